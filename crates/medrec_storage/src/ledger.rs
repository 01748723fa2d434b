#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use medrec_kernel_contracts::evidence::{
    EvidenceLedgerRow, EvidenceLedgerRowInput, EvidencePayload, EvidenceStreamKind,
    EVIDENCE_CONTRACT_VERSION, GENESIS_ROW_HASH,
};
use medrec_kernel_contracts::roster::{Actor, SubjectId};
use medrec_kernel_contracts::{ContractViolation, Validate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const EVIDENCE_LEDGER_TABLE: &str = "evidence_ledger";
const JOURNAL_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("append-only violation on {table}")]
    AppendOnlyViolation { table: &'static str },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
    #[error("ledger backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
    #[error("ledger journal io failed: {reason}")]
    JournalIo { reason: String },
    #[error("ledger journal corrupt at line {line}: {reason}")]
    JournalCorrupt { line: usize, reason: String },
    #[error("ledger hash chain broken at ledger_id {ledger_id}")]
    HashChainBroken { ledger_id: u64 },
    #[error("ledger journal poisoned, appends refused: {reason}")]
    JournalPoisoned { reason: String },
}

impl StorageError {
    /// Backend conditions that may clear on their own. Everything else is a
    /// deterministic rejection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::BackendUnavailable { .. } | StorageError::JournalIo { .. }
        )
    }
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::JournalIo {
            reason: err.to_string(),
        }
    }
}

pub(crate) fn compute_row_hash(
    prev_row_hash: &str,
    ledger_id: u64,
    stream_seq: u64,
    input: &EvidenceLedgerRowInput,
) -> String {
    let (actor_kind, actor_id) = match &input.appended_by {
        Actor::Authority(id) => ("authority", id.as_str()),
        Actor::Subject(id) => ("subject", id.as_str()),
    };
    let payload = input.payload.as_str();
    let mut hasher = Sha256::new();
    hasher.update(prev_row_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(ledger_id.to_be_bytes());
    hasher.update(stream_seq.to_be_bytes());
    hasher.update(input.appended_at.0.to_be_bytes());
    hasher.update(input.subject_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(actor_kind.as_bytes());
    hasher.update(b":");
    hasher.update(actor_id.as_bytes());
    hasher.update(b"|");
    hasher.update(input.payload.stream_kind().as_str().as_bytes());
    hasher.update((payload.len() as u64).to_be_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_as_input(row: &EvidenceLedgerRow) -> EvidenceLedgerRowInput {
    EvidenceLedgerRowInput {
        schema_version: row.schema_version,
        appended_at: row.appended_at,
        subject_id: row.subject_id.clone(),
        appended_by: row.appended_by.clone(),
        payload: row.payload.clone(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EvidenceJournalEntry {
    schema_version: u8,
    row: EvidenceLedgerRow,
}

/// Byte sink under the journal. `File` is the production sink.
trait JournalSink: std::fmt::Debug + Send {
    fn len(&mut self) -> std::io::Result<u64>;
    fn write_durable(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl JournalSink for File {
    fn len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_durable(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes)?;
        self.flush()?;
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

#[derive(Debug)]
struct EvidenceJournal {
    path: PathBuf,
    sink: Box<dyn JournalSink>,
    poisoned: Option<String>,
}

impl EvidenceJournal {
    fn open_append(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            sink: Box::new(file),
            poisoned: None,
        })
    }

    /// Writes one row as a JSON line. A failed write is truncated back so a
    /// half-written row never survives into the next replay. If the truncate
    /// fails too, the journal tail is unknown and every later append is refused.
    fn append(&mut self, row: &EvidenceLedgerRow) -> Result<(), StorageError> {
        if let Some(reason) = &self.poisoned {
            return Err(StorageError::JournalPoisoned {
                reason: reason.clone(),
            });
        }
        let entry = EvidenceJournalEntry {
            schema_version: JOURNAL_SCHEMA_VERSION,
            row: row.clone(),
        };
        let mut line = serde_json::to_string(&entry).map_err(|err| StorageError::JournalIo {
            reason: format!("journal encode failed: {err}"),
        })?;
        line.push('\n');
        let len_before = self.sink.len()?;
        let Err(write_err) = self.sink.write_durable(line.as_bytes()) else {
            return Ok(());
        };
        match self.sink.truncate(len_before) {
            Ok(()) => Err(write_err.into()),
            Err(truncate_err) => {
                let reason = format!(
                    "write failed ({write_err}) and rollback to {len_before} bytes failed ({truncate_err})"
                );
                self.poisoned = Some(reason.clone());
                Err(StorageError::JournalPoisoned { reason })
            }
        }
    }
}

/// Append-only, hash-chained store of evidence pointers. Each subject owns two
/// logical streams that come into existence on their first append.
#[derive(Debug)]
pub struct EvidenceLedgerStore {
    rows: Vec<EvidenceLedgerRow>,
    stream_index: BTreeMap<(SubjectId, EvidenceStreamKind), Vec<usize>>,
    journal: Option<EvidenceJournal>,
}

impl EvidenceLedgerStore {
    pub fn new_in_memory() -> Self {
        Self {
            rows: Vec::new(),
            stream_index: BTreeMap::new(),
            journal: None,
        }
    }

    /// Replays and verifies an existing journal, then keeps appending to it.
    pub fn open_with_journal(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut store = Self::new_in_memory();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: EvidenceJournalEntry =
                    serde_json::from_str(&line).map_err(|err| StorageError::JournalCorrupt {
                        line: idx + 1,
                        reason: err.to_string(),
                    })?;
                if entry.schema_version != JOURNAL_SCHEMA_VERSION {
                    return Err(StorageError::JournalCorrupt {
                        line: idx + 1,
                        reason: "unsupported journal schema_version".to_string(),
                    });
                }
                store.replay_row(entry.row, idx + 1)?;
            }
        }
        store.journal = Some(EvidenceJournal::open_append(path)?);
        Ok(store)
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path.as_path())
    }

    pub fn journal_poisoned(&self) -> bool {
        self.journal.as_ref().is_some_and(|j| j.poisoned.is_some())
    }

    fn replay_row(&mut self, row: EvidenceLedgerRow, line: usize) -> Result<(), StorageError> {
        row.validate()?;
        let expected_ledger_id = self.rows.len() as u64 + 1;
        if row.ledger_id != expected_ledger_id {
            return Err(StorageError::JournalCorrupt {
                line,
                reason: format!("expected ledger_id {expected_ledger_id}"),
            });
        }
        let key = (row.subject_id.clone(), row.stream_kind());
        let expected_seq = self.stream_len(&key.0, key.1) as u64 + 1;
        if row.stream_seq != expected_seq {
            return Err(StorageError::JournalCorrupt {
                line,
                reason: format!("expected stream_seq {expected_seq}"),
            });
        }
        let prev = self.last_row_hash();
        let recomputed = compute_row_hash(prev, row.ledger_id, row.stream_seq, &row_as_input(&row));
        if row.prev_row_hash != prev || row.row_hash != recomputed {
            return Err(StorageError::HashChainBroken {
                ledger_id: row.ledger_id,
            });
        }
        self.stream_index.entry(key).or_default().push(self.rows.len());
        self.rows.push(row);
        Ok(())
    }

    fn last_row_hash(&self) -> &str {
        self.rows
            .last()
            .map(|r| r.row_hash.as_str())
            .unwrap_or(GENESIS_ROW_HASH)
    }

    pub fn append_evidence_row(&mut self, input: EvidenceLedgerRowInput) -> Result<u64, StorageError> {
        input.validate()?;
        let ledger_id = self.rows.len() as u64 + 1;
        let stream_seq = self.stream_len(&input.subject_id, input.payload.stream_kind()) as u64 + 1;
        let prev_row_hash = self.last_row_hash().to_string();
        let row_hash = compute_row_hash(&prev_row_hash, ledger_id, stream_seq, &input);
        let key = (input.subject_id.clone(), input.payload.stream_kind());
        let row = EvidenceLedgerRow {
            schema_version: EVIDENCE_CONTRACT_VERSION,
            ledger_id,
            stream_seq,
            appended_at: input.appended_at,
            subject_id: input.subject_id,
            appended_by: input.appended_by,
            payload: input.payload,
            prev_row_hash,
            row_hash,
        };
        row.validate()?;

        // Durable first, visible second.
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&row)?;
        }
        self.stream_index.entry(key).or_default().push(self.rows.len());
        self.rows.push(row);
        Ok(ledger_id)
    }

    /// There is no mutation primitive for committed rows.
    pub fn attempt_overwrite_evidence_row(&mut self, _ledger_id: u64) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: EVIDENCE_LEDGER_TABLE,
        })
    }

    pub fn evidence_rows(&self) -> &[EvidenceLedgerRow] {
        &self.rows
    }

    pub fn evidence_row(&self, ledger_id: u64) -> Option<&EvidenceLedgerRow> {
        if ledger_id == 0 {
            return None;
        }
        self.rows.get((ledger_id - 1) as usize)
    }

    pub fn stream_rows(
        &self,
        subject_id: &SubjectId,
        kind: EvidenceStreamKind,
    ) -> Vec<&EvidenceLedgerRow> {
        self.stream_index
            .get(&(subject_id.clone(), kind))
            .map(|idxs| idxs.iter().filter_map(|i| self.rows.get(*i)).collect())
            .unwrap_or_default()
    }

    pub fn stream_len(&self, subject_id: &SubjectId, kind: EvidenceStreamKind) -> usize {
        self.stream_index
            .get(&(subject_id.clone(), kind))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stream_payloads(
        &self,
        subject_id: &SubjectId,
        kind: EvidenceStreamKind,
    ) -> Vec<EvidencePayload> {
        self.stream_rows(subject_id, kind)
            .into_iter()
            .map(|r| r.payload.clone())
            .collect()
    }

    /// Recomputes every row hash from genesis.
    pub fn verify_hash_chain(&self) -> Result<(), StorageError> {
        let mut prev = GENESIS_ROW_HASH.to_string();
        for row in &self.rows {
            let recomputed =
                compute_row_hash(&prev, row.ledger_id, row.stream_seq, &row_as_input(row));
            if row.prev_row_hash != prev || row.row_hash != recomputed {
                return Err(StorageError::HashChainBroken {
                    ledger_id: row.ledger_id,
                });
            }
            prev = row.row_hash.clone();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tamper_payload_for_tests(&mut self, ledger_id: u64, payload: EvidencePayload) {
        if let Some(row) = self.rows.get_mut((ledger_id - 1) as usize) {
            row.payload = payload;
        }
    }
}

impl Default for EvidenceLedgerStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}
