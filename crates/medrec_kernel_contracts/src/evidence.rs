#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_token_ascii;
use crate::roster::{Actor, SubjectId};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const EVIDENCE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
/// Large enough for a stored observation in the legacy nested-list form.
pub const SYMPTOM_TEXT_MAX_BYTES: usize = 1_048_576;
pub const CONTENT_ID_MAX_LEN: usize = 128;
pub const ROW_HASH_HEX_LEN: usize = 64;
pub const GENESIS_ROW_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Opaque symptom payload. The ledger never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct SymptomText(String);

impl SymptomText {
    pub fn new(text: impl Into<String>) -> Result<Self, ContractViolation> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "symptom_text",
                reason: "must not be empty",
            });
        }
        if text.len() > SYMPTOM_TEXT_MAX_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "symptom_text",
                reason: "exceeds SYMPTOM_TEXT_MAX_BYTES",
            });
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for SymptomText {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Content identifier handed out by the blob store for a file payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_token_ascii("content_id", &id, CONTENT_ID_MAX_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvidenceStreamKind {
    Symptom,
    File,
}

impl EvidenceStreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceStreamKind::Symptom => "SYMPTOM",
            EvidenceStreamKind::File => "FILE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidencePayload {
    Symptom(SymptomText),
    File(ContentId),
}

impl Validate for EvidencePayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            EvidencePayload::Symptom(text) => {
                SymptomText::new(text.as_str())?;
            }
            EvidencePayload::File(content_id) => {
                ContentId::new(content_id.as_str())?;
            }
        }
        Ok(())
    }
}

impl EvidencePayload {
    pub fn stream_kind(&self) -> EvidenceStreamKind {
        match self {
            EvidencePayload::Symptom(_) => EvidenceStreamKind::Symptom,
            EvidencePayload::File(_) => EvidenceStreamKind::File,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EvidencePayload::Symptom(t) => t.as_str(),
            EvidencePayload::File(c) => c.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceLedgerRowInput {
    pub schema_version: SchemaVersion,
    pub appended_at: MonotonicTimeNs,
    pub subject_id: SubjectId,
    pub appended_by: Actor,
    pub payload: EvidencePayload,
}

impl EvidenceLedgerRowInput {
    pub fn v1(
        appended_at: MonotonicTimeNs,
        subject_id: SubjectId,
        appended_by: Actor,
        payload: EvidencePayload,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: EVIDENCE_CONTRACT_VERSION,
            appended_at,
            subject_id,
            appended_by,
            payload,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for EvidenceLedgerRowInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != EVIDENCE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row_input.schema_version",
                reason: "must match EVIDENCE_CONTRACT_VERSION",
            });
        }
        if self.appended_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row_input.appended_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// One committed ledger entry. Rows are chained by `prev_row_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedgerRow {
    pub schema_version: SchemaVersion,
    pub ledger_id: u64,
    pub stream_seq: u64,
    pub appended_at: MonotonicTimeNs,
    pub subject_id: SubjectId,
    pub appended_by: Actor,
    pub payload: EvidencePayload,
    pub prev_row_hash: String,
    pub row_hash: String,
}

impl EvidenceLedgerRow {
    pub fn stream_kind(&self) -> EvidenceStreamKind {
        self.payload.stream_kind()
    }
}

impl Validate for EvidenceLedgerRow {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != EVIDENCE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row.schema_version",
                reason: "must match EVIDENCE_CONTRACT_VERSION",
            });
        }
        if self.ledger_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row.ledger_id",
                reason: "must be > 0",
            });
        }
        if self.stream_seq == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row.stream_seq",
                reason: "must be > 0",
            });
        }
        if self.appended_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_ledger_row.appended_at",
                reason: "must be > 0",
            });
        }
        validate_hash_hex("evidence_ledger_row.prev_row_hash", &self.prev_row_hash)?;
        validate_hash_hex("evidence_ledger_row.row_hash", &self.row_hash)?;
        self.payload.validate()?;
        Ok(())
    }
}

fn validate_hash_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() != ROW_HASH_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be 64 hex chars",
        });
    }
    Ok(())
}

/// Both evidence streams of one subject, verbatim and in append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceView {
    pub subject_id: SubjectId,
    pub symptoms: Vec<SymptomText>,
    pub files: Vec<ContentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub ledger_id: u64,
    pub subject_id: SubjectId,
    pub stream_kind: EvidenceStreamKind,
}
