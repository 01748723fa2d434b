#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use medrec_kernel_contracts::evidence::{
    ContentId, EvidenceLedgerRowInput, EvidencePayload, EvidenceStreamKind, SymptomText,
};
use medrec_kernel_contracts::roster::{Actor, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;

use crate::ledger::{EvidenceLedgerStore, StorageError};

/// Typed repository interface for the per-subject evidence streams.
///
/// Implementations perform no authorization. Each append is all-or-nothing and
/// serialized by the backend; reads return the full stream in append order and
/// an empty sequence for a stream that was never written.
pub trait EvidenceLedgerRepo: Send + Sync {
    fn append_symptom(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        text: SymptomText,
    ) -> Result<u64, StorageError>;

    fn append_file(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        content_id: ContentId,
    ) -> Result<u64, StorageError>;

    fn list_symptoms(&self, subject_id: &SubjectId) -> Result<Vec<SymptomText>, StorageError>;

    fn list_files(&self, subject_id: &SubjectId) -> Result<Vec<ContentId>, StorageError>;
}

/// `EvidenceLedgerStore` behind a mutex; the mutex is the ledger's append
/// serialization point.
#[derive(Debug, Clone)]
pub struct SharedEvidenceLedger {
    store: Arc<Mutex<EvidenceLedgerStore>>,
}

impl SharedEvidenceLedger {
    pub fn new(store: EvidenceLedgerStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(EvidenceLedgerStore::new_in_memory())
    }

    pub fn with_store<R>(
        &self,
        f: impl FnOnce(&EvidenceLedgerStore) -> R,
    ) -> Result<R, StorageError> {
        let store = self.lock()?;
        Ok(f(&store))
    }

    fn lock(&self) -> Result<MutexGuard<'_, EvidenceLedgerStore>, StorageError> {
        self.store
            .lock()
            .map_err(|_| StorageError::BackendUnavailable {
                reason: "evidence ledger lock poisoned".to_string(),
            })
    }

    fn append(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        payload: EvidencePayload,
    ) -> Result<u64, StorageError> {
        let input =
            EvidenceLedgerRowInput::v1(now, subject_id.clone(), appended_by.clone(), payload)?;
        self.lock()?.append_evidence_row(input)
    }
}

impl EvidenceLedgerRepo for SharedEvidenceLedger {
    fn append_symptom(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        text: SymptomText,
    ) -> Result<u64, StorageError> {
        self.append(now, subject_id, appended_by, EvidencePayload::Symptom(text))
    }

    fn append_file(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        content_id: ContentId,
    ) -> Result<u64, StorageError> {
        self.append(now, subject_id, appended_by, EvidencePayload::File(content_id))
    }

    fn list_symptoms(&self, subject_id: &SubjectId) -> Result<Vec<SymptomText>, StorageError> {
        let store = self.lock()?;
        Ok(store
            .stream_payloads(subject_id, EvidenceStreamKind::Symptom)
            .into_iter()
            .filter_map(|p| match p {
                EvidencePayload::Symptom(t) => Some(t),
                EvidencePayload::File(_) => None,
            })
            .collect())
    }

    fn list_files(&self, subject_id: &SubjectId) -> Result<Vec<ContentId>, StorageError> {
        let store = self.lock()?;
        Ok(store
            .stream_payloads(subject_id, EvidenceStreamKind::File)
            .into_iter()
            .filter_map(|p| match p {
                EvidencePayload::File(c) => Some(c),
                EvidencePayload::Symptom(_) => None,
            })
            .collect())
    }
}
