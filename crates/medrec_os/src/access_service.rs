#![forbid(unsafe_code)]

use std::sync::Arc;

use medrec_engines::codec::{decode_observation, encode_observation, CodecError};
use medrec_engines::gateway::{FileGateway, GatewayError};
use medrec_engines::policy::{AccessMode, AuthorizationPolicy};
use medrec_kernel_contracts::derived::{DerivedSymptomJobId, DerivedSymptomJobStatus};
use medrec_kernel_contracts::evidence::{
    AppendReceipt, ContentId, EvidenceStreamKind, EvidenceView, SymptomText,
};
use medrec_kernel_contracts::observation::ObservationGrid;
use medrec_kernel_contracts::roster::{Actor, Roster, SubjectId};
use medrec_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use medrec_storage::derived_jobs::DerivedSymptomJobQueue;
use medrec_storage::ledger::StorageError;
use medrec_storage::repo::{EvidenceLedgerRepo, SharedEvidenceLedger};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::{run_with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccessError {
    #[error("actor {actor} may not {mode} evidence of subject {subject}")]
    Unauthorized {
        actor: String,
        subject: String,
        mode: &'static str,
    },
    #[error("subject {subject} is not in the roster")]
    UnknownSubject { subject: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(ContractViolation),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("file upload failed: {0}")]
    UploadFailed(GatewayError),
    #[error("file fetch failed: {0}")]
    FileFetchFailed(GatewayError),
    #[error("ledger append failed: {0}")]
    LedgerAppendFailed(StorageError),
    #[error("ledger read failed: {0}")]
    LedgerReadFailed(StorageError),
    #[error("not found: {what}")]
    NotFound { what: String },
}

impl AccessError {
    /// Stable tag for transports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::Unauthorized { .. } => "UNAUTHORIZED",
            AccessError::UnknownSubject { .. } => "UNKNOWN_SUBJECT",
            AccessError::InvalidPayload(_) => "INVALID_PAYLOAD",
            AccessError::Codec(_) => "CODEC_ERROR",
            AccessError::UploadFailed(_) => "UPLOAD_FAILED",
            AccessError::FileFetchFailed(_) => "FILE_FETCH_FAILED",
            AccessError::LedgerAppendFailed(_) => "LEDGER_APPEND_FAILED",
            AccessError::LedgerReadFailed(_) => "LEDGER_READ_FAILED",
            AccessError::NotFound { .. } => "NOT_FOUND",
        }
    }
}

fn mode_label(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::Write => "write",
        AccessMode::Read => "read",
    }
}

/// Orchestrates authorization, encoding, file storage and ledger appends for
/// every evidence operation. Holds no locks of its own; share it via `Arc`.
#[derive(Clone)]
pub struct RecordAccessService {
    roster: Roster,
    policy: AuthorizationPolicy,
    ledger: Arc<dyn EvidenceLedgerRepo>,
    gateway: FileGateway,
    derived_jobs: Arc<DerivedSymptomJobQueue>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RecordAccessService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordAccessService")
            .field("roster", &self.roster)
            .field("gateway", &self.gateway)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RecordAccessService {
    pub fn new(
        roster: Roster,
        ledger: Arc<dyn EvidenceLedgerRepo>,
        gateway: FileGateway,
        derived_jobs: Arc<DerivedSymptomJobQueue>,
        retry: RetryPolicy,
    ) -> Self {
        let policy = AuthorizationPolicy::new(roster.authority().clone());
        Self {
            roster,
            policy,
            ledger,
            gateway,
            derived_jobs,
            retry,
        }
    }

    /// In-memory ledger, in-memory blob store, default retry.
    pub fn in_memory(roster: Roster) -> Self {
        Self::new(
            roster,
            Arc::new(SharedEvidenceLedger::in_memory()),
            FileGateway::in_memory(),
            Arc::new(DerivedSymptomJobQueue::new()),
            RetryPolicy::mvp_v1(),
        )
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn derived_jobs(&self) -> &DerivedSymptomJobQueue {
        &self.derived_jobs
    }

    pub fn file_backend_label(&self) -> &'static str {
        self.gateway.backend_label()
    }

    fn authorize(
        &self,
        mode: AccessMode,
        actor: &Actor,
        subject: &SubjectId,
    ) -> Result<(), AccessError> {
        if !self.roster.contains(subject) {
            return Err(AccessError::UnknownSubject {
                subject: subject.as_str().to_string(),
            });
        }
        let decision = self.policy.decide(mode, actor, subject);
        if !decision.allowed {
            warn!(
                actor = actor.as_str(),
                subject = subject.as_str(),
                mode = mode_label(mode),
                reason_code = decision.reason_code.0,
                "access denied"
            );
            return Err(AccessError::Unauthorized {
                actor: actor.as_str().to_string(),
                subject: subject.as_str().to_string(),
                mode: mode_label(mode),
            });
        }
        Ok(())
    }

    pub(crate) fn append_symptom_with_retry(
        &self,
        now: MonotonicTimeNs,
        actor: &Actor,
        subject: &SubjectId,
        text: SymptomText,
    ) -> Result<AppendReceipt, AccessError> {
        let ledger_id = run_with_retry(
            &self.retry,
            "ledger.append_symptom",
            StorageError::is_transient,
            || self.ledger.append_symptom(now, subject, actor, text.clone()),
        )
        .map_err(AccessError::LedgerAppendFailed)?;
        Ok(AppendReceipt {
            ledger_id,
            subject_id: subject.clone(),
            stream_kind: EvidenceStreamKind::Symptom,
        })
    }

    fn list_symptoms_with_retry(&self, subject: &SubjectId) -> Result<Vec<SymptomText>, AccessError> {
        run_with_retry(
            &self.retry,
            "ledger.list_symptoms",
            StorageError::is_transient,
            || self.ledger.list_symptoms(subject),
        )
        .map_err(AccessError::LedgerReadFailed)
    }

    fn list_files_with_retry(&self, subject: &SubjectId) -> Result<Vec<ContentId>, AccessError> {
        run_with_retry(
            &self.retry,
            "ledger.list_files",
            StorageError::is_transient,
            || self.ledger.list_files(subject),
        )
        .map_err(AccessError::LedgerReadFailed)
    }

    pub fn submit_symptom(
        &self,
        now: MonotonicTimeNs,
        actor: &Actor,
        subject: &SubjectId,
        text: &str,
    ) -> Result<AppendReceipt, AccessError> {
        self.authorize(AccessMode::Write, actor, subject)?;
        let text = SymptomText::new(text).map_err(AccessError::InvalidPayload)?;
        let receipt = self.append_symptom_with_retry(now, actor, subject, text)?;
        info!(
            actor = actor.as_str(),
            subject = subject.as_str(),
            ledger_id = receipt.ledger_id,
            "symptom appended"
        );
        Ok(receipt)
    }

    /// Stores the bytes first and appends the returned content id second. A
    /// store failure leaves the ledger untouched.
    pub fn submit_file(
        &self,
        now: MonotonicTimeNs,
        actor: &Actor,
        subject: &SubjectId,
        bytes: &[u8],
    ) -> Result<ContentId, AccessError> {
        self.authorize(AccessMode::Write, actor, subject)?;
        let content_id = run_with_retry(
            &self.retry,
            "gateway.store",
            GatewayError::is_transient,
            || self.gateway.store(bytes),
        )
        .map_err(AccessError::UploadFailed)?;
        let ledger_id = run_with_retry(
            &self.retry,
            "ledger.append_file",
            StorageError::is_transient,
            || {
                self.ledger
                    .append_file(now, subject, actor, content_id.clone())
            },
        )
        .map_err(|err| {
            // The blob stays in the store unreferenced; content addressing
            // makes a later resubmission land on the same id.
            warn!(
                content_id = content_id.as_str(),
                error = %err,
                "file stored but ledger append failed"
            );
            AccessError::LedgerAppendFailed(err)
        })?;
        info!(
            actor = actor.as_str(),
            subject = subject.as_str(),
            ledger_id,
            content_id = content_id.as_str(),
            size = bytes.len(),
            "file appended"
        );
        Ok(content_id)
    }

    /// Queues the observation for background encoding and returns at once.
    pub fn submit_derived_symptom(
        &self,
        now: MonotonicTimeNs,
        actor: &Actor,
        subject: &SubjectId,
        observation: ObservationGrid,
    ) -> Result<DerivedSymptomJobId, AccessError> {
        self.authorize(AccessMode::Write, actor, subject)?;
        if !observation.has_fixed_resolution() {
            return Err(AccessError::Codec(CodecError::DimensionMismatch {
                width: observation.width(),
                height: observation.height(),
                channels: observation.channels(),
            }));
        }
        let job_id = self
            .derived_jobs
            .enqueue(now, subject.clone(), actor.clone(), observation)
            .map_err(AccessError::LedgerAppendFailed)?;
        debug!(
            job_id = job_id.as_str(),
            subject = subject.as_str(),
            "derived symptom queued"
        );
        Ok(job_id)
    }

    pub fn submit_derived_symptom_sync(
        &self,
        now: MonotonicTimeNs,
        actor: &Actor,
        subject: &SubjectId,
        observation: &ObservationGrid,
    ) -> Result<AppendReceipt, AccessError> {
        self.authorize(AccessMode::Write, actor, subject)?;
        let encoded = encode_observation(observation)?;
        let text = SymptomText::new(encoded).map_err(AccessError::InvalidPayload)?;
        self.append_symptom_with_retry(now, actor, subject, text)
    }

    pub fn derived_symptom_job_status(
        &self,
        actor: &Actor,
        job_id: &DerivedSymptomJobId,
    ) -> Result<DerivedSymptomJobStatus, AccessError> {
        // A job the caller may not read is indistinguishable from a missing one.
        let not_found = || AccessError::NotFound {
            what: format!("derived symptom job {}", job_id.as_str()),
        };
        let status = self
            .derived_jobs
            .job_status(job_id)
            .map_err(AccessError::LedgerReadFailed)?
            .ok_or_else(not_found)?;
        match self.authorize(AccessMode::Read, actor, &status.subject_id) {
            Ok(()) => Ok(status),
            Err(AccessError::Unauthorized { .. } | AccessError::UnknownSubject { .. }) => {
                Err(not_found())
            }
            Err(err) => Err(err),
        }
    }

    pub fn view_evidence(
        &self,
        actor: &Actor,
        subject: &SubjectId,
    ) -> Result<EvidenceView, AccessError> {
        self.authorize(AccessMode::Read, actor, subject)?;
        Ok(EvidenceView {
            subject_id: subject.clone(),
            symptoms: self.list_symptoms_with_retry(subject)?,
            files: self.list_files_with_retry(subject)?,
        })
    }

    pub fn view_decoded_image(
        &self,
        actor: &Actor,
        subject: &SubjectId,
        entry_index: usize,
    ) -> Result<ObservationGrid, AccessError> {
        self.authorize(AccessMode::Read, actor, subject)?;
        let symptoms = self.list_symptoms_with_retry(subject)?;
        let entry = symptoms
            .get(entry_index)
            .ok_or_else(|| AccessError::NotFound {
                what: format!(
                    "symptom entry {entry_index} of subject {} ({} entries)",
                    subject.as_str(),
                    symptoms.len()
                ),
            })?;
        Ok(decode_observation(entry.as_str())?)
    }

    /// Only content ids referenced by the subject's own file stream are served.
    pub fn fetch_file(
        &self,
        actor: &Actor,
        subject: &SubjectId,
        content_id: &ContentId,
    ) -> Result<Vec<u8>, AccessError> {
        self.authorize(AccessMode::Read, actor, subject)?;
        let files = self.list_files_with_retry(subject)?;
        if !files.contains(content_id) {
            return Err(AccessError::NotFound {
                what: format!(
                    "file {} in evidence of subject {}",
                    content_id.as_str(),
                    subject.as_str()
                ),
            });
        }
        run_with_retry(
            &self.retry,
            "gateway.fetch",
            GatewayError::is_transient,
            || self.gateway.fetch(content_id),
        )
        .map_err(|err| match err {
            GatewayError::NotFound { content_id } => AccessError::NotFound {
                what: format!("blob {content_id}"),
            },
            other => AccessError::FileFetchFailed(other),
        })
    }
}
