#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_token_ascii;
use crate::roster::SubjectId;
use crate::{ContractViolation, MonotonicTimeNs};

pub const DERIVED_JOB_FAILURE_REASON_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct DerivedSymptomJobId(String);

impl DerivedSymptomJobId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_token_ascii("derived_symptom_job_id", &id, 64)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DerivedSymptomJobId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedSymptomJobState {
    Queued,
    Running,
    Completed { ledger_id: u64 },
    Failed { reason: String },
}

impl DerivedSymptomJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DerivedSymptomJobState::Completed { .. } | DerivedSymptomJobState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DerivedSymptomJobState::Queued => "QUEUED",
            DerivedSymptomJobState::Running => "RUNNING",
            DerivedSymptomJobState::Completed { .. } => "COMPLETED",
            DerivedSymptomJobState::Failed { .. } => "FAILED",
        }
    }
}

/// Caller-visible snapshot of a derived-symptom job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSymptomJobStatus {
    pub job_id: DerivedSymptomJobId,
    pub subject_id: SubjectId,
    pub state: DerivedSymptomJobState,
    pub enqueued_at: MonotonicTimeNs,
    pub finished_at: Option<MonotonicTimeNs>,
}

pub fn bounded_failure_reason(reason: impl Into<String>) -> String {
    let reason = reason.into();
    if reason.len() <= DERIVED_JOB_FAILURE_REASON_MAX_LEN {
        return reason;
    }
    reason
        .chars()
        .take(DERIVED_JOB_FAILURE_REASON_MAX_LEN)
        .collect()
}
