#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use medrec_kernel_contracts::derived::{
    bounded_failure_reason, DerivedSymptomJobId, DerivedSymptomJobState, DerivedSymptomJobStatus,
};
use medrec_kernel_contracts::observation::ObservationGrid;
use medrec_kernel_contracts::roster::{Actor, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;

use crate::ledger::StorageError;

const DERIVED_JOBS_TABLE: &str = "derived_symptom_jobs";
pub const DERIVED_JOB_TERMINAL_RETENTION_DEFAULT: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSymptomJobRecord {
    pub job_id: DerivedSymptomJobId,
    pub subject_id: SubjectId,
    pub requested_by: Actor,
    pub enqueued_at: MonotonicTimeNs,
    pub state: DerivedSymptomJobState,
    pub attempt_count: u16,
    pub finished_at: Option<MonotonicTimeNs>,
    // Released once the job is dequeued.
    observation: Option<ObservationGrid>,
}

impl DerivedSymptomJobRecord {
    pub fn status(&self) -> DerivedSymptomJobStatus {
        DerivedSymptomJobStatus {
            job_id: self.job_id.clone(),
            subject_id: self.subject_id.clone(),
            state: self.state.clone(),
            enqueued_at: self.enqueued_at,
            finished_at: self.finished_at,
        }
    }
}

/// A dequeued job with its observation, owned by exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSymptomWorkItem {
    pub job_id: DerivedSymptomJobId,
    pub subject_id: SubjectId,
    pub requested_by: Actor,
    pub observation: ObservationGrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DerivedJobQueueCounts {
    pub queued_count: u32,
    pub running_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
}

#[derive(Debug, Default)]
struct DerivedJobQueueState {
    jobs: BTreeMap<DerivedSymptomJobId, DerivedSymptomJobRecord>,
    // Terminal jobs, oldest finish first.
    finished: VecDeque<DerivedSymptomJobId>,
    next_seq: u64,
}

/// In-process tracked queue for derived-symptom work. Jobs not yet terminal
/// are lost if the process stops. Only the most recent `terminal_retention`
/// finished jobs stay queryable; older ones are evicted and read as unknown.
#[derive(Debug)]
pub struct DerivedSymptomJobQueue {
    state: Mutex<DerivedJobQueueState>,
    terminal_retention: usize,
}

impl Default for DerivedSymptomJobQueue {
    fn default() -> Self {
        Self::with_terminal_retention(DERIVED_JOB_TERMINAL_RETENTION_DEFAULT)
    }
}

impl DerivedSymptomJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminal_retention(terminal_retention: usize) -> Self {
        Self {
            state: Mutex::new(DerivedJobQueueState::default()),
            terminal_retention: terminal_retention.max(1),
        }
    }

    pub fn terminal_retention(&self) -> usize {
        self.terminal_retention
    }

    fn lock(&self) -> Result<MutexGuard<'_, DerivedJobQueueState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::BackendUnavailable {
                reason: "derived job queue lock poisoned".to_string(),
            })
    }

    pub fn enqueue(
        &self,
        now: MonotonicTimeNs,
        subject_id: SubjectId,
        requested_by: Actor,
        observation: ObservationGrid,
    ) -> Result<DerivedSymptomJobId, StorageError> {
        let mut state = self.lock()?;
        state.next_seq = state.next_seq.saturating_add(1);
        let job_id = DerivedSymptomJobId::new(format!("dsj_{:016x}", state.next_seq))?;
        state.jobs.insert(
            job_id.clone(),
            DerivedSymptomJobRecord {
                job_id: job_id.clone(),
                subject_id,
                requested_by,
                enqueued_at: now,
                state: DerivedSymptomJobState::Queued,
                attempt_count: 0,
                finished_at: None,
                observation: Some(observation),
            },
        );
        Ok(job_id)
    }

    /// Moves up to `max_items` queued jobs to `Running`, oldest first.
    pub fn dequeue_batch(&self, max_items: u16) -> Result<Vec<DerivedSymptomWorkItem>, StorageError> {
        let mut state = self.lock()?;
        let mut out = Vec::new();
        for record in state.jobs.values_mut() {
            if out.len() >= max_items as usize {
                break;
            }
            if record.state != DerivedSymptomJobState::Queued {
                continue;
            }
            let Some(observation) = record.observation.take() else {
                continue;
            };
            record.state = DerivedSymptomJobState::Running;
            record.attempt_count = record.attempt_count.saturating_add(1);
            out.push(DerivedSymptomWorkItem {
                job_id: record.job_id.clone(),
                subject_id: record.subject_id.clone(),
                requested_by: record.requested_by.clone(),
                observation,
            });
        }
        Ok(out)
    }

    pub fn complete_commit(
        &self,
        now: MonotonicTimeNs,
        job_id: &DerivedSymptomJobId,
        ledger_id: u64,
    ) -> Result<(), StorageError> {
        self.finish(now, job_id, DerivedSymptomJobState::Completed { ledger_id })
    }

    pub fn fail_commit(
        &self,
        now: MonotonicTimeNs,
        job_id: &DerivedSymptomJobId,
        reason: impl Into<String>,
    ) -> Result<(), StorageError> {
        self.finish(
            now,
            job_id,
            DerivedSymptomJobState::Failed {
                reason: bounded_failure_reason(reason),
            },
        )
    }

    fn finish(
        &self,
        now: MonotonicTimeNs,
        job_id: &DerivedSymptomJobId,
        terminal: DerivedSymptomJobState,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: DERIVED_JOBS_TABLE,
                key: job_id.as_str().to_string(),
            })?;
        if record.state.is_terminal() {
            return Err(StorageError::AppendOnlyViolation {
                table: DERIVED_JOBS_TABLE,
            });
        }
        record.state = terminal;
        record.finished_at = Some(now);
        record.observation = None;
        state.finished.push_back(job_id.clone());
        while state.finished.len() > self.terminal_retention {
            if let Some(evicted) = state.finished.pop_front() {
                state.jobs.remove(&evicted);
            }
        }
        Ok(())
    }

    pub fn job_status(
        &self,
        job_id: &DerivedSymptomJobId,
    ) -> Result<Option<DerivedSymptomJobStatus>, StorageError> {
        let state = self.lock()?;
        Ok(state.jobs.get(job_id).map(DerivedSymptomJobRecord::status))
    }

    pub fn counts(&self) -> Result<DerivedJobQueueCounts, StorageError> {
        let state = self.lock()?;
        let mut out = DerivedJobQueueCounts::default();
        for record in state.jobs.values() {
            match record.state {
                DerivedSymptomJobState::Queued => out.queued_count = out.queued_count.saturating_add(1),
                DerivedSymptomJobState::Running => {
                    out.running_count = out.running_count.saturating_add(1)
                }
                DerivedSymptomJobState::Completed { .. } => {
                    out.completed_count = out.completed_count.saturating_add(1)
                }
                DerivedSymptomJobState::Failed { .. } => {
                    out.failed_count = out.failed_count.saturating_add(1)
                }
            }
        }
        Ok(out)
    }
}
