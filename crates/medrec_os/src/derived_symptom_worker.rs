#![forbid(unsafe_code)]

use std::env;

use medrec_engines::codec::encode_observation;
use medrec_kernel_contracts::evidence::SymptomText;
use medrec_kernel_contracts::MonotonicTimeNs;
use medrec_storage::derived_jobs::{DerivedJobQueueCounts, DerivedSymptomWorkItem};
use medrec_storage::ledger::StorageError;
use tracing::{error, info, warn};

use crate::access_service::RecordAccessService;

pub const DERIVED_SYMPTOM_WORKER_MAX_ITEMS: u16 = 16;
pub const DERIVED_SYMPTOM_WORKER_INTERVAL_MS_DEFAULT: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedSymptomWorkerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_items: u16,
}

impl DerivedSymptomWorkerConfig {
    pub fn from_env() -> Self {
        let enabled = env::var("MEDREC_DERIVED_WORKER_ENABLED")
            .ok()
            .map(|v| !matches!(v.trim(), "0" | "false" | "off" | "no"))
            .unwrap_or(true);
        let interval_ms = env::var("MEDREC_DERIVED_WORKER_INTERVAL_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(DERIVED_SYMPTOM_WORKER_INTERVAL_MS_DEFAULT);
        Self {
            enabled,
            interval_ms,
            max_items: DERIVED_SYMPTOM_WORKER_MAX_ITEMS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DerivedSymptomWorkerPassMetrics {
    pub dequeued_count: u16,
    pub completed_count: u16,
    pub failed_count: u16,
    pub commit_error_count: u16,
    pub queue_after: DerivedJobQueueCounts,
}

pub fn run_derived_symptom_worker_pass(
    service: &RecordAccessService,
    now: MonotonicTimeNs,
) -> Result<DerivedSymptomWorkerPassMetrics, StorageError> {
    run_derived_symptom_worker_pass_with_limit(service, now, DERIVED_SYMPTOM_WORKER_MAX_ITEMS)
}

/// Drains up to `max_items` queued jobs. Every dequeued job ends the pass in a
/// terminal state; encode or append failures are recorded on the job. A job
/// whose terminal commit is refused is counted and logged, and the rest of the
/// batch is still processed.
pub fn run_derived_symptom_worker_pass_with_limit(
    service: &RecordAccessService,
    now: MonotonicTimeNs,
    max_items: u16,
) -> Result<DerivedSymptomWorkerPassMetrics, StorageError> {
    let queue = service.derived_jobs();
    let dequeued = queue.dequeue_batch(max_items)?;
    let mut metrics = DerivedSymptomWorkerPassMetrics {
        dequeued_count: dequeued.len() as u16,
        ..Default::default()
    };

    for item in dequeued {
        let committed = match process_item(service, now, &item) {
            Ok(ledger_id) => {
                info!(
                    job_id = item.job_id.as_str(),
                    subject = item.subject_id.as_str(),
                    ledger_id,
                    "derived symptom appended"
                );
                queue
                    .complete_commit(now, &item.job_id, ledger_id)
                    .map(|()| metrics.completed_count = metrics.completed_count.saturating_add(1))
            }
            Err(reason) => {
                warn!(
                    job_id = item.job_id.as_str(),
                    subject = item.subject_id.as_str(),
                    reason = %reason,
                    "derived symptom failed"
                );
                queue
                    .fail_commit(now, &item.job_id, reason)
                    .map(|()| metrics.failed_count = metrics.failed_count.saturating_add(1))
            }
        };
        if let Err(err) = committed {
            metrics.commit_error_count = metrics.commit_error_count.saturating_add(1);
            error!(
                job_id = item.job_id.as_str(),
                error = %err,
                "derived symptom terminal commit refused"
            );
        }
    }

    metrics.queue_after = queue.counts()?;
    Ok(metrics)
}

fn process_item(
    service: &RecordAccessService,
    now: MonotonicTimeNs,
    item: &DerivedSymptomWorkItem,
) -> Result<u64, String> {
    let encoded = encode_observation(&item.observation).map_err(|e| e.to_string())?;
    let text = SymptomText::new(encoded).map_err(|e| e.to_string())?;
    service
        .append_symptom_with_retry(now, &item.requested_by, &item.subject_id, text)
        .map(|receipt| receipt.ledger_id)
        .map_err(|e| e.to_string())
}
