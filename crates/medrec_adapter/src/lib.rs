#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use medrec_engines::codec::{observation_from_rgb8, observation_to_rgb8};
use medrec_engines::gateway::FileGateway;
use medrec_kernel_contracts::derived::{DerivedSymptomJobId, DerivedSymptomJobState};
use medrec_kernel_contracts::evidence::{ContentId, SYMPTOM_TEXT_MAX_BYTES};
use medrec_kernel_contracts::roster::{Actor, AuthorityId, Roster, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;
use medrec_os::access_service::{AccessError, RecordAccessService};
use medrec_os::derived_symptom_worker::run_derived_symptom_worker_pass;
use medrec_os::retry::RetryPolicy;
use medrec_storage::derived_jobs::{DerivedSymptomJobQueue, DERIVED_JOB_TERMINAL_RETENTION_DEFAULT};
use medrec_storage::ledger::EvidenceLedgerStore;
use medrec_storage::repo::SharedEvidenceLedger;
use tracing::info;

pub const DEFAULT_AUTHORITY_ID: &str = "doctor";
pub const DEFAULT_SUBJECT_IDS: &str = "patient_0,patient_1,patient_2";
/// Room for the JSON envelope around the largest field of a request.
pub const REQUEST_BODY_ENVELOPE_BYTES: usize = 64 * 1024;

/// Largest request body the HTTP surface buffers. A file (or raster) of
/// `max_file_bytes` travels as base64, and a symptom text may be JSON-escaped
/// at up to six bytes per input byte.
pub fn request_body_limit_bytes(max_file_bytes: usize) -> usize {
    let base64_len = max_file_bytes.div_ceil(3).saturating_mul(4);
    let escaped_symptom_len = SYMPTOM_TEXT_MAX_BYTES.saturating_mul(6);
    base64_len
        .max(escaped_symptom_len)
        .saturating_add(REQUEST_BODY_ENVELOPE_BYTES)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitSymptomAdapterRequest {
    pub actor_id: String,
    pub subject_index: u32,
    pub text: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitSymptomAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub ledger_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitFileAdapterRequest {
    pub actor_id: String,
    pub subject_index: u32,
    pub file_b64: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitFileAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub content_id: String,
}

/// An RGB8 raster; resampled to the fixed evidence resolution on intake.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitDerivedSymptomAdapterRequest {
    pub actor_id: String,
    pub subject_index: u32,
    pub width: u32,
    pub height: u32,
    pub rgb8_b64: String,
    #[serde(default)]
    pub sync: bool,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitDerivedSymptomAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub job_id: Option<String>,
    pub ledger_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DerivedSymptomJobAdapterResponse {
    pub status: String,
    pub job_id: String,
    pub subject_id: String,
    pub state: String,
    pub ledger_id: Option<u64>,
    pub failure_reason: Option<String>,
    pub enqueued_at_ns: u64,
    pub finished_at_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EvidenceAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub symptoms: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DecodedImageAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub entry_index: u32,
    pub width: u32,
    pub height: u32,
    pub rgb8_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileAdapterResponse {
    pub status: String,
    pub subject_id: String,
    pub content_id: String,
    pub file_b64: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterDerivedWorkerHealth {
    pub queued_count: u32,
    pub running_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub pass_count: u64,
    pub last_pass_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub subject_count: usize,
    pub file_backend: String,
    pub derived_worker: AdapterDerivedWorkerHealth,
}

/// Error body for every failed route; `error_kind` is the stable tag.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub error_kind: String,
    pub reason: String,
}

impl AdapterErrorResponse {
    pub fn new(error_kind: &str, reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error_kind: error_kind.to_string(),
            reason: reason.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.error_kind.as_str() {
            "UNAUTHORIZED" => 403,
            "UNKNOWN_SUBJECT" | "NOT_FOUND" => 404,
            "INVALID_PAYLOAD" => 400,
            "PAYLOAD_TOO_LARGE" => 413,
            "CODEC_ERROR" => 422,
            "UPLOAD_FAILED" | "FILE_FETCH_FAILED" => 502,
            "LEDGER_APPEND_FAILED" | "LEDGER_READ_FAILED" => 503,
            _ => 500,
        }
    }
}

impl AdapterErrorResponse {
    /// Maps a request body the transport refused before it reached a handler.
    pub fn body_rejected(http_status: u16, detail: impl Into<String>) -> Self {
        let kind = if http_status == 413 {
            "PAYLOAD_TOO_LARGE"
        } else {
            "INVALID_PAYLOAD"
        };
        Self::new(kind, detail)
    }
}

impl From<AccessError> for AdapterErrorResponse {
    fn from(err: AccessError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Default)]
struct AdapterWorkerCounters {
    pass_count: u64,
    last_pass_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdapterRuntime {
    service: Arc<RecordAccessService>,
    worker_counters: Arc<Mutex<AdapterWorkerCounters>>,
}

impl AdapterRuntime {
    pub fn new(service: Arc<RecordAccessService>) -> Self {
        Self {
            service,
            worker_counters: Arc::new(Mutex::new(AdapterWorkerCounters::default())),
        }
    }

    pub fn default_from_env() -> Result<Self, String> {
        let roster = roster_from_env()?;
        let ledger = match journal_path_from_env() {
            Some(path) => {
                let store = EvidenceLedgerStore::open_with_journal(&path).map_err(|err| {
                    format!("failed to open ledger journal '{}': {}", path.display(), err)
                })?;
                info!(
                    path = %path.display(),
                    rows = store.evidence_rows().len(),
                    "ledger journal replayed"
                );
                SharedEvidenceLedger::new(store)
            }
            None => SharedEvidenceLedger::in_memory(),
        };
        let gateway = FileGateway::from_env().map_err(|err| err.to_string())?;
        let service = RecordAccessService::new(
            roster,
            Arc::new(ledger),
            gateway,
            Arc::new(DerivedSymptomJobQueue::with_terminal_retention(
                derived_job_retention_from_env(),
            )),
            RetryPolicy::from_env(),
        );
        Ok(Self::new(Arc::new(service)))
    }

    pub fn service(&self) -> &RecordAccessService {
        &self.service
    }

    fn resolve(
        &self,
        actor_id: &str,
        subject_index: u32,
    ) -> Result<(Actor, SubjectId), AdapterErrorResponse> {
        let roster = self.service.roster();
        let actor = roster.resolve_actor(actor_id.trim()).ok_or_else(|| {
            AdapterErrorResponse::new("UNAUTHORIZED", format!("unknown actor '{actor_id}'"))
        })?;
        let subject = roster
            .subject_at(subject_index as usize)
            .cloned()
            .ok_or_else(|| {
                AdapterErrorResponse::new(
                    "UNKNOWN_SUBJECT",
                    format!(
                        "subject index {subject_index} outside roster of {}",
                        roster.len()
                    ),
                )
            })?;
        Ok((actor, subject))
    }

    fn resolve_actor(&self, actor_id: &str) -> Result<Actor, AdapterErrorResponse> {
        self.service
            .roster()
            .resolve_actor(actor_id.trim())
            .ok_or_else(|| {
                AdapterErrorResponse::new("UNAUTHORIZED", format!("unknown actor '{actor_id}'"))
            })
    }

    pub fn submit_symptom(
        &self,
        request: SubmitSymptomAdapterRequest,
    ) -> Result<SubmitSymptomAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(&request.actor_id, request.subject_index)?;
        let now = now_from_request(request.now_ns);
        let receipt = self
            .service
            .submit_symptom(now, &actor, &subject, &request.text)?;
        Ok(SubmitSymptomAdapterResponse {
            status: "ok".to_string(),
            subject_id: receipt.subject_id.as_str().to_string(),
            ledger_id: receipt.ledger_id,
        })
    }

    pub fn submit_file(
        &self,
        request: SubmitFileAdapterRequest,
    ) -> Result<SubmitFileAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(&request.actor_id, request.subject_index)?;
        let bytes = decode_b64("file_b64", &request.file_b64)?;
        let now = now_from_request(request.now_ns);
        let content_id = self.service.submit_file(now, &actor, &subject, &bytes)?;
        Ok(SubmitFileAdapterResponse {
            status: "ok".to_string(),
            subject_id: subject.as_str().to_string(),
            content_id: content_id.as_str().to_string(),
        })
    }

    pub fn submit_derived_symptom(
        &self,
        request: SubmitDerivedSymptomAdapterRequest,
    ) -> Result<SubmitDerivedSymptomAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(&request.actor_id, request.subject_index)?;
        let pixels = decode_b64("rgb8_b64", &request.rgb8_b64)?;
        let observation = observation_from_rgb8(request.width, request.height, &pixels)
            .map_err(|err| AdapterErrorResponse::from(AccessError::from(err)))?;
        let now = now_from_request(request.now_ns);
        if request.sync {
            let receipt = self
                .service
                .submit_derived_symptom_sync(now, &actor, &subject, &observation)?;
            return Ok(SubmitDerivedSymptomAdapterResponse {
                status: "ok".to_string(),
                subject_id: subject.as_str().to_string(),
                job_id: None,
                ledger_id: Some(receipt.ledger_id),
            });
        }
        let job_id = self
            .service
            .submit_derived_symptom(now, &actor, &subject, observation)?;
        Ok(SubmitDerivedSymptomAdapterResponse {
            status: "accepted".to_string(),
            subject_id: subject.as_str().to_string(),
            job_id: Some(job_id.as_str().to_string()),
            ledger_id: None,
        })
    }

    pub fn derived_symptom_job_status(
        &self,
        actor_id: &str,
        job_id: &str,
    ) -> Result<DerivedSymptomJobAdapterResponse, AdapterErrorResponse> {
        let actor = self.resolve_actor(actor_id)?;
        let job_id = DerivedSymptomJobId::new(job_id).map_err(|_| {
            AdapterErrorResponse::new("NOT_FOUND", format!("derived symptom job {job_id}"))
        })?;
        let status = self.service.derived_symptom_job_status(&actor, &job_id)?;
        let (ledger_id, failure_reason) = match &status.state {
            DerivedSymptomJobState::Completed { ledger_id } => (Some(*ledger_id), None),
            DerivedSymptomJobState::Failed { reason } => (None, Some(reason.clone())),
            DerivedSymptomJobState::Queued | DerivedSymptomJobState::Running => (None, None),
        };
        Ok(DerivedSymptomJobAdapterResponse {
            status: "ok".to_string(),
            job_id: status.job_id.as_str().to_string(),
            subject_id: status.subject_id.as_str().to_string(),
            state: status.state.label().to_string(),
            ledger_id,
            failure_reason,
            enqueued_at_ns: status.enqueued_at.0,
            finished_at_ns: status.finished_at.map(|t| t.0),
        })
    }

    pub fn view_evidence(
        &self,
        actor_id: &str,
        subject_index: u32,
    ) -> Result<EvidenceAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(actor_id, subject_index)?;
        let view = self.service.view_evidence(&actor, &subject)?;
        Ok(EvidenceAdapterResponse {
            status: "ok".to_string(),
            subject_id: view.subject_id.as_str().to_string(),
            symptoms: view.symptoms.into_iter().map(|s| s.into_string()).collect(),
            files: view
                .files
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        })
    }

    pub fn view_decoded_image(
        &self,
        actor_id: &str,
        subject_index: u32,
        entry_index: u32,
    ) -> Result<DecodedImageAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(actor_id, subject_index)?;
        let grid = self
            .service
            .view_decoded_image(&actor, &subject, entry_index as usize)?;
        let rgb8 =
            observation_to_rgb8(&grid).map_err(|e| AdapterErrorResponse::from(AccessError::from(e)))?;
        Ok(DecodedImageAdapterResponse {
            status: "ok".to_string(),
            subject_id: subject.as_str().to_string(),
            entry_index,
            width: grid.width(),
            height: grid.height(),
            rgb8_b64: BASE64_STANDARD.encode(rgb8),
        })
    }

    pub fn fetch_file(
        &self,
        actor_id: &str,
        subject_index: u32,
        content_id: &str,
    ) -> Result<FileAdapterResponse, AdapterErrorResponse> {
        let (actor, subject) = self.resolve(actor_id, subject_index)?;
        let content_id = ContentId::new(content_id).map_err(|_| {
            AdapterErrorResponse::new("NOT_FOUND", format!("file {content_id}"))
        })?;
        let bytes = self.service.fetch_file(&actor, &subject, &content_id)?;
        Ok(FileAdapterResponse {
            status: "ok".to_string(),
            subject_id: subject.as_str().to_string(),
            content_id: content_id.as_str().to_string(),
            file_b64: BASE64_STANDARD.encode(bytes),
        })
    }

    pub fn run_derived_symptom_worker_pass(&self, now_ns: Option<u64>) -> Result<(), String> {
        let now = now_from_request(now_ns);
        let result = run_derived_symptom_worker_pass(&self.service, now).map_err(|e| e.to_string());
        let mut counters = self
            .worker_counters
            .lock()
            .map_err(|_| "adapter worker counters lock poisoned".to_string())?;
        counters.pass_count = counters.pass_count.saturating_add(1);
        match result {
            Ok(metrics) => {
                if metrics.dequeued_count > 0 {
                    info!(
                        dequeued = metrics.dequeued_count,
                        completed = metrics.completed_count,
                        failed = metrics.failed_count,
                        commit_errors = metrics.commit_error_count,
                        "derived symptom worker pass"
                    );
                }
                counters.last_pass_error = None;
                Ok(())
            }
            Err(err) => {
                counters.last_pass_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, String> {
        let queue = self
            .service
            .derived_jobs()
            .counts()
            .map_err(|e| e.to_string())?;
        let counters = self
            .worker_counters
            .lock()
            .map_err(|_| "adapter worker counters lock poisoned".to_string())?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            subject_count: self.service.roster().len(),
            file_backend: self.service.file_backend_label().to_string(),
            derived_worker: AdapterDerivedWorkerHealth {
                queued_count: queue.queued_count,
                running_count: queue.running_count,
                completed_count: queue.completed_count,
                failed_count: queue.failed_count,
                pass_count: counters.pass_count,
                last_pass_error: counters.last_pass_error.clone(),
            },
        })
    }
}

fn decode_b64(field: &str, raw: &str) -> Result<Vec<u8>, AdapterErrorResponse> {
    BASE64_STANDARD
        .decode(raw.trim())
        .map_err(|err| AdapterErrorResponse::new("INVALID_PAYLOAD", format!("{field}: {err}")))
}

pub fn roster_from_env() -> Result<Roster, String> {
    roster_from_values(
        env::var("MEDREC_AUTHORITY_ID").ok().as_deref(),
        env::var("MEDREC_SUBJECT_IDS").ok().as_deref(),
    )
}

fn roster_from_values(authority: Option<&str>, subjects: Option<&str>) -> Result<Roster, String> {
    let authority = authority
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_AUTHORITY_ID);
    let subjects = subjects
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_SUBJECT_IDS);
    let authority = AuthorityId::new(authority).map_err(|v| format!("MEDREC_AUTHORITY_ID: {v}"))?;
    let subjects = subjects
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| SubjectId::new(s).map_err(|v| format!("MEDREC_SUBJECT_IDS: {v}")))
        .collect::<Result<Vec<_>, _>>()?;
    Roster::v1(authority, subjects).map_err(|v| format!("roster: {v}"))
}

fn journal_path_from_env() -> Option<PathBuf> {
    env::var("MEDREC_LEDGER_JOURNAL_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn derived_job_retention_from_env() -> usize {
    env::var("MEDREC_DERIVED_JOB_RETENTION")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| (1..=1_000_000).contains(v))
        .unwrap_or(DERIVED_JOB_TERMINAL_RETENTION_DEFAULT)
}

fn now_from_request(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}
