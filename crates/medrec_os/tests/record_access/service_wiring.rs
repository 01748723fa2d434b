#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use medrec_engines::codec::{encode_observation, QUANTIZATION_STEP};
use medrec_engines::gateway::{
    BlobStore, FileGateway, FileGatewayConfig, GatewayError, InMemoryBlobStore,
};
use medrec_kernel_contracts::derived::DerivedSymptomJobState;
use medrec_kernel_contracts::evidence::{ContentId, EvidenceStreamKind, SymptomText};
use medrec_kernel_contracts::observation::ObservationGrid;
use medrec_kernel_contracts::roster::{Actor, AuthorityId, Roster, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;
use medrec_os::access_service::{AccessError, RecordAccessService};
use medrec_os::derived_symptom_worker::run_derived_symptom_worker_pass;
use medrec_os::retry::RetryPolicy;
use medrec_storage::derived_jobs::DerivedSymptomJobQueue;
use medrec_storage::ledger::StorageError;
use medrec_storage::repo::{EvidenceLedgerRepo, SharedEvidenceLedger};

fn roster() -> Roster {
    Roster::v1(
        AuthorityId::new("doctor").unwrap(),
        vec![
            SubjectId::new("patient_0").unwrap(),
            SubjectId::new("patient_1").unwrap(),
            SubjectId::new("patient_2").unwrap(),
        ],
    )
    .unwrap()
}

fn doctor() -> Actor {
    Actor::Authority(AuthorityId::new("doctor").unwrap())
}

fn patient(i: usize) -> SubjectId {
    SubjectId::new(format!("patient_{i}")).unwrap()
}

fn as_patient(i: usize) -> Actor {
    Actor::Subject(patient(i))
}

fn fast_retry(max_attempts: u16) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
    }
}

fn service_with(
    blob_store: Arc<dyn BlobStore>,
    ledger: Arc<dyn EvidenceLedgerRepo>,
    retry: RetryPolicy,
) -> RecordAccessService {
    RecordAccessService::new(
        roster(),
        ledger,
        FileGateway::new(FileGatewayConfig::mvp_v1(), blob_store),
        Arc::new(DerivedSymptomJobQueue::new()),
        retry,
    )
}

/// Fails the first `failures` puts with `Unavailable`, then delegates.
#[derive(Debug)]
struct FlakyBlobStore {
    inner: InMemoryBlobStore,
    failures: u32,
    put_calls: AtomicU32,
}

impl FlakyBlobStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryBlobStore::new(),
            failures,
            put_calls: AtomicU32::new(0),
        }
    }
}

impl BlobStore for FlakyBlobStore {
    fn backend_label(&self) -> &'static str {
        "flaky"
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentId, GatewayError> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(GatewayError::Unavailable {
                reason: "simulated outage".to_string(),
            });
        }
        self.inner.put(bytes)
    }

    fn get(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError> {
        self.inner.get(content_id)
    }
}

#[derive(Debug)]
struct RejectingBlobStore {
    put_calls: AtomicU32,
}

impl BlobStore for RejectingBlobStore {
    fn backend_label(&self) -> &'static str {
        "rejecting"
    }

    fn put(&self, _bytes: &[u8]) -> Result<ContentId, GatewayError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        Err(GatewayError::Rejected {
            reason: "policy".to_string(),
        })
    }

    fn get(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError> {
        Err(GatewayError::NotFound {
            content_id: content_id.as_str().to_string(),
        })
    }
}

/// Fails the first `failures` appends with `BackendUnavailable`.
struct FlakyLedger {
    inner: SharedEvidenceLedger,
    failures: u32,
    append_calls: AtomicU32,
}

impl FlakyLedger {
    fn new(failures: u32) -> Self {
        Self {
            inner: SharedEvidenceLedger::in_memory(),
            failures,
            append_calls: AtomicU32::new(0),
        }
    }

    fn fail_now(&self) -> Result<(), StorageError> {
        let call = self.append_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StorageError::BackendUnavailable {
                reason: "simulated ledger outage".to_string(),
            });
        }
        Ok(())
    }
}

impl EvidenceLedgerRepo for FlakyLedger {
    fn append_symptom(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        text: SymptomText,
    ) -> Result<u64, StorageError> {
        self.fail_now()?;
        self.inner.append_symptom(now, subject_id, appended_by, text)
    }

    fn append_file(
        &self,
        now: MonotonicTimeNs,
        subject_id: &SubjectId,
        appended_by: &Actor,
        content_id: ContentId,
    ) -> Result<u64, StorageError> {
        self.fail_now()?;
        self.inner.append_file(now, subject_id, appended_by, content_id)
    }

    fn list_symptoms(&self, subject_id: &SubjectId) -> Result<Vec<SymptomText>, StorageError> {
        self.inner.list_symptoms(subject_id)
    }

    fn list_files(&self, subject_id: &SubjectId) -> Result<Vec<ContentId>, StorageError> {
        self.inner.list_files(subject_id)
    }
}

fn gradient() -> ObservationGrid {
    let values = (0..medrec_kernel_contracts::observation::OBSERVATION_VALUE_COUNT)
        .map(|i| (i % 256) as f32 / 255.0 * 0.999)
        .collect();
    ObservationGrid::new(120, 120, 3, values).unwrap()
}

#[test]
fn at_access_wiring_01_three_subject_symptom_scenario() {
    let svc = RecordAccessService::in_memory(roster());
    let r1 = svc
        .submit_symptom(MonotonicTimeNs(1), &as_patient(1), &patient(1), "fever")
        .unwrap();
    let r2 = svc
        .submit_symptom(MonotonicTimeNs(2), &as_patient(1), &patient(1), "cough")
        .unwrap();
    assert_eq!(r1.stream_kind, EvidenceStreamKind::Symptom);
    assert!(r2.ledger_id > r1.ledger_id);

    let view = svc.view_evidence(&doctor(), &patient(1)).unwrap();
    let texts: Vec<&str> = view.symptoms.iter().map(|s| s.as_str()).collect();
    assert_eq!(texts, vec!["fever", "cough"]);
    assert!(view.files.is_empty());

    for i in [0, 2] {
        let other = svc.view_evidence(&doctor(), &patient(i)).unwrap();
        assert!(other.symptoms.is_empty());
        assert!(other.files.is_empty());
    }
}

#[test]
fn at_access_wiring_02_file_scenario_round_trips_bytes() {
    let svc = RecordAccessService::in_memory(roster());
    let cid = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(0), b"hello")
        .unwrap();
    let view = svc.view_evidence(&doctor(), &patient(0)).unwrap();
    assert_eq!(view.files, vec![cid.clone()]);
    assert_eq!(
        svc.fetch_file(&doctor(), &patient(0), &cid).unwrap(),
        b"hello".to_vec()
    );
    // The subject owns the evidence and can read it too.
    assert_eq!(
        svc.fetch_file(&as_patient(0), &patient(0), &cid).unwrap(),
        b"hello".to_vec()
    );
}

#[test]
fn at_access_wiring_03_non_owner_subjects_are_unauthorized() {
    let svc = RecordAccessService::in_memory(roster());
    let owner = patient(1);
    let intruder = as_patient(2);

    let err = svc
        .submit_symptom(MonotonicTimeNs(1), &intruder, &owner, "fever")
        .unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");
    let err = svc
        .submit_file(MonotonicTimeNs(1), &intruder, &owner, b"x")
        .unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");
    let err = svc.view_evidence(&intruder, &owner).unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");
    let err = svc
        .submit_derived_symptom(MonotonicTimeNs(1), &intruder, &owner, ObservationGrid::filled(0.5))
        .unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");

    let view = svc.view_evidence(&doctor(), &owner).unwrap();
    assert!(view.symptoms.is_empty());
    assert!(view.files.is_empty());
}

#[test]
fn at_access_wiring_04_subject_writes_are_visible_to_authority() {
    let svc = RecordAccessService::in_memory(roster());
    svc.submit_symptom(MonotonicTimeNs(1), &as_patient(2), &patient(2), "headache")
        .unwrap();
    let view = svc.view_evidence(&doctor(), &patient(2)).unwrap();
    assert_eq!(view.symptoms, vec![SymptomText::new("headache").unwrap()]);
}

#[test]
fn at_access_wiring_05_identical_uploads_are_separate_entries() {
    let svc = RecordAccessService::in_memory(roster());
    let a = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(1), b"scan")
        .unwrap();
    let b = svc
        .submit_file(MonotonicTimeNs(2), &doctor(), &patient(1), b"scan")
        .unwrap();
    assert_eq!(a, b);
    let view = svc.view_evidence(&doctor(), &patient(1)).unwrap();
    assert_eq!(view.files, vec![a.clone(), a]);
}

#[test]
fn at_access_wiring_06_gateway_outage_leaves_file_stream_unchanged() {
    let store = Arc::new(FlakyBlobStore::new(u32::MAX));
    let svc = service_with(
        store.clone(),
        Arc::new(SharedEvidenceLedger::in_memory()),
        fast_retry(3),
    );
    let err = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(0), b"hello")
        .unwrap_err();
    assert_eq!(err.kind(), "UPLOAD_FAILED");
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 3);
    assert!(svc
        .view_evidence(&doctor(), &patient(0))
        .unwrap()
        .files
        .is_empty());
}

#[test]
fn at_access_wiring_07_transient_gateway_outage_is_retried() {
    let store = Arc::new(FlakyBlobStore::new(2));
    let svc = service_with(
        store.clone(),
        Arc::new(SharedEvidenceLedger::in_memory()),
        fast_retry(3),
    );
    let cid = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(0), b"hello")
        .unwrap();
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        svc.view_evidence(&doctor(), &patient(0)).unwrap().files,
        vec![cid]
    );
}

#[test]
fn at_access_wiring_08_gateway_rejection_is_not_retried() {
    let store = Arc::new(RejectingBlobStore {
        put_calls: AtomicU32::new(0),
    });
    let svc = service_with(
        store.clone(),
        Arc::new(SharedEvidenceLedger::in_memory()),
        fast_retry(5),
    );
    let err = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(0), b"hello")
        .unwrap_err();
    assert!(matches!(
        err,
        AccessError::UploadFailed(GatewayError::Rejected { .. })
    ));
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn at_access_wiring_09_ledger_outage_is_retried_then_reported() {
    let svc = service_with(
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(FlakyLedger::new(1)),
        fast_retry(2),
    );
    svc.submit_symptom(MonotonicTimeNs(1), &doctor(), &patient(0), "fever")
        .unwrap();

    let svc = service_with(
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(FlakyLedger::new(u32::MAX)),
        fast_retry(2),
    );
    let err = svc
        .submit_symptom(MonotonicTimeNs(1), &doctor(), &patient(0), "fever")
        .unwrap_err();
    assert_eq!(err.kind(), "LEDGER_APPEND_FAILED");
    assert!(svc
        .view_evidence(&doctor(), &patient(0))
        .unwrap()
        .symptoms
        .is_empty());
}

#[test]
fn at_access_wiring_10_derived_symptom_job_lifecycle() {
    let svc = RecordAccessService::in_memory(roster());
    let grid = gradient();
    let job = svc
        .submit_derived_symptom(MonotonicTimeNs(1), &as_patient(1), &patient(1), grid.clone())
        .unwrap();

    let status = svc.derived_symptom_job_status(&doctor(), &job).unwrap();
    assert_eq!(status.state, DerivedSymptomJobState::Queued);
    assert_eq!(status.subject_id, patient(1));
    assert_eq!(
        svc.derived_symptom_job_status(&as_patient(0), &job)
            .unwrap_err()
            .kind(),
        "NOT_FOUND"
    );

    run_derived_symptom_worker_pass(&svc, MonotonicTimeNs(2)).unwrap();
    let status = svc.derived_symptom_job_status(&as_patient(1), &job).unwrap();
    assert!(matches!(
        status.state,
        DerivedSymptomJobState::Completed { .. }
    ));
    assert_eq!(status.finished_at, Some(MonotonicTimeNs(2)));

    let decoded = svc.view_decoded_image(&doctor(), &patient(1), 0).unwrap();
    for (a, b) in grid.values().iter().zip(decoded.values()) {
        assert!((a - b).abs() <= QUANTIZATION_STEP);
    }
}

#[test]
fn at_access_wiring_11_sync_derived_symptom_appends_encoded_text() {
    let svc = RecordAccessService::in_memory(roster());
    let grid = ObservationGrid::filled(1.0);
    let receipt = svc
        .submit_derived_symptom_sync(MonotonicTimeNs(1), &doctor(), &patient(2), &grid)
        .unwrap();
    assert_eq!(receipt.subject_id, patient(2));
    let view = svc.view_evidence(&doctor(), &patient(2)).unwrap();
    assert_eq!(view.symptoms[0].as_str(), encode_observation(&grid).unwrap());
    assert_eq!(
        svc.view_decoded_image(&doctor(), &patient(2), 0).unwrap(),
        grid
    );
}

#[test]
fn at_access_wiring_12_plain_text_entry_is_a_codec_error() {
    let svc = RecordAccessService::in_memory(roster());
    svc.submit_symptom(MonotonicTimeNs(1), &doctor(), &patient(0), "fever")
        .unwrap();
    let err = svc
        .view_decoded_image(&doctor(), &patient(0), 0)
        .unwrap_err();
    assert_eq!(err.kind(), "CODEC_ERROR");
}

#[test]
fn at_access_wiring_13_fetch_requires_reference_in_subject_stream() {
    let svc = RecordAccessService::in_memory(roster());
    let cid = svc
        .submit_file(MonotonicTimeNs(1), &doctor(), &patient(0), b"private")
        .unwrap();
    // Patient 1 cannot reach patient 0's blob through their own stream.
    let err = svc
        .fetch_file(&as_patient(1), &patient(1), &cid)
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_FOUND");
    let err = svc
        .fetch_file(&as_patient(1), &patient(0), &cid)
        .unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");
}

#[test]
fn at_access_wiring_14_unknown_job_is_not_found() {
    let svc = RecordAccessService::in_memory(roster());
    let missing = medrec_kernel_contracts::derived::DerivedSymptomJobId::new("dsj_missing").unwrap();
    assert_eq!(
        svc.derived_symptom_job_status(&doctor(), &missing)
            .unwrap_err()
            .kind(),
        "NOT_FOUND"
    );
}

#[test]
fn at_access_wiring_15_concurrent_submissions_lose_nothing() {
    let svc = Arc::new(RecordAccessService::in_memory(roster()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let svc = Arc::clone(&svc);
            std::thread::spawn(move || {
                for n in 0..25u64 {
                    svc.submit_symptom(
                        MonotonicTimeNs(t * 100 + n + 1),
                        &doctor(),
                        &patient(0),
                        &format!("entry-{t}-{n}"),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let view = svc.view_evidence(&doctor(), &patient(0)).unwrap();
    assert_eq!(view.symptoms.len(), 100);
}

#[test]
fn at_access_wiring_16_foreign_authority_is_unauthorized() {
    let svc = RecordAccessService::in_memory(roster());
    let nurse = Actor::Authority(AuthorityId::new("nurse").unwrap());
    let err = svc
        .submit_symptom(MonotonicTimeNs(1), &nurse, &patient(0), "fever")
        .unwrap_err();
    assert_eq!(err.kind(), "UNAUTHORIZED");
}

#[test]
fn at_access_wiring_17_legacy_json_observation_decodes_through_service() {
    let svc = RecordAccessService::in_memory(roster());
    let pixel = "[0.0,0.5,1.0]";
    let row = format!("[{}]", vec![pixel; 120].join(","));
    let legacy = format!("[{}]", vec![row; 120].join(","));
    assert!(legacy.len() > 65_536);

    svc.submit_symptom(MonotonicTimeNs(1), &doctor(), &patient(0), &legacy)
        .unwrap();
    let decoded = svc.view_decoded_image(&as_patient(0), &patient(0), 0).unwrap();
    assert!(decoded.has_fixed_resolution());
    for px in decoded.values().chunks(3) {
        assert_eq!(px[0], 0.0);
        assert!((px[1] - 0.5).abs() <= QUANTIZATION_STEP);
        assert_eq!(px[2], 1.0);
    }
}

#[test]
fn at_access_wiring_18_other_subjects_job_reads_as_missing() {
    let svc = RecordAccessService::in_memory(roster());
    let job = svc
        .submit_derived_symptom(MonotonicTimeNs(1), &doctor(), &patient(1), gradient())
        .unwrap();
    let missing = medrec_kernel_contracts::derived::DerivedSymptomJobId::new("dsj_ffffffffffffffff").unwrap();

    let foreign = svc.derived_symptom_job_status(&as_patient(2), &job).unwrap_err();
    let absent = svc.derived_symptom_job_status(&as_patient(2), &missing).unwrap_err();
    assert_eq!(foreign.kind(), "NOT_FOUND");
    assert_eq!(absent.kind(), "NOT_FOUND");
    assert!(svc.derived_symptom_job_status(&as_patient(1), &job).is_ok());
}
