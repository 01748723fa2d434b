#![forbid(unsafe_code)]

use medrec_kernel_contracts::derived::DerivedSymptomJobState;
use medrec_kernel_contracts::observation::ObservationGrid;
use medrec_kernel_contracts::roster::{Actor, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;
use medrec_storage::derived_jobs::DerivedSymptomJobQueue;
use medrec_storage::ledger::StorageError;

fn p(id: &str) -> SubjectId {
    SubjectId::new(id).unwrap()
}

#[test]
fn at_derived_db_01_enqueue_dequeue_complete_lifecycle() {
    let q = DerivedSymptomJobQueue::new();
    let job = q
        .enqueue(
            MonotonicTimeNs(10),
            p("patient_0"),
            Actor::Subject(p("patient_0")),
            ObservationGrid::filled(0.25),
        )
        .unwrap();
    assert_eq!(
        q.job_status(&job).unwrap().unwrap().state,
        DerivedSymptomJobState::Queued
    );

    let batch = q.dequeue_batch(8).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job_id, job);
    assert_eq!(batch[0].observation, ObservationGrid::filled(0.25));
    assert_eq!(
        q.job_status(&job).unwrap().unwrap().state,
        DerivedSymptomJobState::Running
    );
    assert!(q.dequeue_batch(8).unwrap().is_empty());

    q.complete_commit(MonotonicTimeNs(20), &job, 7).unwrap();
    let status = q.job_status(&job).unwrap().unwrap();
    assert_eq!(status.state, DerivedSymptomJobState::Completed { ledger_id: 7 });
    assert_eq!(status.finished_at, Some(MonotonicTimeNs(20)));
}

#[test]
fn at_derived_db_02_terminal_state_is_immutable() {
    let q = DerivedSymptomJobQueue::new();
    let job = q
        .enqueue(
            MonotonicTimeNs(1),
            p("patient_1"),
            Actor::Subject(p("patient_1")),
            ObservationGrid::filled(0.0),
        )
        .unwrap();
    let _ = q.dequeue_batch(1).unwrap();
    q.fail_commit(MonotonicTimeNs(2), &job, "codec rejected").unwrap();

    assert!(matches!(
        q.complete_commit(MonotonicTimeNs(3), &job, 1),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(
        q.job_status(&job).unwrap().unwrap().state,
        DerivedSymptomJobState::Failed {
            reason: "codec rejected".to_string()
        }
    );
}

#[test]
fn at_derived_db_03_batch_respects_max_items_and_fifo_order() {
    let q = DerivedSymptomJobQueue::new();
    let mut ids = Vec::new();
    for t in 1..=3 {
        ids.push(
            q.enqueue(
                MonotonicTimeNs(t),
                p("patient_2"),
                Actor::Subject(p("patient_2")),
                ObservationGrid::filled(1.0),
            )
            .unwrap(),
        );
    }
    let first = q.dequeue_batch(2).unwrap();
    assert_eq!(
        first.iter().map(|w| w.job_id.clone()).collect::<Vec<_>>(),
        ids[..2].to_vec()
    );
    let counts = q.counts().unwrap();
    assert_eq!(counts.running_count, 2);
    assert_eq!(counts.queued_count, 1);
}

#[test]
fn at_derived_db_04_unknown_job_is_foreign_key_violation() {
    let q = DerivedSymptomJobQueue::new();
    let missing = medrec_kernel_contracts::derived::DerivedSymptomJobId::new("dsj_missing").unwrap();
    assert!(q.job_status(&missing).unwrap().is_none());
    assert!(matches!(
        q.fail_commit(MonotonicTimeNs(1), &missing, "x"),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_derived_db_05_terminal_retention_evicts_oldest_finished_jobs() {
    let q = DerivedSymptomJobQueue::with_terminal_retention(2);
    let jobs: Vec<_> = (1..=4)
        .map(|t| {
            q.enqueue(
                MonotonicTimeNs(t),
                p("patient_0"),
                Actor::Subject(p("patient_0")),
                ObservationGrid::filled(0.5),
            )
            .unwrap()
        })
        .collect();
    assert_eq!(q.dequeue_batch(8).unwrap().len(), 4);

    q.complete_commit(MonotonicTimeNs(10), &jobs[0], 1).unwrap();
    q.fail_commit(MonotonicTimeNs(11), &jobs[1], "bad").unwrap();
    q.complete_commit(MonotonicTimeNs(12), &jobs[2], 2).unwrap();

    assert!(q.job_status(&jobs[0]).unwrap().is_none());
    assert!(q.job_status(&jobs[1]).unwrap().is_some());
    assert!(q.job_status(&jobs[2]).unwrap().is_some());
    // Running jobs are never evicted.
    assert_eq!(
        q.job_status(&jobs[3]).unwrap().unwrap().state,
        DerivedSymptomJobState::Running
    );

    let counts = q.counts().unwrap();
    assert_eq!(counts.completed_count + counts.failed_count, 2);
    assert_eq!(counts.running_count, 1);
}
