#![forbid(unsafe_code)]

use medrec_kernel_contracts::evidence::{
    ContentId, EvidenceLedgerRowInput, EvidencePayload, EvidenceStreamKind, SymptomText,
};
use medrec_kernel_contracts::roster::{Actor, AuthorityId, SubjectId};
use medrec_kernel_contracts::MonotonicTimeNs;
use medrec_storage::ledger::{EvidenceLedgerStore, StorageError};
use medrec_storage::repo::{EvidenceLedgerRepo, SharedEvidenceLedger};

fn subject(id: &str) -> SubjectId {
    SubjectId::new(id).unwrap()
}

fn doctor() -> Actor {
    Actor::Authority(AuthorityId::new("doctor").unwrap())
}

fn symptom_ev(t: u64, subject_id: &str, text: &str) -> EvidenceLedgerRowInput {
    EvidenceLedgerRowInput::v1(
        MonotonicTimeNs(t),
        subject(subject_id),
        doctor(),
        EvidencePayload::Symptom(SymptomText::new(text).unwrap()),
    )
    .unwrap()
}

#[test]
fn at_evidence_db_01_subject_isolation_enforced() {
    let mut s = EvidenceLedgerStore::new_in_memory();
    s.append_evidence_row(symptom_ev(10, "patient_0", "fever")).unwrap();
    s.append_evidence_row(symptom_ev(11, "patient_1", "rash")).unwrap();

    let p0 = s.stream_rows(&subject("patient_0"), EvidenceStreamKind::Symptom);
    let p1 = s.stream_rows(&subject("patient_1"), EvidenceStreamKind::Symptom);
    assert_eq!(p0.len(), 1);
    assert_eq!(p1.len(), 1);
    assert_eq!(p0[0].payload.as_str(), "fever");
    assert_eq!(p1[0].payload.as_str(), "rash");
    assert_eq!(s.evidence_rows().len(), 2);
}

#[test]
fn at_evidence_db_02_append_only_enforced() {
    let mut s = EvidenceLedgerStore::new_in_memory();
    let ledger_id = s
        .append_evidence_row(symptom_ev(20, "patient_0", "fever"))
        .unwrap();

    assert!(matches!(
        s.attempt_overwrite_evidence_row(ledger_id),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.evidence_row(ledger_id).unwrap().payload.as_str(), "fever");
}

#[test]
fn at_evidence_db_03_streams_are_ordered_and_sequenced_per_subject() {
    let mut s = EvidenceLedgerStore::new_in_memory();
    s.append_evidence_row(symptom_ev(30, "patient_1", "fever")).unwrap();
    s.append_evidence_row(symptom_ev(31, "patient_2", "chills")).unwrap();
    s.append_evidence_row(symptom_ev(32, "patient_1", "cough")).unwrap();

    let rows = s.stream_rows(&subject("patient_1"), EvidenceStreamKind::Symptom);
    let texts: Vec<&str> = rows.iter().map(|r| r.payload.as_str()).collect();
    assert_eq!(texts, vec!["fever", "cough"]);
    assert_eq!(rows[0].stream_seq, 1);
    assert_eq!(rows[1].stream_seq, 2);
    assert_eq!(rows[0].ledger_id, 1);
    assert_eq!(rows[1].ledger_id, 3);
}

#[test]
fn at_evidence_db_04_never_written_stream_reads_empty() {
    let ledger = SharedEvidenceLedger::in_memory();
    assert!(ledger.list_symptoms(&subject("patient_2")).unwrap().is_empty());
    assert!(ledger.list_files(&subject("patient_2")).unwrap().is_empty());
}

#[test]
fn at_evidence_db_05_symptom_and_file_streams_are_separate() {
    let ledger = SharedEvidenceLedger::in_memory();
    let p0 = subject("patient_0");
    let cid = ContentId::new("sha256-abc123").unwrap();
    ledger
        .append_symptom(MonotonicTimeNs(1), &p0, &doctor(), SymptomText::new("fever").unwrap())
        .unwrap();
    ledger
        .append_file(MonotonicTimeNs(2), &p0, &doctor(), cid.clone())
        .unwrap();
    ledger
        .append_file(MonotonicTimeNs(3), &p0, &doctor(), cid.clone())
        .unwrap();

    assert_eq!(
        ledger.list_symptoms(&p0).unwrap(),
        vec![SymptomText::new("fever").unwrap()]
    );
    assert_eq!(ledger.list_files(&p0).unwrap(), vec![cid.clone(), cid]);
    assert_eq!(
        ledger
            .with_store(|s| s.stream_len(&p0, EvidenceStreamKind::File))
            .unwrap(),
        2
    );
}

#[test]
fn at_evidence_db_06_rows_attribute_the_appending_actor() {
    let ledger = SharedEvidenceLedger::in_memory();
    let p1 = subject("patient_1");
    let self_actor = Actor::Subject(p1.clone());
    ledger
        .append_symptom(MonotonicTimeNs(5), &p1, &self_actor, SymptomText::new("cough").unwrap())
        .unwrap();
    let appended_by = ledger
        .with_store(|s| s.evidence_rows()[0].appended_by.clone())
        .unwrap();
    assert_eq!(appended_by, self_actor);
}

#[test]
fn at_evidence_db_07_zero_time_is_rejected_without_state_change() {
    let ledger = SharedEvidenceLedger::in_memory();
    let p0 = subject("patient_0");
    let out = ledger.append_symptom(
        MonotonicTimeNs(0),
        &p0,
        &doctor(),
        SymptomText::new("fever").unwrap(),
    );
    assert!(matches!(out, Err(StorageError::ContractViolation(_))));
    assert!(ledger.list_symptoms(&p0).unwrap().is_empty());
}
