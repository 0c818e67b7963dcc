#![forbid(unsafe_code)]

use forge_kernel_contracts::namespace::{JobId, OwnerId};
use forge_kernel_contracts::status::{BuildStatus, TerminalStatus};
use forge_kernel_contracts::MonotonicTimeNs;
use forge_storage::repo::StatusStoreRepo;
use forge_storage::store::{ForgeStore, StorageError};

fn owner() -> OwnerId {
    OwnerId::new("dbw-owner-1").unwrap()
}

fn job(id: &str) -> JobId {
    JobId::new(id).unwrap()
}

fn built(image: &str) -> TerminalStatus {
    TerminalStatus::Built {
        image_ref: image.to_string(),
    }
}

#[test]
fn at_status_db_01_pending_then_built_is_the_only_write_sequence() {
    let mut s = ForgeStore::new_in_memory();
    let pending = s
        .begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(1))
        .unwrap();
    assert_eq!(pending.status, BuildStatus::Pending);
    assert!(pending.image_ref.is_none());

    let done = s
        .complete_submission_row(
            &owner(),
            &job("q1"),
            pending.submission_seq,
            built("repo/user_dbw-owner-1_q_q1:latest"),
            MonotonicTimeNs(2),
        )
        .unwrap();
    assert_eq!(done.status, BuildStatus::Built);

    let row = StatusStoreRepo::status_row(&s, &owner(), &job("q1")).unwrap();
    assert_eq!(
        row.image_ref.as_deref(),
        Some("repo/user_dbw-owner-1_q_q1:latest")
    );
    assert_eq!(row.updated_at_ns, MonotonicTimeNs(2));
}

#[test]
fn at_status_db_02_terminal_never_regresses_without_new_submission() {
    let mut s = ForgeStore::new_in_memory();
    let pending = s
        .begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(1))
        .unwrap();
    s.complete_submission_row(
        &owner(),
        &job("q1"),
        pending.submission_seq,
        built("img"),
        MonotonicTimeNs(2),
    )
    .unwrap();

    let err = s
        .complete_submission_row(
            &owner(),
            &job("q1"),
            pending.submission_seq,
            TerminalStatus::Failed {
                error: "late".to_string(),
            },
            MonotonicTimeNs(3),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
    assert_eq!(
        StatusStoreRepo::status_row(&s, &owner(), &job("q1"))
            .unwrap()
            .status,
        BuildStatus::Built
    );

    // A new submission is the only way back to pending.
    let again = s
        .begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(4))
        .unwrap();
    assert_eq!(again.status, BuildStatus::Pending);
    assert_eq!(again.submission_seq, 2);
}

#[test]
fn at_status_db_03_superseded_submission_cannot_write_its_outcome() {
    let mut s = ForgeStore::new_in_memory();
    let first = s
        .begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(1))
        .unwrap();
    let second = s
        .begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(2))
        .unwrap();

    let err = s
        .complete_submission_row(
            &owner(),
            &job("q1"),
            first.submission_seq,
            built("old"),
            MonotonicTimeNs(3),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::StaleSubmission {
            attempted_seq: 1,
            current_seq: 2,
            ..
        }
    ));

    s.complete_submission_row(
        &owner(),
        &job("q1"),
        second.submission_seq,
        built("new"),
        MonotonicTimeNs(4),
    )
    .unwrap();
    assert_eq!(
        StatusStoreRepo::status_row(&s, &owner(), &job("q1"))
            .unwrap()
            .image_ref
            .as_deref(),
        Some("new")
    );
}

#[test]
fn at_status_db_04_unknown_job_is_not_found() {
    let mut s = ForgeStore::new_in_memory();
    assert!(StatusStoreRepo::status_row(&s, &owner(), &job("missing")).is_none());
    let err = s
        .complete_submission_row(
            &owner(),
            &job("missing"),
            1,
            built("img"),
            MonotonicTimeNs(1),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[test]
fn at_status_db_05_rows_are_scoped_per_owner() {
    let mut s = ForgeStore::new_in_memory();
    let other = OwnerId::new("dbw-owner-2").unwrap();
    s.begin_submission_row(&owner(), &job("q1"), MonotonicTimeNs(1))
        .unwrap();
    s.begin_submission_row(&owner(), &job("q2"), MonotonicTimeNs(1))
        .unwrap();
    s.begin_submission_row(&other, &job("q1"), MonotonicTimeNs(1))
        .unwrap();
    assert_eq!(StatusStoreRepo::status_rows_for_owner(&s, &owner()).len(), 2);
    assert_eq!(StatusStoreRepo::status_rows_for_owner(&s, &other).len(), 1);
}
