#![forbid(unsafe_code)]

use forge_kernel_contracts::namespace::{JobId, OwnerId};
use forge_kernel_contracts::status::{BuildStatus, TerminalStatus};
use forge_kernel_contracts::MonotonicTimeNs;
use forge_storage::store::{ForgeStore, StorageError, INTERRUPTED_BY_RESTART};

fn owner() -> OwnerId {
    OwnerId::new("dbw-owner-1").unwrap()
}

fn job() -> JobId {
    JobId::new("q1").unwrap()
}

#[test]
fn at_journal_db_01_store_replays_status_and_quota_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("forge_store.jsonl");

    {
        let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
        let pending = s.begin_submission(&owner(), &job(), MonotonicTimeNs(1)).unwrap();
        s.complete_submission(
            &owner(),
            &job(),
            pending.submission_seq,
            TerminalStatus::Failed {
                error: "backend unavailable".to_string(),
            },
            MonotonicTimeNs(2),
        )
        .unwrap();
        s.admit_quota(&owner(), 10).unwrap();
        s.admit_quota(&owner(), 10).unwrap();
    }

    let lines = std::fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 4);

    let mut reopened = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    let row = reopened.status_row(&owner(), &job()).unwrap();
    assert_eq!(row.status, BuildStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("backend unavailable"));
    assert_eq!(reopened.quota_count(&owner()), 2);

    // Sequence numbering continues from the replayed row.
    let next = reopened
        .begin_submission(&owner(), &job(), MonotonicTimeNs(3))
        .unwrap();
    assert_eq!(next.submission_seq, 2);
}

#[test]
fn at_journal_db_02_denied_quota_appends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    s.admit_quota(&owner(), 1).unwrap();
    s.admit_quota(&owner(), 1).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
}

#[test]
fn at_journal_db_03_corrupt_line_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    std::fs::write(&path, "{\"schema_version\":1,\"event\":\n").unwrap();
    let err = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap_err();
    assert!(matches!(err, StorageError::Journal { .. }));
}

#[test]
fn at_journal_db_04_unknown_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    std::fs::write(
        &path,
        "{\"schema_version\":9,\"event\":{\"kind\":\"quota_written\",\"record\":{\"owner_id\":\"a\",\"count\":1}}}\n",
    )
    .unwrap();
    let err = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap_err();
    assert!(err.to_string().contains("unsupported schema_version=9"));
}

#[test]
fn at_journal_db_05_pending_row_from_previous_run_is_failed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    {
        let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
        s.begin_submission(&owner(), &job(), MonotonicTimeNs(1)).unwrap();
    }

    let reopened = ForgeStore::open_with_journal(&path, MonotonicTimeNs(50)).unwrap();
    let row = reopened.status_row(&owner(), &job()).unwrap();
    assert_eq!(row.status, BuildStatus::Failed);
    assert_eq!(row.error.as_deref(), Some(INTERRUPTED_BY_RESTART));
    assert_eq!(row.submission_seq, 1);
    assert_eq!(row.updated_at_ns, MonotonicTimeNs(50));
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

    // The failure was journaled, so a second restart writes nothing new.
    drop(reopened);
    let again = ForgeStore::open_with_journal(&path, MonotonicTimeNs(60)).unwrap();
    assert_eq!(
        again.status_row(&owner(), &job()).unwrap().updated_at_ns,
        MonotonicTimeNs(50)
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
}

#[test]
fn at_journal_db_06_torn_last_line_is_dropped_and_appends_continue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    {
        let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
        s.admit_quota(&owner(), 10).unwrap();
    }
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{\"schema_version\":1,\"event\":{\"kind\":\"quota_wr");
    std::fs::write(&path, &contents).unwrap();

    let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    assert_eq!(s.quota_count(&owner()), 1);
    s.admit_quota(&owner(), 10).unwrap();
    drop(s);

    let reopened = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    assert_eq!(reopened.quota_count(&owner()), 2);
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
}

#[test]
fn at_journal_db_07_complete_but_unterminated_last_line_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    std::fs::write(
        &path,
        "{\"schema_version\":1,\"event\":{\"kind\":\"quota_written\",\"record\":{\"owner_id\":\"dbw-owner-1\",\"count\":3}}}",
    )
    .unwrap();

    let mut s = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    assert_eq!(s.quota_count(&owner()), 3);
    s.admit_quota(&owner(), 10).unwrap();
    drop(s);

    let reopened = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap();
    assert_eq!(reopened.quota_count(&owner()), 4);
}

#[test]
fn at_journal_db_08_corruption_before_the_last_line_still_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge_store.jsonl");
    std::fs::write(
        &path,
        "{\"schema_version\":1,\"event\":{\"kind\":\"quota_wr\n{\"schema_version\":1,\"event\":{\"kind\":\"quota_written\",\"record\":{\"owner_id\":\"dbw-owner-1\",\"count\":3}}}\n",
    )
    .unwrap();
    let err = ForgeStore::open_with_journal(&path, MonotonicTimeNs(0)).unwrap_err();
    assert!(err.to_string().contains("failed parsing line 1"));
}
