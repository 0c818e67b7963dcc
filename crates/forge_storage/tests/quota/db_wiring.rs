#![forbid(unsafe_code)]

use forge_kernel_contracts::namespace::OwnerId;
use forge_kernel_contracts::quota::QuotaDecision;
use forge_storage::repo::QuotaRepo;
use forge_storage::store::ForgeStore;

fn owner(id: &str) -> OwnerId {
    OwnerId::new(id).unwrap()
}

#[test]
fn at_quota_db_01_each_admitted_check_adds_exactly_one() {
    let mut s = ForgeStore::new_in_memory();
    for expected in 1..=3 {
        assert_eq!(
            s.admit_quota_row(&owner("u1"), 10).unwrap(),
            QuotaDecision::Admitted { count: expected }
        );
        assert_eq!(QuotaRepo::quota_row(&s, &owner("u1")).unwrap().count, expected);
    }
}

#[test]
fn at_quota_db_02_limit_plus_one_is_denied_without_increment() {
    let limit = 5;
    let mut s = ForgeStore::new_in_memory();
    for _ in 0..limit {
        assert!(s.admit_quota_row(&owner("u1"), limit).unwrap().is_admitted());
    }
    for _ in 0..3 {
        assert_eq!(
            s.admit_quota_row(&owner("u1"), limit).unwrap(),
            QuotaDecision::Denied {
                current_count: limit
            }
        );
    }
    assert_eq!(QuotaRepo::quota_row(&s, &owner("u1")).unwrap().count, limit);
}

#[test]
fn at_quota_db_03_counters_are_independent_per_owner() {
    let mut s = ForgeStore::new_in_memory();
    s.admit_quota_row(&owner("u1"), 1).unwrap();
    assert!(!s.admit_quota_row(&owner("u1"), 1).unwrap().is_admitted());
    assert!(s.admit_quota_row(&owner("u2"), 1).unwrap().is_admitted());
    assert!(QuotaRepo::quota_row(&s, &owner("u3")).is_none());
}
