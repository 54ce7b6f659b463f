//! Built-in conformance suite.

mod cluster_role;
mod pod;
mod replica_set;

use kcon_common::{Registry, TestCase};

/// Every built-in test, in run order.
pub fn cases() -> impl Iterator<Item = TestCase> {
    pod::CASES
        .iter()
        .chain(replica_set::CASES)
        .chain(cluster_role::CASES)
        .copied()
}

pub fn registry() -> Registry {
    Registry::new(cases())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_order_and_uniqueness() {
        let registry = registry();
        assert_eq!(
            registry.names(),
            &["Pod001", "Pod002", "ReplicaSet001", "ReplicaSet002", "ClusterRole001"]
        );
        let unique: HashSet<_> = cases().map(|c| c.name).collect();
        assert_eq!(unique.len(), registry.len());
    }

    #[test]
    fn test_only_cluster_scoped_tests_serialize() {
        let serialized: Vec<_> = cases().filter(|c| c.serialize).map(|c| c.name).collect();
        assert_eq!(serialized, vec!["ClusterRole001"]);
    }

    #[test]
    fn test_every_case_is_documented() {
        for case in cases() {
            assert!(!case.summary.is_empty(), "{} has no summary", case.name);
        }
    }
}
