//! Cluster-scoped RBAC tests. These touch global state and run alone.

use std::time::Duration;

use kcon_common::{TestCase, TestContext, TestResult};

const ROLE_NAME: &str = "kcon-conformance-reader";
const DELETE_TIMEOUT: Duration = Duration::from_secs(20);

pub const CASES: &[TestCase] = &[TestCase::new("ClusterRole001", cluster_role001)
    .serialized()
    .with_summary("A ClusterRole is created with the given rules, reads back unchanged and can be deleted.")];

const ROLE_YAML: &str = r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: kcon-conformance-reader
rules:
- apiGroups: [""]
  resources: ["pods", "services"]
  verbs: ["get", "list", "watch"]
"#;

/// The platform MUST store a ClusterRole's rules exactly as given.
fn cluster_role001(ctx: &mut TestContext) -> TestResult {
    let target = format!("clusterrole/{ROLE_NAME}");

    // Left behind by an interrupted run.
    ctx.kubectl(&["delete", target.as_str(), "--ignore-not-found"]);

    ctx.create_file("role.yaml", ROLE_YAML)?;
    ctx.kubectl_ok(&["create", "-f", "role.yaml"])?;

    // Namespace cleanup never sweeps cluster-scoped objects, so the role is
    // deleted whether or not the checks pass.
    let checked = check_role(ctx, &target);
    let deleted = ctx.kubectl_ok(&["delete", target.as_str(), "--ignore-not-found"]);
    checked?;
    deleted?;
    ctx.wait_for_deletion("clusterrole", ROLE_NAME, DELETE_TIMEOUT)
}

fn check_role(ctx: &mut TestContext, target: &str) -> TestResult {
    let out = ctx.kubectl_ok(&["get", target, "-o", "yaml"])?;
    let resource = ctx.yaml_value(&out.output, "rules[0].resources[1]")?;
    ctx.check_eq(resource.as_str(), "services", "resource")?;
    let verbs = ctx.yaml_value(&out.output, "rules[0].verbs")?;
    ctx.check_eq(verbs.as_str(), r#"["get","list","watch"]"#, "verbs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::testing::{not_found, run_case};
    use kcon_common::{CommandOutput, MockCluster};
    use std::sync::Arc;

    const TARGET: &str = "clusterrole/kcon-conformance-reader";

    fn stored_role(resources: &str) -> String {
        format!(
            r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: kcon-conformance-reader
rules:
- apiGroups:
  - ""
  resources: {resources}
  verbs:
  - get
  - list
  - watch
"#
        )
    }

    fn cluster(resources: &str) -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        cluster.script(&["create", "-f", "role.yaml"], CommandOutput::new(0, "created\n"));
        cluster.script(&["delete", TARGET], CommandOutput::new(0, "deleted\n"));
        cluster.script_once(&["get", TARGET], CommandOutput::new(0, stored_role(resources)));
        cluster.script(&["get", TARGET], not_found("clusterroles", ROLE_NAME));
        cluster
    }

    #[test]
    fn test_cluster_role001_passes() {
        let cluster = cluster("[pods, services]");
        let report = run_case(&CASES[0], cluster.clone());

        assert!(report.passed, "{:?}", report.message);
        assert_eq!(cluster.count_calls(&["delete", TARGET]), 2);
        // The leftover sweep comes first.
        assert_eq!(cluster.calls()[0][..2], ["delete".to_string(), TARGET.to_string()]);
    }

    #[test]
    fn test_cluster_role001_deletes_role_when_check_fails() {
        let cluster = cluster("[pods, secrets]");
        let report = run_case(&CASES[0], cluster.clone());

        assert!(!report.passed);
        let message = report.message.unwrap();
        assert!(message.starts_with("cluster_role.rs:"), "{message}");
        assert!(message.ends_with(r#"Wrong resource("secrets"), expected "services""#), "{message}");

        let calls = cluster.calls();
        let last = calls.last().unwrap();
        assert_eq!(last[..3], ["delete".to_string(), TARGET.to_string(), "--ignore-not-found".to_string()]);
        assert_eq!(cluster.count_calls(&["delete", TARGET]), 2);
    }
}
