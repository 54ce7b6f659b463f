use std::process::Command;

use crate::common::{assert_contains, assert_not_contains, init_test_logging};

/// Run the binary with a cluster command that cannot exist, so nothing here
/// can reach a real cluster.
fn kcon(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_kcon"))
        .args(args)
        .env("KCON_KUBECTL", "/nonexistent/kcon-test-kubectl")
        .env_remove("KCON_CONCURRENCY")
        .env_remove("KCON_NAMESPACE_PREFIX")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run kcon")
}

#[test]
fn test_kcon_help_includes_description() {
    init_test_logging();
    crate::test_log!("TEST START: test_kcon_help_includes_description");

    let output = kcon(&["--help"]);

    assert!(output.status.success(), "kcon --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "Kubernetes Conformance Runner");
    assert_contains(&stdout, "--concurrency");
    crate::test_log!("TEST PASS: test_kcon_help_includes_description");
}

#[test]
fn test_list_shows_builtin_suite() {
    init_test_logging();
    let output = kcon(&["--list"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["Pod001", "Pod002", "ReplicaSet001", "ReplicaSet002", "ClusterRole001"] {
        assert_contains(&stdout, name);
    }
    assert_contains(&stdout, "[serial]");
}

#[test]
fn test_list_json() {
    init_test_logging();
    let output = kcon(&["--list", "--json"]);

    assert!(output.status.success());
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[4]["name"], "ClusterRole001");
    assert_eq!(entries[4]["serialize"], true);
}

#[test]
fn test_unmatched_pattern_exits_nonzero_without_cluster() {
    init_test_logging();
    let output = kcon(&["NoSuchTest999"]);

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "Test name patterns didn't find any matches");
    assert_not_contains(&stdout, "Results:");
}

#[test]
fn test_unreachable_cluster_is_fatal() {
    init_test_logging();
    let output = kcon(&["pod001"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "No usable cluster context");
    assert_contains(&stderr, "failed to run");
}

#[test]
fn test_bad_pattern_is_rejected() {
    init_test_logging();
    let output = kcon(&["pod("]);

    assert_eq!(output.status.code(), Some(1));
    assert_contains(&String::from_utf8_lossy(&output.stderr), "Bad test pattern");
}

#[test]
fn test_invalid_concurrency_is_rejected() {
    init_test_logging();
    let output = kcon(&["--concurrency", "0", "pod"]);

    assert_eq!(output.status.code(), Some(1));
    assert_contains(&String::from_utf8_lossy(&output.stderr), "out of range");
}
