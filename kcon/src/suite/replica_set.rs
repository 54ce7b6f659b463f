//! ReplicaSet conformance tests.

use std::time::Duration;

use kcon_common::{Document, Poller, Probe, TestCase, TestContext, TestResult};

const READY_TIMEOUT: Duration = Duration::from_secs(60);

pub const CASES: &[TestCase] = &[
    TestCase::new("ReplicaSet001", replica_set001)
        .with_summary("A ReplicaSet brings up the requested number of ready replicas and can be deleted."),
    TestCase::new("ReplicaSet002", replica_set002)
        .with_summary("Scaling a ReplicaSet updates its desired replica count and the ready count follows."),
];

fn replica_set_manifest(name: &str, namespace: &str, replicas: u32) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: ReplicaSet
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: {replicas}
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
      - name: web
        image: nginx
        imagePullPolicy: IfNotPresent
"#
    )
}

/// Poll until `replicaset/<name>` reports `want` ready replicas.
fn wait_ready(ctx: &mut TestContext, name: &str, want: u32) -> TestResult {
    let namespace = ctx.namespace().to_string();
    let target = format!("replicaset/{name}");
    let want = want.to_string();
    let interval = ctx.poll_interval();

    let outcome = Poller::new(READY_TIMEOUT).with_interval(interval).wait(|| {
        let out = ctx.kubectl(&["get", target.as_str(), "-o", "json", "--namespace", namespace.as_str()]);
        if !out.success() {
            return Probe::pending(format!("Error getting {target}: {}", out.output.trim()));
        }
        match Document::from_json(&out.output).and_then(|doc| doc.lookup("status.readyReplicas")) {
            Ok(Some(ready)) if ready == want => Probe::ready(),
            Ok(ready) => Probe::pending(format!(
                "{target} has {} ready replicas",
                ready.as_deref().unwrap_or("0")
            )),
            Err(err) => Probe::pending(err.to_string()),
        }
    });
    outcome.into_result(&format!("{target} to have {want} ready replicas"))?;
    Ok(())
}

/// The platform MUST create the requested number of replicas, report them
/// as ready, and remove the ReplicaSet when it is deleted.
fn replica_set001(ctx: &mut TestContext) -> TestResult {
    let namespace = ctx.namespace().to_string();
    ctx.create_file("rs.yaml", &replica_set_manifest("rs001", &namespace, 2))?;
    ctx.kubectl_ok(&["create", "-f", "rs.yaml"])?;

    let out = ctx.kubectl_ok(&["get", "replicaset/rs001", "-o", "yaml", "--namespace", namespace.as_str()])?;
    let replicas = ctx.yaml_value(&out.output, "spec.replicas")?;
    ctx.check_eq(replicas.as_str(), "2", "replica count")?;
    let image = ctx.yaml_value(&out.output, "spec.template.spec.containers[0].image")?;
    ctx.check_eq(image.as_str(), "nginx", "image name")?;

    wait_ready(ctx, "rs001", 2)?;

    ctx.kubectl_ok(&["delete", "replicaset/rs001", "--namespace", namespace.as_str()])?;
    ctx.wait_for_deletion("replicaset", "rs001", READY_TIMEOUT)
}

/// Scaling MUST be reflected in `spec.replicas` immediately and in the
/// ready count eventually.
fn replica_set002(ctx: &mut TestContext) -> TestResult {
    let namespace = ctx.namespace().to_string();
    ctx.create_file("rs.yaml", &replica_set_manifest("rs002", &namespace, 1))?;
    ctx.kubectl_ok(&["create", "-f", "rs.yaml"])?;
    wait_ready(ctx, "rs002", 1)?;

    ctx.kubectl_ok(&["scale", "replicaset/rs002", "--replicas=3", "--namespace", namespace.as_str()])?;
    let out = ctx.kubectl_ok(&["get", "replicaset/rs002", "-o", "json", "--namespace", namespace.as_str()])?;
    let replicas = ctx.json_value(&out.output, "spec.replicas")?;
    ctx.check_eq(replicas.as_str(), "3", "replica count")?;
    ctx.log(format!("scaled rs002 to {replicas}"));

    wait_ready(ctx, "rs002", 3)?;

    ctx.kubectl_ok(&["delete", "replicaset/rs002", "--namespace", namespace.as_str()])?;
    ctx.wait_for_deletion("replicaset", "rs002", READY_TIMEOUT)
}
