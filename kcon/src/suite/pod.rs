//! Pod conformance tests.

use std::time::Duration;

use kcon_common::{TestCase, TestContext, TestFailure, TestResult};

const POD_TIMEOUT: Duration = Duration::from_secs(20);

pub const CASES: &[TestCase] = &[
    TestCase::new("Pod001", pod001).with_summary(
        "Simple Pod creation works: metadata reads back as created, the Pod reaches Running and can be deleted.",
    ),
    TestCase::new("Pod002", pod002).with_summary(
        "Labels and container environment given at creation are returned unchanged by the platform.",
    ),
];

/// The platform MUST create the specified Pod and queries to retrieve the
/// Pod's metadata MUST return the same values that were used when it was
/// created. The Pod MUST eventually end up in the `Running` state, and then
/// be able to be deleted. Deleting a Pod MUST remove it from the platform.
fn pod001(ctx: &mut TestContext) -> TestResult {
    let namespace = ctx.namespace().to_string();
    ctx.create_file(
        "pod.json",
        &format!(
            r#"{{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {{ "name": "pod001", "namespace": "{namespace}" }},
  "spec": {{
    "containers": [{{
      "name": "pod1",
      "image": "nginx",
      "imagePullPolicy": "IfNotPresent"
    }}]
  }}
}}"#
        ),
    )?;

    ctx.kubectl_ok(&["create", "-f", "pod.json"])?;
    ctx.kubectl_ok(&["get", "pods", "--namespace", namespace.as_str()])?;
    let out = ctx.kubectl_ok(&["get", "pod/pod001", "-o", "yaml", "--namespace", namespace.as_str()])?;

    ctx.wait_for_phase("pod", "pod001", "Running", POD_TIMEOUT)?;

    let name = ctx.yaml_value(&out.output, "metadata.name")?;
    ctx.check_eq(name.as_str(), "pod001", "pod name")?;
    let image = ctx.yaml_value(&out.output, "spec.containers[0].image")?;
    ctx.check_eq(image.as_str(), "nginx", "image name")?;

    ctx.kubectl_ok(&["delete", "pod/pod001", "--namespace", namespace.as_str()])?;
    ctx.wait_for_deletion("pod", "pod001", POD_TIMEOUT)
}

/// Labels and environment variables supplied at creation MUST be returned
/// unchanged when the Pod is read back.
fn pod002(ctx: &mut TestContext) -> TestResult {
    let namespace = ctx.namespace().to_string();
    ctx.create_file(
        "pod.yaml",
        &format!(
            r#"apiVersion: v1
kind: Pod
metadata:
  name: pod002
  namespace: {namespace}
  labels:
    app: conformance
    tier: web
spec:
  containers:
  - name: main
    image: nginx
    imagePullPolicy: IfNotPresent
    env:
    - name: GREETING
      value: hello
    - name: TARGET
      value: world
"#
        ),
    )?;

    ctx.kubectl_ok(&["create", "-f", "pod.yaml"])?;
    let out = ctx.kubectl_ok(&["get", "pod/pod002", "-o", "json", "--namespace", namespace.as_str()])?;

    let app = ctx.json_value(&out.output, "metadata.labels.app")?;
    ctx.check_eq(app.as_str(), "conformance", "app label")?;
    let tier = ctx.json_value(&out.output, "metadata.labels.tier")?;
    ctx.check_eq(tier.as_str(), "web", "tier label")?;
    let target = ctx.json_value(&out.output, "spec.containers[0].env[1].value")?;
    ctx.check_eq(target.as_str(), "world", "TARGET value")?;

    match ctx.json_value(&out.output, "spec.containers[1]") {
        Err(err) if err.is_not_found() => {}
        Ok(extra) => return Err(ctx.fail(format!("Unexpected second container: {extra}"))),
        Err(err) => return Err(TestFailure::from(err)),
    }

    ctx.wait_for_phase("pod", "pod002", "Running", POD_TIMEOUT)?;
    ctx.kubectl_ok(&["delete", "pod/pod002", "--namespace", namespace.as_str()])?;
    ctx.wait_for_deletion("pod", "pod002", POD_TIMEOUT)
}
