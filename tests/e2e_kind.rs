use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use kube::CustomResourceExt;
use telemetry_k8s::controller::conditions::{
    REASON_MAX_PIPELINES_EXCEEDED, REASON_REFERENCED_SECRET_MISSING,
};
use telemetry_k8s::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};

const OPERATOR_NAMESPACE: &str = "telemetry-system";
const OPERATOR_NAME: &str = "telemetry-operator";
const TRACE_GATEWAY: &str = "telemetry-trace-gateway";

// ---------------------------------------------------------------------------
// End-to-end tests against a Kind cluster
//
// Run with: cargo test --test e2e_kind -- --ignored
// ---------------------------------------------------------------------------

/// Full lifecycle of a trace pipeline:
///
/// 1. Install the CRDs and deploy the operator.
/// 2. Create a TracePipeline and wait for the trace gateway Deployment.
/// 3. Assert `ConfigurationGenerated` turns True.
/// 4. Delete the pipeline and verify the gateway is removed.
#[test]
#[ignore]
fn e2e_trace_pipeline_lifecycle() -> Result<(), Box<dyn Error>> {
    let Some(_cleanup) = setup()? else {
        return Ok(());
    };

    kubectl_apply(&trace_pipeline_manifest("e2e-backend", None))?;

    wait_for("trace gateway deployment", Duration::from_secs(180), || {
        Ok(resource_exists("deployment", TRACE_GATEWAY, Some(OPERATOR_NAMESPACE)))
    })?;

    wait_for("ConfigurationGenerated=True", Duration::from_secs(120), || {
        Ok(condition_field("tracepipeline", "e2e-backend", "ConfigurationGenerated", "status")?
            == "True")
    })?;

    run_cmd("kubectl", &["delete", "tracepipeline", "e2e-backend", "--wait=true"])?;

    wait_for("trace gateway removal", Duration::from_secs(120), || {
        Ok(!resource_exists("deployment", TRACE_GATEWAY, Some(OPERATOR_NAMESPACE)))
    })?;

    Ok(())
}

/// Pipelines beyond the per-signal limit are rejected, oldest first wins.
#[test]
#[ignore]
fn e2e_max_pipelines_rejects_newest() -> Result<(), Box<dyn Error>> {
    let Some(_cleanup) = setup()? else {
        return Ok(());
    };

    for i in 0..6 {
        kubectl_apply(&trace_pipeline_manifest(&format!("e2e-limit-{i}"), None))?;
        // creation timestamps have second granularity
        sleep(Duration::from_millis(1100));
    }

    wait_for("newest pipeline rejected", Duration::from_secs(120), || {
        Ok(condition_field("tracepipeline", "e2e-limit-5", "ConfigurationGenerated", "reason")?
            == REASON_MAX_PIPELINES_EXCEEDED)
    })?;

    let oldest = condition_field("tracepipeline", "e2e-limit-0", "ConfigurationGenerated", "status")?;
    assert_eq!(oldest, "True");

    for i in 0..6 {
        let _ = run_cmd_quiet("kubectl", &["delete", "tracepipeline", &format!("e2e-limit-{i}")]);
    }
    Ok(())
}

/// A pipeline pointing at a missing Secret recovers once the Secret appears.
#[test]
#[ignore]
fn e2e_missing_secret_recovers() -> Result<(), Box<dyn Error>> {
    let Some(_cleanup) = setup()? else {
        return Ok(());
    };

    kubectl_apply(&trace_pipeline_manifest("e2e-secret", Some("e2e-backend-endpoint")))?;

    wait_for("ReferencedSecretMissing", Duration::from_secs(120), || {
        Ok(condition_field("tracepipeline", "e2e-secret", "ConfigurationGenerated", "reason")?
            == REASON_REFERENCED_SECRET_MISSING)
    })?;

    run_cmd(
        "kubectl",
        &[
            "create",
            "secret",
            "generic",
            "e2e-backend-endpoint",
            "-n",
            OPERATOR_NAMESPACE,
            "--from-literal=endpoint=http://otlp-sink.default:4317",
        ],
    )?;

    wait_for("ConfigurationGenerated=True", Duration::from_secs(120), || {
        Ok(condition_field("tracepipeline", "e2e-secret", "ConfigurationGenerated", "status")?
            == "True")
    })?;

    let _ = run_cmd_quiet("kubectl", &["delete", "tracepipeline", "e2e-secret"]);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Prepare the cluster; `None` when the cluster tools are not installed.
fn setup() -> Result<Option<Cleanup>, Box<dyn Error>> {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(None);
        }
    }

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "telemetry-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    kubectl_apply(&crd_manifest()?)?;

    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "telemetry-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", true) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &cluster_name],
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let cleanup = Cleanup {
        operator_manifest: operator_yaml.clone(),
    };

    run_cmd(
        "kubectl",
        &[
            "create",
            "namespace",
            OPERATOR_NAMESPACE,
            "--dry-run=client",
            "-o",
            "yaml",
        ],
    )
    .and_then(|output| kubectl_apply(&output))?;

    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{OPERATOR_NAME}"),
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    Ok(Some(cleanup))
}

fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn crd_manifest() -> Result<String, Box<dyn Error>> {
    let mut manifest = String::new();
    for crd in [
        LogPipeline::crd(),
        MetricPipeline::crd(),
        TracePipeline::crd(),
        Telemetry::crd(),
    ] {
        manifest.push_str("---\n");
        manifest.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(manifest)
}

fn trace_pipeline_manifest(name: &str, endpoint_secret: Option<&str>) -> String {
    let endpoint = match endpoint_secret {
        Some(secret) => format!(
            r#"valueFrom:
            secretKeyRef:
              name: {secret}
              namespace: {OPERATOR_NAMESPACE}
              key: endpoint"#
        ),
        None => "value: http://otlp-sink.default:4317".to_string(),
    };
    format!(
        r#"apiVersion: telemetry.kube-ops.io/v1alpha1
kind: TracePipeline
metadata:
  name: {name}
spec:
  output:
    otlp:
      endpoint:
        {endpoint}
"#
    )
}

fn resource_exists(kind: &str, name: &str, namespace: Option<&str>) -> bool {
    let mut args = vec!["get", kind, name];
    if let Some(ns) = namespace {
        args.extend(["-n", ns]);
    }
    run_cmd("kubectl", &args).is_ok()
}

/// Read one field of a named status condition, or "" when absent
fn condition_field(
    kind: &str,
    name: &str,
    condition: &str,
    field: &str,
) -> Result<String, Box<dyn Error>> {
    let path = format!("jsonpath={{.status.conditions[?(@.type==\"{condition}\")].{field}}}");
    let output = run_cmd("kubectl", &["get", kind, name, "-o", &path])?;
    Ok(output.trim().to_string())
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn kube_command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    cmd
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let output = kube_command(program, args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("command failed: {} {:?}\nstderr:\n{}", program, args, stderr).into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = kube_command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(())
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    let _ = kube_command(program, args).output();
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {OPERATOR_NAME}
rules:
  - apiGroups: ["telemetry.kube-ops.io"]
    resources: ["logpipelines", "metricpipelines", "tracepipelines", "telemetries"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: ["telemetry.kube-ops.io"]
    resources:
      - logpipelines/status
      - metricpipelines/status
      - tracepipelines/status
      - telemetries/status
    verbs: ["get", "update", "patch"]
  - apiGroups: [""]
    resources: ["pods", "secrets"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["services", "configmaps", "serviceaccounts"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["create", "update", "patch", "delete"]
  - apiGroups: ["apps"]
    resources: ["deployments", "daemonsets"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["rbac.authorization.k8s.io"]
    resources: ["clusterroles", "clusterrolebindings"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete", "bind", "escalate"]
  - apiGroups: ["networking.k8s.io"]
    resources: ["networkpolicies"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {OPERATOR_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {OPERATOR_NAME}
subjects:
  - kind: ServiceAccount
    name: {OPERATOR_NAME}
    namespace: {OPERATOR_NAMESPACE}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {OPERATOR_NAME}
  template:
    metadata:
      labels:
        app: {OPERATOR_NAME}
    spec:
      serviceAccountName: {OPERATOR_NAME}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {OPERATOR_NAMESPACE}
            - name: LEADER_ELECTION
              value: "false"
"#
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let mut child = match kube_command("kubectl", &["delete", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(_) => return,
        };
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write;
            let _ = stdin.write_all(self.operator_manifest.as_bytes());
        }
        let _ = child.wait();
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "namespace",
                OPERATOR_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
    }
}
