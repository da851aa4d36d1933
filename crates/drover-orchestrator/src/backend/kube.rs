//! Cluster orchestrator backend speaking the Kubernetes REST API.
//!
//! Each run gets its own namespace and every step becomes a single-container
//! pod with `restartPolicy: Never`. Destroying the namespace removes
//! everything the run created.

use async_trait::async_trait;
use drover_core::{Endpoint, PipelineConfig, Step, StepState, WorkItem};
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BoxedEngine, Engine, EngineFactory, LogStream};
use crate::error::{OrchestratorError, Result};

const MAX_NAME_LEN: usize = 63;

fn sanitize(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Converts an arbitrary name to a DNS-1123 label.
pub fn dns_label(raw: &str) -> String {
    let mut label = sanitize(raw);
    label.truncate(MAX_NAME_LEN);
    let trimmed = label.trim_matches('-');
    if trimmed.is_empty() {
        "step".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Converts a run prefix to a namespace name.
///
/// The trailing segment is the run nonce and always survives; only the
/// part before it is shortened to fit the label limit.
pub fn namespace_label(prefix: &str) -> String {
    let label = sanitize(prefix);
    let label = label.trim_matches('-');
    if label.len() <= MAX_NAME_LEN {
        return dns_label(label);
    }

    let Some((head, nonce)) = label.rsplit_once('-') else {
        return dns_label(label);
    };
    let nonce = &nonce[..nonce.len().min(MAX_NAME_LEN / 2)];
    let mut head = head.to_string();
    head.truncate(MAX_NAME_LEN - nonce.len() - 1);
    let head = head.trim_end_matches('-');
    if head.is_empty() {
        return dns_label(nonce);
    }
    format!("{head}-{nonce}")
}

/// Builds the namespace object for a run.
pub fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": { "app.kubernetes.io/managed-by": "drover" }
        }
    })
}

/// Builds the pod object for a step.
pub fn pod_manifest(step: &Step) -> Value {
    let env: Vec<Value> = step
        .environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut container = json!({
        "name": "step",
        "image": step.image,
        "imagePullPolicy": if step.pull { "Always" } else { "IfNotPresent" },
        "env": env,
        "securityContext": { "privileged": step.privileged }
    });
    if !step.entrypoint.is_empty() {
        container["command"] = json!(step.entrypoint);
    }
    if !step.command.is_empty() {
        container["args"] = json!(step.command);
    }
    if let Some(dir) = &step.working_dir {
        container["workingDir"] = json!(dir);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": dns_label(&step.name),
            "labels": { "drover.step": dns_label(&step.name) }
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [container]
        }
    })
}

/// Reads the terminal state of a pod, or `None` while it is still running.
pub fn pod_state(pod: &Value) -> Option<StepState> {
    let phase = pod.pointer("/status/phase")?.as_str()?;
    if phase != "Succeeded" && phase != "Failed" {
        return None;
    }

    match pod.pointer("/status/containerStatuses/0/state/terminated") {
        Some(terminated) => Some(StepState {
            exited: true,
            exit_code: terminated["exitCode"].as_i64().unwrap_or(0),
            oom_killed: terminated["reason"].as_str() == Some("OOMKilled"),
        }),
        // evicted or never scheduled
        None => Some(StepState::default()),
    }
}

fn pod_phase(pod: &Value) -> &str {
    pod.pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("Pending")
}

/// [`Engine`] running each step as a pod in a per-run namespace.
pub struct KubeEngine {
    client: Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    poll_interval: Duration,
}

impl KubeEngine {
    /// Creates an engine for `endpoint` working in the namespace derived
    /// from `prefix`.
    pub async fn new(endpoint: &Endpoint, prefix: &str) -> Result<Self> {
        let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));

        if let Some(tls) = &endpoint.tls {
            let ca = tokio::fs::read(&tls.ca).await?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&ca)?);

            let mut identity = tokio::fs::read(&tls.cert).await?;
            identity.extend(tokio::fs::read(&tls.key).await?);
            builder = builder.identity(reqwest::Identity::from_pem(&identity)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: endpoint.address.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
            namespace: namespace_label(prefix),
            poll_interval: Duration::from_secs(1),
        })
    }

    /// Sets how often `wait` polls the pod.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the namespace of this run.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let response = req.send().await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(OrchestratorError::KubeApi { status, body })
        }
    }

    fn pod_path(&self, step: &Step) -> String {
        format!(
            "/api/v1/namespaces/{}/pods/{}",
            self.namespace,
            dns_label(&step.name)
        )
    }

    async fn get_pod(&self, step: &Step) -> Result<Value> {
        let response = self.send(self.request(Method::GET, &self.pod_path(step))).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Engine for KubeEngine {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn setup(&self, config: &PipelineConfig) -> Result<()> {
        let req = self
            .request(Method::POST, "/api/v1/namespaces")
            .json(&namespace_manifest(&self.namespace));

        match self.send(req).await {
            Ok(_) => {}
            // left over from an earlier attempt
            Err(OrchestratorError::KubeApi { status: 409, .. }) => {
                debug!(namespace = %self.namespace, "namespace already exists");
            }
            Err(e) => return Err(OrchestratorError::setup_failed(e.to_string())),
        }

        if !config.volumes.is_empty() || !config.networks.is_empty() {
            debug!(
                namespace = %self.namespace,
                "pipeline volumes and networks are not provisioned on kubernetes"
            );
        }
        info!(namespace = %self.namespace, "namespace ready");
        Ok(())
    }

    async fn exec(&self, step: &Step) -> Result<()> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let req = self.request(Method::POST, &path).json(&pod_manifest(step));
        self.send(req)
            .await
            .map_err(|e| OrchestratorError::exec_failed(&step.name, e.to_string()))?;
        info!(namespace = %self.namespace, step = %step.name, image = %step.image, "pod created");
        Ok(())
    }

    async fn kill(&self, step: &Step) -> Result<()> {
        let req = self
            .request(Method::DELETE, &self.pod_path(step))
            .query(&[("gracePeriodSeconds", "0")]);
        match self.send(req).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait(&self, step: &Step) -> Result<StepState> {
        loop {
            let pod = self.get_pod(step).await?;
            if let Some(state) = pod_state(&pod) {
                debug!(step = %step.name, exit_code = state.exit_code, "pod terminated");
                return Ok(state);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn tail(&self, step: &Step) -> Result<LogStream> {
        // the log endpoint rejects pods whose container has not started
        loop {
            let pod = self.get_pod(step).await?;
            if pod_phase(&pod) != "Pending" {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let req = self
            .request(Method::GET, &format!("{}/log", self.pod_path(step)))
            .query(&[("follow", "true")]);
        let response = self.send(req).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(OrchestratorError::from))
            .boxed())
    }

    async fn destroy(&self, _config: &PipelineConfig) -> Result<()> {
        let req = self.request(
            Method::DELETE,
            &format!("/api/v1/namespaces/{}", self.namespace),
        );
        match self.send(req).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "namespace deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "failed to delete namespace");
                Err(OrchestratorError::teardown_failed(e.to_string()))
            }
        }
    }
}

/// Opens [`KubeEngine`]s on kubernetes endpoints.
#[derive(Debug, Default)]
pub struct KubeFactory;

impl KubeFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineFactory for KubeFactory {
    async fn connect(&self, endpoint: &Endpoint, item: &WorkItem) -> Result<BoxedEngine> {
        let prefix = super::docker::run_prefix(item);
        Ok(Arc::new(KubeEngine::new(endpoint, &prefix).await?))
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        let engine = KubeEngine::new(endpoint, "ping").await?;
        let response = engine.send(engine.request(Method::GET, "/version")).await?;
        if response.status() != StatusCode::OK {
            return Err(OrchestratorError::KubeApi {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_label_sanitizes() {
        assert_eq!(dns_label("drover_org/repo_42_ab12"), "drover-org-repo-42-ab12");
        assert_eq!(dns_label("__"), "step");
        assert!(dns_label(&"x".repeat(100)).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn namespace_keeps_nonce_for_long_ids() {
        let item = WorkItem::new(
            "github.com/some-org/some-long-repository-name/pipelines/1234",
            PipelineConfig::new("p"),
        );
        let a = super::super::docker::run_prefix(&item);
        let b = super::super::docker::run_prefix(&item);

        let (ns_a, ns_b) = (namespace_label(&a), namespace_label(&b));
        assert_ne!(ns_a, ns_b);
        for (prefix, ns) in [(&a, &ns_a), (&b, &ns_b)] {
            assert!(ns.len() <= MAX_NAME_LEN);
            assert!(ns.starts_with("drover-github-com"));
            let nonce = prefix.rsplit('_').next().unwrap();
            assert!(ns.ends_with(&format!("-{nonce}")));
            assert_eq!(dns_label(ns), *ns);
        }
    }

    #[test]
    fn short_namespace_is_unchanged() {
        assert_eq!(namespace_label("drover_42_abcdef12"), "drover-42-abcdef12");
    }

    #[tokio::test]
    async fn missing_tls_material_fails_connect() {
        let mut endpoint = Endpoint::kubernetes("k1", "https://k8s.local:6443");
        endpoint.tls = Some(drover_core::TlsPaths {
            ca: "/nonexistent/ca.pem".into(),
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        });
        assert!(KubeEngine::new(&endpoint, "drover_1_abcdef12").await.is_err());
    }

    #[test]
    fn pod_manifest_maps_step_fields() {
        let mut step = Step::new("Unit_Tests", "rust:1.80")
            .command(["cargo", "test"])
            .env("CI", "true")
            .pull(true);
        step.entrypoint = vec!["/bin/sh".into(), "-c".into()];
        step.working_dir = Some("/src".into());

        let pod = pod_manifest(&step);

        assert_eq!(pod["metadata"]["name"], "unit-tests");
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["image"], "rust:1.80");
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(container["command"], json!(["/bin/sh", "-c"]));
        assert_eq!(container["args"], json!(["cargo", "test"]));
        assert_eq!(container["env"], json!([{ "name": "CI", "value": "true" }]));
        assert_eq!(container["workingDir"], "/src");
    }

    #[test]
    fn pod_manifest_omits_empty_command() {
        let pod = pod_manifest(&Step::new("a", "alpine"));
        let container = &pod["spec"]["containers"][0];
        assert!(container.get("command").is_none());
        assert!(container.get("args").is_none());
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
    }

    #[test]
    fn namespace_manifest_is_labelled() {
        let ns = namespace_manifest("drover-1");
        assert_eq!(ns["kind"], "Namespace");
        assert_eq!(ns["metadata"]["name"], "drover-1");
    }

    #[test]
    fn pod_state_reads_terminated_container() {
        let running = json!({ "status": { "phase": "Running" } });
        assert_eq!(pod_state(&running), None);

        let failed = json!({
            "status": {
                "phase": "Failed",
                "containerStatuses": [
                    { "state": { "terminated": { "exitCode": 137, "reason": "OOMKilled" } } }
                ]
            }
        });
        let state = pod_state(&failed).unwrap();
        assert!(state.exited);
        assert_eq!(state.exit_code, 137);
        assert!(state.oom_killed);

        let evicted = json!({ "status": { "phase": "Failed" } });
        assert!(!pod_state(&evicted).unwrap().exited);
    }

    #[tokio::test]
    async fn engine_namespace_is_dns_safe() {
        let endpoint = Endpoint::kubernetes("k1", "https://k8s.local:6443/").with_token("t");
        let engine = KubeEngine::new(&endpoint, "drover_42_abcdef12").await.unwrap();
        assert_eq!(engine.namespace(), "drover-42-abcdef12");

        let step = Step::new("build", "alpine");
        assert_eq!(
            engine.pod_path(&step),
            "/api/v1/namespaces/drover-42-abcdef12/pods/build"
        );
        let req = engine.request(Method::GET, "/version").build().unwrap();
        assert_eq!(req.url().as_str(), "https://k8s.local:6443/version");
    }
}
