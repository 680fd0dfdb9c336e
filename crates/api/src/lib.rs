//! Keel API façade (in-process).
//!
//! Request handlers and the CLI depend on this crate: it decodes nothing itself, but
//! takes validated manifests, converges them onto the live resources, persists the
//! result and hands deployments to their controller.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use keel_controller::Controller;
use keel_converge::{converge_deployment, converge_pod, DeploymentManifest, DiffSummary, Manifest, NamespaceManifest, PodManifest};
use keel_core::{Deployment, Kind, Meta, Namespace, Node, NodeInfo, Object, Pod};
use keel_storage::Storage;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// API errors suitable for transport.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<keel_core::Error> for ApiError {
    fn from(e: keel_core::Error) -> Self {
        use keel_core::Error as E;
        match e {
            E::NotFound(k) => ApiError::NotFound(k),
            E::AlreadyExists(k) => ApiError::Conflict(format!("{} already exists", k)),
            E::Validation(m) => ApiError::Validation(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCreateOptions {
    pub name: String,
    /// Generated when absent.
    pub token: Option<String>,
    pub region: String,
    pub provider: String,
    pub info: NodeInfo,
}

/// Outcome of applying a manifest.
#[derive(Debug, Clone, Serialize)]
pub struct Applied<T> {
    pub value: T,
    pub created: bool,
    pub changed: bool,
    pub summary: DiffSummary,
}

/// Store-backed façade over namespaces, nodes, deployments and pods.
pub struct Distribution {
    storage: Storage,
    cancel: CancellationToken,
    deployments: Option<Arc<Controller<Deployment>>>,
}

fn not_found<T>(v: keel_core::Result<T>) -> ApiResult<Option<T>> {
    match v {
        Ok(v) => Ok(Some(v)),
        Err(keel_core::Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn required_name(subject: &str, name: &Option<String>) -> ApiResult<String> {
    match name.as_deref() {
        Some(n) if !n.is_empty() => Ok(n.to_string()),
        _ => Err(ApiError::Validation(format!("{}: name is required", subject))),
    }
}

impl Distribution {
    pub fn new(storage: Storage) -> Self {
        Self { storage, cancel: CancellationToken::new(), deployments: None }
    }

    /// Deployments applied through this façade are handed to `ctrl` directly.
    pub fn with_deployment_controller(mut self, ctrl: Arc<Controller<Deployment>>) -> Self {
        self.deployments = Some(ctrl);
        self
    }

    /// Calls in flight are aborted once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ---- namespaces ----

    pub async fn namespace_create(&self, m: &NamespaceManifest) -> ApiResult<Namespace> {
        m.validate()?;
        let name = required_name("namespace", &m.meta.name)?;
        let mut ns = Namespace { meta: Meta::new(None, &name) };
        ns.meta.description = m.meta.description.clone().unwrap_or_default();
        ns.meta.labels = m.meta.labels.clone().unwrap_or_default();
        ns.meta.self_link = ns.self_link();
        self.storage.create(&self.cancel, Kind::Namespace, &name, &ns, None).await?;
        info!(namespace = %name, "api: namespace created");
        Ok(ns)
    }

    pub async fn namespace_get(&self, name: &str) -> ApiResult<Option<Namespace>> {
        not_found(self.storage.get(&self.cancel, Kind::Namespace, name).await)
    }

    pub async fn namespace_list(&self) -> ApiResult<Vec<Namespace>> {
        Ok(self.storage.list(&self.cancel, Kind::Namespace, "").await?)
    }

    /// Fails with `Conflict` while deployments or pods still live in it.
    pub async fn namespace_remove(&self, name: &str) -> ApiResult<()> {
        let deployments: Vec<Deployment> = self.storage.list(&self.cancel, Kind::Deployment, name).await?;
        let pods: Vec<Pod> = self.storage.list(&self.cancel, Kind::Pod, name).await?;
        if !deployments.is_empty() || !pods.is_empty() {
            return Err(ApiError::Conflict(format!(
                "namespace {} is not empty ({} deployments, {} pods)",
                name,
                deployments.len(),
                pods.len()
            )));
        }
        self.storage.remove(&self.cancel, Kind::Namespace, name).await?;
        info!(namespace = %name, "api: namespace removed");
        Ok(())
    }

    async fn require_namespace(&self, name: &str) -> ApiResult<()> {
        match self.namespace_get(name).await? {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(format!("namespace {}", name))),
        }
    }

    // ---- nodes ----

    pub async fn node_create(&self, opts: NodeCreateOptions) -> ApiResult<Node> {
        if opts.name.is_empty() {
            return Err(ApiError::Validation("node: name is required".into()));
        }
        let mut node = Node {
            meta: Meta::new(None, &opts.name),
            token: opts.token.filter(|t| !t.is_empty()).unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            region: opts.region,
            provider: opts.provider,
            online: true,
            info: opts.info,
        };
        node.meta.self_link = node.self_link();
        self.storage.create(&self.cancel, Kind::Node, &node.meta.self_link, &node, None).await?;
        info!(node = %node.meta.name, "api: node registered");
        Ok(node)
    }

    /// `None` when the node is unknown.
    pub async fn node_get(&self, name: &str) -> ApiResult<Option<Node>> {
        let res = not_found(self.storage.get(&self.cancel, Kind::Node, name).await)?;
        if res.is_none() {
            warn!(node = %name, "api: node not found");
        }
        Ok(res)
    }

    pub async fn node_list(&self) -> ApiResult<BTreeMap<String, Node>> {
        Ok(self.storage.map(&self.cancel, Kind::Node, "").await?)
    }

    async fn node_set_online_state(&self, name: &str, online: bool) -> ApiResult<Node> {
        let mut node: Node = self.storage.get(&self.cancel, Kind::Node, name).await?;
        if node.online != online {
            node.online = online;
            node.meta.updated = Utc::now();
            self.storage.update(&self.cancel, Kind::Node, name, &node, None).await?;
            info!(node = %name, online, "api: node state changed");
        }
        Ok(node)
    }

    pub async fn node_set_online(&self, name: &str) -> ApiResult<Node> {
        self.node_set_online_state(name, true).await
    }

    pub async fn node_set_offline(&self, name: &str) -> ApiResult<Node> {
        self.node_set_online_state(name, false).await
    }

    pub async fn node_remove(&self, name: &str) -> ApiResult<()> {
        self.storage.remove(&self.cancel, Kind::Node, name).await?;
        Ok(())
    }

    // ---- deployments ----

    /// Create or update a deployment from its manifest.
    ///
    /// Nothing is written when convergence reports no change. Every write is handed
    /// to the deployment controller, when one is attached.
    pub async fn deployment_apply(&self, namespace: &str, m: &DeploymentManifest) -> ApiResult<Applied<Deployment>> {
        let t0 = Instant::now();
        m.validate()?;
        let name = required_name("deployment", &m.meta.name)?;
        self.require_namespace(namespace).await?;
        let link = keel_core::self_link(Some(namespace), &name);

        let existing: Option<Deployment> = not_found(self.storage.get(&self.cancel, Kind::Deployment, &link).await)?;
        let created = existing.is_none();
        let base = existing.unwrap_or_else(|| {
            let mut d = Deployment { meta: Meta::new(Some(namespace), &name), ..Default::default() };
            d.meta.self_link = link.clone();
            d
        });
        let mut out = converge_deployment(&base, m, Utc::now());
        if created {
            self.storage.create(&self.cancel, Kind::Deployment, &link, &out.value, None).await?;
        } else if out.changed {
            out.value.meta.updated = Utc::now();
            self.storage.update(&self.cancel, Kind::Deployment, &link, &out.value, None).await?;
        }
        if created || out.changed {
            counter!("api_applied_total", 1u64, "kind" => "deployment");
            if let Some(ctrl) = &self.deployments {
                ctrl.update_deployment(out.value.clone());
            }
        }
        info!(deployment = %link, created, changed = out.changed, took_ms = %t0.elapsed().as_millis(), "api: deployment applied");
        Ok(Applied { value: out.value, created, changed: created || out.changed, summary: out.summary })
    }

    pub async fn deployment_get(&self, namespace: &str, name: &str) -> ApiResult<Option<Deployment>> {
        let link = keel_core::self_link(Some(namespace), name);
        not_found(self.storage.get(&self.cancel, Kind::Deployment, &link).await)
    }

    pub async fn deployment_list(&self, namespace: &str) -> ApiResult<Vec<Deployment>> {
        Ok(self.storage.list(&self.cancel, Kind::Deployment, namespace).await?)
    }

    /// Owned pods are removed by the controller once it observes the deletion.
    pub async fn deployment_remove(&self, namespace: &str, name: &str) -> ApiResult<()> {
        let link = keel_core::self_link(Some(namespace), name);
        self.storage.remove(&self.cancel, Kind::Deployment, &link).await?;
        info!(deployment = %link, "api: deployment removed");
        Ok(())
    }

    // ---- pods ----

    pub async fn pod_apply(&self, namespace: &str, m: &PodManifest) -> ApiResult<Applied<Pod>> {
        m.validate()?;
        let name = required_name("pod", &m.meta.name)?;
        self.require_namespace(namespace).await?;
        let link = keel_core::self_link(Some(namespace), &name);

        let existing: Option<Pod> = not_found(self.storage.get(&self.cancel, Kind::Pod, &link).await)?;
        let created = existing.is_none();
        let base = existing.unwrap_or_else(|| {
            let mut p = Pod { meta: Meta::new(Some(namespace), &name), ..Default::default() };
            p.meta.self_link = link.clone();
            p
        });
        let mut out = converge_pod(&base, m, Utc::now());
        if created {
            self.storage.create(&self.cancel, Kind::Pod, &link, &out.value, None).await?;
        } else if out.changed {
            out.value.meta.updated = Utc::now();
            self.storage.update(&self.cancel, Kind::Pod, &link, &out.value, None).await?;
        } else {
            debug!(pod = %link, "api: pod unchanged");
        }
        if created || out.changed {
            counter!("api_applied_total", 1u64, "kind" => "pod");
        }
        Ok(Applied { value: out.value, created, changed: created || out.changed, summary: out.summary })
    }

    pub async fn pod_get(&self, namespace: &str, name: &str) -> ApiResult<Option<Pod>> {
        let link = keel_core::self_link(Some(namespace), name);
        not_found(self.storage.get(&self.cancel, Kind::Pod, &link).await)
    }

    pub async fn pod_list(&self, namespace: &str) -> ApiResult<Vec<Pod>> {
        Ok(self.storage.list(&self.cancel, Kind::Pod, namespace).await?)
    }

    pub async fn pod_remove(&self, namespace: &str, name: &str) -> ApiResult<()> {
        let link = keel_core::self_link(Some(namespace), name);
        self.storage.remove(&self.cancel, Kind::Pod, &link).await?;
        Ok(())
    }
}
