//! Deployment reconciler: keeps owned pods at `spec.replicas` and reports status.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use keel_core::{
    Deployment, DeploymentState, DeploymentStatus, Error, Kind, Meta, Object, Pod, PodSpec, PodState,
};
use keel_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Reconciler;

pub struct DeploymentReconciler {
    storage: Storage,
}

impl DeploymentReconciler {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    async fn owned_pods(&self, cancel: &CancellationToken, d: &Deployment) -> anyhow::Result<Vec<Pod>> {
        let ns = d.meta.namespace.as_deref().unwrap_or_default();
        let pods: Vec<Pod> = self
            .storage
            .list(cancel, Kind::Pod, ns)
            .await
            .with_context(|| format!("listing pods of {}", d.self_link()))?;
        Ok(pods.into_iter().filter(|p| p.meta.owner.as_deref() == Some(d.meta.name.as_str())).collect())
    }

    fn new_pod(d: &Deployment) -> Pod {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", d.meta.name, &id[..8]);
        let mut meta = Meta::new(d.meta.namespace.as_deref(), &name);
        meta.owner = Some(d.meta.name.clone());
        meta.labels = d.meta.labels.clone();
        let mut pod = Pod {
            meta,
            spec: PodSpec { selector: d.spec.selector.clone(), template: d.spec.template.clone() },
            ..Default::default()
        };
        pod.meta.self_link = pod.self_link();
        pod
    }

    async fn write_status(&self, cancel: &CancellationToken, d: &Deployment, status: DeploymentStatus) -> anyhow::Result<()> {
        let link = d.self_link();
        // Re-read so a concurrent spec write is not clobbered.
        let mut latest: Deployment = match self.storage.get(cancel, Kind::Deployment, &link).await {
            Ok(v) => v,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", link)),
        };
        if latest.status == status {
            return Ok(());
        }
        latest.status = status;
        self.storage
            .update(cancel, Kind::Deployment, &link, &latest, None)
            .await
            .with_context(|| format!("writing status of {}", link))
    }
}

#[async_trait]
impl Reconciler<Deployment> for DeploymentReconciler {
    async fn reconcile_spec(&self, cancel: &CancellationToken, d: Arc<Deployment>) -> anyhow::Result<()> {
        let link = d.self_link();
        let mut pods = self.owned_pods(cancel, &d).await?;
        let desired = d.spec.replicas as usize;
        let stamp = d.spec.template.updated;

        // Oldest first, so surplus removal takes the newest.
        pods.sort_by(|a, b| a.meta.created.cmp(&b.meta.created).then_with(|| a.meta.name.cmp(&b.meta.name)));
        let surplus = pods.len().saturating_sub(desired);
        for pod in pods.drain(pods.len() - surplus..) {
            self.storage
                .remove(cancel, Kind::Pod, &pod.self_link())
                .await
                .with_context(|| format!("removing surplus pod {}", pod.self_link()))?;
            debug!(deployment = %link, pod = %pod.meta.name, "pod removed");
        }

        let mut refreshed = 0usize;
        for pod in pods.iter_mut().filter(|p| p.spec.template.updated < stamp) {
            pod.spec.selector = d.spec.selector.clone();
            pod.spec.template = d.spec.template.clone();
            pod.status.state = PodState::Provision;
            pod.meta.updated = Utc::now();
            self.storage
                .update(cancel, Kind::Pod, &pod.self_link(), &*pod, None)
                .await
                .with_context(|| format!("refreshing pod {}", pod.self_link()))?;
            refreshed += 1;
        }

        let mut created = 0usize;
        while pods.len() + created < desired {
            let pod = Self::new_pod(&d);
            self.storage
                .create(cancel, Kind::Pod, &pod.self_link(), &pod, None)
                .await
                .with_context(|| format!("creating pod {}", pod.self_link()))?;
            created += 1;
        }

        let provisioned = (pods.len() + created) as u32;
        if surplus + refreshed + created > 0 {
            info!(deployment = %link, created, removed = surplus, refreshed, replicas = desired, "pods converged");
        }
        let status = DeploymentStatus {
            state: if provisioned == d.spec.replicas { DeploymentState::Ready } else { DeploymentState::Provisioning },
            message: String::new(),
            desired: d.spec.replicas,
            provisioned,
            observed: Some(stamp),
        };
        self.write_status(cancel, &d, status).await
    }

    async fn reconcile_status(&self, _cancel: &CancellationToken, d: Arc<Deployment>) -> anyhow::Result<()> {
        debug!(
            deployment = %d.self_link(),
            state = ?d.status.state,
            provisioned = d.status.provisioned,
            desired = d.status.desired,
            "status observed"
        );
        Ok(())
    }

    async fn remove(&self, cancel: &CancellationToken, d: Arc<Deployment>) -> anyhow::Result<()> {
        let pods = self.owned_pods(cancel, &d).await?;
        for pod in &pods {
            match self.storage.remove(cancel, Kind::Pod, &pod.self_link()).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e).with_context(|| format!("removing pod {}", pod.self_link())),
            }
        }
        info!(deployment = %d.self_link(), pods = pods.len(), "deployment removed");
        Ok(())
    }
}
