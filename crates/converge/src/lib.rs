//! Keel converge: merge desired manifests onto live resource specs.
//!
//! Convergence is pure: it takes the live value by reference, builds the next value
//! and reports whether anything observable changed. The template `updated` stamp is
//! bumped at most once per pass, and only when the template itself changed, so a
//! second pass over its own output is a no-op.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use keel_core::{Deployment, Meta, Pod, SpecSelector, SpecTemplate, SpecTemplateContainer};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod manifest;
pub mod merge;
pub mod quantity;

pub use manifest::{
    DeploymentManifest, Manifest, ManifestContainer, ManifestMeta, ManifestSelector, ManifestTemplate,
    NamespaceManifest, PodManifest,
};
pub use merge::{reconcile, reconcile_binds, Named};
pub use quantity::{cpu_or_zero, decode_cpu, decode_memory, memory_or_zero, QuantityError};

use merge::{reconcile_container_volumes, reconcile_env, reconcile_template_volumes, set};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Result of one convergence pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Converged<T> {
    pub value: T,
    /// Anything observable changed (metadata, selector, replicas or template).
    pub changed: bool,
    /// The template changed and its `updated` stamp was bumped.
    pub template_changed: bool,
    pub summary: DiffSummary,
}

/// Split on single spaces, dropping empty words.
fn words(s: &str) -> Vec<String> {
    s.split(' ').filter(|w| !w.is_empty()).map(str::to_string).collect()
}

fn set_words(slot: &mut Vec<String>, desired: &str) -> bool {
    let want = words(desired);
    if slot.join(" ") == want.join(" ") {
        return false;
    }
    *slot = want;
    true
}

/// Tracked container fields only; ports and labels are left as they are.
fn update_container(d: &ManifestContainer, c: &mut SpecTemplateContainer, summary: &mut DiffSummary) -> bool {
    let mut changed = set(&mut c.image.name, d.image.name.clone());
    changed |= set(&mut c.image.secret, d.image.secret.clone());
    changed |= set_words(&mut c.exec.command, &d.command);
    changed |= set(&mut c.exec.args, d.args.clone());
    changed |= set_words(&mut c.exec.entrypoint, &d.entrypoint);
    changed |= set(&mut c.exec.workdir, d.workdir.clone());

    let (env, env_changed) = reconcile_env(&d.env, &c.env_vars, summary);
    c.env_vars = env;
    changed |= env_changed;

    let req = &d.resources.request;
    changed |= set(&mut c.resources.request.ram, memory_or_zero(&req.ram));
    changed |= set(&mut c.resources.request.cpu, cpu_or_zero(&req.cpu));
    let lim = &d.resources.limits;
    changed |= set(&mut c.resources.limits.ram, memory_or_zero(&lim.ram));
    changed |= set(&mut c.resources.limits.cpu, cpu_or_zero(&lim.cpu));

    let (volumes, vol_changed) = reconcile_container_volumes(&d.volumes, &c.volumes, summary);
    c.volumes = volumes;
    changed | vol_changed
}

fn create_container(d: &ManifestContainer, summary: &mut DiffSummary) -> SpecTemplateContainer {
    let mut c = SpecTemplateContainer {
        name: d.name.clone(),
        ports: d.ports.clone(),
        labels: d.labels.clone(),
        ..Default::default()
    };
    update_container(d, &mut c, summary);
    c
}

/// Converge a template, stamping `updated = now` when it changed.
pub fn converge_template(
    desired: &ManifestTemplate,
    current: &SpecTemplate,
    now: DateTime<Utc>,
    summary: &mut DiffSummary,
) -> (SpecTemplate, bool) {
    let (containers, c_changed) = reconcile(&desired.containers, &current.containers, summary, create_container, update_container);
    let (volumes, v_changed) = reconcile_template_volumes(&desired.volumes, &current.volumes, summary);
    let changed = c_changed || v_changed;
    let updated = if changed { now } else { current.updated };
    (SpecTemplate { containers, volumes, updated }, changed)
}

/// Name is only taken when the live value has none; description and labels when given.
pub fn converge_meta(desired: &ManifestMeta, current: &mut Meta) -> bool {
    let mut changed = false;
    if current.name.is_empty() {
        if let Some(name) = &desired.name {
            changed |= set(&mut current.name, name.clone());
        }
    }
    if let Some(description) = &desired.description {
        changed |= set(&mut current.description, description.clone());
    }
    if let Some(labels) = &desired.labels {
        changed |= set(&mut current.labels, labels.clone());
    }
    changed
}

pub fn converge_selector(desired: &ManifestSelector, current: &mut SpecSelector) -> bool {
    let mut changed = false;
    if !desired.node.is_empty() {
        changed |= set(&mut current.node, desired.node.clone());
    }
    if let Some(labels) = &desired.labels {
        changed |= set(&mut current.labels, labels.clone());
    }
    changed
}

fn finish<T>(kind: &'static str, value: T, changed: bool, template_changed: bool, summary: DiffSummary) -> Converged<T> {
    counter!("converge_passes_total", 1u64, "kind" => kind);
    if changed {
        counter!("converge_changed_total", 1u64, "kind" => kind);
    }
    debug!(kind, changed, template_changed, adds = summary.adds, updates = summary.updates, removes = summary.removes, "converged");
    Converged { value, changed, template_changed, summary }
}

/// Apply a pod manifest to a live pod (or `Pod::default()` for a new one).
pub fn converge_pod(current: &Pod, desired: &PodManifest, now: DateTime<Utc>) -> Converged<Pod> {
    let mut summary = DiffSummary::default();
    let mut next = current.clone();
    let mut changed = converge_meta(&desired.meta, &mut next.meta);
    if let Some(selector) = &desired.spec.selector {
        changed |= converge_selector(selector, &mut next.spec.selector);
    }
    let mut template_changed = false;
    if let Some(template) = &desired.spec.template {
        let (t, tc) = converge_template(template, &current.spec.template, now, &mut summary);
        next.spec.template = t;
        template_changed = tc;
    }
    finish("pod", next, changed || template_changed, template_changed, summary)
}

/// Apply a deployment manifest; replicas converge alongside the template.
pub fn converge_deployment(current: &Deployment, desired: &DeploymentManifest, now: DateTime<Utc>) -> Converged<Deployment> {
    let mut summary = DiffSummary::default();
    let mut next = current.clone();
    let mut changed = converge_meta(&desired.meta, &mut next.meta);
    if let Some(replicas) = desired.spec.replicas {
        changed |= set(&mut next.spec.replicas, replicas);
    }
    if let Some(selector) = &desired.spec.selector {
        changed |= converge_selector(selector, &mut next.spec.selector);
    }
    let mut template_changed = false;
    if let Some(template) = &desired.spec.template {
        let (t, tc) = converge_template(template, &current.spec.template, now, &mut summary);
        next.spec.template = t;
        template_changed = tc;
    }
    finish("deployment", next, changed || template_changed, template_changed, summary)
}
