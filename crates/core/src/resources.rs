//! Resource model persisted in the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Kind, Object, Stateful};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Meta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    /// Name of the owning resource in the same namespace, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub self_link: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Meta {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            created: now,
            updated: now,
            ..Default::default()
        }
    }
}

// ---- Namespace ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Namespace {
    pub meta: Meta,
}

impl Object for Namespace {
    const KIND: Kind = Kind::Namespace;
    fn meta(&self) -> &Meta { &self.meta }
}

// ---- Node ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeInfo {
    pub hostname: String,
    pub os_name: String,
    pub architecture: String,
    pub external_ip: String,
    pub internal_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Node {
    pub meta: Meta,
    pub token: String,
    pub region: String,
    pub provider: String,
    pub online: bool,
    pub info: NodeInfo,
}

impl Object for Node {
    const KIND: Kind = Kind::Node;
    fn meta(&self) -> &Meta { &self.meta }
}

// ---- Pod template ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpecSelector {
    pub node: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpecTemplate {
    pub containers: Vec<SpecTemplateContainer>,
    pub volumes: Vec<SpecTemplateVolume>,
    /// Bumped by convergence whenever an observable value changes.
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpecTemplateContainer {
    pub name: String,
    pub image: ContainerImage,
    pub exec: ContainerExec,
    pub resources: ContainerResources,
    pub env_vars: Vec<ContainerEnv>,
    pub volumes: Vec<ContainerVolume>,
    pub ports: Vec<ContainerPort>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerImage {
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerExec {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub entrypoint: Vec<String>,
    pub workdir: String,
}

/// Canonical resource amounts: RAM in bytes, CPU in millicores.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceAmount {
    pub ram: i64,
    pub cpu: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerResources {
    pub request: ResourceAmount,
    pub limits: ResourceAmount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerEnv {
    pub name: String,
    pub value: String,
    pub secret: EnvRef,
    pub config: EnvRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerVolume {
    pub name: String,
    pub mode: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerPort {
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(default)]
pub struct VolumeBind {
    pub key: String,
    pub file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VolumeSource {
    pub name: String,
    pub binds: Vec<VolumeBind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpecTemplateVolume {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub secret: VolumeSource,
    pub config: VolumeSource,
}

// ---- Deployment ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub selector: SpecSelector,
    pub template: SpecTemplate,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    #[default]
    Created,
    Provisioning,
    Ready,
    Destroy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploymentStatus {
    pub state: DeploymentState,
    pub message: String,
    pub desired: u32,
    pub provisioned: u32,
    /// Template `updated` stamp the controller last acted on.
    pub observed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Deployment {
    pub meta: Meta,
    pub spec: DeploymentSpec,
    pub status: DeploymentStatus,
}

impl Object for Deployment {
    const KIND: Kind = Kind::Deployment;
    fn meta(&self) -> &Meta { &self.meta }
}

impl Stateful for Deployment {
    type Spec = DeploymentSpec;
    type Status = DeploymentStatus;
    fn spec(&self) -> &DeploymentSpec { &self.spec }
    fn status(&self) -> &DeploymentStatus { &self.status }
}

// ---- Pod ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PodSpec {
    pub selector: SpecSelector,
    pub template: SpecTemplate,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodState {
    #[default]
    Created,
    Provision,
    Running,
    Error,
    Destroy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PodStatus {
    pub state: PodState,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pod {
    pub meta: Meta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Object for Pod {
    const KIND: Kind = Kind::Pod;
    fn meta(&self) -> &Meta { &self.meta }
}

impl Stateful for Pod {
    type Spec = PodSpec;
    type Status = PodStatus;
    fn spec(&self) -> &PodSpec { &self.spec }
    fn status(&self) -> &PodStatus { &self.status }
}
