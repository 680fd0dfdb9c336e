//! Keel core types: resource kinds, self-links, watch events and the resource model.

#![forbid(unsafe_code)]

use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod error;
pub mod resources;

pub use error::{Error, Result};
pub use resources::*;

/// Resource type tag selecting a key namespace in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Node,
    Service,
    Deployment,
    Pod,
    Namespace,
    Volume,
    Route,
    Endpoint,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Node,
        Kind::Service,
        Kind::Deployment,
        Kind::Pod,
        Kind::Namespace,
        Kind::Volume,
        Kind::Route,
        Kind::Endpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Node => "node",
            Kind::Service => "service",
            Kind::Deployment => "deployment",
            Kind::Pod => "pod",
            Kind::Namespace => "namespace",
            Kind::Volume => "volume",
            Kind::Route => "route",
            Kind::Endpoint => "endpoint",
        }
    }

    /// Cluster-scoped kinds are keyed by name alone.
    pub fn namespaced(&self) -> bool {
        !matches!(self, Kind::Node | Kind::Namespace)
    }

    /// Store key prefix for this kind, always ending in `/`.
    pub fn prefix(&self) -> String {
        format!("{}/", self.as_str())
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let trimmed = lower.strip_suffix('s').unwrap_or(&lower);
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == lower || k.as_str() == trimmed)
            .ok_or_else(|| Error::Validation(format!("unknown kind: {}", s)))
    }
}

/// Derive the self-link of a resource: `name` or `namespace:name`.
pub fn self_link(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}:{}", ns, name),
        _ => name.to_string(),
    }
}

/// Store key for a self-link: `<kind>/<name>` or `<kind>/<namespace>/<name>`.
pub fn store_key(kind: Kind, self_link: &str) -> String {
    format!("{}/{}", kind.as_str(), self_link.replacen(':', "/", 1))
}

/// Prefix scanned by list/map queries. An empty query selects the whole kind.
pub fn query_prefix(kind: Kind, query: &str) -> String {
    let query = query.trim_matches('/');
    if query.is_empty() {
        kind.prefix()
    } else {
        format!("{}/{}/", kind.as_str(), query.replacen(':', "/", 1))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    Error,
}

/// Typed event produced by a store watch.
///
/// `data` is always `None` for deletes; `self_link` is recovered from the key so
/// deletes can still be correlated across namespaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: Action,
    pub name: String,
    pub self_link: String,
    pub data: Option<Vec<u8>>,
}

/// A persisted resource with a fixed kind and a derived self-link.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &Meta;

    fn self_link(&self) -> String {
        let meta = self.meta();
        if Self::KIND.namespaced() {
            self_link(meta.namespace.as_deref(), &meta.name)
        } else {
            self_link(None, &meta.name)
        }
    }
}

/// Objects whose desired spec and observed status change independently.
pub trait Stateful: Object {
    type Spec: PartialEq;
    type Status: PartialEq;

    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> &Self::Status;
}

/// Tagged union over every kind, decided at the translator boundary.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "object", rename_all = "lowercase")]
pub enum AnyResource {
    Namespace(Namespace),
    Node(Node),
    Deployment(Deployment),
    Pod(Pod),
    /// Kinds without a typed model in this crate.
    Raw(Kind, serde_json::Value),
}

impl AnyResource {
    pub fn decode(kind: Kind, data: &[u8]) -> Result<Self> {
        Ok(match kind {
            Kind::Namespace => AnyResource::Namespace(serde_json::from_slice(data)?),
            Kind::Node => AnyResource::Node(serde_json::from_slice(data)?),
            Kind::Deployment => AnyResource::Deployment(serde_json::from_slice(data)?),
            Kind::Pod => AnyResource::Pod(serde_json::from_slice(data)?),
            other => AnyResource::Raw(other, serde_json::from_slice(data)?),
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            AnyResource::Namespace(_) => Kind::Namespace,
            AnyResource::Node(_) => Kind::Node,
            AnyResource::Deployment(_) => Kind::Deployment,
            AnyResource::Pod(_) => Kind::Pod,
            AnyResource::Raw(kind, _) => *kind,
        }
    }
}

pub mod prelude {
    pub use super::{
        self_link, store_key, Action, AnyResource, Error, Kind, Meta, Object, Result, Stateful,
        WatchEvent,
    };
}
