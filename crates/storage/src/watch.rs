//! Translation of raw backend notifications into typed watch events.

use keel_core::{self_link, Action, Error, Kind, Result, WatchEvent};
use metrics::counter;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::backend::{BackendWatch, Notification};

/// Matches `<kind>/<name>`, and for namespaced kinds also `<kind>/<namespace>/<name>`
/// (or `<namespace>:<name>`).
#[derive(Debug, Clone)]
pub struct KeyPattern {
    re: Regex,
}

impl KeyPattern {
    pub fn new(kind: Kind) -> Result<Self> {
        let ns = if kind.namespaced() { r"(?:(?P<ns>[^/:]+)[/:])?" } else { "" };
        let pattern = format!(r"^{}/{}(?P<name>[^/:]+)$", regex::escape(kind.as_str()), ns);
        let re = Regex::new(&pattern).map_err(|e| Error::Backend(format!("key pattern: {}", e)))?;
        Ok(Self { re })
    }

    /// `(name, self_link)` for a well-formed key.
    pub fn parse(&self, key: &str) -> Option<(String, String)> {
        let caps = self.re.captures(key)?;
        let name = caps.name("name")?.as_str();
        let ns = caps.name("ns").map(|m| m.as_str());
        Some((name.to_string(), self_link(ns, name)))
    }
}

/// Map one notification to a typed event. Malformed keys yield `None`.
///
/// Puts are always reported as `Update`; the consumer decides create vs update
/// from what it already holds.
pub fn translate(pattern: &KeyPattern, n: Notification) -> Option<WatchEvent> {
    match n {
        Notification::Put { key, value, .. } => {
            let (name, self_link) = pattern.parse(&key)?;
            Some(WatchEvent { action: Action::Update, name, self_link, data: Some(value) })
        }
        Notification::Delete { key, .. } => {
            let (name, self_link) = pattern.parse(&key)?;
            Some(WatchEvent { action: Action::Delete, name, self_link, data: None })
        }
        Notification::Error(_) => None,
    }
}

/// An established watch for one kind, not yet pumping events.
#[derive(Debug)]
pub struct WatchStream {
    kind: Kind,
    pattern: KeyPattern,
    inner: BackendWatch,
}

impl WatchStream {
    pub(crate) fn new(kind: Kind, inner: BackendWatch) -> Result<Self> {
        Ok(Self { kind, pattern: KeyPattern::new(kind)?, inner })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Pump translated events into `tx` until cancelled.
    ///
    /// Cancellation and a dropped receiver end the stream cleanly; a backend
    /// error ends it with `StreamTerminated`.
    pub async fn run(mut self, cancel: CancellationToken, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
        let kind = self.kind;
        debug!(kind = %kind, "watch started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(kind = %kind, "watch interrupted");
                    self.inner.stop();
                    return Ok(());
                }
                n = self.inner.next() => n,
            };
            let n = match next {
                Some(Notification::Error(e)) => {
                    error!(kind = %kind, error = %e, "watch failed");
                    return Err(Error::StreamTerminated(e));
                }
                Some(n) => n,
                None => {
                    error!(kind = %kind, "backend closed watch stream");
                    return Err(Error::StreamTerminated(format!("{} watch closed by backend", kind)));
                }
            };
            let Some(event) = translate(&self.pattern, n) else {
                counter!("storage_watch_dropped_total", 1u64, "kind" => kind.as_str());
                continue;
            };
            trace!(kind = %kind, name = %event.name, action = ?event.action, "watch event");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.inner.stop();
                    return Ok(());
                }
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!(kind = %kind, "watch receiver dropped");
                        self.inner.stop();
                        return Ok(());
                    }
                    counter!("storage_watch_events_total", 1u64, "kind" => kind.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str) -> Notification {
        Notification::Put { key: key.into(), value: b"{}".to_vec(), revision: 1 }
    }

    #[test]
    fn delete_yields_single_event_without_data() {
        let p = KeyPattern::new(Kind::Node).unwrap();
        let ev = translate(&p, Notification::Delete { key: "node/X".into(), revision: 2 }).unwrap();
        assert_eq!(
            ev,
            WatchEvent { action: Action::Delete, name: "X".into(), self_link: "X".into(), data: None }
        );
    }

    #[test]
    fn put_maps_to_update_with_namespaced_link() {
        let p = KeyPattern::new(Kind::Deployment).unwrap();
        let ev = translate(&p, put("deployment/prod/web")).unwrap();
        assert_eq!(ev.action, Action::Update);
        assert_eq!(ev.name, "web");
        assert_eq!(ev.self_link, "prod:web");
        assert_eq!(ev.data.as_deref(), Some(&b"{}"[..]));

        let ev = translate(&p, put("deployment/prod:api")).unwrap();
        assert_eq!(ev.name, "api");
        assert_eq!(ev.self_link, "prod:api");
    }

    #[test]
    fn malformed_keys_are_dropped() {
        let p = KeyPattern::new(Kind::Node).unwrap();
        for key in ["node/", "node", "nodes/x", "node/a/b", "node/a:b", "node/a/b/c", "garbage", "pod/x"] {
            assert!(translate(&p, put(key)).is_none(), "key {key} should be dropped");
        }
        assert!(translate(&p, Notification::Error("boom".into())).is_none());
    }
}
