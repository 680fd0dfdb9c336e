use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Business logic a controller runs for each work item.
///
/// Failures are logged by the controller and not retried; the next event or
/// catch-up scan brings the item back.
#[async_trait]
pub trait Reconciler<T: Send + Sync + 'static>: Send + Sync {
    async fn reconcile_spec(&self, cancel: &CancellationToken, item: Arc<T>) -> anyhow::Result<()>;

    async fn reconcile_status(&self, _cancel: &CancellationToken, _item: Arc<T>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, cancel: &CancellationToken, item: Arc<T>) -> anyhow::Result<()>;
}
