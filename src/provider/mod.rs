//! Event sources. A provider watches some upstream (stdin, a code-hosting
//! API) and drives the orchestrator through [`EventHandler`] once per event.

pub mod json;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Receives each event a watcher produces. Implemented by the orchestrator;
/// tests substitute recorders.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, token: &CancellationToken, event: &Event) -> Result<()>;
}

/// Drives an [`EventHandler`] until the source runs dry, the token fires, or
/// the handler returns the [`StopWatcher`] sentinel.
#[async_trait]
pub trait Watcher: Send {
    async fn watch(
        &mut self,
        token: &CancellationToken,
        handler: &dyn EventHandler,
    ) -> Result<()>;
}

/// Sentinel error: a handler that returns it ends the watch cleanly.
#[derive(Debug, thiserror::Error)]
#[error("stop watcher")]
pub struct StopWatcher;

/// Whether `err` is (or wraps) the stop sentinel.
pub fn is_stop(err: &anyhow::Error) -> bool {
    err.is::<StopWatcher>()
}
