//! Endpoint tasks: the units a watcher drives against its targets.
//!
//! An endpoint task is anything that can be validated at registration,
//! bound to a watcher's response channel, handed to the scheduler as a
//! repeatable unit of work, and closed. Two implementations exist: HTTP
//! endpoints and WebSocket endpoints (one-hit or persistent JSON-RPC).

mod http;
mod ws;

pub use http::{HttpEndpoint, TransportControl};
pub use ws::{WsEndpoint, WsEndpointMode};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WatchResult;
use crate::response::WatcherResponse;

/// Capability set every endpoint task must provide.
#[async_trait]
pub trait EndpointTask: Send + Sync {
    /// Checks that the endpoint is ready for initialization. Called by the
    /// manager when the owning watcher is registered.
    fn validate(&self) -> WatchResult<()>;

    /// Binds the endpoint to its watcher and response channel. Persistent
    /// endpoints establish their connection here.
    async fn initialize(
        &self,
        watcher_id: &str,
        response_tx: mpsc::Sender<WatcherResponse>,
    ) -> WatchResult<()>;

    /// Produces the schedulable unit of work for this endpoint. The returned
    /// task is executed repeatedly at the watcher's cadence.
    fn task(self: Arc<Self>) -> Arc<dyn vigil_cadence::Task>;

    /// Releases the endpoint's resources. Blocks until done.
    async fn close(&self) -> WatchResult<()>;
}

/// Shared binding installed by [`EndpointTask::initialize`].
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) watcher_id: String,
    pub(crate) response_tx: mpsc::Sender<WatcherResponse>,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
}

impl TaskContext {
    /// Delivers a response record, unless the channel is gone.
    pub(crate) async fn emit(&self, mut response: WatcherResponse) {
        response.watcher_id = self.watcher_id.clone();
        if self.response_tx.send(response).await.is_err() {
            tracing::debug!("response channel closed, record dropped");
        }
    }
}
