//! Shared stubs for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;
use vigil_cadence::SchedulerError;

use crate::error::{WatchError, WatchResult};
use crate::response::{RequestTimestamps, TaskPayload, WatcherResponse, WsPayload};
use crate::task::EndpointTask;

/// Endpoint stand-in that records lifecycle calls and lets tests feed
/// records into the task-response channel directly.
pub(crate) struct StubEndpoint {
    id: String,
    url: Url,
    valid: bool,
    init_fails: bool,
    tx: Mutex<Option<mpsc::Sender<WatcherResponse>>>,
    close_calls: AtomicUsize,
}

impl StubEndpoint {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            url: Url::parse("ws://localhost:9000/stub").unwrap(),
            valid: true,
            init_fails: false,
            tx: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn invalid(id: &str) -> Self {
        Self {
            valid: false,
            ..Self::new(id)
        }
    }

    pub(crate) fn failing_init(id: &str) -> Self {
        Self {
            init_fails: true,
            ..Self::new(id)
        }
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Pushes one success record into the watcher's task channel, if bound.
    /// Send failures are ignored, as they are in task code.
    pub(crate) async fn emit_success(&self, data: &[u8]) {
        let tx = self.tx.lock().unwrap().clone();
        let Some(tx) = tx else { return };
        let now = Instant::now();
        let timestamps = RequestTimestamps {
            start: Some(now),
            first_byte: Some(now),
            ..Default::default()
        };
        let payload = WsPayload::new(None, Bytes::copy_from_slice(data), timestamps, None);
        let _ = tx
            .send(WatcherResponse::success(
                self.id.clone(),
                self.url.clone(),
                TaskPayload::Ws(payload),
            ))
            .await;
    }
}

#[async_trait]
impl EndpointTask for StubEndpoint {
    fn validate(&self) -> WatchResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(WatchError::Configuration("stub marked invalid".into()))
        }
    }

    async fn initialize(
        &self,
        _watcher_id: &str,
        response_tx: mpsc::Sender<WatcherResponse>,
    ) -> WatchResult<()> {
        if self.init_fails {
            return Err(WatchError::Configuration("stub initialize failure".into()));
        }
        *self.tx.lock().unwrap() = Some(response_tx);
        Ok(())
    }

    fn task(self: Arc<Self>) -> Arc<dyn vigil_cadence::Task> {
        Arc::new(StubProbe { endpoint: self })
    }

    async fn close(&self) -> WatchResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubProbe {
    endpoint: Arc<StubEndpoint>,
}

#[async_trait]
impl vigil_cadence::Task for StubProbe {
    async fn execute(&self) -> Result<(), SchedulerError> {
        self.endpoint.emit_success(b"tick").await;
        Ok(())
    }
}
