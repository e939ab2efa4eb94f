//! The top-level manager: watcher lifecycle and response delivery.
//!
//! A [`Vigil`] owns the watcher map, the scheduler, and two internal loops:
//! a fan-in that forwards records from the internal response channel to the
//! external one, and an activation loop that starts queued watchers. The
//! activation loop stays blocked until the consumer takes the response
//! stream with [`Vigil::start`] — watchers registered before that are
//! queued, not started, so no records are produced for a stream nobody
//! reads.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_cadence::Scheduler;

use crate::error::{WatchError, WatchResult};
use crate::response::WatcherResponse;
use crate::watcher::Watcher;

/// Channel capacities for a [`Vigil`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the internal and external response channels. Bursts
    /// beyond this backpressure into task execution.
    pub response_buffer: usize,
    /// Capacity of the new-watcher queue.
    pub watcher_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_buffer: 512,
            watcher_queue: 16,
        }
    }
}

/// Manages a collection of endpoint watchers and delivers their responses
/// to a single consumer.
///
/// Must be created inside a tokio runtime; construction spawns the two
/// internal loops.
pub struct Vigil {
    watchers: Arc<DashMap<String, Arc<Watcher>>>,
    scheduler: Arc<Scheduler>,
    watcher_tx: mpsc::Sender<Arc<Watcher>>,
    external_rx: Mutex<Option<mpsc::Receiver<WatcherResponse>>>,
    gate: CancellationToken,
    cancel: CancellationToken,
}

impl Vigil {
    /// Creates a manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a manager with the given channel capacities.
    pub fn with_config(config: EngineConfig) -> Self {
        let (watcher_tx, watcher_rx) = mpsc::channel(config.watcher_queue.max(1));
        let (internal_tx, internal_rx) = mpsc::channel(config.response_buffer.max(1));
        let (external_tx, external_rx) = mpsc::channel(config.response_buffer.max(1));

        let watchers = Arc::new(DashMap::new());
        let scheduler = Arc::new(Scheduler::new());
        let gate = CancellationToken::new();
        let cancel = CancellationToken::new();

        tokio::spawn(forward_responses(
            internal_rx,
            external_tx,
            cancel.clone(),
        ));
        tokio::spawn(activate_watchers(
            watcher_rx,
            internal_tx,
            watchers.clone(),
            scheduler.clone(),
            gate.clone(),
            cancel.clone(),
        ));

        Self {
            watchers,
            scheduler,
            watcher_tx,
            external_rx: Mutex::new(Some(external_rx)),
            gate,
            cancel,
        }
    }

    /// Validates and enqueues a watcher. Queued watchers are started only
    /// once the consumer has taken the response stream.
    pub async fn add_watcher(&self, watcher: Watcher) -> WatchResult<()> {
        watcher.validate()?;
        self.watcher_tx
            .send(Arc::new(watcher))
            .await
            .map_err(|_| WatchError::ChannelClosed)
    }

    /// Validates every watcher, then enqueues them. Stops at the first
    /// validation failure, before anything is enqueued.
    pub async fn add_watchers(
        &self,
        watchers: impl IntoIterator<Item = Watcher>,
    ) -> WatchResult<()> {
        let watchers: Vec<Watcher> = watchers.into_iter().collect();
        for watcher in &watchers {
            watcher.validate()?;
        }
        for watcher in watchers {
            self.watcher_tx
                .send(Arc::new(watcher))
                .await
                .map_err(|_| WatchError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Removes a watcher: deletes it from the map, closes it, and removes
    /// its scheduler job.
    pub async fn remove_watcher(&self, id: &str) -> WatchResult<()> {
        let Some((_, watcher)) = self.watchers.remove(id) else {
            return Err(WatchError::WatcherNotFound(id.to_string()));
        };

        let closed = watcher.close().await;
        // The job may not exist yet if the watcher was still queued.
        if let Err(e) = self.scheduler.remove_job(id).await {
            tracing::debug!(watcher = %id, error = %e, "no scheduler job to remove");
        }
        closed
    }

    /// Opens the consumption gate and hands out the external response
    /// stream. Queued watchers start once this has been called. The stream
    /// can be taken exactly once; later calls fail with
    /// [`WatchError::StreamAlreadyTaken`].
    pub fn start(&self) -> WatchResult<mpsc::Receiver<WatcherResponse>> {
        let mut slot = self.external_rx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rx) = slot.take() else {
            return Err(WatchError::StreamAlreadyTaken);
        };
        self.gate.cancel();
        Ok(rx)
    }

    /// Shuts the engine down: cancels the internal loops, stops the
    /// scheduler, and closes every watcher. The external channel is left
    /// open; consumers observe shutdown as the stream going quiet.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.scheduler.stop().await;

        let ids: Vec<String> = self.watchers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, watcher)) = self.watchers.remove(&id) {
                if let Err(e) = watcher.close().await {
                    tracing::warn!(watcher = %id, error = %e, "error closing watcher");
                }
            }
        }
    }

    /// Number of currently stored (activated) watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

impl Default for Vigil {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-in: internal response channel to external, until shutdown.
async fn forward_responses(
    mut internal_rx: mpsc::Receiver<WatcherResponse>,
    external_tx: mpsc::Sender<WatcherResponse>,
    cancel: CancellationToken,
) {
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => return,
            response = internal_rx.recv() => response,
        };
        let Some(response) = response else { return };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = external_tx.send(response) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Blocks until the consumption gate opens, then starts each queued
/// watcher: initialize against the internal channel, schedule its job,
/// store it in the map.
async fn activate_watchers(
    mut watcher_rx: mpsc::Receiver<Arc<Watcher>>,
    internal_tx: mpsc::Sender<WatcherResponse>,
    watchers: Arc<DashMap<String, Arc<Watcher>>>,
    scheduler: Arc<Scheduler>,
    gate: CancellationToken,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = gate.cancelled() => {}
    }

    loop {
        let watcher = tokio::select! {
            _ = cancel.cancelled() => return,
            watcher = watcher_rx.recv() => watcher,
        };
        let Some(watcher) = watcher else { return };

        if let Err(e) = watcher.start(internal_tx.clone()).await {
            tracing::error!(watcher = %watcher.id(), error = %e, "error starting watcher");
            continue;
        }
        if let Err(e) = scheduler.schedule_job(watcher.job()).await {
            tracing::error!(watcher = %watcher.id(), error = %e, "error scheduling watcher job");
            continue;
        }
        watchers.insert(watcher.id().to_string(), watcher);
    }
}
