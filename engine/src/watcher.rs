//! Watchers: named groups of endpoint tasks sharing one cadence.
//!
//! A watcher funnels the output of its tasks through an internal channel,
//! tags each record with the watcher's ID, and forwards it to the channel
//! the manager provides. The forwarder selects on the done signal around
//! the send itself, so closing a watcher can never race a mid-flight
//! delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{WatchError, WatchResult};
use crate::response::WatcherResponse;
use crate::task::EndpointTask;

/// Capacity of the internal task-response channel.
const TASK_RESPONSE_BUFFER: usize = 512;

/// A named group of endpoint tasks fired together at a fixed cadence.
///
/// Once closed, a watcher cannot be reopened; construct a new one (the ID
/// may be reused).
pub struct Watcher {
    id: String,
    cadence: Duration,
    tasks: Vec<Arc<dyn EndpointTask>>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl Watcher {
    /// Creates a watcher. Validation happens at registration time, when the
    /// manager calls [`Watcher::validate`].
    pub fn new(
        id: impl Into<String>,
        cadence: Duration,
        tasks: Vec<Arc<dyn EndpointTask>>,
    ) -> Self {
        Self {
            id: id.into(),
            cadence,
            tasks,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The watcher's stable ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The period between firings of the task set.
    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Checks that the watcher is ready to be started.
    pub fn validate(&self) -> WatchResult<()> {
        if self.id.is_empty() {
            return Err(WatchError::InvalidWatcher("ID is empty".into()));
        }
        if self.cadence.is_zero() {
            return Err(WatchError::InvalidWatcher(
                "cadence must be strictly positive".into(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(WatchError::InvalidWatcher(
                "watcher has no endpoint tasks".into(),
            ));
        }
        for task in &self.tasks {
            task.validate()
                .map_err(|e| WatchError::InvalidWatcher(e.to_string()))?;
        }
        Ok(())
    }

    /// Initializes every task against a fresh internal channel and spawns
    /// the forwarder. Per-task initialization failures are aggregated; the
    /// forwarder runs regardless, so tasks that did initialize still
    /// deliver.
    pub(crate) async fn start(
        &self,
        external_tx: mpsc::Sender<WatcherResponse>,
    ) -> WatchResult<()> {
        let (task_tx, task_rx) = mpsc::channel(TASK_RESPONSE_BUFFER);

        let mut errors = Vec::new();
        for task in &self.tasks {
            if let Err(e) = task.initialize(&self.id, task_tx.clone()).await {
                errors.push(e);
            }
        }

        tokio::spawn(forward_responses(
            self.id.clone(),
            task_rx,
            external_tx,
            self.done.clone(),
        ));

        match WatchError::from_errors(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The schedulable unit for this watcher: its task set under its ID and
    /// cadence, first firing one cadence from now.
    pub(crate) fn job(&self) -> vigil_cadence::Job {
        vigil_cadence::Job {
            id: self.id.clone(),
            cadence: self.cadence,
            next_exec: tokio::time::Instant::now() + self.cadence,
            tasks: self.tasks.iter().map(|t| t.clone().task()).collect(),
        }
    }

    /// Signals the forwarder and closes every endpoint task, aggregating
    /// errors. A second call is a no-op.
    pub async fn close(&self) -> WatchResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.done.cancel();

        let mut errors = Vec::new();
        for task in &self.tasks {
            if let Err(e) = task.close().await {
                errors.push(e);
            }
        }
        match WatchError::from_errors(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("cadence", &self.cadence)
            .field("tasks", &self.tasks.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Tags inbound task responses with the watcher ID and forwards them until
/// the done signal fires or either channel goes away.
async fn forward_responses(
    watcher_id: String,
    mut task_rx: mpsc::Receiver<WatcherResponse>,
    external_tx: mpsc::Sender<WatcherResponse>,
    done: CancellationToken,
) {
    loop {
        let response = tokio::select! {
            _ = done.cancelled() => return,
            response = task_rx.recv() => response,
        };
        let Some(mut response) = response else { return };
        response.watcher_id = watcher_id.clone();

        tokio::select! {
            _ = done.cancelled() => return,
            sent = external_tx.send(response) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
