//! Vigil — a polling endpoint watcher engine.
//!
//! A [`Vigil`] manager owns a dynamic set of [`Watcher`]s. Each watcher
//! bundles one or more endpoint tasks (HTTP or WebSocket) under a shared ID
//! and cadence; the scheduler fires every watcher's task set at its period,
//! and all resulting response records are multiplexed onto one consumer
//! stream, with per-request latency breakdowns attached.
//!
//! WebSocket endpoints run in one of two modes: one-hit text (a fresh
//! connection per message) or persistent JSON-RPC (one long-lived
//! connection with replies correlated to requests by rewriting request
//! IDs).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use http::Method;
//! use url::Url;
//! use vigil_engine::{EndpointTask, HttpEndpoint, Vigil, Watcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), vigil_engine::WatchError> {
//!     let vigil = Vigil::new();
//!
//!     let endpoint = HttpEndpoint::new(
//!         Url::parse("https://example.com/health").unwrap(),
//!         Method::GET,
//!     );
//!     let tasks: Vec<Arc<dyn EndpointTask>> = vec![Arc::new(endpoint)];
//!     vigil
//!         .add_watcher(Watcher::new("example", Duration::from_secs(5), tasks))
//!         .await?;
//!
//!     // Taking the stream unblocks watcher activation.
//!     let mut responses = vigil.start()?;
//!     while let Some(mut response) = responses.recv().await {
//!         match response.data().await {
//!             Ok(body) => println!("{}: {} bytes", response.url, body.len()),
//!             Err(e) => eprintln!("{}: {e}", response.url),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod response;
pub mod task;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{WatchError, WatchResult};
pub use manager::{EngineConfig, Vigil};
pub use response::{
    HttpPayload, RequestTimestamps, ResponseMetadata, TaskPayload, WatcherResponse, WsPayload,
};
pub use task::{EndpointTask, HttpEndpoint, TransportControl, WsEndpoint, WsEndpointMode};
pub use watcher::Watcher;

// The scheduler contract (`Job`, `Task`) appears in the public API surface
// of `EndpointTask`; re-export the crate so implementors don't need a
// separate dependency line.
pub use vigil_cadence as cadence;
