//! # Cloudburst client
//!
//! Async client runtime for invoking DAGs on a Cloudburst scheduler.
//!
//! A call goes to the scheduler over a strict request/reply channel and is
//! acknowledged with a response id. The result is later read from the
//! key-value store under that id, or, when the caller asks for a direct
//! response, pushed straight back to this client.
//!
//! # Module Organization
//!
//! - [`client`] - [`Client`], configuration, store discovery, futures, KVS access
//! - [`shared`] - Transports, the request/reply channel, the frame decoder
//! - [`types`] - Wire messages and lattice values
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use cloudburst_client::{Client, ClientConfig, LocalConnector, MemoryKvs};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> cloudburst_client::Result<()> {
//! let config = ClientConfig::new("scheduler.internal");
//! let client = Client::connect(config, &LocalConnector::new(Arc::new(MemoryKvs::new()))).await?;
//!
//! let result = client.call_dag("hello", BTreeMap::new(), true).await?.get().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod shared;
pub mod types;

pub use client::{
    Client, ClientConfig, EndpointPorts, EndpointRole, FutureState, KvsClient, KvsConnector,
    LocalConnector, MemoryKvs, PollPolicy, ResponseFuture,
};
pub use error::{Error, FramingError, KvsError, Result, TransportError};
pub use shared::{Endpoint, ResponseFrame};
pub use types::{ArgumentValue, Arguments, DagCall, GenericResponse, Lattice};

/// Installs a `tracing` subscriber that logs to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `cloudburst_client=info`.
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cloudburst_client=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
