//! Error types for the Cloudburst client.
//!
//! [`Error`] is the single error type returned by every public operation.
//! Its variants follow the failure classes a DAG call can hit: the scheduler
//! or inbound channel being unreachable, a call that cannot be encoded, a
//! malformed direct-response frame, and a result that never showed up in the
//! store. Use [`Error::category`] to classify an error without matching on
//! every variant.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the Cloudburst client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handshake, call, or inbound channel failed or timed out.
    #[error("connectivity error: {0}")]
    Connectivity(#[from] TransportError),

    /// The call could not be encoded, or a reply could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A direct-response frame did not carry a valid length prefix.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The result was not available in the store within the wait bound.
    #[error("timed out resolving response {response_id} after {waited:?} ({attempts} polls)")]
    ResolutionTimeout {
        /// The response id being resolved.
        response_id: String,
        /// How long the future waited before giving up.
        waited: Duration,
        /// Number of store reads issued.
        attempts: u32,
    },

    /// Resolution was cancelled by the caller.
    #[error("resolution of response {response_id} was cancelled")]
    Cancelled {
        /// The response id being resolved.
        response_id: String,
    },

    /// A request was issued on a request/reply channel that is still
    /// waiting for the reply to a previous request.
    #[error("request channel to {endpoint} is busy with an outstanding request")]
    ChannelBusy {
        /// The endpoint the channel is connected to.
        endpoint: String,
    },

    /// The scheduler acknowledged the call but refused to run it.
    #[error("scheduler rejected call to DAG '{dag}': {reason}")]
    Rejected {
        /// The DAG that was called.
        dag: String,
        /// Error code reported by the scheduler.
        reason: String,
    },

    /// The scheduler replied with something that violates the call protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The key-value store returned a non-retryable error.
    #[error(transparent)]
    Store(#[from] KvsError),

    /// Invalid client configuration or usage.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the error category as a static string.
    ///
    /// Categories: `"connectivity"`, `"serialization"`, `"framing"`,
    /// `"timeout"`, `"cancelled"`, `"busy"`, `"rejected"`, `"protocol"`,
    /// `"store"`, `"config"`.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::Serialization(_) => "serialization",
            Self::Framing(_) => "framing",
            Self::ResolutionTimeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ChannelBusy { .. } => "busy",
            Self::Rejected { .. } => "rejected",
            Self::Protocol(_) => "protocol",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }

    /// Returns `true` if the error came from the network layer.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML parse error: {}", err))
    }
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation did not complete within its deadline.
    #[error("{operation} on {endpoint} timed out after {after:?}")]
    Timeout {
        /// What was being attempted (`connect`, `send`, `receive`).
        operation: &'static str,
        /// Remote or local endpoint involved.
        endpoint: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// A frame exceeded the configured size limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// An earlier exchange on this request/reply channel failed part-way.
    #[error("request channel to {endpoint} is broken by an earlier failed exchange")]
    ChannelBroken {
        /// The endpoint the channel is connected to.
        endpoint: String,
    },

    /// The address could not be parsed.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Errors produced while splitting a direct-response frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The frame is too short to hold a prefix and a payload.
    #[error("frame too short: {len} bytes (need at least 2)")]
    TooShort {
        /// Length of the frame.
        len: usize,
    },

    /// No prefix length is consistent with the frame length.
    #[error("no self-describing prefix fits a frame of {len} bytes")]
    NoPrefix {
        /// Length of the frame.
        len: usize,
    },
}

/// Errors reported by a [`KvsClient`](crate::client::KvsClient).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvsError {
    /// A transient failure; the read may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored lattice cannot be reconciled to raw bytes.
    #[error("lattice type '{kind}' under key {key} cannot be reconciled to bytes")]
    UnsupportedLattice {
        /// The key that was read.
        key: String,
        /// Name of the lattice variant found.
        kind: &'static str,
    },

    /// A write carried a different lattice type than the stored value.
    #[error("lattice type mismatch under key {key}: stored {stored}, incoming {incoming}")]
    TypeMismatch {
        /// The key being written.
        key: String,
        /// Variant already stored.
        stored: &'static str,
        /// Variant being written.
        incoming: &'static str,
    },
}

impl KvsError {
    /// Returns `true` if the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
