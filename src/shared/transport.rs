//! Transport abstractions.
//!
//! [`Transport`] is a bidirectional, message-oriented connection: every
//! `send` delivers one frame and every `receive` yields one frame. The
//! request/reply discipline lives above it in
//! [`RequestChannel`](crate::shared::RequestChannel).
//!
//! [`Inbox`] is the receive-only side used for frames the scheduler pushes
//! to this client without being asked.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// A host/port pair on the scheduler or on this client.
///
/// Displays with the `tcp://` scheme the scheduler expects in response
/// addresses.
///
/// # Examples
///
/// ```
/// use cloudburst_client::shared::Endpoint;
///
/// let endpoint = Endpoint::parse("tcp://10.0.0.5:5005").unwrap();
/// assert_eq!(endpoint.port, 5005);
/// assert_eq!(endpoint.socket_address(), "10.0.0.5:5005");
/// assert_eq!(endpoint.to_string(), "tcp://10.0.0.5:5005");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `tcp://host:port` or `host:port`.
    pub fn parse(address: &str) -> std::result::Result<Self, TransportError> {
        let rest = address.strip_prefix("tcp://").unwrap_or(address);
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// `host:port`, suitable for socket APIs.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// A message-oriented connection to one remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Receives one frame.
    async fn receive(&mut self) -> Result<Bytes>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<()>;

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Short name of the transport, for logs.
    fn transport_type(&self) -> &'static str;

    /// The connected peer, for logs and errors, if the transport knows it.
    fn peer(&self) -> Option<String> {
        None
    }

    /// Largest frame [`send`](Self::send) accepts, if bounded.
    fn max_frame_bytes(&self) -> Option<usize> {
        None
    }
}

/// Receive-only endpoint for frames pushed by the scheduler.
#[async_trait]
pub trait Inbox: Send {
    /// Waits for the next pushed frame.
    async fn recv_frame(&mut self) -> Result<Bytes>;

    /// Drops frames that are already queued, returning how many were
    /// discarded. Called before a new direct-response call so that a frame
    /// left over from an abandoned call is not mistaken for its result.
    fn discard_pending(&mut self) -> usize {
        0
    }
}
