//! Store discovery handshake.
//!
//! The scheduler's connect endpoint answers an empty request with the
//! address of the KVS entry point. There is no retry: a failed or timed out
//! exchange is reported as [`Error::Connectivity`].

use bytes::Bytes;

use super::config::{ClientConfig, EndpointRole};
use crate::error::{Error, Result};
use crate::shared::{RequestChannel, TcpTransport, Transport};

/// Connects to the scheduler's connect endpoint and returns the KVS
/// address it reports.
pub async fn discover_store_address(config: &ClientConfig) -> Result<String> {
    let endpoint = config.endpoint(EndpointRole::Connect);
    let transport =
        TcpTransport::connect(&endpoint, config.handshake_timeout(), config.max_frame_bytes)
            .await?;
    let channel = RequestChannel::new(endpoint.to_string(), transport, config.handshake_timeout());

    let result = handshake(&channel).await;
    if let Err(e) = channel.close().await {
        tracing::trace!(error = %e, "closing handshake channel failed");
    }
    result
}

/// Runs the handshake over an open channel.
pub async fn handshake<T: Transport>(channel: &RequestChannel<T>) -> Result<String> {
    let reply = channel.request(Bytes::new()).await?;
    let address = std::str::from_utf8(&reply)
        .map_err(|_| Error::Protocol("store address is not valid UTF-8".to_string()))?
        .trim();
    if address.is_empty() {
        return Err(Error::Protocol(
            "scheduler returned an empty store address".to_string(),
        ));
    }

    tracing::debug!(endpoint = channel.endpoint(), store_address = address, "discovered store");
    Ok(address.to_string())
}
