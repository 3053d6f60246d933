//! Strict request/reply channel.
//!
//! A [`RequestChannel`] wraps a [`Transport`] and enforces the alternation
//! the scheduler's request endpoints require: one send, then exactly one
//! receive, before the channel can carry another request.
//!
//! A request issued while another is still waiting for its reply fails
//! immediately with [`Error::ChannelBusy`]; it never queues behind the
//! first. Any failure in the middle of an exchange (send error, receive
//! error, timeout, or the caller dropping the request future) leaves the
//! peer in an unknown position in the exchange, so the channel is marked
//! [`ChannelState::Broken`] and refuses further requests.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result, TransportError};
use crate::shared::transport::Transport;

/// Position of a [`RequestChannel`] in its send/receive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Ready for the next request.
    Idle,
    /// A request was sent and its reply has not been received yet.
    AwaitingReply,
    /// An exchange failed part-way; the channel must be replaced.
    Broken,
}

/// Single-flight request/reply channel over a [`Transport`].
pub struct RequestChannel<T: Transport> {
    endpoint: String,
    transport: tokio::sync::Mutex<T>,
    state: Mutex<ChannelState>,
    reply_timeout: Duration,
    max_frame_bytes: Option<usize>,
}

impl<T: Transport> std::fmt::Debug for RequestChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestChannel")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("reply_timeout", &self.reply_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}

impl<T: Transport> RequestChannel<T> {
    /// Wraps `transport`. Each exchange must complete within `reply_timeout`.
    pub fn new(endpoint: impl Into<String>, transport: T, reply_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_frame_bytes: transport.max_frame_bytes(),
            transport: tokio::sync::Mutex::new(transport),
            state: Mutex::new(ChannelState::Idle),
            reply_timeout,
        }
    }

    /// The endpoint this channel talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Sends `payload` and waits for the single reply.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelBusy`] if another request is awaiting its reply.
    /// - [`Error::Connectivity`] if the channel is broken, or the send or
    ///   receive fails or times out. A payload larger than the transport's
    ///   frame limit is refused with [`TransportError::FrameTooLarge`]
    ///   before anything is sent and leaves the channel usable.
    pub async fn request(&self, payload: Bytes) -> Result<Bytes> {
        if let Some(limit) = self.max_frame_bytes.filter(|&limit| payload.len() > limit) {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                limit,
            }
            .into());
        }
        let exchange = self.begin()?;

        let mut transport = self.transport.lock().await;
        let reply = tokio::time::timeout(self.reply_timeout, async {
            transport.send(payload).await?;
            transport.receive().await
        })
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "request",
            endpoint: self.endpoint.clone(),
            after: self.reply_timeout,
        })??;
        drop(transport);

        exchange.complete();
        Ok(reply)
    }

    /// Closes the underlying transport.
    pub async fn close(&self) -> Result<()> {
        *self.state.lock() = ChannelState::Broken;
        self.transport.lock().await.close().await
    }

    fn begin(&self) -> Result<Exchange<'_>> {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Idle => {
                *state = ChannelState::AwaitingReply;
                Ok(Exchange {
                    state: &self.state,
                    completed: false,
                })
            },
            ChannelState::AwaitingReply => Err(Error::ChannelBusy {
                endpoint: self.endpoint.clone(),
            }),
            ChannelState::Broken => Err(TransportError::ChannelBroken {
                endpoint: self.endpoint.clone(),
            }
            .into()),
        }
    }
}

/// Marks the channel broken unless the exchange completes.
struct Exchange<'a> {
    state: &'a Mutex<ChannelState>,
    completed: bool,
}

impl Exchange<'_> {
    fn complete(mut self) {
        self.completed = true;
        *self.state.lock() = ChannelState::Idle;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.state.lock() = ChannelState::Broken;
        }
    }
}
