//! TCP transport implementation.
//!
//! Frames are delimited by a 4-byte big-endian length header
//! ([`LengthDelimitedCodec`]). [`TcpTransport`] dials one scheduler
//! endpoint; [`ResponseListener`] accepts pushed frames from any number of
//! peers and funnels them into a single queue.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::shared::transport::{Endpoint, Inbox, Transport};

/// Pushed frames buffered before the listener applies backpressure.
const INBOX_CAPACITY: usize = 64;

fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Length-delimited TCP connection to one endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use cloudburst_client::shared::{Endpoint, TcpTransport, Transport};
/// use std::time::Duration;
///
/// # async fn example() -> cloudburst_client::Result<()> {
/// let endpoint = Endpoint::new("127.0.0.1", 5005);
/// let mut transport = TcpTransport::connect(&endpoint, Duration::from_secs(5), 1 << 20).await?;
/// transport.send(bytes::Bytes::from_static(b"{}")).await?;
/// let reply = transport.receive().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TcpTransport {
    endpoint: Endpoint,
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    max_frame_bytes: usize,
}

impl TcpTransport {
    /// Connects to `endpoint`, giving up after `connect_timeout`.
    pub async fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let stream =
            tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.socket_address()))
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "connect",
                    endpoint: endpoint.to_string(),
                    after: connect_timeout,
                })?
                .map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;

        tracing::debug!(endpoint = %endpoint, "connected");
        Ok(Self::from_stream(endpoint.clone(), stream, max_frame_bytes))
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(endpoint: Endpoint, stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            endpoint,
            framed: Some(Framed::new(stream, codec(max_frame_bytes))),
            max_frame_bytes,
        }
    }

    /// The remote endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn framed(&mut self) -> Result<&mut Framed<TcpStream, LengthDelimitedCodec>> {
        self.framed
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionClosed.into())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        if frame.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            }
            .into());
        }
        self.framed()?
            .send(frame)
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes> {
        let next = self.framed()?.next().await;
        match next {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(TransportError::from(e).into()),
            None => {
                self.framed = None;
                Err(TransportError::ConnectionClosed.into())
            },
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            SinkExt::<Bytes>::close(&mut framed)
                .await
                .map_err(TransportError::from)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    fn transport_type(&self) -> &'static str {
        "tcp"
    }

    fn peer(&self) -> Option<String> {
        Some(self.endpoint.to_string())
    }

    fn max_frame_bytes(&self) -> Option<usize> {
        Some(self.max_frame_bytes)
    }
}

/// Listener for frames pushed to this client.
///
/// Binds once and keeps accepting connections in the background until
/// dropped. Frames from every connection land in one queue, read with
/// [`Inbox::recv_frame`].
#[derive(Debug)]
pub struct ResponseListener {
    local_addr: SocketAddr,
    frames: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
}

impl ResponseListener {
    /// Binds to `bind_address` (`host:port`) and starts accepting.
    pub async fn bind(bind_address: &str, max_frame_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        let (tx, frames) = mpsc::channel(INBOX_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, tx, shutdown.clone(), max_frame_bytes));
        tracing::debug!(address = %local_addr, "direct-response listener bound");

        Ok(Self {
            local_addr,
            frames,
            shutdown,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ResponseListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Inbox for ResponseListener {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        self.frames
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionClosed.into())
    }

    fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.frames.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "direct-response peer connected");
                    tokio::spawn(read_frames(
                        stream,
                        peer,
                        tx.clone(),
                        shutdown.child_token(),
                        max_frame_bytes,
                    ));
                },
                Err(e) => tracing::warn!(error = %e, "failed to accept direct-response connection"),
            },
        }
    }
}

async fn read_frames(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
) {
    let mut reader = FramedRead::new(stream, codec(max_frame_bytes));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    if tx.send(frame.freeze()).await.is_err() {
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "dropping malformed direct-response stream");
                    break;
                },
                None => break,
            },
        }
    }
}
