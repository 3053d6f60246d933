//! Cloudburst client.
//!
//! [`Client`] owns a request/reply channel to the scheduler's DAG-call
//! endpoint, an optional inbox for pushed results, and a handle to the KVS
//! where results are stored.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cloudburst_client::client::{Client, ClientConfig, LocalConnector, MemoryKvs};
//! use cloudburst_client::types::{ArgumentValue, Arguments};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> cloudburst_client::Result<()> {
//! let config = ClientConfig::from_env()?;
//! let connector = LocalConnector::new(Arc::new(MemoryKvs::new()));
//! let client = Client::connect(config, &connector).await?;
//!
//! let mut args = BTreeMap::new();
//! args.insert("square".to_string(), Arguments::from(ArgumentValue::string("7")));
//!
//! let future = client.call_dag("square_then_print", args, false).await?;
//! let result = future.get().await?;
//! println!("{} bytes", result.len());
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod future;
pub mod kvs;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result, TransportError};
use crate::shared::{
    ChannelState, Inbox, RequestChannel, ResponseFrame, ResponseListener, TcpTransport, Transport,
};
use crate::types::{Arguments, DagCall, GenericResponse};

pub use bootstrap::discover_store_address;
pub use config::{ClientConfig, EndpointPorts, EndpointRole};
pub use future::{FutureState, PollPolicy, ResponseFuture};
pub use kvs::{KvsClient, KvsConnector, LocalConnector, MemoryKvs};

/// Inbound channel for pushed results, and the address advertised for it.
struct DirectResponses {
    address: String,
    // held for the whole call so only one direct-response call is in flight
    inbox: tokio::sync::Mutex<Box<dyn Inbox>>,
}

/// Client for invoking DAGs on a Cloudburst scheduler.
pub struct Client<T: Transport = TcpTransport> {
    config: ClientConfig,
    store_address: String,
    dag_calls: RequestChannel<T>,
    direct: Option<DirectResponses>,
    store: Arc<dyn KvsClient>,
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("scheduler", &self.config.scheduler_host)
            .field("store_address", &self.store_address)
            .field("dag_calls", &self.dag_calls)
            .field("response_address", &self.response_address())
            .finish()
    }
}

impl Client<TcpTransport> {
    /// Connects to the scheduler described by `config`.
    ///
    /// Runs the store discovery handshake, opens the KVS through
    /// `connector`, dials the DAG-call endpoint, and binds the
    /// direct-response listener when `enable_direct_response` is set.
    pub async fn connect(config: ClientConfig, connector: &dyn KvsConnector) -> Result<Self> {
        config.validate()?;

        let store_address = discover_store_address(&config).await?;
        let store = connector.connect(&store_address, &config).await?;

        let endpoint = config.endpoint(EndpointRole::DagCall);
        let transport =
            TcpTransport::connect(&endpoint, config.handshake_timeout(), config.max_frame_bytes)
                .await?;
        let mut client = Self::from_parts(config, store_address, transport, store);

        if client.config.enable_direct_response {
            let listener = ResponseListener::bind(
                &client.config.response_bind_address(),
                client.config.max_frame_bytes,
            )
            .await?;
            let address = client.config.response_endpoint().to_string();
            client = client.with_inbox(address, listener);
        }

        tracing::info!(
            scheduler = %client.config.scheduler_host,
            store_address = %client.store_address,
            direct_response = client.direct.is_some(),
            "client connected"
        );
        Ok(client)
    }
}

impl<T: Transport> Client<T> {
    /// Assembles a client from an already-open DAG-call transport.
    ///
    /// The channel is labelled with the transport's peer, falling back to
    /// the configured DAG-call endpoint when the transport cannot name it.
    pub fn from_parts(
        config: ClientConfig,
        store_address: impl Into<String>,
        transport: T,
        store: Arc<dyn KvsClient>,
    ) -> Self {
        let endpoint = transport
            .peer()
            .unwrap_or_else(|| config.endpoint(EndpointRole::DagCall).to_string());
        let dag_calls = RequestChannel::new(endpoint, transport, config.call_timeout());
        Self {
            config,
            store_address: store_address.into(),
            dag_calls,
            direct: None,
            store,
        }
    }

    /// Attaches an inbox for pushed results, advertised to the scheduler
    /// as `address`.
    pub fn with_inbox(mut self, address: impl Into<String>, inbox: impl Inbox + 'static) -> Self {
        self.direct = Some(DirectResponses {
            address: address.into(),
            inbox: tokio::sync::Mutex::new(Box::new(inbox)),
        });
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// KVS address reported by the scheduler.
    pub fn store_address(&self) -> &str {
        &self.store_address
    }

    /// Address advertised for pushed results, if an inbox is attached.
    pub fn response_address(&self) -> Option<&str> {
        self.direct.as_ref().map(|d| d.address.as_str())
    }

    /// The KVS handle futures poll.
    pub fn store(&self) -> Arc<dyn KvsClient> {
        self.store.clone()
    }

    /// Peer of the DAG-call channel, as named in errors and logs.
    pub fn dag_call_endpoint(&self) -> &str {
        self.dag_calls.endpoint()
    }

    /// State of the DAG-call channel.
    pub fn channel_state(&self) -> ChannelState {
        self.dag_calls.state()
    }

    /// Calls the DAG `name` with `args`.
    ///
    /// The call is encoded before any I/O. With `direct_response` the call
    /// carries this client's response address and the returned future is
    /// already resolved with the pushed result; otherwise the future polls
    /// the KVS.
    ///
    /// # Errors
    ///
    /// - [`Error::Serialization`] if the call is malformed or too large.
    /// - [`Error::Config`] if `direct_response` is requested without an inbox.
    /// - [`Error::ChannelBusy`] if another call is awaiting its reply.
    /// - [`Error::Connectivity`] if the exchange or the pushed frame fails.
    /// - [`Error::Rejected`] / [`Error::Protocol`] for refused or malformed replies.
    /// - [`Error::Framing`] if the pushed frame cannot be split.
    pub async fn call_dag(
        &self,
        name: &str,
        args: BTreeMap<String, Arguments>,
        direct_response: bool,
    ) -> Result<ResponseFuture> {
        let mut call = DagCall::with_args(name, args);
        let direct = if direct_response {
            let direct = self.direct.as_ref().ok_or_else(|| {
                Error::Config(format!(
                    "direct response requested for '{}' but the client has no inbox",
                    name
                ))
            })?;
            call = call.with_response_address(direct.address.clone());
            Some(direct)
        } else {
            None
        };
        let request = call.encode(self.config.request_limit())?;

        let mut inbox = match direct {
            Some(direct) => Some(direct.inbox.lock().await),
            None => None,
        };
        if let Some(inbox) = inbox.as_mut() {
            let stale = inbox.discard_pending();
            if stale > 0 {
                tracing::warn!(dag = name, stale, "discarded unclaimed direct-response frames");
            }
        }

        tracing::debug!(dag = name, bytes = request.len(), direct_response, "calling DAG");
        let reply = self.dag_calls.request(request).await?;
        let response_id = GenericResponse::decode(&reply)?.into_response_id(name)?;
        tracing::debug!(dag = name, response_id = %response_id, "call acknowledged");

        let (Some(direct), Some(mut inbox)) = (direct, inbox) else {
            return Ok(ResponseFuture::new(
                response_id,
                self.store.clone(),
                self.config.poll.clone(),
            ));
        };

        let timeout = self.config.call_timeout();
        let raw = tokio::time::timeout(timeout, inbox.recv_frame())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "receive",
                endpoint: direct.address.clone(),
                after: timeout,
            })??;
        drop(inbox);

        let frame = ResponseFrame::decode(raw)?;
        tracing::debug!(
            dag = name,
            response_id = %response_id,
            prefix = %frame.prefix_hex(),
            payload_bytes = frame.payload().len(),
            "received direct response"
        );
        Ok(ResponseFuture::resolved(
            response_id,
            self.store.clone(),
            self.config.poll.clone(),
            frame.into_payload(),
        ))
    }

    /// Closes the DAG-call channel. Later calls fail with a connectivity
    /// error.
    pub async fn close(&self) -> Result<()> {
        self.dag_calls.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArgumentValue, CallErrorCode, Lattice};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Transport that records requests and replays canned replies.
    #[derive(Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<Bytes>>>,
        replies: Arc<Mutex<VecDeque<Bytes>>>,
        peer: Option<String>,
        limit: Option<usize>,
    }

    impl MockTransport {
        fn replying(replies: impl IntoIterator<Item = GenericResponse>) -> Self {
            let mock = Self::default();
            mock.replies
                .lock()
                .extend(replies.into_iter().map(|r| r.encode().unwrap()));
            mock
        }

        fn sent_calls(&self) -> Vec<DagCall> {
            self.sent
                .lock()
                .iter()
                .map(|b| DagCall::decode(b).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: Bytes) -> Result<()> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Bytes> {
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError::ConnectionClosed.into())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn transport_type(&self) -> &'static str {
            "mock"
        }

        fn peer(&self) -> Option<String> {
            self.peer.clone()
        }

        fn max_frame_bytes(&self) -> Option<usize> {
            self.limit
        }
    }

    struct ChannelInbox(mpsc::UnboundedReceiver<Bytes>);

    #[async_trait]
    impl Inbox for ChannelInbox {
        async fn recv_frame(&mut self) -> Result<Bytes> {
            self.0
                .recv()
                .await
                .ok_or_else(|| TransportError::ConnectionClosed.into())
        }

        fn discard_pending(&mut self) -> usize {
            let mut n = 0;
            while self.0.try_recv().is_ok() {
                n += 1;
            }
            n
        }
    }

    fn pushed_frame(payload: &[u8]) -> Bytes {
        // tag byte plus single-byte varint length
        assert!(payload.len() < 128);
        let mut frame = vec![0x0a, payload.len() as u8];
        frame.extend_from_slice(payload);
        Bytes::from(frame)
    }

    fn args(function: &str, value: &str) -> BTreeMap<String, Arguments> {
        let mut args = BTreeMap::new();
        args.insert(function.to_string(), Arguments::from(ArgumentValue::string(value)));
        args
    }

    fn client(transport: MockTransport, store: Arc<MemoryKvs>) -> Client<MockTransport> {
        let config = ClientConfig::new("scheduler").with_poll_policy(
            PollPolicy::default()
                .with_backoff(std::time::Duration::from_millis(5), std::time::Duration::from_millis(20)),
        );
        Client::from_parts(config, "10.0.0.9", transport, store)
    }

    #[tokio::test]
    async fn test_polling_call_resolves_from_store() {
        let transport = MockTransport::replying([GenericResponse::accepted("resp-1")]);
        let store = Arc::new(MemoryKvs::new());
        let client = client(transport.clone(), store.clone());

        let future = client.call_dag("pipeline", args("f", "x"), false).await.unwrap();
        assert_eq!(future.response_id(), "resp-1");
        assert!(!future.is_resolved());

        store.put("resp-1", Lattice::lww(1, "result")).unwrap();
        assert_eq!(future.get().await.unwrap(), Bytes::from("result"));

        let sent = transport.sent_calls();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "pipeline");
        assert_eq!(sent[0].response_address, None);
        assert_eq!(client.channel_state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_direct_call_is_resolved_without_store_reads() {
        let transport = MockTransport::replying([GenericResponse::accepted("resp-2")]);
        let store = Arc::new(MemoryKvs::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let client = client(transport.clone(), store.clone())
            .with_inbox("tcp://10.0.0.17:9010", ChannelInbox(rx));

        // left over from an abandoned call
        tx.send(pushed_frame(b"stale")).unwrap();

        let call = client.call_dag("pipeline", args("f", "x"), true);
        let push = async {
            tokio::task::yield_now().await;
            tx.send(pushed_frame(b"fresh")).unwrap();
        };
        let (future, ()) = tokio::join!(call, push);
        let future = future.unwrap();

        assert!(future.is_resolved());
        assert_eq!(future.get().await.unwrap(), Bytes::from("fresh"));
        assert_eq!(store.reads(), 0);
        assert_eq!(
            transport.sent_calls()[0].response_address.as_deref(),
            Some("tcp://10.0.0.17:9010")
        );
    }

    #[tokio::test]
    async fn test_direct_call_without_inbox_fails_before_io() {
        let transport = MockTransport::replying([GenericResponse::accepted("r")]);
        let client = client(transport.clone(), Arc::new(MemoryKvs::new()));

        let err = client.call_dag("pipeline", BTreeMap::new(), true).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_call_fails_before_io() {
        let transport = MockTransport::replying([GenericResponse::accepted("r")]);
        let client = client(transport.clone(), Arc::new(MemoryKvs::new()));

        let err = client.call_dag("", BTreeMap::new(), false).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let err = client
            .call_dag("pipeline", args("", "x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(transport.sent.lock().is_empty());
        assert_eq!(client.channel_state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_oversized_call_fails_before_io() {
        let transport = MockTransport::replying([GenericResponse::accepted("r")]);
        let config = ClientConfig::new("scheduler").with_max_request_bytes(64);
        let client = Client::from_parts(config, "kvs", transport.clone(), Arc::new(MemoryKvs::new()));

        let big = "x".repeat(256);
        let err = client.call_dag("pipeline", args("f", &big), false).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_call_larger_than_frame_limit_fails_before_io() {
        // max_request_bytes stays at its 4 MiB default
        let mut transport = MockTransport::replying([GenericResponse::accepted("r")]);
        transport.limit = Some(256);
        let config = ClientConfig::new("scheduler").with_max_frame_bytes(256);
        let client = Client::from_parts(config, "kvs", transport.clone(), Arc::new(MemoryKvs::new()));

        let big = "x".repeat(1024);
        let err = client.call_dag("pipeline", args("f", &big), false).await.unwrap_err();
        assert_eq!(err.category(), "serialization");
        assert!(transport.sent.lock().is_empty());
        assert_eq!(client.channel_state(), ChannelState::Idle);

        let future = client.call_dag("pipeline", BTreeMap::new(), false).await.unwrap();
        assert_eq!(future.response_id(), "r");
    }

    #[test]
    fn test_channel_is_labelled_with_transport_peer() {
        let mut transport = MockTransport::default();
        transport.peer = Some("tcp://127.0.0.1:40123".to_string());
        let client = client(transport, Arc::new(MemoryKvs::new()));
        assert_eq!(client.dag_call_endpoint(), "tcp://127.0.0.1:40123");

        let client = client_without_peer();
        assert_eq!(client.dag_call_endpoint(), "tcp://scheduler:5005");
    }

    fn client_without_peer() -> Client<MockTransport> {
        client(MockTransport::default(), Arc::new(MemoryKvs::new()))
    }

    #[tokio::test]
    async fn test_rejected_call() {
        let transport = MockTransport::replying([GenericResponse::rejected(CallErrorCode::NoSuchDag)]);
        let client = client(transport, Arc::new(MemoryKvs::new()));

        match client.call_dag("missing", BTreeMap::new(), false).await.unwrap_err() {
            Error::Rejected { dag, reason } => {
                assert_eq!(dag, "missing");
                assert_eq!(reason, "no_such_dag");
            },
            other => panic!("unexpected error: {other}"),
        }
        // the exchange itself completed
        assert_eq!(client.channel_state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_bad_pushed_frame_is_framing_error() {
        let transport = MockTransport::replying([GenericResponse::accepted("r")]);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = client(transport, Arc::new(MemoryKvs::new()))
            .with_inbox("tcp://127.0.0.1:9010", ChannelInbox(rx));

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.send(Bytes::from_static(&[0x0a])).unwrap();
        });
        let err = client.call_dag("pipeline", BTreeMap::new(), true).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[tokio::test]
    async fn test_closed_client_refuses_calls() {
        let transport = MockTransport::replying([GenericResponse::accepted("r")]);
        let client = client(transport, Arc::new(MemoryKvs::new()));
        client.close().await.unwrap();

        let err = client.call_dag("pipeline", BTreeMap::new(), false).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
