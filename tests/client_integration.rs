//! End-to-end tests against a scheduler simulated over loopback TCP.
//!
//! The mock scheduler answers the connect handshake with a store address,
//! acknowledges DAG calls, and then either writes the result to a shared
//! in-memory store or pushes it to the call's response address.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudburst_client::types::CallErrorCode;
use cloudburst_client::{
    ArgumentValue, Arguments, Client, ClientConfig, DagCall, Endpoint, Error, GenericResponse,
    LocalConnector, MemoryKvs, PollPolicy,
};
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const STORE_ADDRESS: &str = "127.0.0.1:6450";

struct MockScheduler {
    connect_port: u16,
    dag_call_port: u16,
    calls: mpsc::UnboundedReceiver<DagCall>,
    release: Arc<Notify>,
}

/// Starts a scheduler. With `hold_replies`, each reply waits for
/// `release.notify_one()`.
async fn spawn_scheduler(store: Arc<MemoryKvs>, hold_replies: bool) -> MockScheduler {
    let connect = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dag_call = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connect_port = connect.local_addr().unwrap().port();
    let dag_call_port = dag_call.local_addr().unwrap().port();
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());

    tokio::spawn(async move {
        while let Ok((stream, _)) = connect.accept().await {
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            if let Some(Ok(_)) = framed.next().await {
                framed.send(Bytes::from_static(STORE_ADDRESS.as_bytes())).await.unwrap();
            }
        }
    });

    let gate = release.clone();
    tokio::spawn(async move {
        let counter = AtomicUsize::new(0);
        while let Ok((stream, _)) = dag_call.accept().await {
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                let call = DagCall::decode(&frame).unwrap();
                calls_tx.send(call.clone()).unwrap();
                if hold_replies {
                    gate.notified().await;
                }

                if call.name == "missing" {
                    let reply = GenericResponse::rejected(CallErrorCode::NoSuchDag);
                    framed.send(reply.encode().unwrap()).await.unwrap();
                    continue;
                }

                let id = format!("{}-{}", call.name, counter.fetch_add(1, Ordering::SeqCst));
                let result = format!("ran {}", call.name);
                framed
                    .send(GenericResponse::accepted(id.clone()).encode().unwrap())
                    .await
                    .unwrap();

                match call.response_address {
                    Some(address) => push_result(&address, result.as_bytes()).await,
                    None => {
                        store.put_lww(id, 1, result).unwrap();
                    },
                }
            }
        }
    });

    MockScheduler {
        connect_port,
        dag_call_port,
        calls,
        release,
    }
}

async fn push_result(address: &str, payload: &[u8]) {
    assert!(payload.len() < 128);
    let mut frame = vec![0x0a, payload.len() as u8];
    frame.extend_from_slice(payload);

    let endpoint = Endpoint::parse(address).unwrap();
    let stream = TcpStream::connect(endpoint.socket_address()).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::from(frame)).await.unwrap();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config_for(scheduler: &MockScheduler, direct_response: bool) -> ClientConfig {
    let mut config = ClientConfig::new("127.0.0.1")
        .with_response_port(free_port())
        .with_direct_response(direct_response)
        .with_call_timeout(5_000)
        .with_poll_policy(
            PollPolicy::default()
                .with_backoff(Duration::from_millis(5), Duration::from_millis(50))
                .with_max_wait(Some(Duration::from_secs(5))),
        );
    config.ports.connect = scheduler.connect_port;
    config.ports.dag_call = scheduler.dag_call_port;
    config
}

fn args(value: &str) -> BTreeMap<String, Arguments> {
    let mut args = BTreeMap::new();
    args.insert("square".to_string(), Arguments::from(ArgumentValue::string(value)));
    args
}

#[tokio::test]
async fn test_call_resolved_through_store() {
    let store = Arc::new(MemoryKvs::new());
    let mut scheduler = spawn_scheduler(store.clone(), false).await;
    let connector = LocalConnector::new(store.clone());

    let client = Client::connect(config_for(&scheduler, false), &connector)
        .await
        .unwrap();
    assert_eq!(client.store_address(), STORE_ADDRESS);
    assert_eq!(client.response_address(), None);

    let future = client.call_dag("square_dag", args("7"), false).await.unwrap();
    assert_eq!(future.response_id(), "square_dag-0");
    assert_eq!(future.get().await.unwrap(), Bytes::from("ran square_dag"));

    // cached after the first resolution
    let reads = store.reads();
    assert_eq!(future.get().await.unwrap(), Bytes::from("ran square_dag"));
    assert_eq!(store.reads(), reads);

    let call = scheduler.calls.recv().await.unwrap();
    assert_eq!(call.name, "square_dag");
    assert_eq!(call.function_args["square"].values[0].body, b"7".to_vec());
    assert_eq!(call.response_address, None);
}

#[tokio::test]
async fn test_direct_response_skips_store() {
    let store = Arc::new(MemoryKvs::new());
    let mut scheduler = spawn_scheduler(store.clone(), false).await;
    let connector = LocalConnector::new(store.clone());
    let config = config_for(&scheduler, true);
    let expected_address = format!("tcp://127.0.0.1:{}", config.response_port);

    let client = Client::connect(config, &connector).await.unwrap();
    assert_eq!(client.response_address(), Some(expected_address.as_str()));

    for round in 0..3 {
        let future = client.call_dag("echo", args("hi"), true).await.unwrap();
        assert!(future.is_resolved(), "round {round}");
        assert_eq!(future.get().await.unwrap(), Bytes::from("ran echo"));
    }
    assert_eq!(store.reads(), 0);
    assert!(store.is_empty());

    let call = scheduler.calls.recv().await.unwrap();
    assert_eq!(call.response_address.as_deref(), Some(expected_address.as_str()));
}

#[tokio::test]
async fn test_rejected_call_surfaces_error_code() {
    let store = Arc::new(MemoryKvs::new());
    let scheduler = spawn_scheduler(store.clone(), false).await;
    let client = Client::connect(config_for(&scheduler, false), &LocalConnector::new(store))
        .await
        .unwrap();

    let err = client.call_dag("missing", args("1"), false).await.unwrap_err();
    assert_eq!(err.category(), "rejected");
    assert!(err.to_string().contains("no_such_dag"));

    // the channel is still usable
    let future = client.call_dag("after", args("1"), false).await.unwrap();
    assert_eq!(future.get().await.unwrap(), Bytes::from("ran after"));
}

#[tokio::test]
async fn test_second_call_while_first_is_outstanding_is_busy() {
    let store = Arc::new(MemoryKvs::new());
    let mut scheduler = spawn_scheduler(store.clone(), true).await;
    let client = Arc::new(
        Client::connect(config_for(&scheduler, false), &LocalConnector::new(store))
            .await
            .unwrap(),
    );

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.call_dag("slow", args("1"), false).await })
    };
    assert_eq!(scheduler.calls.recv().await.unwrap().name, "slow");

    let err = client.call_dag("eager", args("2"), false).await.unwrap_err();
    assert!(matches!(err, Error::ChannelBusy { .. }));

    scheduler.release.notify_one();
    let future = first.await.unwrap().unwrap();
    assert_eq!(future.get().await.unwrap(), Bytes::from("ran slow"));
}

#[tokio::test]
async fn test_invalid_call_never_reaches_scheduler() {
    let store = Arc::new(MemoryKvs::new());
    let mut scheduler = spawn_scheduler(store.clone(), false).await;
    let client = Client::connect(config_for(&scheduler, false), &LocalConnector::new(store))
        .await
        .unwrap();

    let err = client.call_dag("", args("1"), false).await.unwrap_err();
    assert_eq!(err.category(), "serialization");

    let future = client.call_dag("valid", args("1"), false).await.unwrap();
    future.get().await.unwrap();
    assert_eq!(scheduler.calls.recv().await.unwrap().name, "valid");
}

#[tokio::test]
async fn test_unreachable_scheduler() {
    let port = free_port();
    let mut config = ClientConfig::new("127.0.0.1").with_handshake_timeout(1_000);
    config.ports.connect = port;

    let err = Client::connect(config, &LocalConnector::new(Arc::new(MemoryKvs::new())))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}
