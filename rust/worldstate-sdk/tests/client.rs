mod common;

use async_trait::async_trait;
use common::*;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use worldstate_sdk::frame::PROTOCOL_VERSION;
use worldstate_sdk::{
    Client, ClientConfig, ClientError, MemoryIndexer, Query, Result, SubscriptionEvent, Transport,
    WireMessage,
};

/// Accepts everything and never answers.
struct Silent;

#[async_trait]
impl Transport for Silent {
    async fn send(&mut self, _message: WireMessage) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

/// Answers the handshake, then stays idle. Closing takes a while.
struct SlowClose {
    welcomed: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for SlowClose {
    async fn send(&mut self, _message: WireMessage) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        if !self.welcomed {
            self.welcomed = true;
            let welcome = format!(
                r#"{{"type":"welcome","protocol_version":{},"server":"slow"}}"#,
                PROTOCOL_VERSION
            );
            return Some(Ok(WireMessage::Text(welcome)));
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_client_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync + Clone>() {}
    assert_send_sync::<Client>();
}

#[tokio::test]
async fn test_handshake_reports_server() {
    let indexer = MemoryIndexer::new();
    let client = connect(&indexer).await;
    assert_eq!(client.server(), "memory-indexer");
    assert!(!client.is_closed());
    assert_eq!(indexer.session_count(), 1);
}

#[tokio::test]
async fn test_protocol_mismatch_is_a_connection_error() {
    let indexer = MemoryIndexer::with_protocol_version(99);
    let err = Client::from_transport(indexer.connect(), ClientConfig::default())
        .await
        .unwrap_err();
    match err {
        ClientError::Connection(message) => assert!(message.contains("mismatch")),
        other => panic!("expected a connection error, got {other:?}"),
    }
    eventually(|| indexer.session_count() == 0).await;
}

#[tokio::test]
async fn test_handshake_times_out() {
    let config = ClientConfig::default().with_handshake_timeout(Duration::from_millis(30));
    let err = Client::from_transport(Silent, config).await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(ref m) if m.contains("timed out")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_connection_error() {
    let err = Client::connect("ws://127.0.0.1:1", 1024).await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
}

#[tokio::test]
async fn test_concurrent_executes_share_one_connection() {
    let indexer = seeded(9);
    let client = connect(&indexer).await;

    let handles: Vec<_> = (1..=9u32)
        .map(|limit| {
            let client = client.clone();
            tokio::spawn(async move { client.execute(&Query::new().with_limit(limit)).await })
        })
        .collect();
    for (limit, handle) in (1..=9usize).zip(handles) {
        let page = handle.await.unwrap().unwrap();
        assert_eq!(page.items.len(), limit);
    }
    assert_eq!(indexer.session_count(), 1);
}

#[tokio::test]
async fn test_close_fails_in_flight_execute() {
    let indexer = seeded(4);
    let client = connect(&indexer).await;
    indexer.hold_queries();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.execute(&Query::new()).await })
    };
    eventually(|| indexer.queries_served() == 1).await;

    client.close().await;
    indexer.release_queries();

    let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::Connection(_))));
}

#[tokio::test]
async fn test_close_cancels_subscriptions() {
    let indexer = MemoryIndexer::new();
    let client = connect(&indexer).await;
    let mut sub = client.subscribe(None, []).await.unwrap();

    client.close().await;
    indexer.publish(position(WORLD_A, 1, 1, 0));

    assert_eq!(timeout(Duration::from_secs(2), sub.next()).await.unwrap(), None);
    assert!(!sub.is_active());
    eventually(|| indexer.session_count() == 0).await;
}

#[tokio::test]
async fn test_every_call_fails_after_close() {
    let indexer = seeded(2);
    let client = connect(&indexer).await;
    let other = client.clone();

    client.close().await;
    client.close().await;
    assert!(other.is_closed());

    assert_eq!(
        other.execute(&Query::new()).await.unwrap_err(),
        ClientError::Connection("client closed".to_string())
    );
    assert!(matches!(
        other.subscribe(None, []).await,
        Err(ClientError::Connection(_))
    ));
    assert!(matches!(
        other.subscribe_with_callback(None, [], |_: SubscriptionEvent| {}).await,
        Err(ClientError::Connection(_))
    ));
    assert!(matches!(
        other.fetch_all(Query::new()).await,
        Err(ClientError::Connection(_))
    ));
}

#[tokio::test]
async fn test_local_validation_wins_over_closed_connection() {
    let indexer = seeded(1);
    let client = connect(&indexer).await;
    client.close().await;

    let err = client.execute(&Query::new().with_limit(0)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_zero_ping_interval_disables_keepalive() {
    let indexer = seeded(3);
    let client = connect_with(&indexer, ClientConfig::default().with_ping_interval(Duration::ZERO)).await;
    let mut sub = client.subscribe(None, []).await.unwrap();

    let page = client.execute(&Query::new()).await.unwrap();
    assert_eq!(page.items.len(), 3);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!client.is_closed());

    indexer.disconnect_all();
    match timeout(Duration::from_secs(2), sub.next()).await.unwrap() {
        Some(SubscriptionEvent::Error(err)) => assert!(err.is_retryable()),
        other => panic!("expected an error, got {other:?}"),
    }
    let err = client.execute(&Query::new()).await.unwrap_err();
    assert_eq!(err, ClientError::Connection("connection closed by server".to_string()));
}

#[tokio::test]
async fn test_concurrent_close_returns_after_teardown() {
    let closed = Arc::new(AtomicBool::new(false));
    let transport = SlowClose {
        welcomed: false,
        closed: closed.clone(),
    };
    let client = Client::from_transport(transport, ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.server(), "slow");
    let other = client.clone();

    tokio::join!(
        async {
            client.close().await;
            assert!(closed.load(Ordering::SeqCst));
        },
        async {
            other.close().await;
            assert!(closed.load(Ordering::SeqCst));
        },
    );
}
