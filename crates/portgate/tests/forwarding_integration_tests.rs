//! End-to-end forwarding through an in-process agent

mod integration;

use anyhow::Result;
use integration::{
    allow, attach, echo_server, exchange, read_until_closed, wait_until, Gateway,
};
use portgate::PortgateError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_forward_round_trip() -> Result<()> {
    let echo = echo_server().await?;
    let gateway = Gateway::allowing(&[&echo.to_string()]).await?;
    let manager = &gateway.manager;

    let bound = manager.start_forward("127.0.0.1:0", &echo.to_string()).await?;
    assert_ne!(bound.port(), 0);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let reply = exchange(bound, &payload).await?;
    assert_eq!(reply, payload);

    // The agent counts payload in both directions
    let metrics = gateway.agent_metrics.clone();
    wait_until("agent byte count", || {
        metrics.snapshot().total_bytes == 2 * payload.len() as u64
    })
    .await?;

    let snapshot = gateway.agent_metrics.snapshot();
    assert_eq!(snapshot.handshake_count, 1);
    assert_eq!(snapshot.connect_count, 1);
    assert_eq!(snapshot.denied_requests, 0);

    // The client counts the transport, overhead included
    let traffic = manager.metrics();
    assert!(traffic.bytes_sent > payload.len() as u64);
    assert!(traffic.bytes_received > payload.len() as u64);

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_forwards_are_independent() -> Result<()> {
    let echo = echo_server().await?;
    let gateway = Gateway::allowing(&[&echo.to_string()]).await?;
    let bound = gateway
        .manager
        .start_forward("127.0.0.1:0", &echo.to_string())
        .await?;

    let mut exchanges = Vec::new();
    for i in 0..8u8 {
        exchanges.push(tokio::spawn(async move {
            let payload = vec![i; 10_000 + i as usize];
            let reply = exchange(bound, &payload).await?;
            anyhow::ensure!(reply == payload, "forward {} corrupted", i);
            Ok(())
        }));
    }
    for exchange in exchanges {
        exchange.await??;
    }

    assert_eq!(gateway.agent_metrics.snapshot().connect_count, 8);
    Ok(())
}

#[tokio::test]
async fn test_denied_target_closes_local_connection() -> Result<()> {
    let echo = echo_server().await?;
    let gateway = Gateway::allowing(&["10.0.0.5:80", &echo.to_string()]).await?;
    let manager = &gateway.manager;

    let denied = manager.start_forward("127.0.0.1:0", "10.0.0.5:81").await?;
    let mut conn = TcpStream::connect(denied).await?;
    let received = read_until_closed(&mut conn).await?;
    assert!(received.is_empty());

    let metrics = gateway.agent_metrics.clone();
    wait_until("denial count", || metrics.snapshot().denied_requests == 1).await?;
    assert_eq!(gateway.agent_metrics.snapshot().connect_errors, 0);

    // The session and other forwards are unaffected
    assert!(manager.status());
    let allowed = manager.start_forward("127.0.0.1:0", &echo.to_string()).await?;
    assert_eq!(exchange(allowed, b"still here").await?, b"still here");
    Ok(())
}

#[tokio::test]
async fn test_unreachable_target_counts_connect_error() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let gone = listener.local_addr()?.to_string();
    drop(listener);

    let gateway = Gateway::allowing(&[&gone]).await?;
    let bound = gateway.manager.start_forward("127.0.0.1:0", &gone).await?;

    let mut conn = TcpStream::connect(bound).await?;
    assert!(read_until_closed(&mut conn).await?.is_empty());

    let metrics = gateway.agent_metrics.clone();
    wait_until("connect error count", || metrics.snapshot().connect_errors == 1).await?;
    assert_eq!(gateway.agent_metrics.snapshot().denied_requests, 0);
    assert_eq!(gateway.agent_metrics.snapshot().total_bytes, 0);
    Ok(())
}

#[tokio::test]
async fn test_explicit_address_registered_once() -> Result<()> {
    let gateway = Gateway::allowing(&["10.0.0.5:80"]).await?;
    let manager = &gateway.manager;

    let bound = manager.start_forward("127.0.0.1:0", "10.0.0.5:80").await?;
    let err = manager
        .start_forward(&bound.to_string(), "10.0.0.5:80")
        .await
        .unwrap_err();
    assert!(matches!(err, PortgateError::AlreadyInUse(_)));
    assert_eq!(manager.forwards().len(), 1);

    // The original registration is untouched
    assert_eq!(manager.forwards()[0].local_addr, bound);
    assert_eq!(manager.forwards()[0].target, "10.0.0.5:80");
    Ok(())
}

#[tokio::test]
async fn test_stop_forward() -> Result<()> {
    let echo = echo_server().await?;
    let gateway = Gateway::allowing(&[&echo.to_string()]).await?;
    let manager = &gateway.manager;

    assert!(!manager.stop_forward("127.0.0.1:1").await);

    let bound = manager.start_forward("127.0.0.1:0", &echo.to_string()).await?;
    assert!(manager.stop_forward(&bound.to_string()).await);
    assert!(manager.forwards().is_empty());
    assert!(TcpStream::connect(bound).await.is_err());
    assert!(!manager.stop_forward(&bound.to_string()).await);

    // The same address can be forwarded again
    let again = manager
        .start_forward(&bound.to_string(), &echo.to_string())
        .await?;
    assert_eq!(again, bound);
    assert_eq!(exchange(again, b"ping").await?, b"ping");
    Ok(())
}

#[tokio::test]
async fn test_stream_limit_rejects_excess_forward() -> Result<()> {
    let echo = echo_server().await?;
    let mut config = allow(&[&echo.to_string()]);
    config.max_streams = 1;
    let gateway = Gateway::start(config).await?;
    let metrics = gateway.agent_metrics.clone();
    wait_until("handshake slot release", || metrics.snapshot().active_streams == 0).await?;

    let bound = gateway
        .manager
        .start_forward("127.0.0.1:0", &echo.to_string())
        .await?;

    // The first forward holds the only slot
    let mut first = TcpStream::connect(bound).await?;
    first.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    first.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");
    assert_eq!(metrics.snapshot().active_streams, 1);

    // The second is shed without being read
    let mut second = TcpStream::connect(bound).await?;
    assert!(read_until_closed(&mut second).await?.is_empty());
    assert_eq!(metrics.snapshot().denied_requests, 1);
    assert_eq!(metrics.snapshot().connect_count, 1);

    // Releasing the slot admits the next one
    first.shutdown().await?;
    read_until_closed(&mut first).await?;
    wait_until("slot release", || metrics.snapshot().active_streams == 0).await?;

    assert_eq!(exchange(bound, b"pong").await?, b"pong");
    assert_eq!(metrics.snapshot().connect_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_closes_everything() -> Result<()> {
    let gateway = Gateway::allowing(&["10.0.0.5:80", "10.0.0.6:80"]).await?;
    let manager = &gateway.manager;

    let first = manager.start_forward("127.0.0.1:0", "10.0.0.5:80").await?;
    let second = manager.start_forward("127.0.0.1:0", "10.0.0.6:80").await?;
    assert_eq!(manager.forwards().len(), 2);

    assert!(manager.disconnect().await);
    assert!(!manager.status());
    assert!(manager.forwards().is_empty());
    assert!(TcpStream::connect(first).await.is_err());
    assert!(TcpStream::connect(second).await.is_err());

    // Idempotent
    assert!(manager.disconnect().await);
    assert!(manager.forwards().is_empty());

    // The agent sees its session end
    tokio::time::timeout(Duration::from_secs(10), gateway.agent).await??;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_replaces_session_and_resets_counters() -> Result<()> {
    let echo = echo_server().await?;
    let gateway = Gateway::allowing(&[&echo.to_string()]).await?;
    let manager = &gateway.manager;

    let bound = manager.start_forward("127.0.0.1:0", &echo.to_string()).await?;
    exchange(bound, &[7u8; 50_000]).await?;
    assert!(manager.metrics().bytes_sent > 50_000);

    // Connecting again tears down the old session and its listeners
    let (new_metrics, _agent) = attach(manager, allow(&["10.0.0.9:22"])).await?;
    assert!(manager.status());
    assert!(manager.forwards().is_empty());
    assert!(TcpStream::connect(bound).await.is_err());
    assert!(manager.metrics().bytes_sent < 50_000);
    assert_eq!(new_metrics.snapshot().handshake_count, 1);

    let allowed = manager.allowed_ports().await.unwrap_or_default();
    assert_eq!(allowed.len(), 1);
    assert_eq!(allowed[0].target, "10.0.0.9:22");

    tokio::time::timeout(Duration::from_secs(10), gateway.agent).await??;
    Ok(())
}

#[tokio::test]
async fn test_agent_loss_tears_down_forwards() -> Result<()> {
    let gateway = Gateway::allowing(&["10.0.0.5:80"]).await?;
    let manager = gateway.manager.clone();
    manager.start_forward("127.0.0.1:0", "10.0.0.5:80").await?;

    gateway.agent.abort();

    tokio::time::timeout(Duration::from_secs(10), manager.closed()).await?;
    let watched = manager.clone();
    wait_until("forward teardown", move || watched.forwards().is_empty()).await?;
    assert!(!manager.status());

    // Nothing left to tear down
    assert!(manager.disconnect().await);
    Ok(())
}
