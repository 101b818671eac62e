//! Graceful shutdown: stop accepting, drain, close everything, report
//! not-ready on the control plane.
mod common;

use std::time::Duration;

use anyhow::Result;
use gateway::routes::MSG_ECHO;
use relay_client::GatewayClient;
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

async fn http_get(addr: std::net::SocketAddr, path: &str) -> Result<String> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").as_bytes())
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test]
#[serial]
async fn graceful_shutdown_drains_and_closes() -> Result<()> {
    let gateway = common::start_gateway(common::test_config()?).await?;
    let addr = gateway.addr;
    let control_addr = gateway.control_addr;
    let metrics = std::sync::Arc::clone(&gateway.metrics);

    // A handful of live connections, each having served traffic.
    let mut clients = Vec::new();
    for _ in 0..8 {
        let mut client = GatewayClient::connect(addr).await?;
        client.send(MSG_ECHO, b"warm").await?;
        let reply = timeout(RECV_TIMEOUT, client.recv()).await??;
        assert!(reply.is_some());
        clients.push(client);
    }
    assert!(
        common::wait_for(RECV_TIMEOUT, || async {
            metrics.connections.value() == 8
        })
        .await
    );
    let ready = http_get(control_addr, "/ready").await?;
    assert!(ready.starts_with("HTTP/1.1 200"));

    gateway.shutdown().await;

    // The listener is gone: new connections are refused.
    assert!(GatewayClient::connect(addr).await.is_err());
    // Every tracked connection was closed and the gauge returned to zero.
    assert_eq!(metrics.connections.value(), 0);
    // Existing clients observe end-of-stream.
    for client in clients.iter_mut() {
        let eof = timeout(RECV_TIMEOUT, client.recv()).await?;
        assert!(matches!(eof, Ok(None) | Err(_)));
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn readiness_flips_false_once_shutdown_starts() -> Result<()> {
    let gateway = common::start_gateway(common::test_config()?).await?;
    let readiness = std::sync::Arc::clone(&gateway.readiness);
    assert!(readiness.is_ready());
    gateway.shutdown().await;
    assert!(!readiness.is_ready());
    Ok(())
}

#[tokio::test]
#[serial]
async fn shutdown_with_no_inflight_returns_quickly() -> Result<()> {
    let mut cfg = common::test_config()?;
    cfg.shutdown_grace_ms = 10_000;
    let gateway = common::start_gateway(cfg).await?;
    let _client = GatewayClient::connect(gateway.addr).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No frames in flight: the drain loop must end well before the 10s
    // grace window.
    let started = std::time::Instant::now();
    gateway.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}
