//! Listen-accept loop and per-connection wiring.
//!
//! The server owns the listener, the connection manager, the idle reaper and
//! the periodic metrics report. Admission at accept time goes through the IP
//! limiter; everything per-frame happens behind the codec's frame callback.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use relay_metrics::MetricsRegistry;
use relay_wire::BufferPool;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::codec::FrameCodec;
use crate::connection::Connection;
use crate::idle;
use crate::limits::IpLimiter;
use crate::manager::ConnectionManager;

// Period of the one-line metrics report.
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    pub bind: SocketAddr,
    pub idle_timeout_ms: u64,
    pub max_send_buffer_bytes: usize,
}

/// The gateway's TCP front end.
pub struct GatewayServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    cfg: GatewayServerConfig,
    manager: Arc<ConnectionManager>,
    ip_limiter: Arc<IpLimiter>,
    codec: Arc<FrameCodec>,
    metrics: Arc<MetricsRegistry>,
    pool: Arc<BufferPool>,
    shutdown: watch::Sender<bool>,
}

impl GatewayServer {
    pub async fn bind(
        cfg: GatewayServerConfig,
        codec: Arc<FrameCodec>,
        manager: Arc<ConnectionManager>,
        ip_limiter: Arc<IpLimiter>,
        metrics: Arc<MetricsRegistry>,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(cfg.bind)
            .await
            .with_context(|| format!("bind gateway listener {}", cfg.bind))?;
        let local_addr = listener.local_addr().context("read gateway local address")?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            cfg,
            manager,
            ip_limiter,
            codec,
            metrics,
            pool,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.manager.len()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run the accept loop until `stop_accept` fires. Also drives the idle
    /// reaper and the periodic metrics report.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("gateway listener poisoned")
            .take()
            .context("gateway already served")?;
        let reaper = idle::spawn(
            Arc::clone(&self.manager),
            self.cfg.idle_timeout_ms,
            self.shutdown.subscribe(),
        );
        let reporter = spawn_metrics_report(Arc::clone(&self.metrics), self.shutdown.subscribe());

        let mut stop = self.shutdown.subscribe();
        tracing::info!(addr = %self.local_addr, "gateway listening");
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept_connection(stream, peer),
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
        // Dropping the listener here is what makes new connects fail fast
        // during the drain window.
        drop(listener);
        let _ = reaper.await;
        let _ = reporter.await;
        Ok(())
    }

    fn accept_connection(self: &Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let ip = peer.ip().to_string();
        if !self.ip_limiter.allow_conn(&ip) {
            self.metrics.inc_ip_reject_conn();
            tracing::warn!(%ip, "connection refused by ip limiter");
            // Dropping the stream closes it immediately.
            return;
        }
        let conn = Connection::new(
            stream,
            self.cfg.max_send_buffer_bytes,
            Arc::clone(&self.metrics),
            Arc::clone(&self.pool),
        );

        let codec = Arc::clone(&self.codec);
        conn.set_message_callback(Arc::new(move |conn, buf| codec.on_bytes(conn, buf)));

        let codec = Arc::clone(&self.codec);
        let manager = Arc::clone(&self.manager);
        let ip_limiter = Arc::clone(&self.ip_limiter);
        let metrics = Arc::clone(&self.metrics);
        conn.set_close_callback(Arc::new(move |conn| {
            codec.on_close(conn);
            manager.remove(conn);
            ip_limiter.on_conn_close(conn.remote_ip());
            metrics.connections.dec();
            tracing::info!(
                session_id = %conn.session_id(),
                ip = %conn.remote_ip(),
                "connection closed"
            );
        }));

        self.manager.add(&conn);
        self.metrics.connections.inc();
        tracing::info!(session_id = %conn.session_id(), %ip, "connection accepted");
        conn.start();
    }

    /// Stop accepting new connections. Existing connections keep running.
    pub fn stop_accept(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        self.manager.close_all();
    }
}

fn spawn_metrics_report(
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => metrics.log_snapshot(),
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::send_frame;
    use crate::limits::IpLimitConfig;
    use bytes::Bytes;
    use relay_client::GatewayClient;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn start_echo_server(ip_cfg: IpLimitConfig) -> Result<Arc<GatewayServer>> {
        let metrics = MetricsRegistry::new();
        let codec = FrameCodec::new(
            Arc::new(|conn, msg_type, body: Bytes| {
                send_frame(conn, msg_type, &body);
            }),
            0,
            Arc::clone(&metrics),
        );
        let server = GatewayServer::bind(
            GatewayServerConfig {
                bind: "127.0.0.1:0".parse()?,
                idle_timeout_ms: 60_000,
                max_send_buffer_bytes: 1 << 20,
            },
            codec,
            ConnectionManager::new(),
            IpLimiter::new(ip_cfg),
            metrics,
            BufferPool::new(16, 4096),
        )
        .await?;
        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.serve().await });
        Ok(server)
    }

    #[tokio::test]
    async fn accepts_and_echoes_frames() -> Result<()> {
        let server = start_echo_server(IpLimitConfig::default()).await?;
        let mut client = GatewayClient::connect(server.local_addr()).await?;
        client.send(2, b"ping").await?;
        let (msg_type, body) = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await??
            .expect("reply");
        assert_eq!(msg_type, 2);
        assert_eq!(body.as_ref(), b"ping");
        assert_eq!(server.connection_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn conn_limit_rejects_at_accept() -> Result<()> {
        let server = start_echo_server(IpLimitConfig {
            max_conn_per_ip: 1,
            max_qps_per_ip: 0,
            whitelist: HashSet::new(),
            state_ttl_sec: 0,
        })
        .await?;
        let mut first = GatewayClient::connect(server.local_addr()).await?;
        first.send(2, b"ok").await?;
        assert!(
            tokio::time::timeout(Duration::from_secs(2), first.recv())
                .await??
                .is_some()
        );

        // The second connection from the same IP is closed before serving.
        let mut second = GatewayClient::connect(server.local_addr()).await?;
        let eof = tokio::time::timeout(Duration::from_secs(2), second.recv()).await??;
        assert!(eof.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stop_accept_refuses_new_connections() -> Result<()> {
        let server = start_echo_server(IpLimitConfig::default()).await?;
        let addr = server.local_addr();
        let _existing = GatewayClient::connect(addr).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop_accept();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(GatewayClient::connect(addr).await.is_err());
        Ok(())
    }
}
