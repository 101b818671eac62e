//! One TCP peer: read loop, coalescing write loop, and backpressure latch.
//!
//! The reader and writer are two tasks on the runtime; all cross-task state
//! is either atomic or owned by exactly one of the loops. A `watch` channel
//! carries the close signal and a `Notify` wakes the reader out of a
//! backpressure pause, so neither loop ever blocks the other.
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use relay_metrics::MetricsRegistry;
use relay_wire::{Buffer, BufferPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};

// Read chunk the read loop guarantees before each read.
const READ_CHUNK: usize = 4096;
// Max buffers coalesced into one vectored write.
const MAX_WRITE_BATCH: usize = 16;

pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// A live TCP connection owned by the gateway.
///
/// `send` may be called from any task. The close path is idempotent: the
/// first caller wins, both loops observe the cancel signal and unwind, and
/// the close callback fires exactly once.
pub struct Connection {
    session_id: String,
    trace_id: Mutex<String>,
    remote_ip: String,
    max_send_buf: usize,
    high_watermark: usize,
    low_watermark: usize,
    send_queue_bytes: AtomicUsize,
    last_active_ms: AtomicU64,
    read_paused: AtomicBool,
    closing: AtomicBool,
    outgoing: mpsc::UnboundedSender<Bytes>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    resume: Notify,
    cancel: watch::Sender<bool>,
    socket: Mutex<Option<TcpStream>>,
    message_cb: OnceLock<MessageCallback>,
    close_cb: OnceLock<CloseCallback>,
    metrics: Arc<MetricsRegistry>,
    pool: Arc<BufferPool>,
}

impl Connection {
    pub fn new(
        socket: TcpStream,
        max_send_buf: usize,
        metrics: Arc<MetricsRegistry>,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        // Cache the peer address now so close-time reporting still works
        // after the socket is shut down.
        let remote_ip = socket
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        let conn = Arc::new(Self {
            trace_id: Mutex::new(session_id.clone()),
            session_id,
            remote_ip,
            max_send_buf,
            high_watermark: max_send_buf * 8 / 10,
            low_watermark: max_send_buf / 2,
            send_queue_bytes: AtomicUsize::new(0),
            last_active_ms: AtomicU64::new(0),
            read_paused: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            outgoing,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            resume: Notify::new(),
            cancel,
            socket: Mutex::new(Some(socket)),
            message_cb: OnceLock::new(),
            close_cb: OnceLock::new(),
            metrics,
            pool,
        });
        conn.touch();
        conn
    }

    /// Install the frame-bytes callback. Must happen before `start`.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        let _ = self.message_cb.set(cb);
    }

    /// Install the close callback. Must happen before `start`.
    pub fn set_close_callback(&self, cb: CloseCallback) {
        let _ = self.close_cb.set(cb);
    }

    /// Spawn the read and write loops.
    pub fn start(self: &Arc<Self>) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let socket = self
            .socket
            .lock()
            .expect("connection socket poisoned")
            .take();
        let Some(socket) = socket else {
            return; // started twice
        };
        let (reader, writer) = socket.into_split();
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.read_loop(reader).await });
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.write_loop(writer).await });
    }

    /// Queue an encoded frame for sending. Any task may call this.
    ///
    /// Dropped silently while closing; dropped with an error log when it
    /// would push the send queue past `max_send_buf`.
    pub fn send(&self, message: Bytes) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let len = message.len();
        if self.max_send_buf > 0
            && self.send_queue_bytes.load(Ordering::Acquire) + len > self.max_send_buf
        {
            self.metrics.dropped_frames.inc();
            tracing::error!(
                session_id = %self.session_id,
                size = len,
                "send buffer overflow, dropping message"
            );
            return;
        }
        let queued = self.send_queue_bytes.fetch_add(len, Ordering::AcqRel) + len;
        self.metrics.send_queue_max_bytes.set_max(queued as i64);
        if self.outgoing.send(message).is_err() {
            // Writer already gone; close is in progress.
            self.send_queue_bytes.fetch_sub(len, Ordering::AcqRel);
            return;
        }
        if self.max_send_buf > 0
            && queued > self.high_watermark
            && !self.read_paused.swap(true, Ordering::AcqRel)
        {
            self.metrics.on_backpressure_enter();
            tracing::warn!(
                session_id = %self.session_id,
                queued,
                high = self.high_watermark,
                "send queue over high watermark, pausing read"
            );
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(self: &Arc<Self>) {
        self.handle_close();
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn send_queue_bytes(&self) -> usize {
        self.send_queue_bytes.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn trace_id(&self) -> String {
        self.trace_id.lock().expect("trace id poisoned").clone()
    }

    /// Override the trace ID (normally done by an auth or tracing middleware).
    pub fn set_trace_id(&self, trace_id: String) {
        *self.trace_id.lock().expect("trace id poisoned") = trace_id;
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Stamp the last-activity clock.
    pub fn touch(&self) {
        self.last_active_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut cancel = self.cancel.subscribe();
        let mut buf = self.pool.acquire(READ_CHUNK);
        loop {
            if self.closing.load(Ordering::Acquire) {
                break;
            }
            if self.read_paused.load(Ordering::Acquire) {
                // Parked until the write loop drains below the low watermark
                // or the connection is told to close.
                tokio::select! {
                    _ = self.resume.notified() => continue,
                    _ = cancel.changed() => break,
                }
            }
            buf.ensure_writable(READ_CHUNK);
            let read = tokio::select! {
                read = reader.read(buf.writable_mut()) => read,
                _ = cancel.changed() => break,
            };
            match read {
                Ok(0) => break, // peer closed
                Ok(n) => {
                    self.metrics.bytes_in.add(n as u64);
                    self.touch();
                    buf.advance_write(n);
                    if let Some(cb) = self.message_cb.get()
                        && buf.readable_bytes() > 0
                    {
                        cb(&self, &mut buf);
                    }
                }
                Err(err) if is_disconnect(&err) => break,
                Err(err) => {
                    tracing::error!(session_id = %self.session_id, error = %err, "read failed");
                    break;
                }
            }
        }
        // The pooled read buffer returns to the pool here.
        drop(buf);
        self.handle_close();
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        let mut rx = self
            .outgoing_rx
            .lock()
            .expect("connection outgoing poisoned")
            .take()
            .expect("write loop started twice");
        let mut cancel = self.cancel.subscribe();
        let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_WRITE_BATCH);
        loop {
            let first = tokio::select! {
                _ = cancel.changed() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            batch.clear();
            batch.push(first);
            // Coalesce whatever else is already queued, bounding the batch so
            // one slow peer cannot pin a huge vectored write.
            while batch.len() < MAX_WRITE_BATCH {
                match rx.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }
            let total: usize = batch.iter().map(Bytes::len).sum();
            let result = if batch.len() == 1 {
                writer.write_all(&batch[0]).await
            } else {
                write_all_vectored(&mut writer, &batch).await
            };
            if let Err(err) = result {
                if !is_disconnect(&err) {
                    tracing::info!(session_id = %self.session_id, error = %err, "write failed");
                }
                break;
            }
            self.send_queue_bytes.fetch_sub(total, Ordering::AcqRel);
            self.metrics.bytes_out.add(total as u64);
            self.maybe_resume_read();
        }
        let _ = writer.shutdown().await;
        self.handle_close();
    }

    fn maybe_resume_read(&self) {
        if self.read_paused.load(Ordering::Acquire)
            && self.send_queue_bytes.load(Ordering::Acquire) <= self.low_watermark
            && !self.closing.load(Ordering::Acquire)
            && self.read_paused.swap(false, Ordering::AcqRel)
        {
            self.resume.notify_one();
            self.metrics.on_backpressure_exit();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.read_paused.swap(false, Ordering::AcqRel) {
            self.resume.notify_one();
            self.metrics.on_backpressure_exit();
        }
        // Wake both loops; queued send buffers are dropped with the receiver.
        let _ = self.cancel.send(true);
        self.send_queue_bytes.store(0, Ordering::Release);
        if let Some(cb) = self.close_cb.get() {
            cb(self);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("remote_ip", &self.remote_ip)
            .field("send_queue_bytes", &self.send_queue_bytes())
            .field("read_paused", &self.is_read_paused())
            .field("closing", &self.is_closing())
            .finish()
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

async fn write_all_vectored(writer: &mut OwnedWriteHalf, batch: &[Bytes]) -> io::Result<()> {
    let mut slices: Vec<IoSlice<'_>> = batch.iter().map(|b| IoSlice::new(b)).collect();
    let mut remaining: &mut [IoSlice<'_>] = &mut slices;
    while !remaining.is_empty() {
        let written = writer.write_vectored(remaining).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        IoSlice::advance_slices(&mut remaining, written);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        Ok((server, client))
    }

    fn test_conn(socket: TcpStream, max_send_buf: usize) -> Arc<Connection> {
        Connection::new(
            socket,
            max_send_buf,
            MetricsRegistry::new(),
            BufferPool::new(16, 4096),
        )
    }

    #[tokio::test]
    async fn send_reaches_the_peer_in_order() -> Result<()> {
        let (server, mut client) = socket_pair().await?;
        let conn = test_conn(server, 1 << 20);
        conn.start();
        conn.send(Bytes::from_static(b"first "));
        conn.send(Bytes::from_static(b"second"));
        let mut out = vec![0u8; 12];
        client.read_exact(&mut out).await?;
        assert_eq!(&out, b"first second");
        Ok(())
    }

    #[tokio::test]
    async fn incoming_bytes_reach_the_message_callback() -> Result<()> {
        let (server, mut client) = socket_pair().await?;
        let conn = test_conn(server, 1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_message_callback(Arc::new(move |_, buf| {
            let data = buf.peek().to_vec();
            buf.retrieve(data.len());
            let _ = tx.send(data);
        }));
        conn.start();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"hello").await?;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("callback ran");
        assert_eq!(got, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn overflow_drops_the_whole_message() -> Result<()> {
        let (server, _client) = socket_pair().await?;
        let conn = test_conn(server, 8);
        // Not started: nothing drains the queue, so the cap is authoritative.
        conn.send(Bytes::from_static(b"12345678"));
        conn.send(Bytes::from_static(b"x"));
        assert_eq!(conn.send_queue_bytes(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn queue_over_high_watermark_pauses_read() -> Result<()> {
        let (server, _client) = socket_pair().await?;
        let conn = test_conn(server, 100);
        // 81 bytes > high watermark of 80; write loop not running.
        conn.send(Bytes::from(vec![0u8; 81]));
        assert!(conn.is_read_paused());
        Ok(())
    }

    #[tokio::test]
    async fn backpressure_clears_once_the_peer_drains() -> Result<()> {
        let (server, mut client) = socket_pair().await?;
        let conn = test_conn(server, 100);
        conn.start();
        // Past the high watermark of 80 while the peer reads nothing.
        conn.send(Bytes::from(vec![7u8; 90]));
        assert!(conn.is_read_paused());

        // Draining lets the write loop finish and fall under the low
        // watermark, which lifts the pause.
        let mut sink = vec![0u8; 90];
        client.read_exact(&mut sink).await?;
        for _ in 0..100 {
            if !conn.is_read_paused() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!conn.is_read_paused());
        assert_eq!(conn.send_queue_bytes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_callback_once() -> Result<()> {
        let (server, _client) = socket_pair().await?;
        let conn = test_conn(server, 1 << 20);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        conn.set_close_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        conn.start();
        conn.close();
        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(conn.is_closing());
        Ok(())
    }

    #[tokio::test]
    async fn peer_disconnect_closes_the_connection() -> Result<()> {
        let (server, client) = socket_pair().await?;
        let conn = test_conn(server, 1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_close_callback(Arc::new(move |_| {
            let _ = tx.send(());
        }));
        conn.start();
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("close callback ran");
        Ok(())
    }
}
