// Incremental frame extraction between the connection read loop and the
// dispatch gate. Partial frames stay buffered; a corrupt length prefix drains
// the connection's buffered bytes but keeps the connection alive.
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use relay_metrics::MetricsRegistry;
use relay_wire::{Buffer, decode_frame, encode_frame};

use crate::connection::Connection;

/// Invoked once per complete frame: `(connection, msg_type, body)`.
pub type FrameCallback = Arc<dyn Fn(&Arc<Connection>, u16, Bytes) + Send + Sync>;

/// Length-prefixed frame codec bound to a frame callback.
pub struct FrameCodec {
    frame_cb: FrameCallback,
    max_frame_bytes: usize,
    metrics: Arc<MetricsRegistry>,
}

impl FrameCodec {
    pub fn new(
        frame_cb: FrameCallback,
        max_frame_bytes: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            frame_cb,
            max_frame_bytes,
            metrics,
        })
    }

    /// Drain every complete frame currently buffered for `conn`.
    ///
    /// A panic escaping the frame callback is contained here: it counts as an
    /// error and parsing continues with the next frame.
    pub fn on_bytes(&self, conn: &Arc<Connection>, buf: &mut Buffer) {
        loop {
            match decode_frame(buf, self.max_frame_bytes) {
                Ok(Some(frame)) => {
                    let msg_type = frame.msg_type;
                    let body = frame.body;
                    let started = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        (self.frame_cb)(conn, msg_type, body);
                    }));
                    match outcome {
                        Ok(()) => self.metrics.total_frames.inc(),
                        Err(_) => {
                            self.metrics.total_errors.inc();
                            tracing::error!(
                                session_id = %conn.session_id(),
                                msg_type,
                                "frame callback panicked"
                            );
                        }
                    }
                    self.metrics
                        .frame_latency
                        .observe(started.elapsed().as_secs_f64() * 1000.0);
                }
                Ok(None) => break,
                Err(err) => {
                    self.metrics.total_errors.inc();
                    tracing::error!(
                        session_id = %conn.session_id(),
                        error = %err,
                        "invalid frame, discarding buffered bytes"
                    );
                    buf.clear();
                    break;
                }
            }
        }
    }

    /// Per-connection teardown hook. The read buffer itself is pooled and
    /// returns when the read loop unwinds.
    pub fn on_close(&self, conn: &Arc<Connection>) {
        tracing::debug!(session_id = %conn.session_id(), "codec released connection");
    }
}

/// Encode and enqueue one frame on the connection.
pub fn send_frame(conn: &Arc<Connection>, msg_type: u16, body: &[u8]) {
    match encode_frame(msg_type, body) {
        Ok(encoded) => conn.send(encoded),
        Err(err) => {
            tracing::error!(session_id = %conn.session_id(), error = %err, "frame encode failed");
        }
    }
}
