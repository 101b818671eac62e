//! Message-type routing with an ordered middleware chain.
//!
//! Handlers declare one of three payload shapes: Raw bytes, JSON, or a
//! protobuf message (the concrete type is the factory, captured at
//! registration). Tables are built at startup and read-mostly afterwards.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use relay_metrics::MetricsRegistry;

use crate::connection::Connection;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type RawHandler =
    Arc<dyn Fn(Arc<Connection>, Bytes) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
type JsonHandler = Arc<
    dyn Fn(Arc<Connection>, serde_json::Value) -> BoxFuture<anyhow::Result<()>> + Send + Sync,
>;
type DefaultHandler =
    Arc<dyn Fn(Arc<Connection>, u16, Bytes) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Continuation handed to each middleware; not calling it drops the frame.
pub type Next = Box<dyn FnOnce(MessageContext) -> BoxFuture<()> + Send>;

/// Middleware observes or rewrites the context, then decides whether to
/// continue the chain.
pub type Middleware = Arc<dyn Fn(MessageContext, Next) -> BoxFuture<()> + Send + Sync>;

/// Mutable per-frame dispatch state threaded through the middleware chain.
pub struct MessageContext {
    pub conn: Arc<Connection>,
    pub msg_type: u16,
    pub body: Bytes,
    pub trace_id: String,
}

#[derive(Clone)]
enum HandlerKind {
    Raw(RawHandler),
    Json(JsonHandler),
    // Decode thunk produced by `register_proto`; the message type's
    // `Default` impl acts as the factory.
    Proto(RawHandler),
}

/// msg-type dispatch table plus the middleware chain.
pub struct MessageRouter {
    handlers: RwLock<HashMap<u16, HandlerKind>>,
    default_handler: RwLock<Option<DefaultHandler>>,
    middlewares: RwLock<Vec<Middleware>>,
    metrics: Arc<MetricsRegistry>,
}

impl MessageRouter {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            middlewares: RwLock::new(Vec::new()),
            metrics,
        })
    }

    /// Register a handler that receives the body as opaque bytes.
    pub fn register<F, Fut>(&self, msg_type: u16, handler: F)
    where
        F: Fn(Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: RawHandler = Arc::new(move |conn, body| Box::pin(handler(conn, body)));
        self.handlers
            .write()
            .expect("router handlers poisoned")
            .insert(msg_type, HandlerKind::Raw(handler));
    }

    /// Register a handler that receives the body parsed as JSON.
    pub fn register_json<F, Fut>(&self, msg_type: u16, handler: F)
    where
        F: Fn(Arc<Connection>, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: JsonHandler = Arc::new(move |conn, value| Box::pin(handler(conn, value)));
        self.handlers
            .write()
            .expect("router handlers poisoned")
            .insert(msg_type, HandlerKind::Json(handler));
    }

    /// Register a handler that receives a decoded protobuf message.
    pub fn register_proto<M, F, Fut>(&self, msg_type: u16, handler: F)
    where
        M: prost::Message + Default + 'static,
        F: Fn(Arc<Connection>, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let thunk: RawHandler = Arc::new(move |conn, body: Bytes| match M::decode(body) {
            Ok(message) => Box::pin(handler(conn, message)),
            Err(err) => {
                tracing::warn!(msg_type, error = %err, "proto payload parse failed, dropping frame");
                Box::pin(async { Ok(()) })
            }
        });
        self.handlers
            .write()
            .expect("router handlers poisoned")
            .insert(msg_type, HandlerKind::Proto(thunk));
    }

    /// Fallback for message types with no registered handler.
    pub fn set_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, u16, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: DefaultHandler =
            Arc::new(move |conn, msg_type, body| Box::pin(handler(conn, msg_type, body)));
        *self
            .default_handler
            .write()
            .expect("router default poisoned") = Some(handler);
    }

    /// Append a middleware. Dispatch order is registration order.
    pub fn use_middleware(&self, middleware: Middleware) {
        self.middlewares
            .write()
            .expect("router middlewares poisoned")
            .push(middleware);
    }

    /// Run one frame through the middleware chain and into its handler.
    pub fn on_message(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        msg_type: u16,
        body: Bytes,
    ) -> BoxFuture<()> {
        let ctx = MessageContext {
            trace_id: conn.trace_id(),
            conn,
            msg_type,
            body,
        };
        Arc::clone(self).dispatch_from(0, ctx)
    }

    fn dispatch_from(self: Arc<Self>, index: usize, ctx: MessageContext) -> BoxFuture<()> {
        Box::pin(async move {
            let middleware = {
                let middlewares = self.middlewares.read().expect("router middlewares poisoned");
                middlewares.get(index).cloned()
            };
            match middleware {
                Some(middleware) => {
                    let router = Arc::clone(&self);
                    let next: Next = Box::new(move |ctx| router.dispatch_from(index + 1, ctx));
                    middleware(ctx, next).await;
                }
                None => self.invoke_handler(ctx).await,
            }
        })
    }

    async fn invoke_handler(&self, ctx: MessageContext) {
        let entry = {
            let handlers = self.handlers.read().expect("router handlers poisoned");
            handlers.get(&ctx.msg_type).cloned()
        };
        let MessageContext {
            conn,
            msg_type,
            body,
            trace_id,
        } = ctx;
        let result = match entry {
            Some(HandlerKind::Raw(handler)) | Some(HandlerKind::Proto(handler)) => {
                handler(conn, body).await
            }
            Some(HandlerKind::Json(handler)) => match serde_json::from_slice(&body) {
                Ok(value) => handler(conn, value).await,
                Err(err) => {
                    tracing::warn!(msg_type, error = %err, "json payload parse failed, dropping frame");
                    return;
                }
            },
            None => {
                let default = self
                    .default_handler
                    .read()
                    .expect("router default poisoned")
                    .clone();
                match default {
                    Some(handler) => handler(conn, msg_type, body).await,
                    None => {
                        tracing::warn!(msg_type, body_size = body.len(), "unknown message type");
                        return;
                    }
                }
            }
        };
        if let Err(err) = result {
            self.metrics.total_errors.inc();
            tracing::error!(trace_id = %trace_id, msg_type, error = %err, "handler failed");
        }
    }
}
