// Core route set and the reserved message-type space.
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use relay_gateway::codec::send_frame;
use relay_gateway::{Connection, MessageRouter};

// Application message types.
pub const MSG_HEARTBEAT: u16 = 1;
pub const MSG_ECHO: u16 = 2;
pub const MSG_JSON_ECHO: u16 = 3;
pub const MSG_PROTO_PING: u16 = 4;

// Reserved rejection message types.
pub const MSG_REJECT_IP_CONN: u16 = 65000;
pub const MSG_REJECT_IP_QPS: u16 = 65001;
pub const MSG_REJECT_INFLIGHT: u16 = 65002;
pub const MSG_REJECT_MSG_RATE: u16 = 65003;

/// Protobuf ping payload for `MSG_PROTO_PING`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
}

type RouteHandler = Arc<
    dyn Fn(Arc<Connection>, Bytes) -> relay_gateway::router::BoxFuture<Result<()>> + Send + Sync,
>;

struct RouteEntry {
    msg_type: u16,
    name: &'static str,
    handler: RouteHandler,
}

/// Collects named routes before applying them to a router, so applications
/// can assemble route sets module by module.
#[derive(Default)]
pub struct RouteRegistry {
    entries: Vec<RouteEntry>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&mut self, msg_type: u16, name: &'static str, handler: F)
    where
        F: Fn(Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.entries.push(RouteEntry {
            msg_type,
            name,
            handler: Arc::new(move |conn, body| Box::pin(handler(conn, body))),
        });
    }

    pub fn apply_to(self, router: &MessageRouter) {
        for entry in self.entries {
            tracing::debug!(msg_type = entry.msg_type, name = entry.name, "route registered");
            let handler = entry.handler;
            router.register(entry.msg_type, move |conn, body| handler(conn, body));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Register the built-in routes: heartbeat, echo, JSON echo, proto ping.
pub fn register_core_routes(router: &MessageRouter) {
    let mut registry = RouteRegistry::new();

    // Heartbeat: refreshes the idle clock, no reply.
    registry.add(MSG_HEARTBEAT, "heartbeat", |_conn, _body| async { Ok(()) });

    registry.add(MSG_ECHO, "echo", |conn, body| async move {
        let mut reply = Vec::with_capacity(4 + body.len());
        reply.extend_from_slice(b"echo");
        reply.extend_from_slice(&body);
        send_frame(&conn, MSG_ECHO, &reply);
        Ok(())
    });

    registry.apply_to(router);

    // JSON echo: wraps the parsed document in an envelope.
    router.register_json(MSG_JSON_ECHO, |conn, value| async move {
        let reply = serde_json::to_vec(&serde_json::json!({ "echo": value }))?;
        send_frame(&conn, MSG_JSON_ECHO, &reply);
        Ok(())
    });

    // Proto ping: replies with the next sequence number.
    router.register_proto(MSG_PROTO_PING, |conn, ping: Ping| async move {
        let pong = Ping { seq: ping.seq + 1 };
        send_frame(&conn, MSG_PROTO_PING, &prost::Message::encode_to_vec(&pong));
        Ok(())
    });

    // Anything else is logged and dropped.
    router.set_default_handler(|_conn, msg_type, body| async move {
        tracing::warn!(msg_type, body_size = body.len(), "unknown message type");
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_collects_entries() {
        let mut registry = RouteRegistry::new();
        assert!(registry.is_empty());
        registry.add(10, "ten", |_conn, _body| async { Ok(()) });
        registry.add(11, "eleven", |_conn, _body| async { Ok(()) });
        assert_eq!(registry.len(), 2);
    }
}
