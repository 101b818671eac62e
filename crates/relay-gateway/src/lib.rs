//! Reusable TCP message gateway core.
//!
//! # Purpose
//! Accepts many client connections, parses length-prefixed frames, dispatches
//! them through a middleware chain to registered handlers, and enforces
//! admission and overload control so that misbehaving clients or bursts
//! cannot collapse the service.
//!
//! # Notes
//! Applications wire the pieces together (see the `gateway` service crate):
//! build a router, register routes and middleware, construct a codec with an
//! admission callback, and hand both to the server.
pub mod codec;
pub mod connection;
pub mod idle;
pub mod limits;
pub mod manager;
pub mod middleware;
pub mod overload;
pub mod router;
pub mod server;
pub mod worker;

pub use connection::Connection;
pub use manager::ConnectionManager;
pub use router::{MessageContext, MessageRouter};
pub use server::GatewayServer;
