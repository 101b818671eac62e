//! Admission control: per-source-IP caps and per-message-type caps.
mod ip;
mod message;

pub use ip::{IpLimitConfig, IpLimiter};
pub use message::{MessageLimiter, MsgLimitConfig, MsgLimitStats, MsgRejectReason};
