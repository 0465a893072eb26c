//! Transport-adjacent subsystems: rate limiting, connection admission, and
//! the channel bus.

pub mod channel;
pub mod connection;
pub mod rate_limit;

pub use channel::{Channel, FloorOutcome, JoinOutcome};
pub use connection::{Allowlist, BanList, ConnState, ConnectionRecord, PendingChallenge};
pub use rate_limit::{ConnectionRateLimits, PerIpLimiter};
