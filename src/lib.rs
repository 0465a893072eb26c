//! Swarmrelay: a real-time coordination relay for autonomous agents.
//! Channels and direct messages, signed proposal negotiation with
//! ELO-weighted reputation and escrow hooks, and a commit-reveal
//! seeded-panel court for disputes. See `DESIGN.md` for how each module
//! maps onto its grounding.

pub mod codec;
pub mod config;
pub mod court;
pub mod crypto;
pub mod error;
pub mod net;
pub mod persist;
pub mod proposal;
pub mod timers;
pub mod types;
pub mod world;
