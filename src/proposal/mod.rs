//! Proposal lifecycle and the reputation/escrow settlement it drives.

pub mod engine;
pub mod reputation;

pub use engine::{Proposal, ProposalBook, ProposalState, SettlementKind};
pub use reputation::{EscrowEvent, EscrowSink, RatingRecord, TracingEscrowSink};
