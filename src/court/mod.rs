//! Commit-reveal, seeded-panel dispute resolution. `spec.md` §4.9.

pub mod dispute;
pub mod panel;

pub use dispute::{
    arbiter_accept_signing_string, arbiter_decline_signing_string, dispute_intent_signing_string,
    dispute_reveal_signing_string, evidence_signing_string, tally_votes, vote_signing_string, ArbiterSlot,
    ArbiterStatus, Dispute, DisputeBook, DisputePhase, EvidenceSubmission, Verdict,
};
pub use panel::{eligible_arbiters, select_panel, selection_seed, ArbiterCandidate};
