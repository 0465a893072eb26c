//! Court dispute state machine: commit-reveal filing through verdict.
//! `spec.md` §4.9.

use crate::codec::EvidenceItem;
use crate::crypto::{sha256, signing_string};
use crate::error::RelayError;
use crate::types::{now_ms, AgentId, MAX_EVIDENCE_ITEMS, MAX_STATEMENT_CHARS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputePhase {
    RevealPending,
    ArbiterResponse,
    Evidence,
    Deliberation,
    Resolved,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterStatus {
    Pending,
    Accepted,
    Declined,
    Voted,
    Forfeited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Disputant,
    Respondent,
    Mutual,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Disputant => "disputant",
            Verdict::Respondent => "respondent",
            Verdict::Mutual => "mutual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterSlot {
    pub agent: AgentId,
    pub status: ArbiterStatus,
    pub vote: Option<Verdict>,
    pub is_replacement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    pub items: Vec<EvidenceItem>,
    pub statement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: String,
    pub proposal_id: String,
    pub disputant: AgentId,
    pub respondent: AgentId,
    pub reason: String,
    pub commitment: String,
    pub disputant_nonce: Option<String>,
    pub server_nonce: String,
    pub seed: Option<[u8; 32]>,
    pub arbiters: Vec<ArbiterSlot>,
    pub evidence: HashMap<AgentId, EvidenceSubmission>,
    pub phase: DisputePhase,
    pub created_at_ms: u64,
    pub reveal_deadline_ms: u64,
    pub arbiter_response_deadline_ms: Option<u64>,
    pub evidence_deadline_ms: Option<u64>,
    pub vote_deadline_ms: Option<u64>,
    pub verdict: Option<Verdict>,
}

impl Dispute {
    pub fn is_party(&self, agent: &str) -> bool {
        self.disputant == agent || self.respondent == agent
    }

    pub fn is_arbiter(&self, agent: &str) -> bool {
        self.arbiters.iter().any(|slot| slot.agent == agent)
    }

    pub fn accepted_count(&self) -> usize {
        self.arbiters.iter().filter(|s| s.status == ArbiterStatus::Accepted || s.status == ArbiterStatus::Voted).count()
    }

    pub fn seed_hex(&self) -> Option<String> {
        self.seed.map(hex::encode)
    }
}

pub fn dispute_intent_signing_string(proposal_id: &str, reason: &str, commitment: &str) -> String {
    signing_string(&["DISPUTE_INTENT", proposal_id, reason, commitment])
}

pub fn dispute_reveal_signing_string(proposal_id: &str, nonce: &str) -> String {
    signing_string(&["DISPUTE_REVEAL", proposal_id, nonce])
}

/// `EVIDENCE|dispute_id|SHA-256(items)`, items canonicalised by
/// sorted-key JSON serialization before hashing.
pub fn evidence_signing_string(dispute_id: &str, items: &[EvidenceItem]) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(items)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let digest_hex = hex::encode(sha256(&bytes));
    Ok(signing_string(&["EVIDENCE", dispute_id, &digest_hex]))
}

pub fn arbiter_accept_signing_string(dispute_id: &str) -> String {
    signing_string(&["ARBITER_ACCEPT", dispute_id])
}

pub fn arbiter_decline_signing_string(dispute_id: &str, reason: &str) -> String {
    signing_string(&["ARBITER_DECLINE", dispute_id, reason])
}

pub fn vote_signing_string(dispute_id: &str, verdict: &str) -> String {
    signing_string(&["VOTE", dispute_id, verdict])
}

/// Tally arbiter votes: majority wins; a three-way tie (one vote each
/// across all three verdicts, or any other deadlock) is `mutual`.
/// `spec.md` §4.9.
pub fn tally_votes(votes: &[Verdict]) -> Verdict {
    let mut disputant = 0;
    let mut respondent = 0;
    let mut mutual = 0;
    for v in votes {
        match v {
            Verdict::Disputant => disputant += 1,
            Verdict::Respondent => respondent += 1,
            Verdict::Mutual => mutual += 1,
        }
    }
    if disputant > respondent && disputant > mutual {
        Verdict::Disputant
    } else if respondent > disputant && respondent > mutual {
        Verdict::Respondent
    } else {
        Verdict::Mutual
    }
}

/// In-memory table of live and resolved disputes.
#[derive(Debug, Default)]
pub struct DisputeBook {
    disputes: HashMap<String, Dispute>,
}

impl DisputeBook {
    pub fn new() -> Self {
        Self { disputes: HashMap::new() }
    }

    pub fn get(&self, dispute_id: &str) -> Option<&Dispute> {
        self.disputes.get(dispute_id)
    }

    pub fn has_open_dispute_for_proposal(&self, proposal_id: &str) -> bool {
        self.disputes.values().any(|d| d.proposal_id == proposal_id && d.phase != DisputePhase::Resolved && d.phase != DisputePhase::Fallback)
    }

    pub fn file_intent(&mut self, dispute_id: String, proposal_id: String, disputant: AgentId, respondent: AgentId, reason: String, commitment: String, server_nonce: String, reveal_ttl_secs: u64) -> &Dispute {
        let now = now_ms();
        let dispute = Dispute {
            dispute_id: dispute_id.clone(),
            proposal_id,
            disputant,
            respondent,
            reason,
            commitment,
            disputant_nonce: None,
            server_nonce,
            seed: None,
            arbiters: Vec::new(),
            evidence: HashMap::new(),
            phase: DisputePhase::RevealPending,
            created_at_ms: now,
            reveal_deadline_ms: now + reveal_ttl_secs.saturating_mul(1000),
            arbiter_response_deadline_ms: None,
            evidence_deadline_ms: None,
            vote_deadline_ms: None,
            verdict: None,
        };
        self.disputes.insert(dispute_id.clone(), dispute);
        self.disputes.get(&dispute_id).expect("just inserted")
    }

    /// `spec.md` §4.9: commitment = SHA-256(nonce); mismatch leaves phase
    /// unchanged and fails with `DisputeCommitmentMismatch`-flavoured
    /// `InvariantViolation`.
    pub fn reveal(&mut self, dispute_id: &str, nonce: &str) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        if dispute.phase != DisputePhase::RevealPending {
            return Err(RelayError::StateConflict("dispute is not awaiting reveal".into(), "DISPUTE_INVALID_PHASE"));
        }
        let expected = hex::encode(sha256(nonce.as_bytes()));
        if expected != dispute.commitment {
            return Err(RelayError::InvariantViolation("reveal nonce does not match commitment".into(), "DISPUTE_COMMITMENT_MISMATCH"));
        }
        let seed = crate::court::panel::selection_seed(&dispute.proposal_id, nonce, &dispute.server_nonce);
        dispute.disputant_nonce = Some(nonce.to_string());
        dispute.seed = Some(seed);
        Ok(dispute)
    }

    /// Form the arbiter panel after a successful reveal. `eligible <3`
    /// means the caller should route straight to `mark_fallback` instead.
    pub fn form_panel(&mut self, dispute_id: &str, arbiters: Vec<AgentId>, response_ttl_secs: u64) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        dispute.arbiters = arbiters
            .into_iter()
            .map(|agent| ArbiterSlot { agent, status: ArbiterStatus::Pending, vote: None, is_replacement: false })
            .collect();
        dispute.phase = DisputePhase::ArbiterResponse;
        dispute.arbiter_response_deadline_ms = Some(now_ms() + response_ttl_secs.saturating_mul(1000));
        Ok(dispute)
    }

    pub fn mark_fallback(&mut self, dispute_id: &str) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        dispute.phase = DisputePhase::Fallback;
        Ok(dispute)
    }

    /// Returns `true` once all three slots have accepted (caller should
    /// advance to the evidence phase).
    pub fn arbiter_accept(&mut self, dispute_id: &str, agent: &str, evidence_ttl_secs: u64) -> Result<bool, RelayError> {
        let dispute = self.require(dispute_id)?;
        if dispute.phase != DisputePhase::ArbiterResponse {
            return Err(RelayError::StateConflict("dispute is not awaiting arbiter response".into(), "DISPUTE_INVALID_PHASE"));
        }
        let slot = dispute
            .arbiters
            .iter_mut()
            .find(|s| s.agent == agent)
            .ok_or_else(|| RelayError::AuthorizationFailure("not an assigned arbiter".into(), "DISPUTE_NOT_ARBITER"))?;
        slot.status = ArbiterStatus::Accepted;
        let all_accepted = dispute.arbiters.len() == 3 && dispute.arbiters.iter().all(|s| s.status == ArbiterStatus::Accepted);
        if all_accepted {
            dispute.phase = DisputePhase::Evidence;
            dispute.evidence_deadline_ms = Some(now_ms() + evidence_ttl_secs.saturating_mul(1000));
        }
        Ok(all_accepted)
    }

    /// Marks the slot declined; the caller is responsible for finding and
    /// installing a replacement via [`Self::replace_arbiter`].
    pub fn arbiter_decline(&mut self, dispute_id: &str, agent: &str) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        if dispute.phase != DisputePhase::ArbiterResponse {
            return Err(RelayError::StateConflict("dispute is not awaiting arbiter response".into(), "DISPUTE_INVALID_PHASE"));
        }
        let slot = dispute
            .arbiters
            .iter_mut()
            .find(|s| s.agent == agent)
            .ok_or_else(|| RelayError::AuthorizationFailure("not an assigned arbiter".into(), "DISPUTE_NOT_ARBITER"))?;
        slot.status = ArbiterStatus::Declined;
        Ok(dispute)
    }

    pub fn replace_arbiter(&mut self, dispute_id: &str, declined_agent: &str, replacement: AgentId) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        let slot = dispute
            .arbiters
            .iter_mut()
            .find(|s| s.agent == declined_agent && s.status == ArbiterStatus::Declined)
            .ok_or_else(|| RelayError::StateConflict("no declined slot to replace".into(), "DISPUTE_INVALID_PHASE"))?;
        slot.agent = replacement;
        slot.status = ArbiterStatus::Pending;
        slot.is_replacement = true;
        Ok(dispute)
    }

    /// Deadline fired on `arbiter_response`: forfeit non-responders, then
    /// either proceed (>= 3 accepted) or fall back. Returns `true` if
    /// evidence phase was entered.
    pub fn expire_arbiter_response(&mut self, dispute_id: &str, evidence_ttl_secs: u64) -> Result<bool, RelayError> {
        let dispute = self.require(dispute_id)?;
        for slot in dispute.arbiters.iter_mut() {
            if slot.status == ArbiterStatus::Pending {
                slot.status = ArbiterStatus::Forfeited;
            }
        }
        let accepted = dispute.arbiters.iter().filter(|s| s.status == ArbiterStatus::Accepted).count();
        if accepted >= 3 {
            dispute.phase = DisputePhase::Evidence;
            dispute.evidence_deadline_ms = Some(now_ms() + evidence_ttl_secs.saturating_mul(1000));
            Ok(true)
        } else {
            dispute.phase = DisputePhase::Fallback;
            Ok(false)
        }
    }

    /// Submit one party's evidence; returns `true` once both parties have
    /// submitted (caller should close the phase and fan out `CASE_READY`).
    pub fn submit_evidence(&mut self, dispute_id: &str, party: &str, items: Vec<EvidenceItem>, statement: String, vote_ttl_secs: u64) -> Result<bool, RelayError> {
        let dispute = self.require(dispute_id)?;
        if dispute.phase != DisputePhase::Evidence {
            return Err(RelayError::StateConflict("dispute is not accepting evidence".into(), "DISPUTE_INVALID_PHASE"));
        }
        if !dispute.is_party(party) {
            return Err(RelayError::AuthorizationFailure("not a party to this dispute".into(), "DISPUTE_NOT_PARTY"));
        }
        if items.len() > MAX_EVIDENCE_ITEMS {
            return Err(RelayError::ProtocolViolation("too many evidence items".into()));
        }
        if statement.chars().count() > MAX_STATEMENT_CHARS {
            return Err(RelayError::ProtocolViolation("evidence statement too long".into()));
        }
        dispute.evidence.insert(party.to_string(), EvidenceSubmission { items, statement });
        let both_submitted = dispute.evidence.contains_key(&dispute.disputant) && dispute.evidence.contains_key(&dispute.respondent);
        if both_submitted {
            dispute.phase = DisputePhase::Deliberation;
            dispute.vote_deadline_ms = Some(now_ms() + vote_ttl_secs.saturating_mul(1000));
        }
        Ok(both_submitted)
    }

    pub fn close_evidence_on_deadline(&mut self, dispute_id: &str, vote_ttl_secs: u64) -> Result<&Dispute, RelayError> {
        let dispute = self.require(dispute_id)?;
        dispute.phase = DisputePhase::Deliberation;
        dispute.vote_deadline_ms = Some(now_ms() + vote_ttl_secs.saturating_mul(1000));
        Ok(dispute)
    }

    /// Cast a vote; returns `Some(verdict)` once all three arbiters have
    /// voted and the case resolves.
    pub fn arbiter_vote(&mut self, dispute_id: &str, agent: &str, verdict: Verdict) -> Result<Option<Verdict>, RelayError> {
        let dispute = self.require(dispute_id)?;
        if dispute.phase != DisputePhase::Deliberation {
            return Err(RelayError::StateConflict("dispute is not in deliberation".into(), "DISPUTE_INVALID_PHASE"));
        }
        let slot = dispute
            .arbiters
            .iter_mut()
            .find(|s| s.agent == agent)
            .ok_or_else(|| RelayError::AuthorizationFailure("not an assigned arbiter".into(), "DISPUTE_NOT_ARBITER"))?;
        slot.status = ArbiterStatus::Voted;
        slot.vote = Some(verdict);

        let votes: Vec<Verdict> = dispute.arbiters.iter().filter_map(|s| s.vote).collect();
        if votes.len() == dispute.arbiters.iter().filter(|s| s.status != ArbiterStatus::Forfeited).count() {
            let final_verdict = tally_votes(&votes);
            dispute.verdict = Some(final_verdict);
            dispute.phase = DisputePhase::Resolved;
            Ok(Some(final_verdict))
        } else {
            Ok(None)
        }
    }

    /// Deadline fired on deliberation: forfeit non-voters, tally whoever
    /// voted.
    pub fn expire_deliberation(&mut self, dispute_id: &str) -> Result<Verdict, RelayError> {
        let dispute = self.require(dispute_id)?;
        for slot in dispute.arbiters.iter_mut() {
            if slot.status == ArbiterStatus::Accepted {
                slot.status = ArbiterStatus::Forfeited;
            }
        }
        let votes: Vec<Verdict> = dispute.arbiters.iter().filter_map(|s| s.vote).collect();
        let verdict = tally_votes(&votes);
        dispute.verdict = Some(verdict);
        dispute.phase = DisputePhase::Resolved;
        Ok(verdict)
    }

    fn require(&mut self, dispute_id: &str) -> Result<&mut Dispute, RelayError> {
        self.disputes
            .get_mut(dispute_id)
            .ok_or_else(|| RelayError::NotFound(format!("dispute {dispute_id} not found"), "DISPUTE_NOT_FOUND"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reveal_with_matching_nonce_succeeds() {
        let mut book = DisputeBook::new();
        let nonce = "a".repeat(64);
        let commitment = hex::encode(sha256(nonce.as_bytes()));
        book.file_intent("d1".into(), "p1".into(), "aaaa".into(), "bbbb".into(), "slow delivery".into(), commitment, "serverNonce".into(), 300);
        let dispute = book.reveal("d1", &nonce).unwrap();
        assert!(dispute.seed.is_some());
    }

    #[test]
    fn reveal_with_wrong_nonce_fails_and_leaves_phase_unchanged() {
        let mut book = DisputeBook::new();
        let nonce = "a".repeat(64);
        let commitment = hex::encode(sha256(nonce.as_bytes()));
        book.file_intent("d1".into(), "p1".into(), "aaaa".into(), "bbbb".into(), "slow delivery".into(), commitment, "serverNonce".into(), 300);
        let err = book.reveal("d1", &"b".repeat(64)).unwrap_err();
        assert!(matches!(err, RelayError::InvariantViolation(_, _)));
        assert_eq!(book.get("d1").unwrap().phase, DisputePhase::RevealPending);
    }

    #[test]
    fn three_accepts_advance_to_evidence() {
        let mut book = DisputeBook::new();
        let commitment = hex::encode(sha256(b"x"));
        book.file_intent("d1".into(), "p1".into(), "aaaa".into(), "bbbb".into(), "r".into(), commitment, "sn".into(), 300);
        book.form_panel("d1", vec!["c1".into(), "c2".into(), "c3".into()], 1800).unwrap();
        assert!(!book.arbiter_accept("d1", "c1", 3600).unwrap());
        assert!(!book.arbiter_accept("d1", "c2", 3600).unwrap());
        assert!(book.arbiter_accept("d1", "c3", 3600).unwrap());
        assert_eq!(book.get("d1").unwrap().phase, DisputePhase::Evidence);
    }

    #[test]
    fn tally_votes_tie_resolves_mutual() {
        let votes = vec![Verdict::Disputant, Verdict::Respondent, Verdict::Mutual];
        assert_eq!(tally_votes(&votes), Verdict::Mutual);
    }

    #[test]
    fn tally_votes_majority_wins() {
        let votes = vec![Verdict::Disputant, Verdict::Disputant, Verdict::Respondent];
        assert_eq!(tally_votes(&votes), Verdict::Disputant);
    }

    #[test]
    fn full_panel_to_verdict_flow() {
        let mut book = DisputeBook::new();
        let commitment = hex::encode(sha256(b"x"));
        book.file_intent("d1".into(), "p1".into(), "aaaa".into(), "bbbb".into(), "r".into(), commitment, "sn".into(), 300);
        book.form_panel("d1", vec!["c1".into(), "c2".into(), "c3".into()], 1800).unwrap();
        book.arbiter_accept("d1", "c1", 3600).unwrap();
        book.arbiter_accept("d1", "c2", 3600).unwrap();
        book.arbiter_accept("d1", "c3", 3600).unwrap();
        book.submit_evidence("d1", "aaaa", vec![], "statement".into(), 3600).unwrap();
        let closed = book.submit_evidence("d1", "bbbb", vec![], "statement".into(), 3600).unwrap();
        assert!(closed);
        assert!(book.arbiter_vote("d1", "c1", Verdict::Disputant).unwrap().is_none());
        assert!(book.arbiter_vote("d1", "c2", Verdict::Disputant).unwrap().is_none());
        let verdict = book.arbiter_vote("d1", "c3", Verdict::Respondent).unwrap();
        assert_eq!(verdict, Some(Verdict::Disputant));
        assert_eq!(book.get("d1").unwrap().phase, DisputePhase::Resolved);
    }
}
