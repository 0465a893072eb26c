//! Proposal lifecycle: signed transitions over `PENDING -> {ACCEPTED |
//! REJECTED | EXPIRED}`, `ACCEPTED -> {COMPLETED | DISPUTED | EXPIRED}`.
//! `spec.md` §3/§4.6.

use crate::crypto::signing_string;
use crate::error::RelayError;
use crate::types::{now_ms, AgentId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProposalState {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Disputed,
    Expired,
}

/// Signed 5-tuple offer. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub proposer: AgentId,
    pub recipient: AgentId,
    pub task: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payment_code: Option<String>,
    pub expires: Option<u64>,
    pub proposer_stake: Option<i64>,
    pub recipient_stake: Option<i64>,
    pub state: ProposalState,
    pub created_at_ms: u64,
    pub disputed_by: Option<AgentId>,
}

impl Proposal {
    pub fn amount_or_zero(&self) -> f64 {
        self.amount.unwrap_or(0.0)
    }

    pub fn is_party(&self, agent: &str) -> bool {
        self.proposer == agent || self.recipient == agent
    }

    pub fn counterparty(&self, agent: &str) -> Option<&str> {
        if self.proposer == agent {
            Some(&self.recipient)
        } else if self.recipient == agent {
            Some(&self.proposer)
        } else {
            None
        }
    }
}

/// Canonical signing strings per `spec.md` §4.1.
pub fn proposal_signing_string(to: &str, task: &str, amount: Option<f64>, currency: Option<&str>, payment_code: Option<&str>, expires: Option<u64>) -> String {
    signing_string(&[
        to,
        task,
        &amount.map(|a| a.to_string()).unwrap_or_default(),
        currency.unwrap_or(""),
        payment_code.unwrap_or(""),
        &expires.map(|e| e.to_string()).unwrap_or_default(),
    ])
}

pub fn accept_signing_string(proposal_id: &str, payment_code: Option<&str>) -> String {
    signing_string(&["ACCEPT", proposal_id, payment_code.unwrap_or("")])
}

pub fn reject_signing_string(proposal_id: &str) -> String {
    signing_string(&["REJECT", proposal_id])
}

pub fn complete_signing_string(proposal_id: &str, proof: Option<&str>) -> String {
    signing_string(&["COMPLETE", proposal_id, proof.unwrap_or("")])
}

pub fn dispute_signing_string(proposal_id: &str, reason: Option<&str>) -> String {
    signing_string(&["DISPUTE", proposal_id, reason.unwrap_or("")])
}

/// What the caller (the world actor) must do in response to a settled
/// transition: release or transfer escrow and adjust ratings.
pub enum SettlementKind {
    Complete,
    DisputeUnilateral { disputed_by: AgentId },
    None,
}

/// In-memory table of live and terminal proposals. `spec.md` §9: "message
/// sends with structured replies", realised here as a plain owned struct
/// the world actor holds and calls into directly — it is itself part of
/// the actor's single-threaded state.
#[derive(Debug, Default)]
pub struct ProposalBook {
    proposals: HashMap<String, Proposal>,
}

impl ProposalBook {
    pub fn new() -> Self {
        Self { proposals: HashMap::new() }
    }

    pub fn get(&self, proposal_id: &str) -> Option<&Proposal> {
        self.proposals.get(proposal_id)
    }

    pub fn create(&mut self, proposal_id: String, proposer: AgentId, recipient: AgentId, task: String, amount: Option<f64>, currency: Option<String>, payment_code: Option<String>, expires: Option<u64>) -> &Proposal {
        let proposal = Proposal {
            proposal_id: proposal_id.clone(),
            proposer,
            recipient,
            task,
            amount,
            currency,
            payment_code,
            expires,
            proposer_stake: None,
            recipient_stake: None,
            state: ProposalState::Pending,
            created_at_ms: now_ms(),
            disputed_by: None,
        };
        self.proposals.insert(proposal_id.clone(), proposal);
        self.proposals.get(&proposal_id).expect("just inserted")
    }

    /// `spec.md` §4.6: "only by recipient; proposal must be PENDING."
    pub fn accept(&mut self, proposal_id: &str, caller: &str, proposer_stake: Option<i64>, recipient_stake: Option<i64>) -> Result<&Proposal, RelayError> {
        let proposal = self.require(proposal_id)?;
        if proposal.recipient != caller {
            return Err(RelayError::AuthorizationFailure("only the recipient may accept".into(), "NOT_PROPOSAL_PARTY"));
        }
        if proposal.state != ProposalState::Pending {
            return Err(RelayError::StateConflict("proposal is not pending".into(), "PROPOSAL_EXPIRED"));
        }
        proposal.state = ProposalState::Accepted;
        proposal.proposer_stake = proposer_stake;
        proposal.recipient_stake = recipient_stake;
        Ok(proposal)
    }

    pub fn reject(&mut self, proposal_id: &str, caller: &str) -> Result<&Proposal, RelayError> {
        let proposal = self.require(proposal_id)?;
        if proposal.recipient != caller {
            return Err(RelayError::AuthorizationFailure("only the recipient may reject".into(), "NOT_PROPOSAL_PARTY"));
        }
        if proposal.state != ProposalState::Pending {
            return Err(RelayError::StateConflict("proposal is not pending".into(), "PROPOSAL_EXPIRED"));
        }
        proposal.state = ProposalState::Rejected;
        Ok(proposal)
    }

    pub fn complete(&mut self, proposal_id: &str, caller: &str) -> Result<&Proposal, RelayError> {
        let proposal = self.require(proposal_id)?;
        if !proposal.is_party(caller) {
            return Err(RelayError::AuthorizationFailure("not a party to this proposal".into(), "NOT_PROPOSAL_PARTY"));
        }
        if proposal.state != ProposalState::Accepted {
            return Err(RelayError::StateConflict("proposal is not accepted".into(), "PROPOSAL_EXPIRED"));
        }
        proposal.state = ProposalState::Completed;
        Ok(proposal)
    }

    pub fn dispute(&mut self, proposal_id: &str, caller: &str) -> Result<&Proposal, RelayError> {
        let proposal = self.require(proposal_id)?;
        if !proposal.is_party(caller) {
            return Err(RelayError::AuthorizationFailure("not a party to this proposal".into(), "NOT_PROPOSAL_PARTY"));
        }
        if proposal.state != ProposalState::Accepted {
            return Err(RelayError::StateConflict("proposal is not accepted".into(), "PROPOSAL_EXPIRED"));
        }
        proposal.state = ProposalState::Disputed;
        proposal.disputed_by = Some(caller.to_string());
        Ok(proposal)
    }

    /// `spec.md` §4.6: "if still PENDING or ACCEPTED, return escrowed
    /// stakes unchanged, advance to EXPIRED, notify both."
    pub fn expire(&mut self, proposal_id: &str) -> Option<&Proposal> {
        let proposal = self.proposals.get_mut(proposal_id)?;
        if matches!(proposal.state, ProposalState::Pending | ProposalState::Accepted) {
            proposal.state = ProposalState::Expired;
            Some(proposal)
        } else {
            None
        }
    }

    /// Proposals whose `expires` deadline has passed and are still open.
    pub fn due_for_expiry(&self, now: u64) -> Vec<String> {
        self.proposals
            .values()
            .filter(|p| matches!(p.state, ProposalState::Pending | ProposalState::Accepted))
            .filter(|p| p.expires.map(|e| now >= e).unwrap_or(false))
            .map(|p| p.proposal_id.clone())
            .collect()
    }

    fn require(&mut self, proposal_id: &str) -> Result<&mut Proposal, RelayError> {
        self.proposals
            .get_mut(proposal_id)
            .ok_or_else(|| RelayError::NotFound(format!("proposal {proposal_id} not found"), "AGENT_NOT_FOUND"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with_pending() -> (ProposalBook, String) {
        let mut book = ProposalBook::new();
        let id = "p1".to_string();
        book.create(id.clone(), "aaaa1111".into(), "bbbb2222".into(), "do the thing".into(), Some(10.0), Some("USD".into()), None, None);
        (book, id)
    }

    #[test]
    fn only_recipient_may_accept() {
        let (mut book, id) = book_with_pending();
        let err = book.accept(&id, "aaaa1111", None, None).unwrap_err();
        assert!(matches!(err, RelayError::AuthorizationFailure(_, _)));
    }

    #[test]
    fn full_happy_path_to_completion() {
        let (mut book, id) = book_with_pending();
        book.accept(&id, "bbbb2222", Some(5), Some(5)).unwrap();
        assert_eq!(book.get(&id).unwrap().state, ProposalState::Accepted);
        book.complete(&id, "aaaa1111").unwrap();
        assert_eq!(book.get(&id).unwrap().state, ProposalState::Completed);
    }

    #[test]
    fn cannot_accept_twice() {
        let (mut book, id) = book_with_pending();
        book.accept(&id, "bbbb2222", None, None).unwrap();
        let err = book.accept(&id, "bbbb2222", None, None).unwrap_err();
        assert!(matches!(err, RelayError::StateConflict(_, _)));
    }

    #[test]
    fn dispute_records_disputing_party() {
        let (mut book, id) = book_with_pending();
        book.accept(&id, "bbbb2222", None, None).unwrap();
        book.dispute(&id, "bbbb2222").unwrap();
        let proposal = book.get(&id).unwrap();
        assert_eq!(proposal.state, ProposalState::Disputed);
        assert_eq!(proposal.disputed_by.as_deref(), Some("bbbb2222"));
    }

    #[test]
    fn expiry_only_affects_open_states() {
        let (mut book, id) = book_with_pending();
        book.accept(&id, "bbbb2222", None, None).unwrap();
        book.complete(&id, "bbbb2222").unwrap();
        assert!(book.expire(&id).is_none());
    }
}
