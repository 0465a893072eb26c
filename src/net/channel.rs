//! Channel bus: membership, broadcast, replay buffer, floor control, and
//! the idle prompter. `spec.md` §4.5.

use crate::types::{now_ms, AgentId, ChatMessage, FloorClaim};
use std::collections::{HashSet, VecDeque};

/// Outcome of a successful `JOIN`.
pub struct JoinOutcome {
    pub replay: Vec<ChatMessage>,
    pub members: Vec<AgentId>,
    /// Members present *before* this join, who should receive `AGENT_JOINED`.
    pub notify: Vec<AgentId>,
}

/// Outcome of posting a `RESPONDING_TO` floor claim.
pub enum FloorOutcome {
    /// This agent now (or still) holds the floor.
    Holding,
    /// This agent lost the floor to `winner`.
    Yield { winner: AgentId },
}

/// A named broadcast group. `spec.md` §3.
pub struct Channel {
    pub name: String,
    pub invite_only: bool,
    members: Vec<AgentId>,
    member_set: HashSet<AgentId>,
    invites: HashSet<AgentId>,
    buffer: VecDeque<ChatMessage>,
    buffer_capacity: usize,
    floor_claims: std::collections::HashMap<String, FloorClaim>,
    pub last_activity_ms: u64,
}

impl Channel {
    pub fn new(name: impl Into<String>, invite_only: bool, buffer_capacity: usize) -> Self {
        Self {
            name: name.into(),
            invite_only,
            members: Vec::new(),
            member_set: HashSet::new(),
            invites: HashSet::new(),
            buffer: VecDeque::with_capacity(buffer_capacity),
            buffer_capacity,
            floor_claims: std::collections::HashMap::new(),
            last_activity_ms: now_ms(),
        }
    }

    pub fn is_member(&self, agent: &str) -> bool {
        self.member_set.contains(agent)
    }

    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    pub fn is_invited(&self, agent: &str) -> bool {
        self.invites.contains(agent)
    }

    pub fn invite(&mut self, agent: AgentId) {
        self.invites.insert(agent);
    }

    /// Authorisation check for `JOIN`: public, or pre-invited.
    pub fn can_join(&self, agent: &str) -> bool {
        !self.invite_only || self.invites.contains(agent)
    }

    /// Admit `agent`; returns the replay snapshot and pre-join member list
    /// to notify. `spec.md` §4.5: "replay: send each buffered message ...
    /// finally broadcast AGENT_JOINED" and §8 invariant 2/ordering: replay
    /// is delivered before any live broadcast that begins after JOIN is
    /// acknowledged, and is a snapshot, not a live cursor (`spec.md` §9).
    pub fn join(&mut self, agent: AgentId) -> JoinOutcome {
        let notify = self.members.clone();
        if !self.member_set.contains(&agent) {
            self.members.push(agent.clone());
            self.member_set.insert(agent.clone());
        }
        JoinOutcome {
            replay: self.buffer.iter().cloned().collect(),
            members: self.members.clone(),
            notify,
        }
    }

    /// Remove `agent`, clearing any floor claims it held.
    pub fn leave(&mut self, agent: &str) -> bool {
        let was_member = self.member_set.remove(agent);
        if was_member {
            self.members.retain(|a| a != agent);
        }
        self.floor_claims.retain(|_, claim| claim.holder != agent);
        was_member
    }

    /// Append a broadcast message to the ring buffer, evicting the oldest
    /// on overflow. `spec.md` §3/§4.5.
    pub fn record(&mut self, msg: ChatMessage) {
        if self.buffer.len() >= self.buffer_capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(msg);
        self.last_activity_ms = now_ms();
    }

    /// All members other than `exclude`, for broadcast fan-out.
    pub fn other_members(&self, exclude: &str) -> Vec<AgentId> {
        self.members.iter().filter(|a| a.as_str() != exclude).cloned().collect()
    }

    // -------------------------------------------------------------------
    // Floor control. `spec.md` §4.5.
    // -------------------------------------------------------------------

    /// Process an incoming `RESPONDING_TO{msg_id, started_at}` from
    /// `claimant`. Tie-break: earlier `started_at` wins; ties broken by
    /// lexicographically smaller agent id. `spec.md` §8 invariant 7.
    pub fn claim_floor(&mut self, msg_id: &str, claimant: &AgentId, started_at: u64, ttl_secs: u64) -> FloorOutcome {
        self.expire_floor_claims(ttl_secs);

        let now = now_ms();
        match self.floor_claims.get(msg_id) {
            Some(existing) => {
                let claimant_wins = (started_at, claimant) < (existing.started_at, &existing.holder);
                if claimant_wins {
                    let winner = claimant.clone();
                    self.floor_claims.insert(
                        msg_id.to_string(),
                        FloorClaim {
                            msg_id: msg_id.to_string(),
                            holder: winner.clone(),
                            started_at,
                            claimed_at_ms: now,
                        },
                    );
                    FloorOutcome::Holding
                } else {
                    FloorOutcome::Yield { winner: existing.holder.clone() }
                }
            }
            None => {
                self.floor_claims.insert(
                    msg_id.to_string(),
                    FloorClaim {
                        msg_id: msg_id.to_string(),
                        holder: claimant.clone(),
                        started_at,
                        claimed_at_ms: now,
                    },
                );
                FloorOutcome::Holding
            }
        }
    }

    /// Clear every claim held by `holder` — called when that agent sends a
    /// `MSG` to this channel. `spec.md` §4.5.
    pub fn clear_claims_by(&mut self, holder: &str) {
        self.floor_claims.retain(|_, claim| claim.holder != holder);
    }

    fn expire_floor_claims(&mut self, ttl_secs: u64) {
        let now = now_ms();
        let ttl_ms = ttl_secs.saturating_mul(1000);
        self.floor_claims.retain(|_, claim| now.saturating_sub(claim.claimed_at_ms) < ttl_ms);
    }

    pub fn floor_claim_count(&self) -> usize {
        self.floor_claims.len()
    }

    pub fn is_idle(&self, threshold_secs: u64) -> bool {
        self.members.len() >= 2 && now_ms().saturating_sub(self.last_activity_ms) >= threshold_secs * 1000
    }

    pub fn mark_activity(&mut self) {
        self.last_activity_ms = now_ms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            msg_id: id.to_string(),
            from: "aaaa1111".to_string(),
            from_name: None,
            to: "#general".to_string(),
            content: content.to_string(),
            ts: now_ms(),
            replay: false,
        }
    }

    #[test]
    fn replay_buffer_holds_last_n_in_order() {
        let mut channel = Channel::new("#general", false, 3);
        channel.record(msg("1", "hello"));
        channel.record(msg("2", "world"));
        channel.record(msg("3", "again"));
        channel.record(msg("4", "evicts-first"));

        let outcome = channel.join("cccc3333".to_string());
        let contents: Vec<&str> = outcome.replay.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["world", "again", "evicts-first"]);
    }

    #[test]
    fn seed_scenario_replay_correctness() {
        // spec.md §8 seed scenario 1.
        let mut channel = Channel::new("#general", false, 3);
        channel.record(msg("1", "hello"));
        channel.record(msg("2", "world"));
        channel.record(msg("3", "again"));

        let outcome = channel.join("cccc3333".to_string());
        let contents: Vec<&str> = outcome.replay.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "world", "again"]);
        assert!(outcome.notify.is_empty() || !outcome.notify.contains(&"cccc3333".to_string()));
    }

    #[test]
    fn invite_only_requires_prior_invite() {
        let mut channel = Channel::new("#private", true, 20);
        assert!(!channel.can_join("aaaa1111"));
        channel.invite("aaaa1111".to_string());
        assert!(channel.can_join("aaaa1111"));
    }

    #[test]
    fn floor_control_tie_break_by_earlier_start() {
        // spec.md §8 seed scenario 2.
        let mut channel = Channel::new("#dev", false, 20);
        let first = channel.claim_floor("m42", &"aaaa1111".to_string(), 1000, 45);
        assert!(matches!(first, FloorOutcome::Holding));

        let second = channel.claim_floor("m42", &"bbbb2222".to_string(), 1005, 45);
        match second {
            FloorOutcome::Yield { winner } => assert_eq!(winner, "aaaa1111"),
            FloorOutcome::Holding => panic!("expected yield"),
        }
    }

    #[test]
    fn floor_control_tie_break_by_lexicographic_id_on_equal_timestamps() {
        let mut channel = Channel::new("#dev", false, 20);
        channel.claim_floor("m1", &"bbbb2222".to_string(), 1000, 45);
        let outcome = channel.claim_floor("m1", &"aaaa1111".to_string(), 1000, 45);
        assert!(matches!(outcome, FloorOutcome::Holding));
    }

    #[test]
    fn clear_claims_by_holder_releases_floor() {
        let mut channel = Channel::new("#dev", false, 20);
        channel.claim_floor("m1", &"aaaa1111".to_string(), 1000, 45);
        assert_eq!(channel.floor_claim_count(), 1);
        channel.clear_claims_by("aaaa1111");
        assert_eq!(channel.floor_claim_count(), 0);
    }

    #[test]
    fn leave_clears_held_claims() {
        let mut channel = Channel::new("#dev", false, 20);
        channel.join("aaaa1111".to_string());
        channel.claim_floor("m1", &"aaaa1111".to_string(), 1000, 45);
        channel.leave("aaaa1111");
        assert_eq!(channel.floor_claim_count(), 0);
    }
}
