//! The relay's single logical event loop. `spec.md` §5 sanctions either a
//! cooperatively single-threaded design or "protecting the world with one
//! coarse-grained mutex / actor mailbox per subsystem" — this module takes
//! the latter, simpler reading: [`World`] is one plain struct, entered
//! exclusively through an `Arc<tokio::sync::Mutex<World>>` held by
//! `main.rs`'s accept loop, the per-connection read tasks, and the timer
//! task. Every public method runs to completion without an `.await`
//! point, so holding the lock for the duration of one method call is
//! exactly one "critical section" in `spec.md` §5's sense: cross-subsystem
//! calls (proposal completion touching reputation and escrow) execute
//! atomically because nothing else can observe the world mid-call.
//!
//! Grounded on the teacher's `ConnectionManager`, which held peer state
//! behind a single struct rather than splitting it across actors.

use crate::codec::{EvidenceItem, ProposalNotification, ServerMessage};
use crate::config::RelayConfig;
use crate::court::{self, ArbiterCandidate, ArbiterStatus, DisputeBook, Verdict};
use crate::crypto;
use crate::error::RelayError;
use crate::net::channel::{Channel, FloorOutcome};
use crate::net::connection::{Allowlist, BanList, ConnState, ConnectionRecord, PendingChallenge};
use crate::persist::RatingsTable;
use crate::proposal::{EscrowEvent, EscrowSink, Proposal, ProposalBook, ProposalState, TracingEscrowSink};
use crate::timers::{TimerEvent, TimerHandle};
use crate::types::{is_valid_channel_name, is_valid_nick, now_ms, Agent, AgentId, Presence};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

const DEFAULT_CHANNELS: [&str; 3] = ["#general", "#discovery", "#bounties"];

/// One connection's outbound half, as the world sees it.
struct Outbound {
    sender: UnboundedSender<ServerMessage>,
}

pub struct World {
    pub config: RelayConfig,
    agents: HashMap<AgentId, Agent>,
    connections: HashMap<u64, ConnectionRecord>,
    outbound: HashMap<u64, Outbound>,
    /// Live connection pointer per agent. `spec.md` §3 invariant: at most
    /// one live connection per Agent.
    agent_conn: HashMap<AgentId, u64>,
    channels: HashMap<String, Channel>,
    skills: HashMap<AgentId, Vec<String>>,
    proposals: ProposalBook,
    disputes: DisputeBook,
    ratings: RatingsTable,
    ban_list: BanList,
    allowlist: Allowlist,
    escrow_sink: Box<dyn EscrowSink>,
    timers: TimerHandle,
}

impl World {
    pub fn new(config: RelayConfig, ratings: RatingsTable, ban_list: BanList, allowlist: Allowlist, timers: TimerHandle) -> Self {
        let mut channels = HashMap::new();
        for name in DEFAULT_CHANNELS {
            channels.insert(name.to_string(), Channel::new(name, false, config.channel_buffer));
        }
        Self {
            config,
            agents: HashMap::new(),
            connections: HashMap::new(),
            outbound: HashMap::new(),
            agent_conn: HashMap::new(),
            channels,
            skills: HashMap::new(),
            proposals: ProposalBook::new(),
            disputes: DisputeBook::new(),
            ratings,
            ban_list,
            allowlist,
            escrow_sink: Box::new(TracingEscrowSink),
            timers,
        }
    }

    pub fn ratings(&self) -> &RatingsTable {
        &self.ratings
    }

    pub fn ban_list(&self) -> &BanList {
        &self.ban_list
    }

    // -------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------

    pub fn register_connection(&mut self, conn_id: u64, remote_addr: SocketAddr, sender: UnboundedSender<ServerMessage>) {
        self.connections.insert(conn_id, ConnectionRecord::new(conn_id, remote_addr));
        self.outbound.insert(conn_id, Outbound { sender });
    }

    pub fn connection_state(&self, conn_id: u64) -> Option<ConnState> {
        self.connections.get(&conn_id).map(|c| c.state)
    }

    pub fn agent_for_connection(&self, conn_id: u64) -> Option<AgentId> {
        self.connections.get(&conn_id).and_then(|c| c.agent_id.clone())
    }

    fn send(&self, conn_id: u64, msg: ServerMessage) {
        if let Some(out) = self.outbound.get(&conn_id) {
            let _ = out.sender.send(msg);
        }
    }

    fn send_to_agent(&self, agent_id: &str, msg: ServerMessage) {
        if let Some(conn_id) = self.agent_conn.get(agent_id) {
            self.send(*conn_id, msg);
        }
    }

    /// Public entry point for the transport layer to push a frame
    /// (errors, PONG, etc) directly to one connection.
    pub fn send_public(&self, conn_id: u64, msg: ServerMessage) {
        self.send(conn_id, msg);
    }

    /// `spec.md` §4.4 step 5: socket close cleanup.
    pub fn disconnect(&mut self, conn_id: u64) {
        self.outbound.remove(&conn_id);
        let Some(record) = self.connections.remove(&conn_id) else { return };
        let Some(agent_id) = record.agent_id else { return };

        if self.agent_conn.get(&agent_id) != Some(&conn_id) {
            // This connection was already displaced; its own cleanup
            // already ran under the displacing VERIFY_IDENTITY.
            return;
        }
        self.agent_conn.remove(&agent_id);

        if let Some(agent) = self.agents.remove(&agent_id) {
            for channel_name in agent.channels.iter() {
                if let Some(channel) = self.channels.get_mut(channel_name) {
                    channel.leave(&agent_id);
                }
            }
            for channel_name in agent.channels {
                self.broadcast_to_channel(&channel_name, ServerMessage::AgentLeft { channel: channel_name.clone(), agent: agent_id.clone() }, None);
            }
        }
    }

    // -------------------------------------------------------------------
    // Identity & admission. `spec.md` §4.1/§4.4.
    // -------------------------------------------------------------------

    pub fn identify_ephemeral(&mut self, conn_id: u64, nick: Option<String>) {
        let Some(record) = self.connections.get_mut(&conn_id) else { return };
        record.state = ConnState::Admitted;

        let id = crypto::random_alnum_id();
        let mut agent = Agent::new_ephemeral(id.clone());
        if let Some(nick) = nick {
            if is_valid_nick(&nick) {
                agent.nick = nick;
            }
        }
        record.agent_id = Some(id.clone());
        self.agent_conn.insert(id.clone(), conn_id);
        self.agents.insert(id.clone(), agent);
        self.send(conn_id, ServerMessage::Welcome { agent_id: id, verified: false });
    }

    pub fn identify_pubkey(&mut self, conn_id: u64, pubkey_hex: String, challenge_ttl_secs: u64) -> Result<(), RelayError> {
        if self.allowlist.is_enabled() && !self.allowlist.is_approved(&pubkey_hex) {
            return Err(RelayError::AuthorizationFailure("pubkey is not on the allowlist".into(), "VERIFICATION_REQUIRED"));
        }
        if let Ok(pubkey_bytes) = hex::decode(&pubkey_hex) {
            let stable_id = crypto::stable_id_for_pubkey(&pubkey_bytes);
            if self.ban_list.is_banned(&stable_id) {
                return Err(RelayError::AuthorizationFailure("agent is banned".into(), "VERIFICATION_REQUIRED"));
            }
        }
        let Some(record) = self.connections.get_mut(&conn_id) else {
            return Err(RelayError::NotFound("connection not found".into(), "AGENT_NOT_FOUND"));
        };
        let nonce = crypto::random_nonce();
        let challenge_id = crypto::random_alnum_id();
        let now = now_ms();
        let expires_at = now + challenge_ttl_secs.saturating_mul(1000);
        record.pending_challenge = Some(PendingChallenge {
            challenge_id: challenge_id.clone(),
            nonce,
            pubkey: pubkey_hex,
            issued_at_ms: now,
            expires_at_ms: expires_at,
        });
        record.state = ConnState::Challenged;
        self.send(conn_id, ServerMessage::Challenge { nonce: hex::encode(nonce), challenge_id, expires_at });
        Ok(())
    }

    /// `spec.md` §4.4 step 3: verify signature over `AGENTCHAT_AUTH|nonce|challenge_id|timestamp`.
    pub fn verify_identity(&mut self, conn_id: u64, challenge_id: &str, signature_hex: &str, timestamp: u64) -> Result<AgentId, RelayError> {
        let record = self.connections.get(&conn_id).ok_or_else(|| RelayError::NotFound("connection not found".into(), "AGENT_NOT_FOUND"))?;
        let challenge = record.pending_challenge.clone().ok_or_else(|| RelayError::StateConflict("no pending challenge".into(), "VERIFICATION_REQUIRED"))?;
        if challenge.challenge_id != challenge_id {
            return Err(RelayError::StateConflict("challenge id mismatch".into(), "VERIFICATION_REQUIRED"));
        }
        if challenge.is_expired(now_ms()) {
            self.send(conn_id, ServerMessage::VerificationExpired);
            return Err(RelayError::AuthFailure("challenge expired".into()));
        }

        let pubkey_bytes = hex::decode(&challenge.pubkey).map_err(|_| RelayError::AuthFailure("malformed pubkey".into()))?;
        let signature = hex::decode(signature_hex).map_err(|_| RelayError::AuthFailure("malformed signature".into()))?;
        let message = crypto::signing_string(&["AGENTCHAT_AUTH", &hex::encode(challenge.nonce), challenge_id, &timestamp.to_string()]);
        if crypto::verify(&pubkey_bytes, message.as_bytes(), &signature).is_err() {
            self.send(conn_id, ServerMessage::VerificationFailed);
            return Err(RelayError::AuthFailure("invalid signature".into()));
        }

        let stable_id = crypto::stable_id_for_pubkey(&pubkey_bytes);

        // Ban is persistent: unlike `admin_kick`, which only drops the
        // live connection, a banned agent must be refused admission on
        // every subsequent reconnect attempt. `spec.md` §4.8.
        if self.ban_list.is_banned(&stable_id) {
            return Err(RelayError::AuthorizationFailure("agent is banned".into(), "VERIFICATION_REQUIRED"));
        }

        // Identity takeover: a second successful verification displaces
        // the first connection. `spec.md` §4.4 step 3 / §8 seed scenario 6.
        if let Some(&prior_conn_id) = self.agent_conn.get(&stable_id) {
            if prior_conn_id != conn_id {
                self.send(prior_conn_id, ServerMessage::error("SESSION_DISPLACED", "another connection verified as this agent"));
                self.outbound.remove(&prior_conn_id);
                self.connections.remove(&prior_conn_id);
            }
        }

        let agent = self.agents.entry(stable_id.clone()).or_insert_with(|| Agent::new_verified(stable_id.clone(), challenge.pubkey.clone()));
        agent.verified = true;
        agent.pubkey = Some(challenge.pubkey.clone());
        self.agent_conn.insert(stable_id.clone(), conn_id);
        self.ratings.remember_pubkey(challenge.pubkey, stable_id.clone());

        if let Some(record) = self.connections.get_mut(&conn_id) {
            record.state = ConnState::Verified;
            record.agent_id = Some(stable_id.clone());
            record.pending_challenge = None;
        }

        self.send(conn_id, ServerMessage::Welcome { agent_id: stable_id.clone(), verified: true });
        Ok(stable_id)
    }

    // -------------------------------------------------------------------
    // Channel bus. `spec.md` §4.5.
    // -------------------------------------------------------------------

    pub fn join_channel(&mut self, agent_id: &str, channel_name: &str) -> Result<(), RelayError> {
        if !is_valid_channel_name(channel_name) {
            return Err(RelayError::ProtocolViolation("invalid channel name".into()));
        }
        let channel = self.channels.get_mut(channel_name).ok_or_else(|| RelayError::NotFound("channel not found".into(), "CHANNEL_NOT_FOUND"))?;
        if !channel.can_join(agent_id) {
            return Err(RelayError::AuthorizationFailure("not invited".into(), "NOT_INVITED"));
        }
        let outcome = channel.join(agent_id.to_string());
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.channels.insert(channel_name.to_string());
        }
        for msg in outcome.replay {
            self.send_to_agent(agent_id, ServerMessage::Msg(msg));
        }
        self.send_to_agent(agent_id, ServerMessage::Joined { channel: channel_name.to_string(), agents: outcome.members });
        for member in outcome.notify {
            self.send_to_agent(&member, ServerMessage::AgentJoined { channel: channel_name.to_string(), agent: agent_id.to_string() });
        }
        Ok(())
    }

    pub fn leave_channel(&mut self, agent_id: &str, channel_name: &str) {
        let Some(channel) = self.channels.get_mut(channel_name) else { return };
        if !channel.leave(agent_id) {
            return;
        }
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.channels.remove(channel_name);
        }
        self.broadcast_to_channel(channel_name, ServerMessage::AgentLeft { channel: channel_name.to_string(), agent: agent_id.to_string() }, None);
    }

    fn broadcast_to_channel(&self, channel_name: &str, msg: ServerMessage, exclude: Option<&str>) {
        let Some(channel) = self.channels.get(channel_name) else { return };
        for member in channel.members() {
            if Some(member.as_str()) == exclude {
                continue;
            }
            self.send_to_agent(member, msg.clone());
        }
    }

    /// `MSG` to `#channel` or `@agent`. `spec.md` §4.5.
    pub fn send_message(&mut self, from: &str, to: &str, content: &str, msg_id: Option<String>, max_content_chars: usize) -> Result<(), RelayError> {
        if content.chars().count() > max_content_chars {
            return Err(RelayError::ProtocolViolation("content too long".into()));
        }
        let msg_id = msg_id.unwrap_or_else(crypto::random_alnum_id);
        let from_name = self.agents.get(from).map(|a| a.nick.clone());

        if let Some(channel_name) = to.strip_prefix('#').map(|_| to) {
            let channel = self.channels.get(channel_name).ok_or_else(|| RelayError::NotFound("channel not found".into(), "CHANNEL_NOT_FOUND"))?;
            if !channel.is_member(from) {
                return Err(RelayError::AuthorizationFailure("not a channel member".into(), "NOT_INVITED"));
            }
            let stamped = crate::codec::stamp_chat_message(msg_id, from.to_string(), from_name, channel_name.to_string(), content.to_string());
            self.broadcast_to_channel(channel_name, ServerMessage::Msg(stamped.clone()), Some(from));
            if let Some(channel) = self.channels.get_mut(channel_name) {
                channel.record(stamped);
                channel.clear_claims_by(from);
            }
            Ok(())
        } else {
            let target = to.strip_prefix('@').unwrap_or(to);
            if !self.agents.contains_key(target) {
                return Err(RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"));
            }
            let stamped = crate::codec::stamp_chat_message(msg_id, from.to_string(), from_name, target.to_string(), content.to_string());
            self.send_to_agent(target, ServerMessage::Msg(stamped));
            Ok(())
        }
    }

    pub fn list_channels(&self, conn_id: u64) {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        self.send(conn_id, ServerMessage::Channels { channels: names });
    }

    pub fn list_agents(&self, conn_id: u64) {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        self.send(conn_id, ServerMessage::Agents { agents: names });
    }

    pub fn create_channel(&mut self, channel_name: &str, invite_only: bool) -> Result<(), RelayError> {
        if !is_valid_channel_name(channel_name) {
            return Err(RelayError::ProtocolViolation("invalid channel name".into()));
        }
        if self.channels.contains_key(channel_name) {
            return Err(RelayError::StateConflict("channel already exists".into(), "INVALID_MSG"));
        }
        self.channels.insert(channel_name.to_string(), Channel::new(channel_name, invite_only, self.config.channel_buffer));
        Ok(())
    }

    pub fn invite(&mut self, inviter: &str, channel_name: &str, invitee: AgentId) -> Result<(), RelayError> {
        let channel = self.channels.get_mut(channel_name).ok_or_else(|| RelayError::NotFound("channel not found".into(), "CHANNEL_NOT_FOUND"))?;
        if !channel.is_member(inviter) {
            return Err(RelayError::AuthorizationFailure("only a member may invite".into(), "NOT_INVITED"));
        }
        channel.invite(invitee);
        Ok(())
    }

    pub fn set_nick(&mut self, agent_id: &str, nick: String) -> Result<(), RelayError> {
        if !is_valid_nick(&nick) {
            return Err(RelayError::ProtocolViolation("invalid nick".into()));
        }
        let agent = self.agents.get_mut(agent_id).ok_or_else(|| RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"))?;
        agent.nick = nick;
        Ok(())
    }

    pub fn parse_presence(s: &str) -> Result<Presence, RelayError> {
        match s {
            "online" => Ok(Presence::Online),
            "away" => Ok(Presence::Away),
            "busy" => Ok(Presence::Busy),
            "offline" => Ok(Presence::Offline),
            "listening" => Ok(Presence::Listening),
            other => Err(RelayError::ProtocolViolation(format!("unknown presence {other}"))),
        }
    }

    pub fn set_presence(&mut self, agent_id: &str, presence: Presence) -> Result<(), RelayError> {
        let agent = self.agents.get_mut(agent_id).ok_or_else(|| RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"))?;
        agent.presence = presence;
        let channels: Vec<String> = agent.channels.iter().cloned().collect();
        for channel_name in channels {
            self.broadcast_to_channel(&channel_name, ServerMessage::PresenceChanged { agent: agent_id.to_string(), presence: presence_str(presence).to_string() }, None);
        }
        Ok(())
    }

    /// `spec.md` §4.5 floor control.
    pub fn responding_to(&mut self, agent_id: &str, channel_name: &str, msg_id: &str, started_at: u64) -> Result<(), RelayError> {
        let floor_ttl_secs = self.config.floor_ttl_secs;
        let channel = self.channels.get_mut(channel_name).ok_or_else(|| RelayError::NotFound("channel not found".into(), "CHANNEL_NOT_FOUND"))?;
        if !channel.is_member(agent_id) {
            return Err(RelayError::AuthorizationFailure("not a channel member".into(), "NOT_INVITED"));
        }
        let outcome = channel.claim_floor(msg_id, &agent_id.to_string(), started_at, floor_ttl_secs);
        if let FloorOutcome::Yield { winner } = outcome {
            self.send_to_agent(agent_id, ServerMessage::Yield { msg_id: msg_id.to_string(), winner });
        }
        Ok(())
    }

    pub fn register_skills(&mut self, agent_id: &str, skills: Vec<String>) -> usize {
        let count = skills.len();
        self.skills.insert(agent_id.to_string(), skills);
        count
    }

    pub fn search_skills(&self, query: &str) -> Vec<String> {
        let query = query.to_lowercase();
        let mut matches: Vec<String> = self
            .skills
            .iter()
            .filter(|(_, skills)| skills.iter().any(|s| s.to_lowercase().contains(&query)))
            .map(|(agent, _)| agent.clone())
            .collect();
        matches.sort();
        matches
    }

    /// Idle-prompter sweep; called periodically by `main.rs`. `spec.md` §4.5.
    pub fn sweep_idle_channels(&mut self) {
        let idle_prompt_secs = self.config.idle_prompt_secs;
        let idle: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.is_idle(idle_prompt_secs))
            .map(|(name, _)| name.clone())
            .collect();
        for channel_name in idle {
            let msg_id = crypto::random_alnum_id();
            let stamped = crate::codec::stamp_chat_message(msg_id, "@server".to_string(), None, channel_name.clone(), "still there?".to_string());
            self.broadcast_to_channel(&channel_name, ServerMessage::Msg(stamped), None);
            if let Some(channel) = self.channels.get_mut(&channel_name) {
                channel.mark_activity();
            }
        }
    }

    // -------------------------------------------------------------------
    // Proposal engine. `spec.md` §4.6/§4.7.
    // -------------------------------------------------------------------

    fn verify_signature(&self, agent_id: &str, message: &str, signature_hex: &str) -> Result<(), RelayError> {
        let agent = self.agents.get(agent_id).ok_or_else(|| RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"))?;
        let pubkey_hex = agent.pubkey.as_ref().ok_or_else(|| RelayError::AuthorizationFailure("verification required".into(), "VERIFICATION_REQUIRED"))?;
        let pubkey = hex::decode(pubkey_hex).map_err(|_| RelayError::InvariantViolation("malformed pubkey".into(), "INVALID_SIGNATURE"))?;
        let signature = hex::decode(signature_hex).map_err(|_| RelayError::InvariantViolation("malformed signature".into(), "INVALID_SIGNATURE"))?;
        crypto::verify(&pubkey, message.as_bytes(), &signature).map_err(|_| RelayError::InvariantViolation("signature mismatch".into(), "INVALID_SIGNATURE"))
    }

    pub fn create_proposal(&mut self, proposer: &str, to: String, task: String, amount: Option<f64>, currency: Option<String>, payment_code: Option<String>, expires: Option<u64>, signature_hex: &str) -> Result<String, RelayError> {
        let agent = self.agents.get(proposer).ok_or_else(|| RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"))?;
        if !agent.verified {
            return Err(RelayError::AuthorizationFailure("proposer must be verified".into(), "VERIFICATION_REQUIRED"));
        }
        let message = crate::proposal::engine::proposal_signing_string(&to, &task, amount, currency.as_deref(), payment_code.as_deref(), expires);
        self.verify_signature(proposer, &message, signature_hex)?;

        let recipient = to.strip_prefix('@').unwrap_or(&to).to_string();
        if !self.agents.contains_key(&recipient) {
            return Err(RelayError::NotFound("agent not found".into(), "AGENT_NOT_FOUND"));
        }
        let proposal_id = crypto::random_alnum_id();
        let proposal = self.proposals.create(proposal_id.clone(), proposer.to_string(), recipient.clone(), task, amount, currency, payment_code, expires).clone();
        self.send_to_agent(&recipient, ServerMessage::Proposal(notification(&proposal)));
        if let Some(expires_at) = expires {
            self.timers.arm(deadline_duration(expires_at), TimerEvent::ProposalExpired { proposal_id: proposal_id.clone() });
        }
        Ok(proposal_id)
    }

    pub fn accept_proposal(&mut self, caller: &str, proposal_id: &str, payment_code: Option<String>, stake: Option<i64>, signature_hex: &str) -> Result<(), RelayError> {
        let message = crate::proposal::engine::accept_signing_string(proposal_id, payment_code.as_deref());
        self.verify_signature(caller, &message, signature_hex)?;

        if let Some(stake) = stake {
            let proposer_id = self.proposals.get(proposal_id).map(|p| p.proposer.clone()).ok_or_else(|| RelayError::NotFound("proposal not found".into(), "AGENT_NOT_FOUND"))?;
            let proposer_rating = self.ratings.get_or_default(&proposer_id).rating;
            let recipient_rating = self.ratings.get_or_default(caller).rating;
            if proposer_rating < stake || recipient_rating < stake {
                return Err(RelayError::ResourceExhausted("insufficient rating for stake".into()));
            }
        }

        let proposal = self.proposals.accept(proposal_id, caller, stake, stake)?.clone();
        let proposer = proposal.proposer.clone();
        if let Some(stake) = stake {
            self.escrow_sink.emit(EscrowEvent::Created { proposal_id: proposal_id.to_string(), agent: proposer.clone(), amount: stake });
            self.escrow_sink.emit(EscrowEvent::Created { proposal_id: proposal_id.to_string(), agent: caller.to_string(), amount: stake });
        }
        self.send_to_agent(&proposer, ServerMessage::Accept(notification(&proposal)));
        Ok(())
    }

    pub fn reject_proposal(&mut self, caller: &str, proposal_id: &str, signature_hex: &str) -> Result<(), RelayError> {
        let message = crate::proposal::engine::reject_signing_string(proposal_id);
        self.verify_signature(caller, &message, signature_hex)?;
        let proposal = self.proposals.reject(proposal_id, caller)?.clone();
        self.send_to_agent(&proposal.proposer, ServerMessage::Reject(notification(&proposal)));
        Ok(())
    }

    pub fn complete_proposal(&mut self, caller: &str, proposal_id: &str, proof: Option<String>, signature_hex: &str) -> Result<(), RelayError> {
        let message = crate::proposal::engine::complete_signing_string(proposal_id, proof.as_deref());
        self.verify_signature(caller, &message, signature_hex)?;
        let proposal = self.proposals.complete(proposal_id, caller)?.clone();
        self.settle_completion(&proposal);
        self.send_to_agent(&proposal.proposer, ServerMessage::Complete(notification(&proposal)));
        self.send_to_agent(&proposal.recipient, ServerMessage::Complete(notification(&proposal)));
        Ok(())
    }

    fn settle_completion(&mut self, proposal: &Proposal) {
        let proposer_record = self.ratings.get_or_default(&proposal.proposer);
        let recipient_record = self.ratings.get_or_default(&proposal.recipient);
        let (gain_a, gain_b) = crate::proposal::reputation::settle_complete(&proposer_record, &recipient_record, proposal.amount_or_zero());

        let mut proposer_record = proposer_record;
        proposer_record.apply_delta(gain_a);
        self.ratings.put(proposal.proposer.clone(), proposer_record);
        self.escrow_sink.emit(EscrowEvent::SettlementCompletion { proposal_id: proposal.proposal_id.clone(), agent: proposal.proposer.clone(), delta: gain_a });

        let mut recipient_record = recipient_record;
        recipient_record.apply_delta(gain_b);
        self.ratings.put(proposal.recipient.clone(), recipient_record);
        self.escrow_sink.emit(EscrowEvent::SettlementCompletion { proposal_id: proposal.proposal_id.clone(), agent: proposal.recipient.clone(), delta: gain_b });

        if let Some(stake) = proposal.proposer_stake {
            self.escrow_sink.emit(EscrowEvent::Released { proposal_id: proposal.proposal_id.clone(), agent: proposal.proposer.clone(), amount: stake });
        }
        if let Some(stake) = proposal.recipient_stake {
            self.escrow_sink.emit(EscrowEvent::Released { proposal_id: proposal.proposal_id.clone(), agent: proposal.recipient.clone(), amount: stake });
        }
    }

    pub fn dispute_proposal(&mut self, caller: &str, proposal_id: &str, reason: Option<String>, signature_hex: &str) -> Result<(), RelayError> {
        let message = crate::proposal::engine::dispute_signing_string(proposal_id, reason.as_deref());
        self.verify_signature(caller, &message, signature_hex)?;
        let proposal = self.proposals.dispute(proposal_id, caller)?.clone();
        self.settle_dispute_unilateral_proposal(&proposal);
        self.send_to_agent(&proposal.proposer, ServerMessage::Dispute(notification(&proposal)));
        self.send_to_agent(&proposal.recipient, ServerMessage::Dispute(notification(&proposal)));
        Ok(())
    }

    /// Rating settlement for a plain `DISPUTE` with no court involvement.
    fn settle_dispute_unilateral_proposal(&mut self, proposal: &Proposal) {
        let Some(disputer) = proposal.disputed_by.clone() else { return };
        let Some(loser) = proposal.counterparty(&disputer).map(|s| s.to_string()) else { return };
        self.settle_panel_unilateral(&loser, &disputer, proposal.amount_or_zero(), &mut Vec::new());
    }

    /// Timer-driven expiry of a proposal still `PENDING` or `ACCEPTED`.
    /// `spec.md` §4.6.
    pub fn expire_proposal(&mut self, proposal_id: &str) {
        if let Some(proposal) = self.proposals.expire(proposal_id).cloned() {
            self.send_to_agent(&proposal.proposer, ServerMessage::error("PROPOSAL_EXPIRED", format!("proposal {} expired", proposal.proposal_id)));
            self.send_to_agent(&proposal.recipient, ServerMessage::error("PROPOSAL_EXPIRED", format!("proposal {} expired", proposal.proposal_id)));
        }
    }

    /// Sweep every proposal whose `expires` deadline has passed. Cheaper
    /// than arming a timer per open proposal and catches ones created
    /// before the current process started.
    pub fn sweep_expired_proposals(&mut self) {
        for proposal_id in self.proposals.due_for_expiry(now_ms()) {
            self.expire_proposal(&proposal_id);
        }
    }

    // -------------------------------------------------------------------
    // Court protocol. `spec.md` §4.9.
    // -------------------------------------------------------------------

    pub fn dispute_intent(&mut self, disputant: &str, proposal_id: &str, reason: String, commitment: String, signature_hex: &str) -> Result<String, RelayError> {
        let message = court::dispute_intent_signing_string(proposal_id, &reason, &commitment);
        self.verify_signature(disputant, &message, signature_hex)?;
        if self.disputes.has_open_dispute_for_proposal(proposal_id) {
            return Err(RelayError::StateConflict("dispute already exists".into(), "DISPUTE_ALREADY_EXISTS"));
        }
        let proposal = self.proposals.get(proposal_id).ok_or_else(|| RelayError::NotFound("proposal not found".into(), "AGENT_NOT_FOUND"))?;
        let respondent = proposal.counterparty(disputant).ok_or_else(|| RelayError::AuthorizationFailure("not a party to this proposal".into(), "DISPUTE_NOT_PARTY"))?.to_string();

        let dispute_id = crypto::random_alnum_id();
        let server_nonce = hex::encode(crypto::random_nonce());
        let reveal_ttl = self.config.court_reveal_ttl_secs;
        let dispute = self
            .disputes
            .file_intent(dispute_id.clone(), proposal_id.to_string(), disputant.to_string(), respondent, reason, commitment.clone(), server_nonce.clone(), reveal_ttl)
            .clone();
        self.send_to_agent(disputant, ServerMessage::DisputeIntentAck { dispute_id: dispute_id.clone(), commitment, reveal_deadline: dispute.reveal_deadline_ms, server_nonce });
        self.timers.arm(deadline_duration(dispute.reveal_deadline_ms), TimerEvent::DisputeRevealExpired { dispute_id: dispute_id.clone() });
        Ok(dispute_id)
    }

    /// Returns the eligible pool the caller should pass to
    /// [`Self::finish_reveal`] once it decides panel vs fallback — kept
    /// as two steps so callers (and tests) can inspect eligibility.
    pub fn dispute_reveal(&mut self, dispute_id: &str, nonce: &str) -> Result<Vec<AgentId>, RelayError> {
        let dispute = self.disputes.reveal(dispute_id, nonce)?.clone();
        let parties = [dispute.disputant.as_str(), dispute.respondent.as_str()];
        let candidates: Vec<ArbiterCandidate> = self
            .agents
            .values()
            .filter(|a| a.verified)
            .map(|a| {
                let record = self.ratings.get_or_default(&a.id);
                ArbiterCandidate { agent: a.id.clone(), presence: a.presence, rating: record.rating, transactions: record.transactions }
            })
            .collect();
        let eligible = court::eligible_arbiters(&candidates, &parties);
        self.send_to_agent(&dispute.disputant, ServerMessage::DisputeRevealed { dispute_id: dispute_id.to_string() });
        Ok(eligible)
    }

    /// Form the panel (or fall back) after [`Self::dispute_reveal`].
    /// `spec.md` §4.9 seed scenarios 4 and 5.
    pub fn finish_reveal(&mut self, dispute_id: &str, eligible: Vec<AgentId>) -> Result<(), RelayError> {
        if eligible.len() < 3 {
            self.disputes.mark_fallback(dispute_id)?;
            let dispute = self.disputes.get(dispute_id).expect("just marked").clone();
            self.send_to_agent(&dispute.disputant, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
            self.send_to_agent(&dispute.respondent, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
            return Ok(());
        }
        let seed = self.disputes.get(dispute_id).and_then(|d| d.seed).expect("reveal sets seed");
        let panel = court::select_panel(&seed, &eligible);
        let response_ttl = self.config.court_arbiter_response_ttl_secs;
        let evidence_ttl_secs = self.config.court_evidence_ttl_secs;
        let vote_ttl_secs = self.config.court_vote_ttl_secs;

        let dispute = self.disputes.form_panel(dispute_id, panel.clone(), response_ttl)?.clone();
        let evidence_deadline = now_ms() + evidence_ttl_secs.saturating_mul(1000);
        let vote_deadline = evidence_deadline + vote_ttl_secs.saturating_mul(1000);
        let arbiter_response_deadline = dispute.arbiter_response_deadline_ms.expect("just set");

        for party in [dispute.disputant.clone(), dispute.respondent.clone()] {
            self.send_to_agent(
                &party,
                ServerMessage::PanelFormed {
                    dispute_id: dispute_id.to_string(),
                    arbiters: panel.clone(),
                    seed: hex::encode(seed),
                    server_nonce: dispute.server_nonce.clone(),
                    evidence_deadline,
                    vote_deadline,
                },
            );
        }
        for arbiter in &panel {
            self.send_to_agent(arbiter, ServerMessage::ArbiterAssigned { dispute_id: dispute_id.to_string(), is_replacement: None });
        }
        self.timers.arm(deadline_duration(arbiter_response_deadline), TimerEvent::DisputeArbiterResponseExpired { dispute_id: dispute_id.to_string() });
        Ok(())
    }

    pub fn arbiter_accept(&mut self, agent_id: &str, dispute_id: &str, signature_hex: &str) -> Result<(), RelayError> {
        let message = court::arbiter_accept_signing_string(dispute_id);
        self.verify_signature(agent_id, &message, signature_hex)?;
        let evidence_ttl = self.config.court_evidence_ttl_secs;
        let entered_evidence = self.disputes.arbiter_accept(dispute_id, agent_id, evidence_ttl)?;
        if entered_evidence {
            let dispute = self.disputes.get(dispute_id).expect("just entered evidence").clone();
            self.send_to_agent(&dispute.disputant, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
            self.send_to_agent(&dispute.respondent, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
        }
        Ok(())
    }

    pub fn arbiter_decline(&mut self, agent_id: &str, dispute_id: &str, reason: Option<String>, signature_hex: &str) -> Result<Option<AgentId>, RelayError> {
        let message = court::arbiter_decline_signing_string(dispute_id, reason.as_deref().unwrap_or(""));
        self.verify_signature(agent_id, &message, signature_hex)?;
        self.disputes.arbiter_decline(dispute_id, agent_id)?;

        let dispute = self.disputes.get(dispute_id).expect("just declined").clone();
        let parties = [dispute.disputant.as_str(), dispute.respondent.as_str()];
        let already_on_panel: Vec<&str> = dispute.arbiters.iter().map(|s| s.agent.as_str()).collect();
        let candidates: Vec<ArbiterCandidate> = self
            .agents
            .values()
            .filter(|a| a.verified && !already_on_panel.contains(&a.id.as_str()))
            .map(|a| {
                let record = self.ratings.get_or_default(&a.id);
                ArbiterCandidate { agent: a.id.clone(), presence: a.presence, rating: record.rating, transactions: record.transactions }
            })
            .collect();
        let seed = dispute.seed.expect("reveal sets seed");
        let pool = court::select_panel(&seed, &court::eligible_arbiters(&candidates, &parties));
        let replacement = pool.into_iter().next();
        if let Some(replacement) = replacement.clone() {
            self.disputes.replace_arbiter(dispute_id, agent_id, replacement.clone())?;
            self.send_to_agent(&replacement, ServerMessage::ArbiterAssigned { dispute_id: dispute_id.to_string(), is_replacement: Some(true) });
        }
        Ok(replacement)
    }

    pub fn submit_evidence(&mut self, party: &str, dispute_id: &str, items: Vec<EvidenceItem>, statement: String, signature_hex: &str) -> Result<(), RelayError> {
        let message = court::evidence_signing_string(dispute_id, &items).map_err(|e| RelayError::ProtocolViolation(e.to_string()))?;
        self.verify_signature(party, &message, signature_hex)?;
        let vote_ttl = self.config.court_vote_ttl_secs;
        let case_ready = self.disputes.submit_evidence(dispute_id, party, items, statement, vote_ttl)?;
        let dispute = self.disputes.get(dispute_id).expect("just submitted").clone();
        self.send_to_agent(&dispute.disputant, ServerMessage::EvidenceReceived { dispute_id: dispute_id.to_string(), party: party.to_string() });
        self.send_to_agent(&dispute.respondent, ServerMessage::EvidenceReceived { dispute_id: dispute_id.to_string(), party: party.to_string() });
        if case_ready {
            for arbiter in dispute.arbiters {
                self.send_to_agent(&arbiter.agent, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
            }
        }
        Ok(())
    }

    pub fn arbiter_vote(&mut self, agent_id: &str, dispute_id: &str, verdict_str: &str, signature_hex: &str) -> Result<(), RelayError> {
        let message = court::vote_signing_string(dispute_id, verdict_str);
        self.verify_signature(agent_id, &message, signature_hex)?;
        let verdict = parse_verdict(verdict_str)?;
        let resolved = self.disputes.arbiter_vote(dispute_id, agent_id, verdict)?;
        if let Some(final_verdict) = resolved {
            self.apply_verdict(dispute_id, final_verdict);
        }
        Ok(())
    }

    pub fn expire_dispute_deliberation(&mut self, dispute_id: &str) -> Result<(), RelayError> {
        let verdict = self.disputes.expire_deliberation(dispute_id)?;
        self.apply_verdict(dispute_id, verdict);
        Ok(())
    }

    /// Deadline fired while still awaiting reveal: the disputant never
    /// published the nonce, so the dispute falls back to off-platform
    /// resolution rather than leaving it open indefinitely.
    pub fn expire_dispute_reveal(&mut self, dispute_id: &str) {
        if self.disputes.get(dispute_id).map(|d| d.phase) != Some(court::DisputePhase::RevealPending) {
            return;
        }
        let Ok(dispute) = self.disputes.mark_fallback(dispute_id).map(|d| d.clone()) else { return };
        self.send_to_agent(&dispute.disputant, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
        self.send_to_agent(&dispute.respondent, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
    }

    pub fn expire_dispute_arbiter_response(&mut self, dispute_id: &str) {
        let evidence_ttl = self.config.court_evidence_ttl_secs;
        let Ok(entered_evidence) = self.disputes.expire_arbiter_response(dispute_id, evidence_ttl) else { return };
        let Some(dispute) = self.disputes.get(dispute_id).cloned() else { return };
        if entered_evidence {
            self.send_to_agent(&dispute.disputant, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
            self.send_to_agent(&dispute.respondent, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
            if let Some(evidence_deadline) = dispute.evidence_deadline_ms {
                self.timers.arm(deadline_duration(evidence_deadline), TimerEvent::DisputeEvidenceExpired { dispute_id: dispute_id.to_string() });
            }
        } else {
            self.send_to_agent(&dispute.disputant, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
            self.send_to_agent(&dispute.respondent, ServerMessage::DisputeFallback { dispute_id: dispute_id.to_string() });
        }
    }

    /// Deadline fired while still gathering evidence: close the phase
    /// with whatever was submitted and move straight to deliberation.
    pub fn expire_dispute_evidence(&mut self, dispute_id: &str) {
        let vote_ttl = self.config.court_vote_ttl_secs;
        let dispute = match self.disputes.close_evidence_on_deadline(dispute_id, vote_ttl) {
            Ok(d) => d.clone(),
            Err(_) => return,
        };
        for arbiter in &dispute.arbiters {
            self.send_to_agent(&arbiter.agent, ServerMessage::CaseReady { dispute_id: dispute_id.to_string() });
        }
        if let Some(vote_deadline) = dispute.vote_deadline_ms {
            self.timers.arm(deadline_duration(vote_deadline), TimerEvent::DisputeVoteExpired { dispute_id: dispute_id.to_string() });
        }
    }

    /// `spec.md` §4.9: settle ratings and notify both parties once a
    /// verdict is reached, whether by vote or by deliberation-deadline
    /// tally. `dispute.disputant`/`dispute.respondent` are always the
    /// proposal's two parties in dispute-filing order, so the verdict
    /// kind alone picks the loser without consulting the proposal.
    fn apply_verdict(&mut self, dispute_id: &str, verdict: Verdict) {
        let Some(dispute) = self.disputes.get(dispute_id).cloned() else { return };
        let amount = self.proposals.get(&dispute.proposal_id).map(|p| p.amount_or_zero()).unwrap_or(0.0);

        let mut rating_changes: Vec<(String, i64)> = Vec::new();
        match verdict {
            Verdict::Mutual => {
                let a = self.ratings.get_or_default(&dispute.disputant);
                let b = self.ratings.get_or_default(&dispute.respondent);
                let (delta_a, delta_b) = crate::proposal::reputation::settle_dispute_mutual(&a, &b, amount);
                self.apply_rating_delta(&dispute.disputant, delta_a);
                self.apply_rating_delta(&dispute.respondent, delta_b);
                rating_changes.push((dispute.disputant.clone(), delta_a));
                rating_changes.push((dispute.respondent.clone(), delta_b));
            }
            Verdict::Disputant => {
                // Disputant prevails; respondent is at fault.
                self.settle_panel_unilateral(&dispute.respondent, &dispute.disputant, amount, &mut rating_changes);
            }
            Verdict::Respondent => {
                // Respondent prevails; disputant is at fault.
                self.settle_panel_unilateral(&dispute.disputant, &dispute.respondent, amount, &mut rating_changes);
            }
        }

        for arbiter in &dispute.arbiters {
            match arbiter.status {
                ArbiterStatus::Voted if arbiter.vote == Some(verdict) => {
                    self.apply_rating_delta(&arbiter.agent, crate::types::ARBITER_MAJORITY_BONUS);
                }
                ArbiterStatus::Forfeited => {
                    self.apply_rating_delta(&arbiter.agent, -crate::types::ARBITER_STAKE);
                }
                _ => {}
            }
        }

        let votes: Vec<(String, String)> = dispute.arbiters.iter().filter_map(|s| s.vote.map(|v| (s.agent.clone(), v.as_str().to_string()))).collect();
        let settlement = serde_json::json!({ "verdict": verdict.as_str() });
        for recipient in [dispute.disputant.clone(), dispute.respondent.clone()] {
            self.send_to_agent(
                &recipient,
                ServerMessage::Verdict {
                    dispute_id: dispute_id.to_string(),
                    verdict: verdict.as_str().to_string(),
                    votes: votes.clone(),
                    rating_changes: rating_changes.clone(),
                    escrow_settlement: settlement.clone(),
                },
            );
        }
    }

    /// `(loser, winner)` rating settlement shared by plain unilateral
    /// `DISPUTE` and court verdicts. `spec.md` §4.7.
    fn settle_panel_unilateral(&mut self, loser: &str, winner: &str, amount: f64, rating_changes: &mut Vec<(String, i64)>) {
        let loser_record = self.ratings.get_or_default(loser);
        let winner_record = self.ratings.get_or_default(winner);
        let (loser_delta, winner_delta) = crate::proposal::reputation::settle_dispute_unilateral(&loser_record, &winner_record, amount);
        self.apply_rating_delta(loser, loser_delta);
        self.apply_rating_delta(winner, winner_delta);
        rating_changes.push((loser.to_string(), loser_delta));
        rating_changes.push((winner.to_string(), winner_delta));
    }

    fn apply_rating_delta(&mut self, agent_id: &str, delta: i64) {
        let mut record = self.ratings.get_or_default(agent_id);
        record.apply_delta(delta);
        self.ratings.put(agent_id.to_string(), record);
    }

    // -------------------------------------------------------------------
    // Allowlist & admin. `spec.md` §4.8.
    // -------------------------------------------------------------------

    pub fn admin_kick(&mut self, admin_key_supplied: &str, target: &str) -> Result<(), RelayError> {
        if !crate::net::connection::check_admin_key(&self.config.admin_key, admin_key_supplied) {
            return Err(RelayError::AuthorizationFailure("bad admin key".into(), "VERIFICATION_REQUIRED"));
        }
        if let Some(&conn_id) = self.agent_conn.get(target) {
            self.send(conn_id, ServerMessage::error("ADMIN_KICKED", "kicked by administrator"));
            self.disconnect(conn_id);
        }
        Ok(())
    }

    pub fn admin_ban(&mut self, admin_key_supplied: &str, target: &str, reason: Option<String>) -> Result<(), RelayError> {
        if !crate::net::connection::check_admin_key(&self.config.admin_key, admin_key_supplied) {
            return Err(RelayError::AuthorizationFailure("bad admin key".into(), "VERIFICATION_REQUIRED"));
        }
        self.ban_list.ban(target.to_string(), reason.unwrap_or_default());
        self.admin_kick(admin_key_supplied, target)
    }

    pub fn admin_unban(&mut self, admin_key_supplied: &str, target: &str) -> Result<bool, RelayError> {
        if !crate::net::connection::check_admin_key(&self.config.admin_key, admin_key_supplied) {
            return Err(RelayError::AuthorizationFailure("bad admin key".into(), "VERIFICATION_REQUIRED"));
        }
        Ok(self.ban_list.unban(target))
    }

    pub fn is_banned(&self, target: &str) -> bool {
        self.ban_list.is_banned(target)
    }
}

fn presence_str(presence: Presence) -> &'static str {
    match presence {
        Presence::Online => "online",
        Presence::Away => "away",
        Presence::Busy => "busy",
        Presence::Offline => "offline",
        Presence::Listening => "listening",
    }
}

fn state_str(state: ProposalState) -> &'static str {
    match state {
        ProposalState::Pending => "PENDING",
        ProposalState::Accepted => "ACCEPTED",
        ProposalState::Rejected => "REJECTED",
        ProposalState::Completed => "COMPLETED",
        ProposalState::Disputed => "DISPUTED",
        ProposalState::Expired => "EXPIRED",
    }
}

fn notification(proposal: &Proposal) -> ProposalNotification {
    ProposalNotification {
        proposal_id: proposal.proposal_id.clone(),
        proposer: proposal.proposer.clone(),
        recipient: proposal.recipient.clone(),
        task: proposal.task.clone(),
        amount: proposal.amount,
        currency: proposal.currency.clone(),
        state: state_str(proposal.state).to_string(),
    }
}

fn parse_verdict(s: &str) -> Result<Verdict, RelayError> {
    match s {
        "disputant" => Ok(Verdict::Disputant),
        "respondent" => Ok(Verdict::Respondent),
        "mutual" => Ok(Verdict::Mutual),
        other => Err(RelayError::ProtocolViolation(format!("unknown verdict {other}"))),
    }
}

/// Timer deadlines are stored as absolute milliseconds; convert to a
/// relative `Duration` for [`TimerHandle::arm`], clamping negative spans
/// (deadline already passed) to zero so the event fires immediately.
fn deadline_duration(deadline_ms: u64) -> std::time::Duration {
    std::time::Duration::from_millis(deadline_ms.saturating_sub(now_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use tokio::sync::mpsc;

    fn new_world() -> World {
        let (tx, _rx) = mpsc::channel(16);
        World::new(RelayConfig::default(), RatingsTable::new(), BanList::new(), Allowlist::new(false), TimerHandle::new(tx))
    }

    fn connect(world: &mut World, conn_id: u64) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        world.register_connection(conn_id, "127.0.0.1:1".parse().unwrap(), tx);
        rx
    }

    fn expect_welcome(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> AgentId {
        match rx.try_recv().unwrap() {
            ServerMessage::Welcome { agent_id, .. } => agent_id,
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    fn expect_challenge(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> (String, String) {
        match rx.try_recv().unwrap() {
            ServerMessage::Challenge { nonce, challenge_id, .. } => (nonce, challenge_id),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    fn verify(world: &mut World, conn_id: u64, kp: &Keypair, nonce_hex: &str, challenge_id: &str) {
        let timestamp = now_ms();
        let signing = crypto::signing_string(&["AGENTCHAT_AUTH", nonce_hex, challenge_id, &timestamp.to_string()]);
        let sig = kp.sign(signing.as_bytes());
        world.verify_identity(conn_id, challenge_id, &hex::encode(sig), timestamp).unwrap();
    }

    #[test]
    fn ephemeral_identify_creates_unverified_agent() {
        let mut world = new_world();
        let mut rx = connect(&mut world, 1);
        world.identify_ephemeral(1, Some("bob".to_string()));
        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, ServerMessage::Welcome { verified: false, .. }));
    }

    #[test]
    fn pubkey_roundtrip_admits_verified_agent() {
        let mut world = new_world();
        let mut rx = connect(&mut world, 1);
        let kp = Keypair::generate();
        world.identify_pubkey(1, kp.public_key_hex(), 30).unwrap();
        let (nonce_hex, challenge_id) = expect_challenge(&mut rx);
        verify(&mut world, 1, &kp, &nonce_hex, &challenge_id);
        let welcome = rx.try_recv().unwrap();
        assert!(matches!(welcome, ServerMessage::Welcome { verified: true, .. }));
    }

    #[test]
    fn identity_takeover_displaces_prior_connection() {
        let mut world = new_world();
        let kp = Keypair::generate();

        let mut rx1 = connect(&mut world, 1);
        world.identify_pubkey(1, kp.public_key_hex(), 30).unwrap();
        let (nonce_hex, challenge_id) = expect_challenge(&mut rx1);
        verify(&mut world, 1, &kp, &nonce_hex, &challenge_id);
        let _ = rx1.try_recv(); // welcome

        let mut rx2 = connect(&mut world, 2);
        world.identify_pubkey(2, kp.public_key_hex(), 30).unwrap();
        let (nonce_hex, challenge_id) = expect_challenge(&mut rx2);
        verify(&mut world, 2, &kp, &nonce_hex, &challenge_id);

        let displaced = rx1.try_recv().unwrap();
        assert!(matches!(displaced, ServerMessage::Error { code, .. } if code == "SESSION_DISPLACED"));
    }

    #[test]
    fn channel_join_and_message_broadcasts() {
        let mut world = new_world();
        let mut rx1 = connect(&mut world, 1);
        let mut rx2 = connect(&mut world, 2);
        world.identify_ephemeral(1, Some("alice".into()));
        world.identify_ephemeral(2, Some("bob".into()));
        let alice = expect_welcome(&mut rx1);
        let bob = expect_welcome(&mut rx2);

        world.join_channel(&alice, "#general").unwrap();
        let _ = rx1.try_recv(); // JOINED
        world.join_channel(&bob, "#general").unwrap();
        let _ = rx2.try_recv(); // JOINED
        let _ = rx1.try_recv(); // AGENT_JOINED

        world.send_message(&bob, "#general", "hello", None, 4096).unwrap();
        let msg = rx1.try_recv().unwrap();
        assert!(matches!(msg, ServerMessage::Msg(_)));
    }

    #[test]
    fn floor_claim_ties_break_by_earlier_start() {
        let mut world = new_world();
        let mut rx1 = connect(&mut world, 1);
        let mut rx2 = connect(&mut world, 2);
        world.identify_ephemeral(1, Some("alice".into()));
        world.identify_ephemeral(2, Some("bob".into()));
        let alice = expect_welcome(&mut rx1);
        let bob = expect_welcome(&mut rx2);
        world.join_channel(&alice, "#general").unwrap();
        let _ = rx1.try_recv();
        world.join_channel(&bob, "#general").unwrap();
        let _ = rx2.try_recv();
        let _ = rx1.try_recv();

        world.responding_to(&alice, "#general", "m1", 100).unwrap();
        world.responding_to(&bob, "#general", "m2", 200).unwrap();
        let yielded = rx2.try_recv().unwrap();
        assert!(matches!(yielded, ServerMessage::Yield { winner, .. } if winner == alice));
    }

    #[test]
    fn proposal_lifecycle_settles_ratings() {
        let mut world = new_world();
        let mut rx1 = connect(&mut world, 1);
        let mut rx2 = connect(&mut world, 2);
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        world.identify_pubkey(1, kp1.public_key_hex(), 30).unwrap();
        let (nonce, cid) = expect_challenge(&mut rx1);
        verify(&mut world, 1, &kp1, &nonce, &cid);
        let alice = kp1.stable_id();

        world.identify_pubkey(2, kp2.public_key_hex(), 30).unwrap();
        let (nonce, cid) = expect_challenge(&mut rx2);
        verify(&mut world, 2, &kp2, &nonce, &cid);
        let bob = kp2.stable_id();

        let to = format!("@{bob}");
        let msg = crate::proposal::engine::proposal_signing_string(&to, "task", Some(10.0), Some("USD"), None, None);
        let sig = kp1.sign(msg.as_bytes());
        let proposal_id = world.create_proposal(&alice, to, "task".into(), Some(10.0), Some("USD".into()), None, None, &hex::encode(sig)).unwrap();

        let accept_msg = crate::proposal::engine::accept_signing_string(&proposal_id, None);
        let accept_sig = kp2.sign(accept_msg.as_bytes());
        world.accept_proposal(&bob, &proposal_id, None, None, &hex::encode(accept_sig)).unwrap();

        let complete_msg = crate::proposal::engine::complete_signing_string(&proposal_id, None);
        let complete_sig = kp1.sign(complete_msg.as_bytes());
        world.complete_proposal(&alice, &proposal_id, None, &hex::encode(complete_sig)).unwrap();

        assert_eq!(world.ratings().get_or_default(&alice).rating, 1216);
        assert_eq!(world.ratings().get_or_default(&bob).rating, 1216);
    }

    #[test]
    fn unverified_agent_cannot_create_proposal() {
        let mut world = new_world();
        let mut rx = connect(&mut world, 1);
        world.identify_ephemeral(1, None);
        let alice = expect_welcome(&mut rx);
        let err = world.create_proposal(&alice, "@bob".into(), "task".into(), None, None, None, None, "00").unwrap_err();
        assert!(matches!(err, RelayError::AuthorizationFailure(_, _)));
    }

    #[test]
    fn admin_kick_requires_configured_key() {
        let mut world = new_world();
        let err = world.admin_kick("whatever", "aaaa1111").unwrap_err();
        assert!(matches!(err, RelayError::AuthorizationFailure(_, _)));
    }
}
