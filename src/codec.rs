//! Wire protocol: JSON-over-WebSocket-text-frame, tagged by `type`.
//! `spec.md` §4.2 and §6.

use crate::types::{now_ms, ChatMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reject a frame before any field is interpreted. `spec.md` §4.2.
pub fn validate_frame_size(bytes: &[u8], max_frame_bytes: usize) -> bool {
    bytes.len() <= max_frame_bytes
}

/// Reject oversize `MSG` content before any side effect. `spec.md` §4.2/§3.
pub fn validate_content_len(content: &str, max_content_chars: usize) -> bool {
    content.chars().count() <= max_content_chars
}

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Identify {
        #[serde(default)]
        pubkey: Option<String>,
        #[serde(default)]
        nick: Option<String>,
    },
    VerifyIdentity {
        challenge_id: String,
        signature: String,
    },
    Join {
        channel: String,
    },
    Leave {
        channel: String,
    },
    Msg {
        to: String,
        content: String,
        #[serde(default)]
        msg_id: Option<String>,
    },
    ListChannels,
    ListAgents,
    CreateChannel {
        channel: String,
        #[serde(default)]
        invite_only: bool,
    },
    Invite {
        channel: String,
        agent: String,
    },
    SetNick {
        nick: String,
    },
    SetPresence {
        presence: String,
    },
    Ping,
    RespondingTo {
        msg_id: String,
        started_at: u64,
        channel: String,
    },
    RegisterSkills {
        skills: Vec<String>,
    },
    SearchSkills {
        query: String,
    },
    Proposal {
        to: String,
        task: String,
        #[serde(default)]
        amount: Option<f64>,
        #[serde(default)]
        currency: Option<String>,
        #[serde(default)]
        payment_code: Option<String>,
        #[serde(default)]
        expires: Option<u64>,
        #[serde(default)]
        elo_stake: Option<i64>,
        signature: String,
    },
    Accept {
        proposal_id: String,
        #[serde(default)]
        payment_code: Option<String>,
        #[serde(default)]
        elo_stake: Option<i64>,
        signature: String,
    },
    Reject {
        proposal_id: String,
        signature: String,
    },
    Complete {
        proposal_id: String,
        #[serde(default)]
        proof: Option<String>,
        signature: String,
    },
    Dispute {
        proposal_id: String,
        #[serde(default)]
        reason: Option<String>,
        signature: String,
    },
    DisputeIntent {
        proposal_id: String,
        reason: String,
        commitment: String,
        signature: String,
    },
    DisputeReveal {
        dispute_id: String,
        nonce: String,
    },
    Evidence {
        dispute_id: String,
        items: Vec<EvidenceItem>,
        statement: String,
        signature: String,
    },
    ArbiterAccept {
        dispute_id: String,
        signature: String,
    },
    ArbiterDecline {
        dispute_id: String,
        #[serde(default)]
        reason: Option<String>,
        signature: String,
    },
    ArbiterVote {
        dispute_id: String,
        verdict: String,
        signature: String,
    },
    AdminKick {
        admin_key: String,
        target: String,
    },
    AdminBan {
        admin_key: String,
        target: String,
        #[serde(default)]
        reason: Option<String>,
    },
    AdminUnban {
        admin_key: String,
        target: String,
    },
    FileChunk {
        to: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Welcome {
        agent_id: String,
        verified: bool,
    },
    Challenge {
        nonce: String,
        challenge_id: String,
        expires_at: u64,
    },
    VerificationFailed,
    VerificationExpired,
    Msg(ChatMessage),
    Joined {
        channel: String,
        agents: Vec<String>,
    },
    AgentJoined {
        channel: String,
        agent: String,
    },
    AgentLeft {
        channel: String,
        agent: String,
    },
    Channels {
        channels: Vec<String>,
    },
    Agents {
        agents: Vec<String>,
    },
    Pong,
    Yield {
        msg_id: String,
        winner: String,
    },
    SkillsRegistered {
        count: usize,
    },
    SearchResults {
        agents: Vec<String>,
    },
    Proposal(ProposalNotification),
    Accept(ProposalNotification),
    Reject(ProposalNotification),
    Complete(ProposalNotification),
    Dispute(ProposalNotification),
    DisputeIntentAck {
        dispute_id: String,
        commitment: String,
        reveal_deadline: u64,
        server_nonce: String,
    },
    DisputeRevealed {
        dispute_id: String,
    },
    PanelFormed {
        dispute_id: String,
        arbiters: Vec<String>,
        seed: String,
        server_nonce: String,
        evidence_deadline: u64,
        vote_deadline: u64,
    },
    ArbiterAssigned {
        dispute_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_replacement: Option<bool>,
    },
    EvidenceReceived {
        dispute_id: String,
        party: String,
    },
    CaseReady {
        dispute_id: String,
    },
    Verdict {
        dispute_id: String,
        verdict: String,
        votes: Vec<(String, String)>,
        rating_changes: Vec<(String, i64)>,
        escrow_settlement: Value,
    },
    DisputeFallback {
        dispute_id: String,
    },
    PresenceChanged {
        agent: String,
        presence: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalNotification {
    pub proposal_id: String,
    pub proposer: String,
    pub recipient: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub state: String,
}

impl ServerMessage {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        ServerMessage::Error { code, message: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// Parse an inbound text frame into a [`ClientMessage`].
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Result of [`parse_client_frame`], which separates frames that aren't
/// JSON at all from frames that parse as JSON but don't match any known
/// message shape. The two get different wire treatment: malformed JSON
/// is logged and dropped silently, an unknown `type` or missing required
/// field gets an `INVALID_MSG` reply.
pub enum ParsedFrame {
    Message(ClientMessage),
    MalformedJson,
    InvalidMessage,
}

/// Two-stage parse of an inbound text frame, used by the connection loop
/// instead of [`parse_client_message`] so it can distinguish the two
/// failure modes collapsed by a single `serde_json::from_str::<ClientMessage>`.
pub fn parse_client_frame(text: &str) -> ParsedFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return ParsedFrame::MalformedJson,
    };
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => ParsedFrame::Message(msg),
        Err(_) => ParsedFrame::InvalidMessage,
    }
}

pub fn stamp_chat_message(
    msg_id: String,
    from: String,
    from_name: Option<String>,
    to: String,
    content: String,
) -> ChatMessage {
    ChatMessage { msg_id, from, from_name, to, content, ts: now_ms(), replay: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identify_without_pubkey() {
        let msg = parse_client_message(r#"{"type":"IDENTIFY","nick":"bob"}"#).unwrap();
        match msg {
            ClientMessage::Identify { pubkey, nick } => {
                assert!(pubkey.is_none());
                assert_eq!(nick.as_deref(), Some("bob"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(parse_client_message(r#"{"type":"NOT_A_THING"}"#).is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        // MSG requires `to` and `content`.
        assert!(parse_client_message(r##"{"type":"MSG","to":"#general"}"##).is_err());
    }

    #[test]
    fn frame_size_boundary() {
        let max = 256 * 1024;
        assert!(validate_frame_size(&vec![0u8; max], max));
        assert!(!validate_frame_size(&vec![0u8; max + 1], max));
    }

    #[test]
    fn content_len_boundary() {
        assert!(validate_content_len(&"a".repeat(4096), 4096));
        assert!(!validate_content_len(&"a".repeat(4097), 4096));
    }

    #[test]
    fn server_message_serializes_with_tag() {
        let msg = ServerMessage::Welcome { agent_id: "aaaa1111".to_string(), verified: true };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"WELCOME\""));
        assert!(json.contains("\"agent_id\":\"aaaa1111\""));
    }
}
