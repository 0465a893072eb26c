//! Shared data model: agents, presence, channel/message shapes, and the
//! size/name-validation constants named throughout `spec.md` §3 and §6.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// SIZE & NAME LIMITS
// =============================================================================

/// Maximum WebSocket frame size (256 KiB). `spec.md` §4.2.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Maximum `MSG` content length in chars. `spec.md` §3.
pub const MAX_CONTENT_CHARS: usize = 4096;

/// Default per-channel replay ring buffer size. `spec.md` §3.
pub const DEFAULT_CHANNEL_BUFFER: usize = 20;

/// Nick length bounds, `[A-Za-z0-9_-]`. `spec.md` §3.
pub const MIN_NICK_LEN: usize = 1;
pub const MAX_NICK_LEN: usize = 24;

/// Channel name bounds: `#` + 1..=31 `[A-Za-z0-9_-]`. `spec.md` §3.
pub const MAX_CHANNEL_NAME_LEN: usize = 31;

/// Default pre-auth challenge TTL. `spec.md` §4.4.
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 30;

/// Default floor-control claim TTL. `spec.md` §4.5.
pub const DEFAULT_FLOOR_TTL_SECS: u64 = 45;

/// Default idle-prompt threshold. `spec.md` §4.5.
pub const DEFAULT_IDLE_PROMPT_SECS: u64 = 300;

/// Default proposal rating floor. `spec.md` §3/§4.7.
pub const RATING_FLOOR: i64 = 100;

/// Default starting rating for a fresh `RatingRecord`. `spec.md` §3.
pub const DEFAULT_RATING: i64 = 1200;

/// Court default deadlines, §4.9.
pub const DEFAULT_REVEAL_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_ARBITER_RESPONSE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_EVIDENCE_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_VOTE_TTL_SECS: u64 = 60 * 60;

/// Arbiter ELO stake on accept. `spec.md` §4.9.
pub const ARBITER_STAKE: i64 = 25;
/// Bonus for voting with the majority. `spec.md` §4.9.
pub const ARBITER_MAJORITY_BONUS: i64 = 5;

/// Eligible-arbiter rating floor. `spec.md` §4.9.
pub const ARBITER_MIN_RATING: i64 = 1200;
/// Eligible-arbiter completed-transaction floor. `spec.md` §4.9.
pub const ARBITER_MIN_TRANSACTIONS: u64 = 10;

/// Evidence limits. `spec.md` §4.9.
pub const MAX_EVIDENCE_ITEMS: usize = 10;
pub const MAX_STATEMENT_CHARS: usize = 2000;

/// Current UTC time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Current UTC time in whole seconds since the epoch.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

// =============================================================================
// IDENTITY
// =============================================================================

pub type AgentId = String;
pub type PublicKeyHex = String;

/// `agent.presence`. `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Busy,
    Offline,
    Listening,
}

impl Default for Presence {
    fn default() -> Self {
        Presence::Online
    }
}

/// Validate a nick: 1-24 chars, `[A-Za-z0-9_-]`.
pub fn is_valid_nick(nick: &str) -> bool {
    let len = nick.chars().count();
    (MIN_NICK_LEN..=MAX_NICK_LEN).contains(&len)
        && nick.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a channel name including the leading `#`.
pub fn is_valid_channel_name(name: &str) -> bool {
    match name.strip_prefix('#') {
        Some(rest) => {
            let len = rest.chars().count();
            (1..=MAX_CHANNEL_NAME_LEN).contains(&len)
                && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}

/// The process-wide subject of one identity. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub pubkey: Option<PublicKeyHex>,
    pub nick: String,
    pub verified: bool,
    pub presence: Presence,
    pub channels: HashSet<String>,
}

impl Agent {
    pub fn new_ephemeral(id: AgentId) -> Self {
        Self {
            nick: id.clone(),
            id,
            pubkey: None,
            verified: false,
            presence: Presence::Online,
            channels: HashSet::new(),
        }
    }

    pub fn new_verified(id: AgentId, pubkey: PublicKeyHex) -> Self {
        Self {
            nick: id.clone(),
            id,
            pubkey: Some(pubkey),
            verified: true,
            presence: Presence::Online,
            channels: HashSet::new(),
        }
    }
}

// =============================================================================
// CHAT MESSAGE SHAPE
// =============================================================================

/// One chat message, channel- or DM-addressed. `spec.md` §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: String,
    pub from: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub to: String,
    pub content: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
}

/// A floor-control claim over one `msg_id` within a channel. `spec.md` §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorClaim {
    pub msg_id: String,
    pub holder: AgentId,
    pub started_at: u64,
    pub claimed_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_validation() {
        assert!(is_valid_nick("agent_1"));
        assert!(is_valid_nick("a"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick(&"x".repeat(25)));
        assert!(!is_valid_nick("has space"));
    }

    #[test]
    fn channel_name_validation() {
        assert!(is_valid_channel_name("#general"));
        assert!(is_valid_channel_name("#a"));
        assert!(!is_valid_channel_name("general"));
        assert!(!is_valid_channel_name("#"));
        assert!(!is_valid_channel_name(&format!("#{}", "a".repeat(32))));
        assert!(!is_valid_channel_name("#has space"));
    }
}
