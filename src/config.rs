//! Relay configuration, enumerated in `spec.md` §6.

use crate::types::{
    DEFAULT_ARBITER_RESPONSE_TTL_SECS, DEFAULT_CHALLENGE_TTL_SECS, DEFAULT_CHANNEL_BUFFER,
    DEFAULT_EVIDENCE_TTL_SECS, DEFAULT_FLOOR_TTL_SECS, DEFAULT_IDLE_PROMPT_SECS,
    DEFAULT_REVEAL_TTL_SECS, DEFAULT_VOTE_TTL_SECS, MAX_CONTENT_CHARS, MAX_FRAME_BYTES,
};
use clap::Parser;
use std::path::PathBuf;

/// 10 messages / 10s. `spec.md` §4.3.
pub const DEFAULT_PREAUTH_BUDGET: (u32, u64) = (10, 10);
/// 60 messages / 10s. `spec.md` §4.3.
pub const DEFAULT_POSTAUTH_BUDGET: (u32, u64) = (60, 10);

#[derive(Parser, Debug, Clone)]
#[command(name = "swarmrelay", version, about = "Agent coordination relay")]
pub struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Listen port.
    #[arg(long, default_value_t = 7700)]
    pub port: u16,

    /// TLS certificate path (TLS termination is expected to live in front
    /// of this process; these flags are accepted for parity with
    /// `spec.md` §6 but are not wired to an in-process acceptor).
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Per-channel replay buffer size.
    #[arg(long, default_value_t = DEFAULT_CHANNEL_BUFFER)]
    pub channel_buffer: usize,

    /// Pre-auth message budget (messages per 10s window).
    #[arg(long, default_value_t = DEFAULT_PREAUTH_BUDGET.0)]
    pub preauth_budget: u32,

    /// Post-auth global message budget (messages per 10s window).
    #[arg(long, default_value_t = DEFAULT_POSTAUTH_BUDGET.0)]
    pub postauth_budget: u32,

    /// Per-IP concurrent-connection ceiling.
    #[arg(long, default_value_t = 8)]
    pub max_connections_per_ip: usize,

    /// Auth challenge TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_CHALLENGE_TTL_SECS)]
    pub challenge_ttl_secs: u64,

    /// Floor-control claim TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_FLOOR_TTL_SECS)]
    pub floor_ttl_secs: u64,

    /// Idle-prompt threshold in seconds.
    #[arg(long, default_value_t = DEFAULT_IDLE_PROMPT_SECS)]
    pub idle_prompt_secs: u64,

    /// Court reveal-phase TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_REVEAL_TTL_SECS)]
    pub court_reveal_ttl_secs: u64,

    /// Court arbiter-response-phase TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_ARBITER_RESPONSE_TTL_SECS)]
    pub court_arbiter_response_ttl_secs: u64,

    /// Court evidence-phase TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_EVIDENCE_TTL_SECS)]
    pub court_evidence_ttl_secs: u64,

    /// Court deliberation (vote) TTL in seconds.
    #[arg(long, default_value_t = DEFAULT_VOTE_TTL_SECS)]
    pub court_vote_ttl_secs: u64,

    /// Enable the opt-in pubkey allowlist.
    #[arg(long, default_value_t = false)]
    pub allowlist_enabled: bool,

    /// Path to the allowlist file (JSON array of hex pubkeys).
    #[arg(long)]
    pub allowlist_path: Option<PathBuf>,

    /// Shared admin secret for ADMIN_KICK/ADMIN_BAN/ADMIN_UNBAN.
    #[arg(long)]
    pub admin_key: Option<String>,

    /// File-chunk size in bytes for the FILE_CHUNK rate class.
    #[arg(long, default_value_t = 16 * 1024)]
    pub file_chunk_size: usize,

    /// Path to the ratings JSON file.
    #[arg(long, default_value = "ratings.json")]
    pub ratings_path: PathBuf,

    /// Path to the persistent ban list JSON file.
    #[arg(long, default_value = "bans.json")]
    pub ban_list_path: PathBuf,

    /// Path to this node's identity file (see `crypto::save_identity`).
    #[arg(long, default_value = "identity.json")]
    pub identity_path: PathBuf,
}

/// Runtime configuration assembled from [`Args`] (or directly, in tests).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub channel_buffer: usize,
    pub preauth_budget: (u32, u64),
    pub postauth_budget: (u32, u64),
    pub max_connections_per_ip: usize,
    pub challenge_ttl_secs: u64,
    pub floor_ttl_secs: u64,
    pub idle_prompt_secs: u64,
    pub court_reveal_ttl_secs: u64,
    pub court_arbiter_response_ttl_secs: u64,
    pub court_evidence_ttl_secs: u64,
    pub court_vote_ttl_secs: u64,
    pub allowlist_enabled: bool,
    pub admin_key: Option<String>,
    pub max_content_chars: usize,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7700,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            preauth_budget: DEFAULT_PREAUTH_BUDGET,
            postauth_budget: DEFAULT_POSTAUTH_BUDGET,
            max_connections_per_ip: 8,
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            floor_ttl_secs: DEFAULT_FLOOR_TTL_SECS,
            idle_prompt_secs: DEFAULT_IDLE_PROMPT_SECS,
            court_reveal_ttl_secs: DEFAULT_REVEAL_TTL_SECS,
            court_arbiter_response_ttl_secs: DEFAULT_ARBITER_RESPONSE_TTL_SECS,
            court_evidence_ttl_secs: DEFAULT_EVIDENCE_TTL_SECS,
            court_vote_ttl_secs: DEFAULT_VOTE_TTL_SECS,
            allowlist_enabled: false,
            admin_key: None,
            max_content_chars: MAX_CONTENT_CHARS,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        Self {
            bind: args.bind.clone(),
            port: args.port,
            channel_buffer: args.channel_buffer,
            preauth_budget: (args.preauth_budget, 10),
            postauth_budget: (args.postauth_budget, 10),
            max_connections_per_ip: args.max_connections_per_ip,
            challenge_ttl_secs: args.challenge_ttl_secs,
            floor_ttl_secs: args.floor_ttl_secs,
            idle_prompt_secs: args.idle_prompt_secs,
            court_reveal_ttl_secs: args.court_reveal_ttl_secs,
            court_arbiter_response_ttl_secs: args.court_arbiter_response_ttl_secs,
            court_evidence_ttl_secs: args.court_evidence_ttl_secs,
            court_vote_ttl_secs: args.court_vote_ttl_secs,
            allowlist_enabled: args.allowlist_enabled,
            admin_key: args.admin_key.clone(),
            max_content_chars: MAX_CONTENT_CHARS,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}
