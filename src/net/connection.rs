//! Connection/admission state machine, allowlist, and admin ban list.
//! `spec.md` §4.4 and §4.8.

use crate::types::{now_ms, AgentId, PublicKeyHex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

/// One connection's place in the admission state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    PreAuth,
    Challenged,
    Admitted,
    Verified,
    Closing,
    Closed,
}

/// A pending Ed25519 auth challenge issued on the pubkey path.
/// `spec.md` §4.4 step 2.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub challenge_id: String,
    pub nonce: [u8; 32],
    pub pubkey: PublicKeyHex,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

impl PendingChallenge {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at_ms
    }
}

/// Per-connection admission bookkeeping. One per live socket.
pub struct ConnectionRecord {
    pub conn_id: u64,
    pub remote_addr: SocketAddr,
    pub state: ConnState,
    pub agent_id: Option<AgentId>,
    pub pending_challenge: Option<PendingChallenge>,
    pub preauth_messages: u32,
}

impl ConnectionRecord {
    pub fn new(conn_id: u64, remote_addr: SocketAddr) -> Self {
        Self {
            conn_id,
            remote_addr,
            state: ConnState::PreAuth,
            agent_id: None,
            pending_challenge: None,
            preauth_messages: 0,
        }
    }
}

// =============================================================================
// BAN LIST
// =============================================================================

/// `spec.md` §4.8: "ban is persistent and also closes any live connection
/// of the target."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub target: String,
    pub banned_at_ms: u64,
    pub reason: String,
}

/// Maximum on-disk size before a ban list file is rejected unread.
const MAX_BANLIST_FILE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanList {
    bans: HashMap<String, BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self { bans: HashMap::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let meta = std::fs::metadata(&path)?;
        if meta.len() > MAX_BANLIST_FILE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("ban list file too large: {} bytes", meta.len()),
            ));
        }
        let data = std::fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn ban(&mut self, target: String, reason: String) {
        self.bans.insert(
            target.clone(),
            BanEntry { target, banned_at_ms: now_ms(), reason },
        );
    }

    pub fn unban(&mut self, target: &str) -> bool {
        self.bans.remove(target).is_some()
    }

    pub fn is_banned(&self, target: &str) -> bool {
        self.bans.contains_key(target)
    }

    pub fn list(&self) -> Vec<&BanEntry> {
        self.bans.values().collect()
    }
}

// =============================================================================
// ALLOWLIST
// =============================================================================

/// `spec.md` §4.8: "Allowlist is opt-in: when enabled, IDENTIFY is
/// rejected unless the pubkey ... is present."
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    enabled: bool,
    approved_pubkeys: HashSet<PublicKeyHex>,
}

impl Allowlist {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, approved_pubkeys: HashSet::new() }
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), std::io::Error> {
        let data = std::fs::read(path)?;
        let pubkeys: Vec<String> =
            serde_json::from_slice(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.approved_pubkeys = pubkeys.into_iter().collect();
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_approved(&self, pubkey: &str) -> bool {
        !self.enabled || self.approved_pubkeys.contains(pubkey)
    }

    pub fn approve(&mut self, pubkey: PublicKeyHex) {
        self.approved_pubkeys.insert(pubkey);
    }
}

// =============================================================================
// ADMIN AUTHENTICATION
// =============================================================================

/// Constant-time-ish shared-secret comparison for `ADMIN_KICK`/`ADMIN_BAN`/
/// `ADMIN_UNBAN`. `spec.md` §4.8.
pub fn check_admin_key(configured: &Option<String>, supplied: &str) -> bool {
    match configured {
        Some(expected) => {
            expected.len() == supplied.len()
                && expected
                    .bytes()
                    .zip(supplied.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_list_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        let mut list = BanList::new();
        list.ban("aaaa1111".to_string(), "spam".to_string());
        list.save(&path).unwrap();

        let loaded = BanList::load(&path).unwrap();
        assert!(loaded.is_banned("aaaa1111"));
        assert!(!loaded.is_banned("bbbb2222"));
    }

    #[test]
    fn unban_removes_entry() {
        let mut list = BanList::new();
        list.ban("aaaa1111".to_string(), "spam".to_string());
        assert!(list.unban("aaaa1111"));
        assert!(!list.is_banned("aaaa1111"));
    }

    #[test]
    fn allowlist_disabled_approves_everything() {
        let allowlist = Allowlist::new(false);
        assert!(allowlist.is_approved("anything"));
    }

    #[test]
    fn allowlist_enabled_rejects_unknown_pubkey() {
        let mut allowlist = Allowlist::new(true);
        allowlist.approve("aabbcc".to_string());
        assert!(allowlist.is_approved("aabbcc"));
        assert!(!allowlist.is_approved("ddeeff"));
    }

    #[test]
    fn admin_key_check() {
        let configured = Some("secret".to_string());
        assert!(check_admin_key(&configured, "secret"));
        assert!(!check_admin_key(&configured, "wrong"));
        assert!(!check_admin_key(&None, "secret"));
    }
}
