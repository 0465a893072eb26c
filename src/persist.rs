//! Atomic JSON persistence for the two durable artefacts named in
//! `spec.md` §6: the ratings table and the pubkey -> stable-id map.
//!
//! Grounded on the teacher's `BanList` load/save shape (`net/connection.rs`
//! in this crate), generalised from a single `fs::write` to a
//! temp-file-then-rename sequence so a crash mid-write never leaves a
//! truncated ratings file behind.

use crate::proposal::RatingRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Maximum on-disk size before a ratings file is rejected unread.
const MAX_RATINGS_FILE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatingsTable {
    ratings: HashMap<String, RatingRecord>,
    /// pubkey (hex) -> stable id, remembered across sessions.
    pubkey_map: HashMap<String, String>,
}

impl RatingsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_RATINGS_FILE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ratings file too large: {} bytes", meta.len()),
            ));
        }
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write via a temp file in the same directory, then rename, so a
    /// reader never observes a partially-written ratings table.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), io::Error> {
        let path = path.as_ref();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let tmp_path: PathBuf = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("ratings")
        ));
        let data = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, path)
    }

    pub fn get_or_default(&self, stable_id: &str) -> RatingRecord {
        self.ratings.get(stable_id).cloned().unwrap_or_default()
    }

    pub fn put(&mut self, stable_id: String, record: RatingRecord) {
        self.ratings.insert(stable_id, record);
    }

    pub fn remember_pubkey(&mut self, pubkey_hex: String, stable_id: String) {
        self.pubkey_map.insert(pubkey_hex, stable_id);
    }

    pub fn stable_id_for_pubkey(&self, pubkey_hex: &str) -> Option<&str> {
        self.pubkey_map.get(pubkey_hex).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_ratings_and_pubkey_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings.json");

        let mut table = RatingsTable::new();
        table.put("aaaa1111".to_string(), RatingRecord { rating: 1250, transactions: 3, updated_ms: 100 });
        table.remember_pubkey("deadbeef".to_string(), "aaaa1111".to_string());
        table.save(&path).unwrap();

        let loaded = RatingsTable::load(&path).unwrap();
        assert_eq!(loaded.get_or_default("aaaa1111").rating, 1250);
        assert_eq!(loaded.stable_id_for_pubkey("deadbeef"), Some("aaaa1111"));
    }

    #[test]
    fn missing_file_loads_as_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let table = RatingsTable::load(&path).unwrap();
        assert_eq!(table.get_or_default("anyone").rating, crate::types::DEFAULT_RATING);
    }

    #[test]
    fn unknown_agent_gets_default_rating() {
        let table = RatingsTable::new();
        let record = table.get_or_default("never-seen");
        assert_eq!(record.rating, crate::types::DEFAULT_RATING);
        assert_eq!(record.transactions, 0);
    }
}
