//! Eligible-arbiter filtering and seeded Fisher-Yates panel selection.
//! `spec.md` §4.9.

use crate::crypto::sha256_concat;
use crate::types::{AgentId, Presence, ARBITER_MIN_RATING, ARBITER_MIN_TRANSACTIONS};

/// One candidate's standing, as the world actor sees it.
pub struct ArbiterCandidate {
    pub agent: AgentId,
    pub presence: Presence,
    pub rating: i64,
    pub transactions: u64,
}

/// `spec.md` §4.9: "verified agent, not a party, not away, rating >=
/// 1200, >= 10 completed transactions." `busy` is deliberately NOT
/// disqualifying — the open question in `spec.md` §9 is resolved in favor
/// of the literal text, which names only `away`.
pub fn is_eligible(candidate: &ArbiterCandidate, parties: &[&str]) -> bool {
    !parties.contains(&candidate.agent.as_str())
        && candidate.presence != Presence::Away
        && candidate.rating >= ARBITER_MIN_RATING
        && candidate.transactions >= ARBITER_MIN_TRANSACTIONS
}

pub fn eligible_arbiters(candidates: &[ArbiterCandidate], parties: &[&str]) -> Vec<AgentId> {
    let mut pool: Vec<AgentId> = candidates
        .iter()
        .filter(|c| is_eligible(c, parties))
        .map(|c| c.agent.clone())
        .collect();
    pool.sort();
    pool
}

/// Compute the court's selection seed: `SHA-256(proposal_id || disputant_nonce || server_nonce)`.
pub fn selection_seed(proposal_id: &str, disputant_nonce: &str, server_nonce: &str) -> [u8; 32] {
    sha256_concat(&[proposal_id.as_bytes(), disputant_nonce.as_bytes(), server_nonce.as_bytes()])
}

/// Derive the `i`-th pseudo-random 64-bit word from `seed` by rehashing
/// `seed || i`. Used as the entropy stream for the Fisher-Yates shuffle
/// below instead of a general-purpose seeded PRNG crate, since only a
/// finite, reproducible stream of swap indices is needed.
fn stream_word(seed: &[u8; 32], index: u64) -> u64 {
    let digest = sha256_concat(&[seed, &index.to_le_bytes()]);
    u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"))
}

/// Seeded Fisher-Yates shuffle of a deterministically pre-sorted pool;
/// the first three entries become the panel. `spec.md` §4.9: "Seed and
/// server_nonce are published in PANEL_FORMED so any party can reproduce
/// the selection."
pub fn select_panel(seed: &[u8; 32], eligible_sorted: &[AgentId]) -> Vec<AgentId> {
    let mut pool = eligible_sorted.to_vec();
    for i in (1..pool.len()).rev() {
        let j = (stream_word(seed, i as u64) % (i as u64 + 1)) as usize;
        pool.swap(i, j);
    }
    pool.into_iter().take(3).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(agent: &str, presence: Presence, rating: i64, transactions: u64) -> ArbiterCandidate {
        ArbiterCandidate { agent: agent.to_string(), presence, rating, transactions }
    }

    #[test]
    fn filters_parties_and_away_and_thresholds() {
        let candidates = vec![
            candidate("aaaa1111", Presence::Online, 1300, 20),
            candidate("bbbb2222", Presence::Away, 1300, 20),
            candidate("cccc3333", Presence::Busy, 1300, 20),
            candidate("dddd4444", Presence::Online, 1100, 20),
            candidate("eeee5555", Presence::Online, 1300, 5),
            candidate("ffff6666", Presence::Online, 1300, 20),
        ];
        let eligible = eligible_arbiters(&candidates, &["ffff6666"]);
        assert_eq!(eligible, vec!["aaaa1111".to_string(), "cccc3333".to_string()]);
    }

    #[test]
    fn selection_is_reproducible_from_seed() {
        let seed = selection_seed("p1", "aaaa", "bbbb");
        let pool = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let panel1 = select_panel(&seed, &pool);
        let panel2 = select_panel(&seed, &pool);
        assert_eq!(panel1, panel2);
        assert_eq!(panel1.len(), 3);
    }

    #[test]
    fn different_seeds_can_produce_different_panels() {
        let seed_a = selection_seed("p1", "nonce-a", "server-a");
        let seed_b = selection_seed("p2", "nonce-b", "server-b");
        let pool = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()];
        assert_ne!(select_panel(&seed_a, &pool), select_panel(&seed_b, &pool));
    }
}
