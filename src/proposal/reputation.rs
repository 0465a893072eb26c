//! ELO rating, K-factor, and escrow settlement. `spec.md` §4.7.

use crate::types::{now_ms, RATING_FLOOR};
use serde::{Deserialize, Serialize};

/// Expected score for `self` against `opponent` under standard ELO.
pub fn expected_score(rating_self: i64, rating_opponent: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_opponent - rating_self) as f64 / 400.0))
}

/// `<30 -> 32`, `30-99 -> 24`, `>=100 -> 16`. `spec.md` §4.7.
pub fn k_factor(completed_transactions: u64) -> f64 {
    match completed_transactions {
        0..=29 => 32.0,
        30..=99 => 24.0,
        _ => 16.0,
    }
}

/// `K_eff = K * min(1 + log10(amount + 1), 3)`; unpriced proposals
/// (`amount` absent, passed as `0.0`) leave `K_eff = K`.
pub fn effective_k(k: f64, amount: f64) -> f64 {
    if amount <= 0.0 {
        return k;
    }
    k * (1.0 + (amount + 1.0).log10()).min(3.0)
}

/// Per-agent rating ledger entry. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRecord {
    pub rating: i64,
    pub transactions: u64,
    pub updated_ms: u64,
}

impl Default for RatingRecord {
    fn default() -> Self {
        Self { rating: crate::types::DEFAULT_RATING, transactions: 0, updated_ms: now_ms() }
    }
}

impl RatingRecord {
    /// Apply a signed delta, clamping to the floor and bumping the
    /// transaction count. `spec.md` §3: "floor 100".
    pub fn apply_delta(&mut self, delta: i64) {
        self.rating = (self.rating + delta).max(RATING_FLOOR);
        self.transactions += 1;
        self.updated_ms = now_ms();
    }
}

/// `max(1, round(K_eff * (1 - E)))`, halved to resist inflation.
/// `spec.md` §4.7 and seed scenario 3.
pub fn completion_gain(rating_self: i64, rating_opponent: i64, transactions: u64, amount: f64) -> i64 {
    let e = expected_score(rating_self, rating_opponent);
    let k_eff = effective_k(k_factor(transactions), amount);
    let raw = (k_eff * (1.0 - e) / 2.0).round() as i64;
    raw.max(1)
}

/// `max(1, round(K_eff * E))` — the at-fault party's loss in a unilateral
/// dispute. `spec.md` §4.7.
pub fn dispute_loss(rating_self: i64, rating_opponent: i64, transactions: u64, amount: f64) -> i64 {
    let e = expected_score(rating_self, rating_opponent);
    let k_eff = effective_k(k_factor(transactions), amount);
    (k_eff * e).round().max(1.0) as i64
}

/// Both parties' rating deltas for a `COMPLETE` settlement.
/// `spec.md` §4.6/§4.7: symmetric positive-sum gain.
pub fn settle_complete(a: &RatingRecord, b: &RatingRecord, amount: f64) -> (i64, i64) {
    let gain_a = completion_gain(a.rating, b.rating, a.transactions, amount);
    let gain_b = completion_gain(b.rating, a.rating, b.transactions, amount);
    (gain_a, gain_b)
}

/// `(loser_delta, winner_delta)` for a unilateral dispute where `loser` is
/// the at-fault party and `winner` is the disputer. The disputer gains
/// half the loser's loss, per the canonical reading of `spec.md` §4.7's
/// two divergent descriptions (documented as an open question).
pub fn settle_dispute_unilateral(loser: &RatingRecord, winner: &RatingRecord, amount: f64) -> (i64, i64) {
    let loss = dispute_loss(loser.rating, winner.rating, loser.transactions, amount);
    let gain = (loss as f64 / 2.0).round() as i64;
    (-loss, gain)
}

/// `(party_a_delta, party_b_delta)` for a court `mutual`-fault verdict:
/// both lose their computed amounts, escrow burned rather than
/// transferred. `spec.md` §4.7.
pub fn settle_dispute_mutual(a: &RatingRecord, b: &RatingRecord, amount: f64) -> (i64, i64) {
    let loss_a = dispute_loss(a.rating, b.rating, a.transactions, amount);
    let loss_b = dispute_loss(b.rating, a.rating, b.transactions, amount);
    (-loss_a, -loss_b)
}

// =============================================================================
// ESCROW
// =============================================================================

/// `spec.md` §4.7: "Escrow hooks are emitted as named events ... to a
/// pluggable sink; no synchronous blocking on external systems."
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EscrowEvent {
    #[serde(rename = "escrow:created")]
    Created { proposal_id: String, agent: String, amount: i64 },
    #[serde(rename = "escrow:released")]
    Released { proposal_id: String, agent: String, amount: i64 },
    #[serde(rename = "settlement:completion")]
    SettlementCompletion { proposal_id: String, agent: String, delta: i64 },
    #[serde(rename = "settlement:dispute")]
    SettlementDispute { proposal_id: String, agent: String, delta: i64 },
}

/// Destination for escrow/settlement events. The default implementation
/// logs at `info`; a pluggable sink can be swapped in to forward to an
/// external ledger without the settlement call site blocking on it.
pub trait EscrowSink: Send + Sync {
    fn emit(&self, event: EscrowEvent);
}

#[derive(Debug, Default)]
pub struct TracingEscrowSink;

impl EscrowSink for TracingEscrowSink {
    fn emit(&self, event: EscrowEvent) {
        tracing::info!(?event, "escrow event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_scenario_positive_sum_completion() {
        // spec.md §8 seed scenario 3.
        let a = RatingRecord { rating: 1200, transactions: 0, updated_ms: 0 };
        let b = RatingRecord { rating: 1200, transactions: 0, updated_ms: 0 };
        let (gain_a, gain_b) = settle_complete(&a, &b, 10.0);
        assert_eq!(gain_a, 16);
        assert_eq!(gain_b, 16);
    }

    #[test]
    fn k_factor_tiers() {
        assert_eq!(k_factor(0), 32.0);
        assert_eq!(k_factor(29), 32.0);
        assert_eq!(k_factor(30), 24.0);
        assert_eq!(k_factor(99), 24.0);
        assert_eq!(k_factor(100), 16.0);
    }

    #[test]
    fn unpriced_proposal_leaves_k_unchanged() {
        assert_eq!(effective_k(32.0, 0.0), 32.0);
    }

    #[test]
    fn rating_never_drops_below_floor() {
        let mut record = RatingRecord { rating: 101, transactions: 5, updated_ms: 0 };
        record.apply_delta(-50);
        assert_eq!(record.rating, RATING_FLOOR);
    }

    #[test]
    fn dispute_transfers_half_loss_to_disputer() {
        let loser = RatingRecord { rating: 1200, transactions: 10, updated_ms: 0 };
        let winner = RatingRecord { rating: 1200, transactions: 10, updated_ms: 0 };
        let (loser_delta, winner_delta) = settle_dispute_unilateral(&loser, &winner, 0.0);
        assert!(loser_delta < 0);
        assert_eq!(winner_delta, (-loser_delta) / 2);
    }
}
