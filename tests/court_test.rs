//! End-to-end court protocol scenarios, driven directly through `World`
//! the way `src/world.rs`'s own `#[cfg(test)]` module exercises proposals
//! and channels. Commit-reveal and panel selection each have focused unit
//! tests in `src/court/`; these cover the seams between `World` and
//! `DisputeBook`/`panel` that unit tests alone can't reach.

use swarmrelay::codec::ServerMessage;
use swarmrelay::config::RelayConfig;
use swarmrelay::court;
use swarmrelay::crypto::{self, Keypair};
use swarmrelay::net::connection::{Allowlist, BanList};
use swarmrelay::persist::RatingsTable;
use swarmrelay::timers::TimerHandle;
use swarmrelay::types::now_ms;
use swarmrelay::world::World;
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

fn admit(world: &mut World, conn_id: u64, rx: &mut mpsc::UnboundedReceiver<ServerMessage>, kp: &Keypair) -> String {
    world.identify_pubkey(conn_id, kp.public_key_hex(), 30).unwrap();
    let (nonce_hex, challenge_id) = match rx.try_recv().unwrap() {
        ServerMessage::Challenge { nonce, challenge_id, .. } => (nonce, challenge_id),
        other => panic!("expected challenge, got {other:?}"),
    };
    let timestamp = now_ms();
    let signing = crypto::signing_string(&["AGENTCHAT_AUTH", &nonce_hex, &challenge_id, &timestamp.to_string()]);
    let sig = kp.sign(signing.as_bytes());
    world.verify_identity(conn_id, &challenge_id, &hex::encode(sig), timestamp).unwrap();
    let _welcome = rx.try_recv().unwrap();
    kp.stable_id()
}

/// Runs one PROPOSAL/ACCEPT/COMPLETE cycle between two already-verified
/// agents, solely to bump their transaction counts past
/// `ARBITER_MIN_TRANSACTIONS` so they qualify as arbiters.
fn run_filler_proposal(world: &mut World, from: &Keypair, to: &Keypair) {
    let from_id = from.stable_id();
    let to_addr = format!("@{}", to.stable_id());

    let msg = swarmrelay::proposal::engine::proposal_signing_string(&to_addr, "filler", None, None, None, None);
    let sig = from.sign(msg.as_bytes());
    let proposal_id = world.create_proposal(&from_id, to_addr, "filler".into(), None, None, None, None, &hex::encode(sig)).unwrap();

    let to_id = to.stable_id();
    let accept_msg = swarmrelay::proposal::engine::accept_signing_string(&proposal_id, None);
    let accept_sig = to.sign(accept_msg.as_bytes());
    world.accept_proposal(&to_id, &proposal_id, None, None, &hex::encode(accept_sig)).unwrap();

    let complete_msg = swarmrelay::proposal::engine::complete_signing_string(&proposal_id, None);
    let complete_sig = from.sign(complete_msg.as_bytes());
    world.complete_proposal(&from_id, &proposal_id, None, &hex::encode(complete_sig)).unwrap();
}

fn file_a_dispute(world: &mut World, disputant_kp: &Keypair, proposal_id: &str) -> (String, String) {
    let disputant = disputant_kp.stable_id();
    let nonce = "reveal-nonce";
    let commitment = hex::encode(crypto::sha256(nonce.as_bytes()));
    let msg = court::dispute_intent_signing_string(proposal_id, "never delivered", &commitment);
    let sig = disputant_kp.sign(msg.as_bytes());
    let dispute_id = world.dispute_intent(&disputant, proposal_id, "never delivered".into(), commitment, &hex::encode(sig)).unwrap();
    (dispute_id, nonce.to_string())
}

#[test]
fn dispute_with_no_eligible_arbiters_falls_back() {
    let mut world = new_world();
    let mut rx_a = connect(&mut world, 1);
    let mut rx_b = connect(&mut world, 2);
    let kp_a = Keypair::generate();
    let kp_b = Keypair::generate();
    let alice = admit(&mut world, 1, &mut rx_a, &kp_a);
    let _bob = admit(&mut world, 2, &mut rx_b, &kp_b);

    let to = format!("@{}", kp_b.stable_id());
    let msg = swarmrelay::proposal::engine::proposal_signing_string(&to, "task", None, None, None, None);
    let sig = kp_a.sign(msg.as_bytes());
    let proposal_id = world.create_proposal(&alice, to, "task".into(), None, None, None, None, &hex::encode(sig)).unwrap();

    let (dispute_id, nonce) = file_a_dispute(&mut world, &kp_a, &proposal_id);
    let eligible = world.dispute_reveal(&dispute_id, &nonce).unwrap();
    assert!(eligible.is_empty(), "alice and bob are the only verified agents; neither can arbitrate their own dispute");

    world.finish_reveal(&dispute_id, eligible).unwrap();
    let fallback_a = rx_a.try_recv().unwrap();
    assert!(matches!(fallback_a, ServerMessage::DisputeFallback { .. }));
}

#[test]
fn dispute_with_a_seated_panel_settles_on_majority_verdict() {
    let mut world = new_world();
    let mut rx_a = connect(&mut world, 1);
    let mut rx_b = connect(&mut world, 2);
    let kp_a = Keypair::generate();
    let kp_b = Keypair::generate();
    let alice = admit(&mut world, 1, &mut rx_a, &kp_a);
    let bob = admit(&mut world, 2, &mut rx_b, &kp_b);

    // Three more verified agents, pumped past the arbiter transaction
    // floor by completing filler proposals among themselves.
    let arbiters: Vec<Keypair> = (0..3)
        .map(|i| {
            let kp = Keypair::generate();
            let mut rx = connect(&mut world, 100 + i);
            admit(&mut world, 100 + i, &mut rx, &kp);
            kp
        })
        .collect();
    for _ in 0..swarmrelay::types::ARBITER_MIN_TRANSACTIONS {
        run_filler_proposal(&mut world, &arbiters[0], &arbiters[1]);
        run_filler_proposal(&mut world, &arbiters[1], &arbiters[2]);
    }

    let to = format!("@{bob}");
    let msg = swarmrelay::proposal::engine::proposal_signing_string(&to, "task", Some(10.0), Some("USD"), None, None);
    let sig = kp_a.sign(msg.as_bytes());
    let proposal_id = world.create_proposal(&alice, to, "task".into(), Some(10.0), Some("USD".into()), None, None, &hex::encode(sig)).unwrap();
    let accept_msg = swarmrelay::proposal::engine::accept_signing_string(&proposal_id, None);
    let accept_sig = kp_b.sign(accept_msg.as_bytes());
    world.accept_proposal(&bob, &proposal_id, None, None, &hex::encode(accept_sig)).unwrap();

    let (dispute_id, nonce) = file_a_dispute(&mut world, &kp_a, &proposal_id);
    let eligible = world.dispute_reveal(&dispute_id, &nonce).unwrap();
    assert_eq!(eligible.len(), 3);
    world.finish_reveal(&dispute_id, eligible).unwrap();

    for kp in &arbiters {
        let id = kp.stable_id();
        let accept_msg = court::arbiter_accept_signing_string(&dispute_id);
        let accept_sig = kp.sign(accept_msg.as_bytes());
        world.arbiter_accept(&id, &dispute_id, &hex::encode(accept_sig)).unwrap();
    }

    for kp in [&kp_a, &kp_b] {
        let id = kp.stable_id();
        let items = vec![];
        let evidence_msg = court::evidence_signing_string(&dispute_id, &items).unwrap();
        let evidence_sig = kp.sign(evidence_msg.as_bytes());
        world.submit_evidence(&id, &dispute_id, items, "no further comment".into(), &hex::encode(evidence_sig)).unwrap();
    }

    let rating_before = world.ratings().get_or_default(&bob).rating;
    for kp in &arbiters {
        let id = kp.stable_id();
        let vote_msg = court::vote_signing_string(&dispute_id, "disputant");
        let vote_sig = kp.sign(vote_msg.as_bytes());
        world.arbiter_vote(&id, &dispute_id, "disputant", &hex::encode(vote_sig)).unwrap();
    }

    let rating_after = world.ratings().get_or_default(&bob).rating;
    assert!(rating_after < rating_before, "respondent found at fault should lose rating");
}
