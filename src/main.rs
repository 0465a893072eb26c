//! Swarmrelay server entry point: accepts WebSocket connections, parses
//! framed JSON into `ClientMessage`, and dispatches into the `World`
//! actor behind a single `tokio::sync::Mutex`. `spec.md` §5.
//!
//! Grounded on the teacher's `main.rs` shape: parse args, init tracing,
//! build the long-lived state, spawn background tasks, run an accept
//! loop, wait for `ctrl_c`.

use clap::Parser;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swarmrelay::codec::{parse_client_frame, ClientMessage, ParsedFrame, ServerMessage};
use swarmrelay::config::{Args, RelayConfig};
use swarmrelay::net::connection::{Allowlist, BanList, ConnState};
use swarmrelay::net::rate_limit::{ConnectionRateLimits, PerIpLimiter};
use swarmrelay::persist::RatingsTable;
use swarmrelay::timers::{TimerEvent, TimerHandle};
use swarmrelay::types::{now_ms, MAX_FRAME_BYTES};
use swarmrelay::world::World;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Send a close frame with a distinguishable code so the peer can tell a
/// policy-driven disconnect (oversize frame, rate overflow) apart from a
/// plain drop. Best-effort: the connection is ending either way.
async fn close_connection(write: &Arc<Mutex<WsSink>>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame { code, reason: Cow::Borrowed(reason) };
    let _ = write.lock().await.send(Message::Close(Some(frame))).await;
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swarmrelay=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig::from(&args);

    let ratings = RatingsTable::load(&args.ratings_path).unwrap_or_else(|e| {
        warn!("failed to load ratings from {}: {e}, starting fresh", args.ratings_path.display());
        RatingsTable::new()
    });
    let ban_list = if args.ban_list_path.exists() {
        BanList::load(&args.ban_list_path).unwrap_or_else(|e| {
            warn!("failed to load ban list from {}: {e}, starting fresh", args.ban_list_path.display());
            BanList::new()
        })
    } else {
        BanList::new()
    };
    let mut allowlist = Allowlist::new(args.allowlist_enabled);
    if let Some(path) = &args.allowlist_path {
        allowlist.load(path)?;
    }

    if !args.identity_path.exists() {
        let keypair = swarmrelay::crypto::Keypair::generate();
        swarmrelay::crypto::save_identity(&args.identity_path, &keypair)?;
    }
    let server_identity = swarmrelay::crypto::load_identity(&args.identity_path)?;
    info!("server identity: {}", server_identity.public_key_hex());

    let (timer_tx, mut timer_rx) = tokio::sync::mpsc::channel(1024);
    let timers = TimerHandle::new(timer_tx);

    let world = Arc::new(Mutex::new(World::new(config.clone(), ratings, ban_list, allowlist, timers)));

    // Timer-driven transitions re-enter the world as events. `spec.md` §5/§9.
    {
        let world = world.clone();
        tokio::spawn(async move {
            while let Some(event) = timer_rx.recv().await {
                let mut world = world.lock().await;
                apply_timer_event(&mut world, event);
            }
        });
    }

    // Idle-channel sweep. `spec.md` §4.5.
    {
        let world = world.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                world.lock().await.sweep_idle_channels();
            }
        });
    }

    // Periodic save of the ratings table so a crash loses at most one
    // sweep interval of settlements.
    {
        let world = world.clone();
        let ratings_path = args.ratings_path.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let guard = world.lock().await;
                if let Err(e) = guard.ratings().save(&ratings_path) {
                    warn!("failed to save ratings: {e}");
                }
            }
        });
    }

    // Proposal-expiry sweep: cheaper than arming a timer per open
    // proposal when the set is small, and handles proposals created
    // before the current process started.
    {
        let world = world.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let mut guard = world.lock().await;
                guard.sweep_expired_proposals();
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("swarmrelay listening on {addr}");

    let conn_counter = Arc::new(AtomicU64::new(1));
    let per_ip = Arc::new(Mutex::new(PerIpLimiter::new(config.max_connections_per_ip)));
    let ban_list_path = Arc::new(args.ban_list_path.clone());

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);
        let world = world.clone();
        let per_ip = per_ip.clone();
        let config = config.clone();
        let ban_list_path = ban_list_path.clone();
        tokio::spawn(async move {
            if !per_ip.lock().await.try_acquire(remote_addr.ip()) {
                warn!("rejecting {remote_addr}: per-ip connection ceiling reached");
                return;
            }
            if let Err(e) = handle_connection(stream, remote_addr, conn_id, world.clone(), config, ban_list_path).await {
                warn!("connection {conn_id} ({remote_addr}) ended with error: {e}");
            }
            world.lock().await.disconnect(conn_id);
            per_ip.lock().await.release(remote_addr.ip());
        });
    }
}

fn apply_timer_event(world: &mut World, event: TimerEvent) {
    match event {
        TimerEvent::ChallengeExpired { .. } => {
            // Absorbed: `verify_identity` re-checks expiry itself, so a
            // stale challenge that never arrives needs no action here.
        }
        TimerEvent::ProposalExpired { proposal_id } => world.expire_proposal(&proposal_id),
        TimerEvent::FloorClaimExpired { .. } => {
            // Floor claims expire lazily on the next `claim_floor` call.
        }
        TimerEvent::IdlePrompt { .. } => world.sweep_idle_channels(),
        TimerEvent::DisputeRevealExpired { dispute_id } => world.expire_dispute_reveal(&dispute_id),
        TimerEvent::DisputeArbiterResponseExpired { dispute_id } => world.expire_dispute_arbiter_response(&dispute_id),
        TimerEvent::DisputeEvidenceExpired { dispute_id } => world.expire_dispute_evidence(&dispute_id),
        TimerEvent::DisputeVoteExpired { dispute_id } => {
            if let Err(e) = world.expire_dispute_deliberation(&dispute_id) {
                warn!("failed to expire deliberation for {dispute_id}: {e}");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    conn_id: u64,
    world: Arc<Mutex<World>>,
    config: RelayConfig,
    ban_list_path: Arc<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (write, mut read) = ws_stream.split();
    let write = Arc::new(Mutex::new(write));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();
    world.lock().await.register_connection(conn_id, remote_addr, tx);

    let writer = {
        let write = write.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.lock().await.send(Message::Text(msg.to_json())).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut limits = ConnectionRateLimits::new(config.preauth_budget, config.postauth_budget);

    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(_) => break,
        };
        let text = match frame {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
        };
        if text.len() > MAX_FRAME_BYTES {
            warn!("closing connection {conn_id} ({remote_addr}): oversize frame ({} bytes)", text.len());
            close_connection(&write, CloseCode::Size, "frame exceeds maximum size").await;
            break;
        }

        let verified = {
            let guard = world.lock().await;
            matches!(guard.connection_state(conn_id), Some(ConnState::Verified) | Some(ConnState::Admitted))
        };
        let budget_ok = if verified { limits.post_auth.try_consume() } else { limits.pre_auth.try_consume() };
        if !budget_ok {
            if verified {
                let guard = world.lock().await;
                guard_send(&guard, conn_id, ServerMessage::error("RATE_LIMITED", "message budget exceeded"));
                continue;
            } else {
                warn!("closing connection {conn_id} ({remote_addr}): pre-auth rate budget exceeded");
                close_connection(&write, CloseCode::Policy, "pre-auth message budget exceeded").await;
                break;
            }
        }

        let msg = match parse_client_frame(&text) {
            ParsedFrame::Message(msg) => msg,
            ParsedFrame::MalformedJson => {
                debug!("connection {conn_id} ({remote_addr}): dropping malformed JSON frame");
                continue;
            }
            ParsedFrame::InvalidMessage => {
                let guard = world.lock().await;
                guard_send(&guard, conn_id, ServerMessage::error("INVALID_MSG", "unknown message type or missing field"));
                continue;
            }
        };

        if matches!(msg, ClientMessage::Msg { .. }) && !limits.msg_type.try_consume() {
            let guard = world.lock().await;
            guard_send(&guard, conn_id, ServerMessage::error("RATE_LIMITED", "per-type message budget exceeded"));
            continue;
        }
        if matches!(msg, ClientMessage::FileChunk { .. }) && !limits.file_chunk_type.try_consume() {
            let guard = world.lock().await;
            guard_send(&guard, conn_id, ServerMessage::error("RATE_LIMITED", "per-type message budget exceeded"));
            continue;
        }

        let mut guard = world.lock().await;
        dispatch(&mut guard, conn_id, msg, &config, &ban_list_path);
    }

    writer.abort();
    Ok(())
}

fn guard_send(world: &World, conn_id: u64, msg: ServerMessage) {
    world.send_public(conn_id, msg);
}

/// Route one parsed `ClientMessage` into the corresponding `World` call,
/// translating `Err(RelayError)` into an `ERROR` wire frame. `spec.md`
/// §4.2/§7.
fn dispatch(world: &mut World, conn_id: u64, msg: ClientMessage, config: &RelayConfig, ban_list_path: &std::path::Path) {
    let agent_id = world.agent_for_connection(conn_id);

    macro_rules! require_agent {
        () => {
            match &agent_id {
                Some(id) => id.clone(),
                None => {
                    world.send_public(conn_id, ServerMessage::error("NOT_IDENTIFIED", "send IDENTIFY first"));
                    return;
                }
            }
        };
    }

    macro_rules! report {
        ($result:expr) => {
            if let Err(e) = $result {
                world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string()));
            }
        };
    }

    match msg {
        ClientMessage::Identify { pubkey, nick } => match pubkey {
            Some(pubkey) => report!(world.identify_pubkey(conn_id, pubkey, config.challenge_ttl_secs)),
            None => world.identify_ephemeral(conn_id, nick),
        },
        ClientMessage::VerifyIdentity { challenge_id, signature } => {
            let timestamp = now_ms();
            if let Err(e) = world.verify_identity(conn_id, &challenge_id, &signature, timestamp) {
                world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string()));
            }
        }
        ClientMessage::Join { channel } => {
            let agent = require_agent!();
            report!(world.join_channel(&agent, &channel));
        }
        ClientMessage::Leave { channel } => {
            let agent = require_agent!();
            world.leave_channel(&agent, &channel);
        }
        ClientMessage::Msg { to, content, msg_id } => {
            let agent = require_agent!();
            report!(world.send_message(&agent, &to, &content, msg_id, config.max_content_chars));
        }
        ClientMessage::ListChannels => world.list_channels(conn_id),
        ClientMessage::ListAgents => world.list_agents(conn_id),
        ClientMessage::CreateChannel { channel, invite_only } => {
            require_agent!();
            report!(world.create_channel(&channel, invite_only));
        }
        ClientMessage::Invite { channel, agent: invitee } => {
            let agent = require_agent!();
            report!(world.invite(&agent, &channel, invitee));
        }
        ClientMessage::SetNick { nick } => {
            let agent = require_agent!();
            report!(world.set_nick(&agent, nick));
        }
        ClientMessage::SetPresence { presence } => {
            let agent = require_agent!();
            match World::parse_presence(&presence) {
                Ok(presence) => report!(world.set_presence(&agent, presence)),
                Err(e) => world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string())),
            }
        }
        ClientMessage::Ping => world.send_public(conn_id, ServerMessage::Pong),
        ClientMessage::RespondingTo { msg_id, started_at, channel } => {
            let agent = require_agent!();
            report!(world.responding_to(&agent, &channel, &msg_id, started_at));
        }
        ClientMessage::RegisterSkills { skills } => {
            let agent = require_agent!();
            let count = world.register_skills(&agent, skills);
            world.send_public(conn_id, ServerMessage::SkillsRegistered { count });
        }
        ClientMessage::SearchSkills { query } => {
            let agents = world.search_skills(&query);
            world.send_public(conn_id, ServerMessage::SearchResults { agents });
        }
        ClientMessage::Proposal { to, task, amount, currency, payment_code, expires, elo_stake: _, signature } => {
            let agent = require_agent!();
            report!(world.create_proposal(&agent, to, task, amount, currency, payment_code, expires, &signature).map(|_| ()));
        }
        ClientMessage::Accept { proposal_id, payment_code, elo_stake, signature } => {
            let agent = require_agent!();
            report!(world.accept_proposal(&agent, &proposal_id, payment_code, elo_stake, &signature));
        }
        ClientMessage::Reject { proposal_id, signature } => {
            let agent = require_agent!();
            report!(world.reject_proposal(&agent, &proposal_id, &signature));
        }
        ClientMessage::Complete { proposal_id, proof, signature } => {
            let agent = require_agent!();
            report!(world.complete_proposal(&agent, &proposal_id, proof, &signature));
        }
        ClientMessage::Dispute { proposal_id, reason, signature } => {
            let agent = require_agent!();
            report!(world.dispute_proposal(&agent, &proposal_id, reason, &signature));
        }
        ClientMessage::DisputeIntent { proposal_id, reason, commitment, signature } => {
            let agent = require_agent!();
            report!(world.dispute_intent(&agent, &proposal_id, reason, commitment, &signature).map(|_| ()));
        }
        ClientMessage::DisputeReveal { dispute_id, nonce } => {
            require_agent!();
            match world.dispute_reveal(&dispute_id, &nonce) {
                Ok(eligible) => {
                    if let Err(e) = world.finish_reveal(&dispute_id, eligible) {
                        world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string()));
                    }
                }
                Err(e) => world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string())),
            }
        }
        ClientMessage::Evidence { dispute_id, items, statement, signature } => {
            let agent = require_agent!();
            report!(world.submit_evidence(&agent, &dispute_id, items, statement, &signature));
        }
        ClientMessage::ArbiterAccept { dispute_id, signature } => {
            let agent = require_agent!();
            report!(world.arbiter_accept(&agent, &dispute_id, &signature));
        }
        ClientMessage::ArbiterDecline { dispute_id, reason, signature } => {
            let agent = require_agent!();
            report!(world.arbiter_decline(&agent, &dispute_id, reason, &signature).map(|_| ()));
        }
        ClientMessage::ArbiterVote { dispute_id, verdict, signature } => {
            let agent = require_agent!();
            report!(world.arbiter_vote(&agent, &dispute_id, &verdict, &signature));
        }
        ClientMessage::AdminKick { admin_key, target } => report!(world.admin_kick(&admin_key, &target)),
        ClientMessage::AdminBan { admin_key, target, reason } => {
            if let Err(e) = world.admin_ban(&admin_key, &target, reason) {
                world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string()));
            } else if let Err(e) = world.ban_list().save(ban_list_path) {
                warn!("failed to persist ban list to {}: {e}", ban_list_path.display());
            }
        }
        ClientMessage::AdminUnban { admin_key, target } => {
            match world.admin_unban(&admin_key, &target) {
                Err(e) => world.send_public(conn_id, ServerMessage::error(e.code(), e.to_string())),
                Ok(_) => {
                    if let Err(e) = world.ban_list().save(ban_list_path) {
                        warn!("failed to persist ban list to {}: {e}", ban_list_path.display());
                    }
                }
            }
        }
        ClientMessage::FileChunk { .. } => {
            // Accepted and rate-limited per `spec.md` §4.3 but relayed
            // content is out of scope for the coordination plane itself.
            require_agent!();
        }
    }
}

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            if let Err(e) = run().await {
                error!("fatal: {e}");
                std::process::exit(1);
            }
            Ok(())
        })
}
