//! Deadline scheduling: every passive state transition in the relay is
//! driven by a timer that re-enters the world's mailbox as an event.
//! `spec.md` §5/§9.
//!
//! Grounded on the teacher's `RetryInfo` exponential-backoff idiom
//! (schedule-a-future-wakeup-by-duration, not by wall-clock polling), here
//! specialised to fixed TTLs rather than backoff since every deadline in
//! `spec.md` §4.9/§4.6/§4.4/§4.5 is a flat duration, not a retry count.

use crate::types::AgentId;
use std::time::Duration;

/// One outstanding deadline. The world actor is the only consumer; it
/// matches on `kind` and, if the referenced state is still in the phase
/// the timer was armed for, applies the corresponding transition.
/// Misfires for already-exited phases are absorbed as no-ops per
/// `spec.md` §7 ("timer misfires are absorbed").
#[derive(Debug, Clone)]
pub enum TimerEvent {
    ChallengeExpired { conn_id: u64 },
    ProposalExpired { proposal_id: String },
    FloorClaimExpired { channel: String, msg_id: String },
    IdlePrompt { channel: String },
    DisputeRevealExpired { dispute_id: String },
    DisputeArbiterResponseExpired { dispute_id: String },
    DisputeEvidenceExpired { dispute_id: String },
    DisputeVoteExpired { dispute_id: String },
}

/// A handle a connection or the world actor can use to fire a
/// [`TimerEvent`] back into the mailbox after `delay`, without blocking
/// the caller or holding any world state across the wait.
pub struct TimerHandle {
    sender: tokio::sync::mpsc::Sender<TimerEvent>,
}

impl TimerHandle {
    pub fn new(sender: tokio::sync::mpsc::Sender<TimerEvent>) -> Self {
        Self { sender }
    }

    /// Spawn a task that sleeps for `delay` then delivers `event`. Errors
    /// if the mailbox has since closed are swallowed: a shutting-down
    /// world has nothing left to absorb the misfire anyway.
    pub fn arm(&self, delay: Duration, event: TimerEvent) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(event).await;
        });
    }
}

/// Convenience for the idle prompter: a message synthesised by the
/// server rather than relayed from an agent. `spec.md` §4.5.
pub fn idle_prompt_sender() -> AgentId {
    "@server".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_after_delay() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let handle = TimerHandle::new(tx);
        handle.arm(Duration::from_millis(10), TimerEvent::ChallengeExpired { conn_id: 7 });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TimerEvent::ChallengeExpired { conn_id: 7 }));
    }
}
