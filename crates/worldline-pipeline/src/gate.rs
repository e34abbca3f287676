//! Confirmation gates and cancellation
//!
//! A gated stage's proposal is parked until a [`Confirmer`] answers. The
//! default transport is [`ChannelConfirmer`]: requests go out over an mpsc
//! channel, each carrying a oneshot for the reply. Dropping a
//! [`PendingGate`] without answering withdraws it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use worldline_state::{Delta, DeltaError};

use crate::error::GateError;
use crate::stage::{GateRequest, StageContext};

/// Verbs that would present a proposal as an order
pub const DIRECTIVE_VERBS: [&str; 5] = ["directs", "orders", "commands", "authorizes", "executes"];

/// Reject summaries phrased as directives
///
/// # Errors
/// Returns `DeltaError::Policy` naming the first directive verb found
pub fn check_framing(summary: &str) -> Result<(), DeltaError> {
    let directive = summary
        .split(|c: char| !c.is_ascii_alphabetic())
        .map(str::to_ascii_lowercase)
        .find(|word| DIRECTIVE_VERBS.contains(&word.as_str()));
    match directive {
        Some(verb) => Err(DeltaError::Policy(format!(
            "gate summary uses directive verb '{verb}'"
        ))),
        None => Ok(()),
    }
}

/// A confirmer's decision
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// Commit the proposal as is
    Approve,
    /// Commit this replacement instead
    ApproveWithEdits(Delta),
    /// Skip the stage; the turn continues
    Decline { reason: String },
}

/// Answers gate requests
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Decide on `request`
    ///
    /// # Errors
    /// Returns `GateError::Withdrawn` if nobody can answer
    async fn confirm(
        &self,
        request: &GateRequest,
        ctx: &StageContext,
    ) -> Result<Confirmation, GateError>;
}

/// A gate waiting for an answer on the far side of a [`ChannelConfirmer`]
#[derive(Debug)]
pub struct PendingGate {
    request: GateRequest,
    context: StageContext,
    reply: oneshot::Sender<Confirmation>,
}

impl PendingGate {
    /// Proposal under review
    #[inline]
    #[must_use]
    pub fn request(&self) -> &GateRequest {
        &self.request
    }

    /// Stage that produced it
    #[inline]
    #[must_use]
    pub fn context(&self) -> &StageContext {
        &self.context
    }

    /// Answer with an arbitrary decision
    ///
    /// Returns false if the orchestrator stopped waiting.
    pub fn respond(self, decision: Confirmation) -> bool {
        self.reply.send(decision).is_ok()
    }

    /// Approve as proposed
    pub fn approve(self) -> bool {
        self.respond(Confirmation::Approve)
    }

    /// Approve a modified delta
    pub fn approve_with_edits(self, delta: Delta) -> bool {
        self.respond(Confirmation::ApproveWithEdits(delta))
    }

    /// Decline; the stage is skipped
    pub fn decline(self, reason: impl Into<String>) -> bool {
        self.respond(Confirmation::Decline {
            reason: reason.into(),
        })
    }
}

/// Forwards gate requests to whoever holds the receiving end
#[derive(Debug, Clone)]
pub struct ChannelConfirmer {
    sender: mpsc::Sender<PendingGate>,
}

impl ChannelConfirmer {
    /// Create new confirmer and the queue of pending gates
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PendingGate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Confirmer for ChannelConfirmer {
    async fn confirm(
        &self,
        request: &GateRequest,
        ctx: &StageContext,
    ) -> Result<Confirmation, GateError> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .send(PendingGate {
                request: request.clone(),
                context: ctx.clone(),
                reply,
            })
            .await
            .map_err(|_| GateError::Withdrawn)?;
        answer.await.map_err(|_| GateError::Withdrawn)
    }
}

/// Turn-wide cancellation flag
///
/// Clones share the flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create new, uncancelled signal
    #[must_use]
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Check if cancellation was requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageMode;
    use worldline_state::Version;

    fn ctx() -> StageContext {
        StageContext {
            turn: 1,
            index: 0,
            stage: "decide".into(),
            mode: StageMode::Gated,
            phase: None,
            turn_start: Version::GENESIS,
            snapshot: Version::GENESIS,
            attempt: 1,
        }
    }

    #[test]
    fn framing_guard() {
        assert!(check_framing("Staff recommends screening the convoy").is_ok());
        assert!(check_framing("").is_ok());
        let err = check_framing("Commander ORDERS an immediate strike").unwrap_err();
        assert_eq!(
            err,
            DeltaError::Policy("gate summary uses directive verb 'orders'".into())
        );
        // substrings of longer words are fine
        assert!(check_framing("reorders the watch bill").is_ok());
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let (confirmer, mut pending) = ChannelConfirmer::new(1);
        let request = GateRequest::new(Delta::new(), "recommends holding");

        let answer = tokio::spawn(async move {
            let gate = pending.recv().await.unwrap();
            assert_eq!(gate.context().stage, "decide");
            assert_eq!(gate.request().summary, "recommends holding");
            gate.decline("insufficient evidence")
        });

        let decision = confirmer.confirm(&request, &ctx()).await.unwrap();
        assert!(answer.await.unwrap());
        assert_eq!(
            decision,
            Confirmation::Decline {
                reason: "insufficient evidence".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_gate_is_withdrawn() {
        let (confirmer, mut pending) = ChannelConfirmer::new(1);
        tokio::spawn(async move {
            drop(pending.recv().await);
        });
        let res = confirmer
            .confirm(&GateRequest::new(Delta::new(), "recommends"), &ctx())
            .await;
        assert_eq!(res, Err(GateError::Withdrawn));
    }

    #[tokio::test]
    async fn closed_queue_is_withdrawn() {
        let (confirmer, pending) = ChannelConfirmer::new(1);
        drop(pending);
        let res = confirmer
            .confirm(&GateRequest::new(Delta::new(), "recommends"), &ctx())
            .await;
        assert_eq!(res, Err(GateError::Withdrawn));
    }

    #[tokio::test]
    async fn cancel_signal_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        assert!(!signal.is_cancelled());
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
        // already cancelled resolves immediately
        signal.cancelled().await;
    }
}
