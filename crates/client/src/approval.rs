//! Approval mediator: the per-connection consent state machine.
//!
//! Standing `always-allow` / `always-deny` decisions short-circuit the
//! prompt. Requests for the *same* operation serialize on a per-operation
//! lock, so a second caller waits for the first prompt and then re-evaluates
//! the (possibly now-populated) standing decision instead of issuing a
//! duplicate prompt. Requests for different operations proceed independently.

use crate::spec::OperationDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one consent prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ApproveOnce,
    ApproveAlways,
    DenyOnce,
    DenyAlways,
}

/// Persisted "always" choice for one operation on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandingDecision {
    AlwaysAllow,
    AlwaysDeny,
}

/// Why an invocation was denied. Denial is data, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    DeniedOnce,
    DeniedAlways,
    Cancelled,
}

/// What the host UI gets to show for a pending prompt. Ephemeral; exists
/// only for the duration of the prompt.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub operation_id: String,
    pub tool_name: String,
    pub params: Value,
    pub destructive: bool,
    pub hint: Option<String>,
}

/// Host-supplied consent channel.
#[async_trait]
pub trait ConsentHandler: Send + Sync {
    async fn request(&self, request: ApprovalRequest) -> Decision;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Allowed,
    Denied(DenialReason),
}

#[derive(Default)]
pub(crate) struct ApprovalMediator {
    standing: parking_lot::Mutex<HashMap<String, StandingDecision>>,
    op_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApprovalMediator {
    /// Resolve consent for one call.
    ///
    /// Cancellation while queued or while the prompt is pending resolves as
    /// a cancelled denial and never writes a standing decision.
    pub(crate) async fn request_approval(
        &self,
        op: &OperationDescriptor,
        request: ApprovalRequest,
        handler: &dyn ConsentHandler,
        cancel: Option<&CancellationToken>,
    ) -> Verdict {
        if let Some(verdict) = self.standing_verdict(&op.operation_id) {
            return verdict;
        }

        let lock = self.operation_lock(&op.operation_id);
        let guard = match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => return Verdict::Denied(DenialReason::Cancelled),
                    guard = lock.lock() => guard,
                }
            }
            None => lock.lock().await,
        };

        // A prompt that resolved while we were queued may have populated a
        // standing decision.
        if let Some(verdict) = self.standing_verdict(&op.operation_id) {
            drop(guard);
            return verdict;
        }

        let prompt = handler.request(request);
        let decision = match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        drop(guard);
                        return Verdict::Denied(DenialReason::Cancelled);
                    }
                    decision = prompt => decision,
                }
            }
            None => prompt.await,
        };
        // Persist while still holding the lock, so a queued caller's
        // standing re-check cannot run before the decision lands.
        let verdict = match decision {
            Decision::ApproveOnce => Verdict::Allowed,
            Decision::ApproveAlways => {
                self.persist(op, StandingDecision::AlwaysAllow);
                Verdict::Allowed
            }
            Decision::DenyOnce => Verdict::Denied(DenialReason::DeniedOnce),
            Decision::DenyAlways => {
                self.persist(op, StandingDecision::AlwaysDeny);
                Verdict::Denied(DenialReason::DeniedAlways)
            }
        };
        drop(guard);
        verdict
    }

    fn standing_verdict(&self, operation_id: &str) -> Option<Verdict> {
        match self.standing.lock().get(operation_id)? {
            StandingDecision::AlwaysAllow => Some(Verdict::Allowed),
            StandingDecision::AlwaysDeny => Some(Verdict::Denied(DenialReason::DeniedAlways)),
        }
    }

    fn operation_lock(&self, operation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .lock()
            .entry(operation_id.to_string())
            .or_default()
            .clone()
    }

    /// `*-always` decisions persist only where the site permits blanket
    /// approval for the operation.
    fn persist(&self, op: &OperationDescriptor, decision: StandingDecision) {
        if !op.blanket_approval_allowed {
            tracing::debug!(
                operation = %op.operation_id,
                "standing decision not persisted (blanket approval not allowed)"
            );
            return;
        }
        self.standing
            .lock()
            .insert(op.operation_id.clone(), decision);
    }

    /// Snapshot of the standing decisions, for host-side persistence.
    pub(crate) fn standing_decisions(&self) -> HashMap<String, StandingDecision> {
        self.standing.lock().clone()
    }

    /// Restore standing decisions persisted by the host.
    pub(crate) fn restore_standing_decisions(
        &self,
        decisions: HashMap<String, StandingDecision>,
    ) {
        *self.standing.lock() = decisions;
    }
}
