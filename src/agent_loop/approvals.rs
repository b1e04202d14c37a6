//! Approval types and the gate every function call passes through.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Tool approval policy for a loop.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Consult the confirmation handler for every call.
    #[default]
    Ask,
    /// Approve every call without asking.
    AutoApprove,
    /// Deny every call without asking.
    Deny,
}

/// What to do with one function call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalOutcome {
    Approve,
    /// Approve, and approve later calls of the same tool without asking.
    ApproveForSession,
    Deny,
    /// Cancel the whole run.
    AbortRun,
}

/// Decision returned by a [`ConfirmationHandler`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub outcome: ApprovalOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            outcome: ApprovalOutcome::Approve,
            explanation: None,
        }
    }

    pub fn approve_for_session() -> Self {
        Self {
            outcome: ApprovalOutcome::ApproveForSession,
            explanation: None,
        }
    }

    pub fn deny(explanation: impl Into<String>) -> Self {
        Self {
            outcome: ApprovalOutcome::Deny,
            explanation: Some(explanation.into()),
        }
    }

    pub fn abort_run() -> Self {
        Self {
            outcome: ApprovalOutcome::AbortRun,
            explanation: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(
            self.outcome,
            ApprovalOutcome::Approve | ApprovalOutcome::ApproveForSession
        )
    }
}

/// A function call awaiting a decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub tool_name: String,
    /// Raw JSON arguments as sent by the model.
    pub arguments: String,
}

/// External collaborator deciding whether a call may run.
///
/// May suspend for as long as it likes; the loop waits without a timeout but
/// stops waiting when the run is cancelled.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

type ConfirmFn = dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync;

/// Closure-based confirmation handler.
#[derive(Clone)]
pub struct FnConfirmation {
    handler: Arc<ConfirmFn>,
}

impl FnConfirmation {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ApprovalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApprovalDecision> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |request| Box::pin(handler(request))),
        }
    }
}

#[async_trait]
impl ConfirmationHandler for FnConfirmation {
    async fn confirm(&self, request: &ApprovalRequest) -> ApprovalDecision {
        (self.handler)(request.clone()).await
    }
}

impl std::fmt::Debug for FnConfirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnConfirmation").finish_non_exhaustive()
    }
}

/// Applies the policy, consults the handler, and remembers session approvals.
pub(crate) struct ApprovalGate {
    policy: ApprovalPolicy,
    handler: Option<Arc<dyn ConfirmationHandler>>,
    session_approved: Mutex<HashSet<String>>,
}

impl ApprovalGate {
    pub(crate) fn new(
        policy: ApprovalPolicy,
        handler: Option<Arc<dyn ConfirmationHandler>>,
    ) -> Self {
        Self {
            policy,
            handler,
            session_approved: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        match self.policy {
            ApprovalPolicy::AutoApprove => return ApprovalDecision::approve(),
            ApprovalPolicy::Deny => return ApprovalDecision::deny("denied by approval policy"),
            ApprovalPolicy::Ask => {}
        }
        if self.is_session_approved(&request.tool_name) {
            return ApprovalDecision::approve();
        }
        let Some(handler) = &self.handler else {
            tracing::warn!(tool = %request.tool_name, "no confirmation handler; denying call");
            return ApprovalDecision::deny("no confirmation handler configured");
        };
        let decision = handler.confirm(request).await;
        if decision.outcome == ApprovalOutcome::ApproveForSession {
            self.session_approved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request.tool_name.clone());
        }
        tracing::debug!(
            call_id = %request.call_id,
            tool = %request.tool_name,
            outcome = %decision.outcome,
            "approval decided"
        );
        decision
    }

    fn is_session_approved(&self, tool_name: &str) -> bool {
        self.session_approved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tool_name)
    }
}
