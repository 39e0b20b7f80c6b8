//! Resolves tool invocations held for human confirmation.
//!
//! A decision is read from the most recent user message. It applies to every
//! pending invocation that precedes that message. Approved invocations run
//! once (the [`ExecutionLedger`] remembers results by invocation id), rejected
//! ones get a placeholder result, and either way a `tool` message carrying the
//! result is placed right after the assistant message that made the call.

use crate::message::{InvocationState, Message, Role, ToolInvocation};
use dashmap::DashMap;
use parley_tools::ToolSet;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

pub const REJECTION_MESSAGE: &str = "User denied access to tool execution";

const APPROVAL_PREFIXES: &[&str] = &[
    "yes", "y", "approve", "approved", "confirm", "confirmed", "ok", "okay", "sure", "go ahead",
    "do it", "send it",
];
const REJECTION_PREFIXES: &[&str] = &[
    "no", "n", "deny", "denied", "reject", "rejected", "cancel", "stop", "don't", "dont", "do not",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Classify a user reply. `None` when the text expresses no decision.
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.trim().to_lowercase().replace('’', "'");
        let matches = |prefixes: &[&str]| {
            prefixes.iter().any(|p| {
                normalized
                    .strip_prefix(p)
                    .is_some_and(|rest| rest.chars().next().is_none_or(|c| !c.is_alphanumeric()))
            })
        };
        // Rejection first so "no, don't send it" is not read as "send it".
        if matches(REJECTION_PREFIXES) {
            return Some(Self::Reject);
        }
        if matches(APPROVAL_PREFIXES) {
            return Some(Self::Approve);
        }
        None
    }
}

/// Results of executed invocations, keyed by [`ToolInvocation::id`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionLedger {
    results: Arc<DashMap<String, serde_json::Value>>,
}

impl ExecutionLedger {
    pub fn get(&self, invocation_id: &str) -> Option<serde_json::Value> {
        self.results.get(invocation_id).map(|r| r.value().clone())
    }

    pub fn record(&self, invocation_id: &str, result: serde_json::Value) {
        self.results.insert(invocation_id.to_string(), result);
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub messages: Vec<Message>,
    pub executed: usize,
    pub rejected: usize,
    /// Still awaiting a decision; the caller re-presents these.
    pub still_pending: Vec<ToolInvocation>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallResolver {
    ledger: ExecutionLedger,
}

impl ToolCallResolver {
    #[tracing::instrument(level = "info", skip_all, fields(history_len = history.len()))]
    pub async fn resolve(
        &self,
        mut history: Vec<Message>,
        tools: &ToolSet,
        confirmation_required: &HashSet<String>,
    ) -> Resolution {
        let decision_at = history.iter().rposition(|m| m.role == Role::User);
        let decision = decision_at.and_then(|i| Decision::parse(&history[i].content));

        let mut executed = 0usize;
        let mut rejected = 0usize;
        let mut still_pending = Vec::new();
        // (assistant message index, tool messages to place after it)
        let mut inserts: Vec<(usize, Vec<Message>)> = Vec::new();

        for idx in 0..history.len() {
            if history[idx].role != Role::Assistant || history[idx].tool_invocations.is_empty() {
                continue;
            }
            let decided = decision_at.is_some_and(|d| idx < d);
            let mut produced = Vec::new();

            for inv in history[idx].tool_invocations.iter_mut() {
                match (&inv.state, decided.then_some(decision).flatten()) {
                    (InvocationState::Executed { .. } | InvocationState::Rejected { .. }, _) => {}
                    (InvocationState::PendingConfirmation, Some(Decision::Approve))
                    | (InvocationState::Approved, _) => {
                        if !confirmation_required.contains(&inv.tool_name) {
                            tracing::debug!(
                                tool_name = %inv.tool_name,
                                "approved tool no longer requires confirmation"
                            );
                        }
                        inv.state = InvocationState::Approved;
                        let result = self.run_tool(inv, tools).await;
                        produced.push(Message::tool_result(&inv.tool_call_id, &result));
                        inv.state = InvocationState::Executed { result };
                        executed += 1;
                    }
                    (InvocationState::PendingConfirmation, Some(Decision::Reject)) => {
                        let result = json!({ "error": REJECTION_MESSAGE });
                        produced.push(Message::tool_result(&inv.tool_call_id, &result));
                        inv.state = InvocationState::Rejected { result };
                        rejected += 1;
                        tracing::info!(
                            tool_call_id = %inv.tool_call_id,
                            tool_name = %inv.tool_name,
                            "tool invocation rejected by user"
                        );
                    }
                    (InvocationState::PendingConfirmation, None) => {
                        still_pending.push(inv.clone());
                    }
                }
            }

            if !produced.is_empty() {
                inserts.push((idx, produced));
            }
        }

        // Back to front so earlier indices stay valid.
        for (idx, produced) in inserts.into_iter().rev() {
            let mut at = idx + 1;
            while at < history.len() && history[at].role == Role::Tool {
                at += 1;
            }
            history.splice(at..at, produced);
        }

        tracing::info!(
            executed,
            rejected,
            still_pending = still_pending.len(),
            decision = ?decision,
            "tool call resolution finished"
        );
        Resolution {
            messages: history,
            executed,
            rejected,
            still_pending,
        }
    }

    /// Execute one invocation at most once. Failures become error results.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            invocation_id = %invocation.id,
            tool_call_id = %invocation.tool_call_id,
            tool_name = %invocation.tool_name
        )
    )]
    pub async fn run_tool(&self, invocation: &ToolInvocation, tools: &ToolSet) -> serde_json::Value {
        if let Some(result) = self.ledger.get(&invocation.id) {
            tracing::info!("tool call already executed; reusing recorded result");
            return result;
        }

        let result = match tools.get(&invocation.tool_name) {
            None => {
                tracing::error!("tool call referenced unknown tool");
                json!({ "error": format!("unknown tool: {}", invocation.tool_name) })
            }
            Some(tool) => {
                let started = Instant::now();
                match tool.execute(invocation.arguments.clone()).await {
                    Ok(out) => {
                        tracing::info!(
                            latency_ms = started.elapsed().as_millis() as u64,
                            "tool call executed"
                        );
                        out
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            latency_ms = started.elapsed().as_millis() as u64,
                            "tool call failed; recording error result"
                        );
                        json!({ "error": e.to_string() })
                    }
                }
            }
        };
        self.ledger.record(&invocation.id, result.clone());
        result
    }
}
