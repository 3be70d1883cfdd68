// SPDX-License-Identifier: MIT

//! Nested graphs and bounded retry loops
//!
//! A subgraph is a [`CompiledGraph`] called from inside a parent node. It keeps
//! its own schema and state; the parent node projects values in and out.

use async_trait::async_trait;
use std::fmt;

use crate::error::{NodeError, Result};
use crate::workflow::graph::{mapping, CompiledGraph, Route, END};
use crate::workflow::node::Node;
use crate::workflow::state::{Update, WorkflowState};

/// Run `graph` to completion against `input`
pub async fn run_subgraph(graph: &CompiledGraph, input: Update) -> Result<WorkflowState> {
    log::debug!("Entering subgraph '{}'", graph.name());
    graph.invoke(input).await
}

/// A parent node that runs a nested graph.
///
/// `input` maps the parent's state to the subgraph's initial update; `output`
/// maps the subgraph's final state to the parent's partial update.
pub struct SubgraphNode<I, O> {
    graph: CompiledGraph,
    input: I,
    output: O,
}

impl<I, O> SubgraphNode<I, O>
where
    I: Fn(&WorkflowState) -> std::result::Result<Update, NodeError> + Send + Sync,
    O: Fn(WorkflowState) -> std::result::Result<Update, NodeError> + Send + Sync,
{
    pub fn new(graph: CompiledGraph, input: I, output: O) -> Self {
        Self {
            graph,
            input,
            output,
        }
    }
}

#[async_trait]
impl<I, O> Node for SubgraphNode<I, O>
where
    I: Fn(&WorkflowState) -> std::result::Result<Update, NodeError> + Send + Sync,
    O: Fn(WorkflowState) -> std::result::Result<Update, NodeError> + Send + Sync,
{
    async fn run(&self, state: WorkflowState) -> std::result::Result<Update, NodeError> {
        let input = (self.input)(&state)?;
        let output = run_subgraph(&self.graph, input).await?;
        (self.output)(output)
    }
}

/// Two-way decision of a retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Continue,
    End,
}

impl LoopDecision {
    /// Label routed through the loop's conditional edge
    pub fn label(&self) -> &'static str {
        match self {
            LoopDecision::Continue => "continue",
            LoopDecision::End => "end",
        }
    }
}

impl fmt::Display for LoopDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a retry loop stands after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Incomplete with attempts left
    Working,
    /// Completion flag set
    Done,
    /// Ceiling reached without completion
    Exhausted,
}

/// Bounded retry: stop once complete or after `ceiling` attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    ceiling: u64,
}

impl RetryPolicy {
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn decide(&self, is_complete: bool, attempts: u64) -> LoopDecision {
        if is_complete || attempts >= self.ceiling {
            LoopDecision::End
        } else {
            LoopDecision::Continue
        }
    }

    pub fn outcome(&self, is_complete: bool, attempts: u64) -> LoopOutcome {
        if is_complete {
            LoopOutcome::Done
        } else if attempts >= self.ceiling {
            LoopOutcome::Exhausted
        } else {
            LoopOutcome::Working
        }
    }

    /// Label mapping for a loop that returns to `worker` on `continue`
    pub fn mapping(worker: &str) -> std::collections::HashMap<String, String> {
        mapping([(LoopDecision::Continue.label(), worker), (LoopDecision::End.label(), END)])
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl From<&crate::config::LoopConfig> for RetryPolicy {
    fn from(config: &crate::config::LoopConfig) -> Self {
        Self::new(config.ceiling)
    }
}

/// Branch function for a retry loop.
///
/// Reads a boolean completion flag and an integer attempt counter from the
/// state; a missing flag counts as `false`, a missing counter as `0`.
pub fn retry_branch(
    policy: RetryPolicy,
    complete_field: &str,
    counter_field: &str,
) -> impl Fn(&WorkflowState) -> Route + Send + Sync + 'static {
    let complete_field = complete_field.to_string();
    let counter_field = counter_field.to_string();
    move |state: &WorkflowState| {
        let is_complete = state
            .get(&complete_field)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let attempts = state
            .get(&counter_field)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let decision = policy.decide(is_complete, attempts);
        log::debug!(
            "Retry loop at attempt {}/{}: {:?}",
            attempts,
            policy.ceiling(),
            policy.outcome(is_complete, attempts)
        );
        Route::to(decision.label())
    }
}
