//! Graph routing type definitions
//!
//! This module defines edges, branch functions and the shapes a branch
//! function may return.

use std::collections::HashMap;
use std::sync::Arc;

use crate::workflow::state::{Update, WorkflowState};

/// Virtual source node; `add_edge(START, n)` designates `n` as the entry
pub const START: &str = "__start__";

/// Terminal marker; reaching it ends the run
pub const END: &str = "__end__";

/// One fan-out instruction: run `node` with `payload` laid over a copy of the
/// shared state.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub node: String,
    pub payload: Update,
}

impl Dispatch {
    pub fn new(node: impl Into<String>, payload: Update) -> Self {
        Self {
            node: node.into(),
            payload,
        }
    }
}

/// Result of a branch function
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A single successor: a mapping label, a node name, or [`END`]
    To(String),
    /// Fan out to each node against an unmodified copy of the state
    Many(Vec<String>),
    /// Fan out with a payload per branch
    Send(Vec<Dispatch>),
}

impl Route {
    pub fn to(target: impl Into<String>) -> Self {
        Route::To(target.into())
    }

    pub fn end() -> Self {
        Route::To(END.to_string())
    }
}

/// Branching function evaluated against a read-only view of the state
pub trait Branch: Send + Sync {
    fn route(&self, state: &WorkflowState) -> Route;
}

impl<F> Branch for F
where
    F: Fn(&WorkflowState) -> Route + Send + Sync,
{
    fn route(&self, state: &WorkflowState) -> Route {
        self(state)
    }
}

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    /// Unconditional successor (possibly [`END`])
    Fixed(String),
    /// Successor chosen at run time
    Conditional(ConditionalEdge),
}

/// A branch function plus an optional label-to-node mapping
#[derive(Clone)]
pub struct ConditionalEdge {
    pub branch: Arc<dyn Branch>,
    /// Translates scalar labels to node names; also declares the nodes the
    /// branch can lead to
    pub mapping: Option<HashMap<String, String>>,
}

impl ConditionalEdge {
    /// Nodes this edge is declared to lead to, sorted and deduplicated
    pub fn destinations(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .mapping
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets.dedup();
        targets
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Fixed(to) => f.debug_tuple("Fixed").field(to).finish(),
            Edge::Conditional(c) => f
                .debug_struct("Conditional")
                .field("mapping", &c.mapping)
                .finish(),
        }
    }
}

/// What the dispatcher resolved after a node ran
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Continue with one node, or finish when it is [`END`]
    Next(String),
    /// Run every dispatch concurrently, then continue at `converge`
    FanOut {
        branches: Vec<Dispatch>,
        converge: String,
    },
}
