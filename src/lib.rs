// SPDX-License-Identifier: MIT

//! kinetic-graph: a graph-based task orchestration engine
//!
//! Nodes read a snapshot of a shared, schema-typed state and return partial
//! updates. Edges are fixed or conditional; a conditional edge may fan out to
//! any number of concurrent branches whose updates are merged back through
//! per-field reducers.

pub mod config;
pub mod error;
pub mod helpdesk;
pub mod workflow;

pub use config::{BranchFailurePolicy, ConfigLoader, EngineConfig, GraphConfig, LoopConfig};
pub use error::{GraphError, NodeError, Result};
pub use workflow::graph::{
    mapping, Branch, CompiledGraph, Dispatch, GraphBuilder, GraphStream, Route, StepSnapshot, END,
    START,
};
pub use workflow::node::{blocking_fn, node_fn, Node};
pub use workflow::state::{FieldType, ReducerType, StateFieldDef, StateSchema, Update, WorkflowState};
pub use workflow::subgraph::{
    retry_branch, run_subgraph, LoopDecision, LoopOutcome, RetryPolicy, SubgraphNode,
};
