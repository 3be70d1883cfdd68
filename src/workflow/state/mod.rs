// SPDX-License-Identifier: MIT

//! State management for graph workflows
//!
//! This module provides:
//! - `StateSchema` - declares fields, their types and merge policies
//! - `WorkflowState` - per-run state storage with reducer support
//! - `Update` - a node's partial update
//! - `SharedState` - the run's shared state behind a serialized merge point

mod schema;
mod shared;
mod store;

pub use schema::{FieldType, ReducerType, StateFieldDef, StateSchema};
pub use shared::SharedState;
pub use store::{Update, WorkflowState};
