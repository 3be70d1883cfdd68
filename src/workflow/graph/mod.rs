// SPDX-License-Identifier: MIT

//! Graph construction and execution
//!
//! Nodes and edges are collected by a [`GraphBuilder`], validated once, and
//! frozen into a [`CompiledGraph`] that runs them superstep by superstep.

pub mod builder;
mod dispatcher;
pub mod edges;
pub mod executor;
pub mod types;

pub use builder::{mapping, GraphBuilder};
pub use dispatcher::Dispatcher;
pub use executor::{CompiledGraph, GraphStream, StepSnapshot};
pub use types::{Branch, Dispatch, Route, Transition, END, START};
