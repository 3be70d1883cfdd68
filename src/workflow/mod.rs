// SPDX-License-Identifier: MIT

pub mod graph;
pub mod node;
pub mod registry;
pub mod state;
pub mod subgraph;
