// SPDX-License-Identifier: MIT

//! Edge table: fixed and conditional edges plus the entry designation

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Branch, ConditionalEdge, Edge, END, START};
use crate::error::{GraphError, Result};

/// Outgoing edges keyed by source node. A node has at most one outgoing edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeTable {
    edges: HashMap<String, Edge>,
    entry: Option<String>,
}

impl EdgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unconditional edge. `from == START` designates the entry.
    pub fn add_fixed_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if from == START {
            return self.set_entry(to);
        }
        self.insert(from, Edge::Fixed(to.to_string()))
    }

    pub fn add_conditional_edge(
        &mut self,
        from: &str,
        branch: Arc<dyn Branch>,
        mapping: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.insert(from, Edge::Conditional(ConditionalEdge { branch, mapping }))
    }

    /// Designate a terminal node: after it runs, the run is done
    pub fn set_finish(&mut self, node: &str) -> Result<()> {
        self.insert(node, Edge::Fixed(END.to_string()))
    }

    pub fn set_entry(&mut self, node: &str) -> Result<()> {
        if let Some(existing) = &self.entry {
            return Err(GraphError::EntryPointAlreadySet(existing.clone()));
        }
        self.entry = Some(node.to_string());
        Ok(())
    }

    fn insert(&mut self, from: &str, edge: Edge) -> Result<()> {
        if from == END {
            return Err(GraphError::UnknownNode(from.to_string()));
        }
        if self.edges.contains_key(from) {
            return Err(GraphError::DuplicateEdge(from.to_string()));
        }
        self.edges.insert(from.to_string(), edge);
        Ok(())
    }

    pub fn get(&self, from: &str) -> Option<&Edge> {
        self.edges.get(from)
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Edge)> {
        self.edges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The static successor of `node`: its fixed edge target, if it has one
    pub fn static_successor(&self, node: &str) -> Option<&str> {
        match self.edges.get(node) {
            Some(Edge::Fixed(to)) => Some(to.as_str()),
            _ => None,
        }
    }
}
