// SPDX-License-Identifier: MIT

//! Graph builder - collects nodes and edges and validates them into a
//! [`CompiledGraph`]

use std::collections::HashMap;
use std::sync::Arc;

use super::edges::EdgeTable;
use super::executor::{CompiledGraph, GraphParts};
use super::types::{Branch, Edge, END, START};
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::workflow::node::Node;
use crate::workflow::registry::NodeRegistry;
use crate::workflow::state::StateSchema;

/// Build a label-to-node mapping for [`GraphBuilder::add_conditional_edges`]
pub fn mapping<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(label, node)| (label.to_string(), node.to_string()))
        .collect()
}

/// Mutable graph definition. Consumed by [`GraphBuilder::compile`].
pub struct GraphBuilder {
    name: String,
    schema: Arc<StateSchema>,
    registry: NodeRegistry,
    edges: EdgeTable,
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, schema: StateSchema) -> Self {
        Self {
            name: name.into(),
            schema: Arc::new(schema),
            registry: NodeRegistry::new(),
            edges: EdgeTable::new(),
            config: GraphConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_node(&mut self, name: &str, node: Arc<dyn Node>) -> Result<&mut Self> {
        if name == START || name == END {
            return Err(GraphError::config(format!(
                "'{}' is a reserved node name",
                name
            )));
        }
        self.registry.register(name, node)?;
        Ok(self)
    }

    /// Unconditional edge. `add_edge(START, n)` designates `n` as the entry.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<&mut Self> {
        self.edges.add_fixed_edge(from, to)?;
        Ok(self)
    }

    /// Edge whose successor is chosen by `branch` after `from` runs.
    ///
    /// Scalar results are looked up in `mapping` when one is given, and
    /// otherwise taken as node names.
    pub fn add_conditional_edges<B>(
        &mut self,
        from: &str,
        branch: B,
        mapping: Option<HashMap<String, String>>,
    ) -> Result<&mut Self>
    where
        B: Branch + 'static,
    {
        self.edges
            .add_conditional_edge(from, Arc::new(branch), mapping)?;
        Ok(self)
    }

    /// Conditional edge that fans out to `targets`.
    ///
    /// The targets are validated at compile time and tell the scheduler where
    /// to continue when the branch dispatches nothing.
    pub fn add_fan_out_edges<B>(&mut self, from: &str, branch: B, targets: &[&str]) -> Result<&mut Self>
    where
        B: Branch + 'static,
    {
        let identity = mapping(targets.iter().map(|t| (*t, *t)));
        self.add_conditional_edges(from, branch, Some(identity))
    }

    pub fn set_entry_point(&mut self, node: &str) -> Result<&mut Self> {
        self.edges.set_entry(node)?;
        Ok(self)
    }

    pub fn set_finish_point(&mut self, node: &str) -> Result<&mut Self> {
        self.edges.set_finish(node)?;
        Ok(self)
    }

    /// Validate the definition and freeze it
    pub fn compile(self) -> Result<CompiledGraph> {
        self.config.validate()?;

        let entry = self
            .edges
            .entry()
            .ok_or(GraphError::MissingEntryPoint)?
            .to_string();
        self.require_node(&entry)?;

        let mut sources: Vec<(&str, &Edge)> = self.edges.iter().collect();
        sources.sort_by_key(|(from, _)| *from);
        for (from, edge) in sources {
            self.require_node(from)?;
            match edge {
                Edge::Fixed(to) => self.require_target(to)?,
                Edge::Conditional(conditional) => {
                    for to in conditional.destinations() {
                        self.require_target(&to)?;
                    }
                }
            }
        }

        let mut names: Vec<&str> = self.registry.names().collect();
        names.sort();
        if let Some(dangling) = names.into_iter().find(|n| self.edges.get(n).is_none()) {
            return Err(GraphError::DanglingNode(dangling.to_string()));
        }

        log::info!(
            "Compiled graph '{}' with {} nodes, entry '{}'",
            self.name,
            self.registry.len(),
            entry
        );

        Ok(CompiledGraph::from_parts(GraphParts {
            name: self.name,
            schema: self.schema,
            registry: self.registry,
            edges: self.edges,
            entry,
            config: self.config,
        }))
    }

    fn require_node(&self, name: &str) -> Result<()> {
        if self.registry.contains(name) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(name.to_string()))
        }
    }

    fn require_target(&self, name: &str) -> Result<()> {
        if name == END {
            Ok(())
        } else {
            self.require_node(name)
        }
    }
}
