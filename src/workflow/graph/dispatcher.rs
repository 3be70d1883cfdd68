// SPDX-License-Identifier: MIT

//! Resolves the transition out of a node

use super::edges::EdgeTable;
use super::types::{ConditionalEdge, Dispatch, Edge, Route, Transition, END};
use crate::error::{GraphError, Result};
use crate::workflow::registry::NodeRegistry;
use crate::workflow::state::{Update, WorkflowState};

/// Evaluates outgoing edges against the current state
pub struct Dispatcher<'a> {
    edges: &'a EdgeTable,
    registry: &'a NodeRegistry,
}

impl<'a> Dispatcher<'a> {
    pub fn new(edges: &'a EdgeTable, registry: &'a NodeRegistry) -> Self {
        Self { edges, registry }
    }

    /// Transition out of `from` given the state after `from` merged its update
    pub fn next(&self, from: &str, state: &WorkflowState) -> Result<Transition> {
        match self.edges.get(from) {
            Some(Edge::Fixed(to)) => Ok(Transition::Next(to.clone())),
            Some(Edge::Conditional(edge)) => self.evaluate(from, edge, state),
            None => Err(GraphError::DanglingNode(from.to_string())),
        }
    }

    fn evaluate(
        &self,
        from: &str,
        edge: &ConditionalEdge,
        state: &WorkflowState,
    ) -> Result<Transition> {
        match edge.branch.route(state) {
            Route::To(label) => {
                let target = self.resolve_label(edge, &label)?;
                log::debug!("Branch on '{}' selected '{}'", from, target);
                Ok(Transition::Next(target))
            }
            Route::Many(nodes) => {
                let branches = nodes
                    .into_iter()
                    .map(|node| Dispatch::new(node, Update::new()))
                    .collect();
                self.fan_out(from, edge, branches)
            }
            Route::Send(branches) => self.fan_out(from, edge, branches),
        }
    }

    /// Translate a scalar result to a node name
    fn resolve_label(&self, edge: &ConditionalEdge, label: &str) -> Result<String> {
        let target = match &edge.mapping {
            Some(mapping) => mapping
                .get(label)
                .cloned()
                .ok_or_else(|| GraphError::UnknownNode(label.to_string()))?,
            None => label.to_string(),
        };
        if target != END && !self.registry.contains(&target) {
            return Err(GraphError::UnknownNode(target));
        }
        Ok(target)
    }

    fn fan_out(
        &self,
        from: &str,
        edge: &ConditionalEdge,
        branches: Vec<Dispatch>,
    ) -> Result<Transition> {
        for branch in &branches {
            if !self.registry.contains(&branch.node) {
                return Err(GraphError::UnknownNode(branch.node.clone()));
            }
        }

        let converge = if branches.is_empty() {
            let declared = edge.destinations();
            if declared.is_empty() {
                log::warn!(
                    "Empty fan-out from '{}' declares no targets, finishing the run",
                    from
                );
                END.to_string()
            } else {
                self.convergence(from, declared.iter().map(String::as_str))?
            }
        } else {
            self.convergence(from, branches.iter().map(|b| b.node.as_str()))?
        };

        log::debug!(
            "Fan-out from '{}': {} branches converging on '{}'",
            from,
            branches.len(),
            converge
        );
        Ok(Transition::FanOut { branches, converge })
    }

    /// The single static successor shared by every target
    fn convergence<'n>(
        &self,
        from: &str,
        targets: impl Iterator<Item = &'n str>,
    ) -> Result<String> {
        let mut successors: Vec<String> = Vec::new();
        let mut conditional = false;
        for target in targets {
            let successor = match self.edges.static_successor(target) {
                Some(s) => s.to_string(),
                None => {
                    conditional = true;
                    format!("{} (conditional)", target)
                }
            };
            if !successors.contains(&successor) {
                successors.push(successor);
            }
        }

        if !conditional && successors.len() == 1 {
            return Ok(successors.remove(0));
        }
        Err(GraphError::DivergentFanOut {
            from: from.to_string(),
            successors,
        })
    }
}
