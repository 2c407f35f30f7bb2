// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! DAG (Directed Acyclic Graph) builder for pipeline dependencies
//!
//! Builds and validates dependency graphs for pipeline stages,
//! ensuring proper execution order and detecting cycles.

use petgraph::algo::{has_path_connecting, kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::errors::DeployflowError;
use crate::pipeline::Pipeline;

/// Builder for stage dependency DAGs
pub struct DagBuilder {
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    /// Stage names in declaration order
    names: Vec<String>,
}

impl DagBuilder {
    /// Create a new DAG builder
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            names: Vec::new(),
        }
    }

    /// Build a DAG from a pipeline
    pub fn build(pipeline: &Pipeline) -> Result<Self, DeployflowError> {
        let mut builder = Self::new();

        // Add all stages as nodes
        for (idx, stage) in pipeline.stages.iter().enumerate() {
            if builder.name_to_index.contains_key(&stage.name) {
                return Err(DeployflowError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
            let node = builder.graph.add_node(idx);
            builder.name_to_index.insert(stage.name.clone(), node);
            builder.names.push(stage.name.clone());
        }

        // Add dependency edges
        for stage in &pipeline.stages {
            let stage_node = builder.name_to_index[&stage.name];

            for dep_name in &stage.depends_on {
                let dep_node = builder.name_to_index.get(dep_name).ok_or_else(|| {
                    DeployflowError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;

                if !builder.graph.contains_edge(*dep_node, stage_node) {
                    builder.graph.add_edge(*dep_node, stage_node, ());
                }
            }
        }

        builder.validate_acyclic()?;

        Ok(builder)
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> Result<(), DeployflowError> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(_) => Err(DeployflowError::CircularDependency {
                stages: self.find_cycle_members(),
            }),
        }
    }

    /// Find the stages of the first cycle, in declaration order
    fn find_cycle_members(&self) -> Vec<String> {
        let mut cycles: Vec<Vec<usize>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|n| self.graph.contains_edge(*n, *n))
            })
            .map(|component| {
                let mut members: Vec<usize> = component.iter().map(|n| self.graph[*n]).collect();
                members.sort_unstable();
                members
            })
            .collect();
        cycles.sort();

        cycles
            .into_iter()
            .next()
            .map(|members| members.into_iter().map(|i| self.names[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Get topologically sorted stage indices
    ///
    /// Ties are broken by declaration order so the order is stable across runs.
    pub fn topological_order(&self) -> Result<Vec<usize>, DeployflowError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: Vec<usize> = (0..self.names.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());

        while !ready.is_empty() {
            ready.sort_unstable_by(|a, b| b.cmp(a));
            let Some(idx) = ready.pop() else { break };
            order.push(idx);

            let node = self.name_to_index[&self.names[idx]];
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let next_idx = self.graph[next];
                in_degree[next_idx] -= 1;
                if in_degree[next_idx] == 0 {
                    ready.push(next_idx);
                }
            }
        }

        if order.len() != self.names.len() {
            return Err(DeployflowError::CircularDependency {
                stages: self.find_cycle_members(),
            });
        }

        Ok(order)
    }

    /// Get topologically sorted stage names
    pub fn topological_order_names(&self) -> Result<Vec<String>, DeployflowError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|i| self.names[i].clone())
            .collect())
    }

    /// Get dependencies for a stage (stages that must run before it)
    pub fn dependencies(&self, stage_name: &str) -> Option<Vec<String>> {
        self.neighbors(stage_name, Direction::Incoming)
    }

    /// Get dependents for a stage (stages that depend on it)
    pub fn dependents(&self, stage_name: &str) -> Option<Vec<String>> {
        self.neighbors(stage_name, Direction::Outgoing)
    }

    fn neighbors(&self, stage_name: &str, direction: Direction) -> Option<Vec<String>> {
        let node = self.name_to_index.get(stage_name)?;
        let mut indices: Vec<usize> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n])
            .collect();
        indices.sort_unstable();
        Some(indices.into_iter().map(|i| self.names[i].clone()).collect())
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let Some(node_a) = self.name_to_index.get(stage_a) else {
            return false;
        };
        let Some(node_b) = self.name_to_index.get(stage_b) else {
            return false;
        };

        stage_a != stage_b && has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<(usize, usize)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from], self.graph[to]))
            .collect();
        edges.sort_unstable();
        edges
            .into_iter()
            .map(|(from, to)| (self.names[from].as_str(), self.names[to].as_str()))
            .collect()
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for name in &self.names {
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for (from, to) in self.edges() {
            out.push_str(&format!("    {} --> {}\n", from, to));
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edges() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        // Isolated nodes have no edges to imply them
        for name in &self.names {
            let node = self.name_to_index[name];
            if self.graph.neighbors_undirected(node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", name));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution order
    pub fn to_text(&self, pipeline: &Pipeline) -> Result<String, DeployflowError> {
        let order = self.topological_order()?;
        let mut out = String::new();

        for (i, idx) in order.iter().enumerate() {
            let stage = &pipeline.stages[*idx];
            let deps = self.dependencies(&stage.name).unwrap_or_default();

            out.push_str(&format!("{}. {}", i + 1, stage.name));

            if let Some(ref env) = stage.environment {
                out.push_str(&format!(" → {}", env));
            }

            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        Ok(out)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
