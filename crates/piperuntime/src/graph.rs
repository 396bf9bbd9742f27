//! Graph construction and validation.
//!
//! Nodes are partitioned by `parent_id` into one graph per sub-graph node
//! plus the implicit root graph. Each graph is a petgraph `DiGraph` with an
//! edge from every node to each id in its `needs`. Validation collects every
//! violation before reporting, so one run surfaces all configuration
//! mistakes at once.

use crate::registry::HandlerRegistry;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use pipecore::{ConfigError, NodeConfig, Violation, RESERVED_ROOT_ID};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One validated graph, with its layers in execution order.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    id: String,
    graph: DiGraph<String, ()>,
    layers: Vec<Vec<String>>,
}

impl GraphPlan {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Layers ordered dependencies first; ids inside a layer sorted.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Layer executed immediately before layer `index`, empty for the first.
    pub fn previous_layer(&self, index: usize) -> &[String] {
        match index {
            0 => &[],
            i => self.layers.get(i - 1).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

/// Every graph of a pipeline keyed by graph id (`RESERVED_ROOT_ID` for the root).
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    graphs: BTreeMap<String, GraphPlan>,
}

impl PipelineGraph {
    /// Validate `configs` and build one plan per graph. When a registry is
    /// given, handler references are checked against it too.
    pub fn build(
        configs: &[NodeConfig],
        registry: Option<&HandlerRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut violations = Vec::new();

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for config in configs {
            *counts.entry(config.get_id()).or_default() += 1;
        }
        let duplicates: Vec<String> = counts
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(id, _)| id.to_string())
            .collect();
        if !duplicates.is_empty() {
            violations.push(Violation::DuplicateId(duplicates));
        }
        if counts.contains_key(RESERVED_ROOT_ID) {
            violations.push(Violation::ReservedId(RESERVED_ROOT_ID.to_string()));
        }

        let mut by_id: HashMap<&str, &NodeConfig> = HashMap::new();
        for config in configs {
            by_id.entry(config.get_id()).or_insert(config);
        }

        let mut groups: BTreeMap<String, Vec<&NodeConfig>> = BTreeMap::new();
        groups.insert(RESERVED_ROOT_ID.to_string(), Vec::new());
        for config in configs {
            let id = config.get_id();
            match config.parent_id.as_deref() {
                None => groups.entry(RESERVED_ROOT_ID.to_string()).or_default().push(config),
                Some(parent) if !by_id.contains_key(parent) => {
                    violations.push(Violation::UnknownParent {
                        node: id.to_string(),
                        parent: parent.to_string(),
                    });
                }
                Some(parent) if parent == id => {
                    violations.push(Violation::SelfParent(id.to_string()));
                }
                Some(parent) => groups.entry(parent.to_string()).or_default().push(config),
            }

            for need in &config.needs {
                match by_id.get(need.as_str()) {
                    None => violations.push(Violation::UnknownNeed {
                        node: id.to_string(),
                        need: need.clone(),
                    }),
                    Some(_) if need == id => violations.push(Violation::SelfNeed(id.to_string())),
                    Some(upstream) if upstream.parent_id != config.parent_id => {
                        violations.push(Violation::CrossGraphNeed {
                            node: id.to_string(),
                            need: need.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }

            if let Some(registry) = registry {
                for reference in config.handler_references() {
                    if !registry.accepts(reference) {
                        violations.push(Violation::UnknownHandler {
                            node: id.to_string(),
                            reference: reference.to_string(),
                        });
                    }
                }
            }
        }

        for parent in groups.keys().filter(|k| k.as_str() != RESERVED_ROOT_ID) {
            if by_id.get(parent.as_str()).is_some_and(|c| !c.is_graph()) {
                violations.push(Violation::ParentNotGraph(parent.clone()));
            }
        }
        violations.extend(parent_cycles(configs, &by_id));

        // Graph nodes without children still get an (empty) plan.
        for config in configs.iter().filter(|c| c.is_graph()) {
            groups.entry(config.get_id().to_string()).or_default();
        }

        let mut graphs = BTreeMap::new();
        for (graph_id, members) in &groups {
            match build_plan(graph_id, members) {
                Ok(plan) => {
                    graphs.insert(graph_id.clone(), plan);
                }
                Err(v) => violations.push(v),
            }
        }

        if !violations.is_empty() {
            return Err(ConfigError::Invalid(violations));
        }
        Ok(Self { graphs })
    }

    pub fn get(&self, graph_id: &str) -> Option<&GraphPlan> {
        self.graphs.get(graph_id)
    }

    pub fn root(&self) -> Option<&GraphPlan> {
        self.get(RESERVED_ROOT_ID)
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }
}

/// Nodes whose parent chain leads back to themselves.
fn parent_cycles(configs: &[NodeConfig], by_id: &HashMap<&str, &NodeConfig>) -> Vec<Violation> {
    let mut found = Vec::new();
    for config in configs {
        let start = config.get_id();
        let mut seen = HashSet::new();
        let mut current = config.parent_id.as_deref();
        while let Some(parent) = current {
            if parent == start {
                // Direct self-parenting is reported separately.
                if config.parent_id.as_deref() != Some(start) {
                    found.push(Violation::ParentCycle(start.to_string()));
                }
                break;
            }
            if !seen.insert(parent) {
                break;
            }
            current = by_id.get(parent).and_then(|c| c.parent_id.as_deref());
        }
    }
    found
}

fn build_plan(graph_id: &str, members: &[&NodeConfig]) -> Result<GraphPlan, Violation> {
    let mut graph = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for config in members {
        let id = config.get_id();
        if !index.contains_key(id) {
            index.insert(id, graph.add_node(id.to_string()));
        }
    }
    for config in members {
        let from = index[config.get_id()];
        for need in &config.needs {
            // Unknown and cross-graph needs were reported during validation.
            if let Some(&to) = index.get(need.as_str()) {
                if from != to {
                    graph.update_edge(from, to, ());
                }
            }
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(Violation::Cycle {
            graph: graph_id.to_string(),
            node: graph[cycle.node_id()].clone(),
        });
    }

    let layers = generations(&graph).into_iter().rev().collect();
    Ok(GraphPlan {
        id: graph_id.to_string(),
        graph,
        layers,
    })
}

/// Topological generations: each generation holds the nodes whose incoming
/// edges all come from earlier generations. The graph must be acyclic.
fn generations(graph: &DiGraph<String, ()>) -> Vec<Vec<String>> {
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| indegree[n] == 0)
        .collect();

    let mut result = Vec::new();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &node in &current {
            for upstream in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = indegree.get_mut(&upstream) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(upstream);
                    }
                }
            }
        }
        let layer: BTreeSet<String> = current.iter().map(|&n| graph[n].clone()).collect();
        result.push(layer.into_iter().collect());
        current = next;
    }
    result
}
