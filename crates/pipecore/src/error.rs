use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{}", abort_message(.failed))]
    Aborted { failed: Vec<String> },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn abort_message(failed: &[String]) -> String {
    if failed.is_empty() {
        "Execution aborted from another graph, aborting graph execution".to_string()
    } else {
        format!(
            "Error state detected in node(s) {}, aborting graph execution",
            failed.join(", ")
        )
    }
}

/// Errors raised while building a pipeline, before anything runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("The following errors were found in the graph configuration:{}", list_violations(.0))]
    Invalid(Vec<Violation>),

    #[error("Invalid operation '{0}', expected one of GENERATE, TRANSFORM, PASSTHROUGH")]
    InvalidOperation(String),

    #[error("Invalid node kind '{0}', expected STEP or GRAPH")]
    InvalidKind(String),

    #[error("Malformed node config: {0}")]
    Malformed(String),
}

fn list_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("\n\t - {}", v))
        .collect()
}

/// One structural problem found while validating the node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    DuplicateId(Vec<String>),
    ReservedId(String),
    UnknownParent { node: String, parent: String },
    SelfParent(String),
    ParentNotGraph(String),
    ParentCycle(String),
    UnknownNeed { node: String, need: String },
    SelfNeed(String),
    CrossGraphNeed { node: String, need: String },
    Cycle { graph: String, node: String },
    UnknownHandler { node: String, reference: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DuplicateId(ids) => write!(
                f,
                "One or more duplicate IDs were found in the graph; this may mask additional errors until duplicates are eliminated: {}",
                ids.join(", ")
            ),
            Violation::ReservedId(id) => write!(
                f,
                "{} is a reserved ID for the root of the graph, please choose another name/id",
                id
            ),
            Violation::UnknownParent { node, parent } => write!(
                f,
                "Subgraph reference \"{}\" on node \"{}\" not found",
                parent, node
            ),
            Violation::SelfParent(id) => {
                write!(f, "Circular reference found in subgraph node: \"{}\"", id)
            }
            Violation::ParentNotGraph(id) => write!(
                f,
                "Subgraph {} was not defined as a graph. Set the kind to \"GRAPH\"",
                id
            ),
            Violation::ParentCycle(id) => {
                write!(f, "Parent chain of node \"{}\" loops back on itself", id)
            }
            Violation::UnknownNeed { node, need } => write!(
                f,
                "Upstream reference \"{}\" on node \"{}\" not found",
                need, node
            ),
            Violation::SelfNeed(id) => write!(f, "Circular reference found in node: \"{}\"", id),
            Violation::CrossGraphNeed { node, need } => write!(
                f,
                "Node \"{}\" needs \"{}\", which belongs to a different graph",
                node, need
            ),
            Violation::Cycle { graph, node } => write!(
                f,
                "Graph {} is not a DAG, cycle detected involving node \"{}\"",
                graph, node
            ),
            Violation::UnknownHandler { node, reference } => write!(
                f,
                "Node \"{}\" references unregistered handler \"{}\"",
                node, reference
            ),
        }
    }
}

/// Failures inside a single node execution. Recovered into node state.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("No registered handler found named {reference}. The following handlers are registered: {} - please check your configuration", .registered.join(", "))]
    HandlerNotRegistered {
        reference: String,
        registered: Vec<String>,
    },

    #[error("Handler '{reference}' failed: {message}")]
    Handler { reference: String, message: String },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Interaction failed: {0}")]
    Interaction(String),

    #[error("Node has no valid operation configured")]
    MissingOperation,

    #[error("Node was never prepared with input")]
    NotPrepared,
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store backend failure: {0}")]
    Backend(String),
}
