use crate::{ConfigError, DataMap, PipeError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Graph id of the implicit root graph. No node may use it.
pub const RESERVED_ROOT_ID: &str = "___root___";

pub const NATIVE_PREFIX: &str = "native::";
pub const DEFAULT_INPUT_HANDLER: &str = "native::default_input_handler";
pub const DEFAULT_OUTPUT_HANDLER: &str = "native::default_output_handler";
pub const DEFAULT_SYSTEM_PROMPT_HANDLER: &str = "native::default_system_prompt_handler";
pub const DEFAULT_USER_PROMPT_HANDLER: &str = "native::default_user_prompt_handler";

/// Context key handlers may fill for the current execution only; it is
/// removed before a record is persisted.
pub const TRANSIENT_CONTEXT_KEY: &str = "graph_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Plain input/output step
    Step,
    /// Owns a nested graph and may loop until its children succeed
    Graph,
}

impl FromStr for NodeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STEP" => Ok(NodeKind::Step),
            "GRAPH" => Ok(NodeKind::Graph),
            _ => Err(ConfigError::InvalidKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Generate,
    Transform,
    Passthrough,
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "GENERATE" => Ok(Operation::Generate),
            "TRANSFORM" | "DATA_PROCESS" | "DATA_PROCCESS" => Ok(Operation::Transform),
            "PASSTHROUGH" => Ok(Operation::Passthrough),
            _ => Err(ConfigError::InvalidOperation(s.to_string())),
        }
    }
}

/// Handler references used by TRANSFORM and GENERATE nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingConfig {
    pub input_handler: String,
    pub output_handler: String,
}

/// Prompt settings used only by GENERATE nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    /// Overrides the generator's default model
    pub model: Option<String>,
    pub system_prompt: String,
    pub system_prompt_handler: String,
    pub user_prompt: String,
    pub user_prompt_handler: String,
}

/// Operation-specific part of a node config. Each variant carries only the
/// fields its operation can use.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeVariant {
    /// No operation declared. Executing it fails with `MissingOperation`,
    /// so a GRAPH container must declare `PASSTHROUGH` explicitly.
    Base,
    Passthrough,
    Processing(ProcessingConfig),
    Generation {
        processing: ProcessingConfig,
        generation: GenerationConfig,
    },
}

impl NodeVariant {
    fn for_operation(operation: Option<Operation>) -> Self {
        match operation {
            None => NodeVariant::Base,
            Some(Operation::Passthrough) => NodeVariant::Passthrough,
            Some(Operation::Transform) => NodeVariant::Processing(ProcessingConfig::default()),
            Some(Operation::Generate) => NodeVariant::Generation {
                processing: ProcessingConfig::default(),
                generation: GenerationConfig::default(),
            },
        }
    }
}

/// Immutable description of one node in the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawNodeConfig")]
pub struct NodeConfig {
    pub name: String,
    /// Unique id, falls back to `name` when empty
    pub id: String,
    /// Enclosing sub-graph, `None` for the root graph
    pub parent_id: Option<String>,
    pub enabled: bool,
    pub initial_enabled_state: bool,
    /// Announce, wait for external input and echo the result
    pub socket: bool,
    pub allow_failure: bool,
    pub tags: Vec<String>,
    pub kind: NodeKind,
    pub needs: Vec<String>,
    pub global_config: DataMap,
    /// Retry budget of a sub-graph, 0 disables the loop
    pub max_iterations: u32,
    pub variant: NodeVariant,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            parent_id: None,
            enabled: true,
            initial_enabled_state: true,
            socket: false,
            allow_failure: false,
            tags: Vec::new(),
            kind: NodeKind::Step,
            needs: Vec::new(),
            global_config: DataMap::new(),
            max_iterations: 0,
            variant: NodeVariant::Base,
        }
    }

    /// Build a config from a loosely typed map, keeping only known fields.
    pub fn from_map(raw: &DataMap) -> Result<Self, ConfigError> {
        let raw: RawNodeConfig = serde_json::from_value(serde_json::Value::Object(raw.clone()))
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }

    pub fn get_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self.variant {
            NodeVariant::Base => None,
            NodeVariant::Passthrough => Some(Operation::Passthrough),
            NodeVariant::Processing(_) => Some(Operation::Transform),
            NodeVariant::Generation { .. } => Some(Operation::Generate),
        }
    }

    pub fn is_graph(&self) -> bool {
        self.kind == NodeKind::Graph
    }

    pub fn reset_enabled(&mut self) {
        self.enabled = self.initial_enabled_state;
    }

    fn processing(&self) -> Option<&ProcessingConfig> {
        match &self.variant {
            NodeVariant::Processing(p) => Some(p),
            NodeVariant::Generation { processing, .. } => Some(processing),
            _ => None,
        }
    }

    fn processing_mut(&mut self) -> Option<&mut ProcessingConfig> {
        match &mut self.variant {
            NodeVariant::Processing(p) => Some(p),
            NodeVariant::Generation { processing, .. } => Some(processing),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<&GenerationConfig> {
        match &self.variant {
            NodeVariant::Generation { generation, .. } => Some(generation),
            _ => None,
        }
    }

    fn generation_mut(&mut self) -> Option<&mut GenerationConfig> {
        match &mut self.variant {
            NodeVariant::Generation { generation, .. } => Some(generation),
            _ => None,
        }
    }

    pub fn input_handler(&self) -> &str {
        or_default(self.processing().map(|p| p.input_handler.as_str()), DEFAULT_INPUT_HANDLER)
    }

    pub fn output_handler(&self) -> &str {
        or_default(self.processing().map(|p| p.output_handler.as_str()), DEFAULT_OUTPUT_HANDLER)
    }

    pub fn system_prompt_handler(&self) -> &str {
        or_default(
            self.generation().map(|g| g.system_prompt_handler.as_str()),
            DEFAULT_SYSTEM_PROMPT_HANDLER,
        )
    }

    pub fn user_prompt_handler(&self) -> &str {
        or_default(
            self.generation().map(|g| g.user_prompt_handler.as_str()),
            DEFAULT_USER_PROMPT_HANDLER,
        )
    }

    /// Every handler reference this node may dispatch to.
    pub fn handler_references(&self) -> Vec<&str> {
        let mut refs = vec![self.input_handler(), self.output_handler()];
        if self.generation().is_some() {
            refs.push(self.system_prompt_handler());
            refs.push(self.user_prompt_handler());
        }
        refs
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Switch variant; resets any operation-specific fields.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.variant = NodeVariant::for_operation(Some(operation));
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Turn the node into a sub-graph container. Containers still need an
    /// operation, normally `PASSTHROUGH`.
    pub fn as_graph(mut self, max_iterations: u32) -> Self {
        self.kind = NodeKind::Graph;
        self.max_iterations = max_iterations;
        self
    }

    pub fn allowing_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self.initial_enabled_state = false;
        self
    }

    pub fn with_socket(mut self) -> Self {
        self.socket = true;
        self
    }

    pub fn with_input_handler(mut self, reference: impl Into<String>) -> Self {
        if let Some(p) = self.processing_mut() {
            p.input_handler = reference.into();
        }
        self
    }

    pub fn with_output_handler(mut self, reference: impl Into<String>) -> Self {
        if let Some(p) = self.processing_mut() {
            p.output_handler = reference.into();
        }
        self
    }

    pub fn with_prompts(mut self, system: impl Into<String>, user: impl Into<String>) -> Self {
        if let Some(g) = self.generation_mut() {
            g.system_prompt = system.into();
            g.user_prompt = user.into();
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        if let Some(g) = self.generation_mut() {
            g.model = Some(model.into());
        }
        self
    }
}

fn or_default<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default,
    }
}

/// Wire shape of a node: every field optional, unknown keys ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawNodeConfig {
    name: String,
    id: Option<String>,
    parent_id: Option<String>,
    enabled: Option<bool>,
    socket: bool,
    allow_failure: bool,
    tags: Vec<String>,
    #[serde(alias = "automata_type")]
    kind: Option<String>,
    #[serde(alias = "op")]
    operation: Option<String>,
    needs: Vec<String>,
    global_config: DataMap,
    max_iterations: u32,
    input_handler: Option<String>,
    output_handler: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    system_prompt_handler: Option<String>,
    user_prompt: Option<String>,
    user_prompt_handler: Option<String>,
}

impl TryFrom<RawNodeConfig> for NodeConfig {
    type Error = ConfigError;

    fn try_from(raw: RawNodeConfig) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref() {
            Some(k) => k.parse()?,
            None => NodeKind::Step,
        };
        let operation = match raw.operation.as_deref() {
            Some(op) => Some(op.parse::<Operation>()?),
            None => None,
        };

        let processing = || ProcessingConfig {
            input_handler: raw.input_handler.clone().unwrap_or_default(),
            output_handler: raw.output_handler.clone().unwrap_or_default(),
        };
        let variant = match operation {
            Some(Operation::Transform) => NodeVariant::Processing(processing()),
            Some(Operation::Generate) => NodeVariant::Generation {
                processing: processing(),
                generation: GenerationConfig {
                    model: raw.model.clone(),
                    system_prompt: raw.system_prompt.clone().unwrap_or_default(),
                    system_prompt_handler: raw.system_prompt_handler.clone().unwrap_or_default(),
                    user_prompt: raw.user_prompt.clone().unwrap_or_default(),
                    user_prompt_handler: raw.user_prompt_handler.clone().unwrap_or_default(),
                },
            },
            other => NodeVariant::for_operation(other),
        };

        let enabled = raw.enabled.unwrap_or(true);
        Ok(NodeConfig {
            name: raw.name,
            id: raw.id.unwrap_or_default(),
            parent_id: raw.parent_id,
            enabled,
            initial_enabled_state: enabled,
            socket: raw.socket,
            allow_failure: raw.allow_failure,
            tags: raw.tags,
            kind,
            needs: raw.needs,
            global_config: raw.global_config,
            max_iterations: raw.max_iterations,
            variant,
        })
    }
}

/// On-disk pipeline definition: shared handler config plus the node list.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub config: DataMap,
    #[serde(alias = "automata")]
    pub nodes: Vec<NodeConfig>,
}

impl PipelineFile {
    pub fn from_json(json: &str) -> Result<Self, PipeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, PipeError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
