use crate::{DataMap, NodeError, StepData};
use async_trait::async_trait;

/// Execution context handed to a handler alongside the record it mutates.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    /// Records of the node's predecessors at the current iteration path
    pub prior: &'a [StepData],
    /// Snapshot of every stored record
    pub all: &'a [StepData],
    /// Pipeline config overlaid with the node's own `global_config`
    pub global_config: &'a DataMap,
    /// Raw text input for this invocation (prompt template, generated text, ...)
    pub input: &'a str,
}

impl<'a> HandlerContext<'a> {
    pub fn with_input(self, input: &'a str) -> Self {
        Self { input, ..self }
    }
}

/// A backend able to transform a node's working record, selected by the
/// prefix of a handler reference such as `native::default_output_handler`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Reference prefix this backend answers to (e.g. "native::")
    fn prefix(&self) -> &str;

    /// Names this backend knows about, for diagnostics and build-time checks.
    /// An empty list means every reference under the prefix is accepted.
    fn names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Mutate `record`'s input/output/text for `reference`.
    async fn invoke(
        &self,
        reference: &str,
        ctx: HandlerContext<'_>,
        record: &mut StepData,
    ) -> Result<(), NodeError>;

    /// Strip this backend's prefix from a reference.
    fn body<'r>(&self, reference: &'r str) -> &'r str {
        reference.strip_prefix(self.prefix()).unwrap_or(reference)
    }
}

/// Generative model backend used by GENERATE nodes.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: Option<&str>,
    ) -> Result<String, NodeError>;
}

/// Placeholder used when no generator is configured.
pub struct NoGenerator;

#[async_trait]
impl Generator for NoGenerator {
    async fn generate(&self, _: &str, _: &str, _: Option<&str>) -> Result<String, NodeError> {
        Err(NodeError::Generation(
            "no generation backend configured for this run".to_string(),
        ))
    }
}

/// Synchronous external interaction for nodes declared with `socket`.
#[async_trait]
pub trait Interaction: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NodeError>;

    async fn recv(&self) -> Result<String, NodeError>;
}

/// Placeholder used when no interaction channel is configured.
pub struct NoInteraction;

#[async_trait]
impl Interaction for NoInteraction {
    async fn send(&self, _message: &str) -> Result<(), NodeError> {
        Err(NodeError::Interaction(
            "node declares socket interaction but no channel was provided".to_string(),
        ))
    }

    async fn recv(&self) -> Result<String, NodeError> {
        Err(NodeError::Interaction(
            "node declares socket interaction but no channel was provided".to_string(),
        ))
    }
}
