use crate::graph::PipelineGraph;
use crate::registry::HandlerRegistry;
use crate::scheduler::GraphScheduler;
use chrono::Utc;
use pipecore::{
    ConfigError, DataMap, EventBus, ExecutionEvent, ExecutionState, Generator, InMemoryStore,
    Interaction, NoGenerator, NoInteraction, NodeConfig, PipeError, ResultStore, SessionId,
    StepData,
};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Everything one run shares between the scheduler and its node executors.
pub struct Dependencies {
    pub registry: Arc<HandlerRegistry>,
    pub store: Arc<dyn ResultStore>,
    pub generator: Arc<dyn Generator>,
    pub interaction: Arc<dyn Interaction>,
    /// Visible to every handler invocation
    pub global_config: DataMap,
    pub session_id: SessionId,
    pub config: RuntimeConfig,
    pub events: Arc<EventBus>,
}

/// Main entry point for running pipelines
pub struct PipeRuntime {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn ResultStore>,
    generator: Arc<dyn Generator>,
    interaction: Arc<dyn Interaction>,
    global_config: DataMap,
    session_id: SessionId,
    config: RuntimeConfig,
    event_bus: Arc<EventBus>,
}

impl PipeRuntime {
    /// Create a runtime over a pre-configured registry with default settings
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<HandlerRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            store: Arc::new(InMemoryStore::new()),
            generator: Arc::new(NoGenerator),
            interaction: Arc::new(NoInteraction),
            global_config: DataMap::new(),
            session_id: Uuid::new_v4(),
            config,
            event_bus,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_interaction(mut self, interaction: Arc<dyn Interaction>) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn with_global_config(mut self, global_config: DataMap) -> Self {
        self.global_config = global_config;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Validate a node set without running it.
    pub fn validate(&self, configs: &[NodeConfig]) -> Result<PipelineGraph, ConfigError> {
        PipelineGraph::build(configs, Some(self.registry.as_ref()))
    }

    fn dependencies(&self) -> Arc<Dependencies> {
        Arc::new(Dependencies {
            registry: self.registry.clone(),
            store: self.store.clone(),
            generator: self.generator.clone(),
            interaction: self.interaction.clone(),
            global_config: self.global_config.clone(),
            session_id: self.session_id,
            config: self.config.clone(),
            events: self.event_bus.clone(),
        })
    }

    /// Validate and run the full pipeline, returning the nodes of the last
    /// executed root layer with their final records.
    pub async fn run(
        &self,
        configs: Vec<NodeConfig>,
        initial_input: impl Into<String>,
    ) -> Result<ExecutionResult, PipeError> {
        let start_time = Instant::now();
        let node_count = configs.len();
        let scheduler = GraphScheduler::new(configs, self.dependencies())?;

        self.event_bus.emit(ExecutionEvent::RunStarted {
            session_id: self.session_id,
            node_count,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting pipeline session {} with {} nodes", self.session_id, node_count);

        let result = scheduler.run_root(initial_input.into()).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        self.event_bus.emit(ExecutionEvent::RunCompleted {
            session_id: self.session_id,
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        let executed = result?;
        tracing::info!("Pipeline session {} finished in {}ms", self.session_id, duration_ms);

        Ok(ExecutionResult {
            session_id: self.session_id,
            nodes: executed
                .iter()
                .map(|e| NodeResult {
                    node_id: e.id().to_string(),
                    state: e.state(),
                    error: e.error().map(|err| err.to_string()),
                    record: e.record(),
                })
                .collect(),
        })
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    /// Terminal layer of the root graph
    pub nodes: Vec<NodeResult>,
}

impl ExecutionResult {
    pub fn node(&self, id: &str) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.node_id == id)
    }
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: String,
    pub state: ExecutionState,
    pub error: Option<String>,
    pub record: Option<StepData>,
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool size shared by every layer of a run
    pub max_workers: usize,
    /// Sent before a socket node waits for input; `{session_id}` is substituted
    pub announce_message: String,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            announce_message: String::new(),
            event_buffer_size: 1000,
        }
    }
}
