use crate::runtime::Dependencies;
use chrono::Utc;
use pipecore::{
    DataMap, ExecutionEvent, ExecutionState, HandlerContext, IterationPath, NodeConfig, NodeError,
    Operation, StepData, TRANSIENT_CONTEXT_KEY,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Mutable part of an executor. Locked only for short synchronous sections,
/// never across an await.
#[derive(Default)]
struct Slot {
    state: Option<ExecutionState>,
    record: Option<StepData>,
    prior: Vec<StepData>,
    all: Vec<StepData>,
    error: Option<NodeError>,
}

/// Runs the lifecycle of one configured node: build input, perform the
/// operation, record timing and apply the failure policy.
pub struct NodeExecutor {
    config: NodeConfig,
    deps: Arc<Dependencies>,
    /// Pipeline config overlaid with the node's own entries
    global_config: DataMap,
    slot: Mutex<Slot>,
}

impl NodeExecutor {
    pub fn new(config: NodeConfig, deps: Arc<Dependencies>) -> Self {
        let mut global_config = deps.global_config.clone();
        for (key, value) in &config.global_config {
            global_config.insert(key.clone(), value.clone());
        }
        Self {
            config,
            deps,
            global_config,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        self.config.get_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutionState {
        self.slot().state.unwrap_or(ExecutionState::Initialized)
    }

    /// Copy of the current working record.
    pub fn record(&self) -> Option<StepData> {
        self.slot().record.clone()
    }

    pub fn error(&self) -> Option<NodeError> {
        self.slot().error.clone()
    }

    /// False once a handler cleared the record's success flag.
    pub fn succeeded(&self) -> bool {
        self.slot().record.as_ref().map_or(true, |r| r.success)
    }

    /// Build a fresh record for this execution and run the input handler on it.
    pub async fn prepare_input(
        &self,
        prior: Vec<StepData>,
        all: Vec<StepData>,
        initial_input: &str,
    ) -> Result<(), NodeError> {
        let mut record = StepData::new(self.id(), self.deps.session_id.to_string())
            .with_parent(self.config.parent_id.clone())
            .with_text(initial_input)
            .started_now();

        let ctx = HandlerContext {
            prior: &prior,
            all: &all,
            global_config: &self.global_config,
            input: initial_input,
        };
        let result = self
            .deps
            .registry
            .dispatch(self.config.input_handler(), ctx, &mut record)
            .await;

        let mut slot = self.slot();
        slot.state = Some(ExecutionState::Initialized);
        slot.error = None;
        slot.record = Some(record);
        slot.prior = prior;
        slot.all = all;
        result
    }

    /// Execute the prepared record. Failures are recovered into state.
    pub async fn execute(&self) {
        let taken = {
            let mut slot = self.slot();
            slot.state = Some(ExecutionState::InProgress);
            match slot.record.take() {
                Some(record) => {
                    let prior = std::mem::take(&mut slot.prior);
                    let all = std::mem::take(&mut slot.all);
                    Some((record, prior, all))
                }
                None => None,
            }
        };
        let Some((mut record, prior, all)) = taken else {
            self.fail(NodeError::NotPrepared);
            return;
        };

        self.deps.events.emit(ExecutionEvent::NodeStarted {
            session_id: self.deps.session_id,
            node_id: self.id().to_string(),
            timestamp: Utc::now(),
        });

        if !self.config.enabled || self.config.operation() == Some(Operation::Passthrough) {
            tracing::debug!("Node {} bypassed", self.id());
            let mut output = record.input_data.clone();
            output.remove(TRANSIENT_CONTEXT_KEY);
            record.output_data = output;
            self.finish(record, Ok(()));
            return;
        }

        let result = self.perform(&mut record, &prior, &all).await;
        self.finish(record, result);
    }

    async fn perform(
        &self,
        record: &mut StepData,
        prior: &[StepData],
        all: &[StepData],
    ) -> Result<(), NodeError> {
        let registry = &self.deps.registry;
        let ctx = HandlerContext {
            prior,
            all,
            global_config: &self.global_config,
            input: "",
        };

        if self.config.socket {
            let announce = self
                .deps
                .config
                .announce_message
                .replace("{session_id}", &self.deps.session_id.to_string());
            self.deps.interaction.send(&announce).await?;
            record.text = self.deps.interaction.recv().await?;
        }

        match self.config.operation() {
            Some(Operation::Generate) => self.generate(ctx, record).await?,
            Some(Operation::Transform) => {
                let text = record.text.clone();
                registry
                    .dispatch(self.config.output_handler(), ctx.with_input(&text), record)
                    .await?
            }
            _ => {
                tracing::error!("No valid operation found for node {}", self.id());
                return Err(NodeError::MissingOperation);
            }
        }

        if self.config.socket {
            let mut echo = record.clone();
            registry
                .dispatch(self.config.output_handler(), ctx.with_input(&record.text), &mut echo)
                .await?;
            self.deps.interaction.send(&echo.text).await?;
        }
        Ok(())
    }

    /// Two-prompt generation: system and user prompts are rendered on
    /// separate copies so neither clobbers the other's text.
    async fn generate(
        &self,
        ctx: HandlerContext<'_>,
        record: &mut StepData,
    ) -> Result<(), NodeError> {
        let generation = self
            .config
            .generation()
            .ok_or(NodeError::MissingOperation)?;
        let registry = &self.deps.registry;

        let mut system = record.clone();
        registry
            .dispatch(
                self.config.system_prompt_handler(),
                ctx.with_input(&generation.system_prompt),
                &mut system,
            )
            .await?;

        let mut user = record.clone();
        registry
            .dispatch(
                self.config.user_prompt_handler(),
                ctx.with_input(&generation.user_prompt),
                &mut user,
            )
            .await?;

        tracing::debug!("System prompt for {}: {}", self.id(), system.text);
        tracing::debug!("User prompt for {}: {}", self.id(), user.text);

        let content = self
            .deps
            .generator
            .generate(&system.text, &user.text, generation.model.as_deref())
            .await?;
        user.text = content.clone();
        registry
            .dispatch(self.config.output_handler(), ctx.with_input(&content), &mut user)
            .await?;

        *record = user;
        Ok(())
    }

    /// Mark the node failed without executing it.
    pub fn fail(&self, error: NodeError) {
        let record = self.slot().record.take().unwrap_or_else(|| {
            StepData::new(self.id(), self.deps.session_id.to_string())
                .with_parent(self.config.parent_id.clone())
                .started_now()
        });
        self.finish(record, Err(error));
    }

    fn finish(&self, mut record: StepData, result: Result<(), NodeError>) {
        record.stamp_end();
        let duration_ms = record.duration_ms().unwrap_or_default();

        let (state, error) = match result {
            Ok(()) => {
                tracing::info!("Node {} completed in {}ms", self.id(), duration_ms);
                (ExecutionState::Completed, None)
            }
            Err(e) => {
                let state = if self.config.allow_failure {
                    ExecutionState::ErrorIgnored
                } else {
                    ExecutionState::Error
                };
                tracing::error!(
                    node_id = %self.id(),
                    state = %state,
                    error = %e,
                    "Node {} failed",
                    self.id()
                );
                (state, Some(e))
            }
        };

        self.deps.events.emit(ExecutionEvent::NodeFinished {
            session_id: self.deps.session_id,
            node_id: self.id().to_string(),
            state,
            error: error.as_ref().map(|e| e.to_string()),
            duration_ms,
            timestamp: Utc::now(),
        });

        let mut slot = self.slot();
        slot.state = Some(state);
        slot.error = error;
        slot.record = Some(record);
    }

    /// Copy of the record as it should be persisted: stamped with `path`
    /// and without transient context.
    pub fn persisted_record(&self, path: &IterationPath) -> Option<StepData> {
        let mut slot = self.slot();
        let record = slot.record.as_mut()?;
        record.iteration_path = path.clone();
        record.input_data.remove(TRANSIENT_CONTEXT_KEY);
        record.output_data.remove(TRANSIENT_CONTEXT_KEY);
        Some(record.clone())
    }
}
