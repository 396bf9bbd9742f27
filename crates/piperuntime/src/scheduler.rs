use crate::executor::NodeExecutor;
use crate::graph::{GraphPlan, PipelineGraph};
use crate::runtime::Dependencies;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use pipecore::{
    ConfigError, ExecutionEvent, ExecutionState, IterationPath, NodeConfig, PipeError,
    RESERVED_ROOT_ID,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Executes a validated pipeline layer by layer.
///
/// Every node of a layer runs concurrently on a bounded worker pool; the
/// next layer starts only once the previous one has finished, been
/// persisted, and had its sub-graphs run to completion.
pub struct GraphScheduler {
    graph: PipelineGraph,
    executors: BTreeMap<String, Arc<NodeExecutor>>,
    deps: Arc<Dependencies>,
    workers: Arc<Semaphore>,
    aborted: AtomicBool,
}

impl GraphScheduler {
    pub fn new(configs: Vec<NodeConfig>, deps: Arc<Dependencies>) -> Result<Self, ConfigError> {
        let graph = PipelineGraph::build(&configs, Some(deps.registry.as_ref()))?;
        let executors = configs
            .into_iter()
            .map(|config| {
                let id = config.get_id().to_string();
                (id, Arc::new(NodeExecutor::new(config, deps.clone())))
            })
            .collect();
        let workers = Arc::new(Semaphore::new(deps.config.max_workers.max(1)));

        Ok(Self {
            graph,
            executors,
            deps,
            workers,
            aborted: AtomicBool::new(false),
        })
    }

    /// Run the root graph, handing `initial_input` to its first layer.
    pub async fn run_root(&self, initial_input: String) -> Result<Vec<Arc<NodeExecutor>>, PipeError> {
        self.run(RESERVED_ROOT_ID, 0, Vec::new(), Some(initial_input))
            .await
    }

    /// Walk the layers of `graph_id`. Returns the executors of the last
    /// layer that ran.
    pub fn run<'a>(
        &'a self,
        graph_id: &'a str,
        iteration: u32,
        path: IterationPath,
        initial_input: Option<String>,
    ) -> BoxFuture<'a, Result<Vec<Arc<NodeExecutor>>, PipeError>> {
        Box::pin(async move {
            let plan = self.plan(graph_id)?;
            let max_iterations = self
                .executors
                .get(graph_id)
                .map_or(0, |e| e.config().max_iterations);

            let mut iteration = iteration;
            let mut retries = 0u32;

            'attempt: loop {
                self.deps.events.emit(ExecutionEvent::GraphStarted {
                    session_id: self.deps.session_id,
                    graph_id: graph_id.to_string(),
                    iteration_path: extend(&path, iteration),
                    timestamp: Utc::now(),
                });
                tracing::debug!("Running graph {} at iteration {}", graph_id, iteration);

                let mut input = initial_input.clone();
                let mut executed = Vec::new();

                for index in 0..plan.layers().len() {
                    executed = self
                        .run_layer(plan, index, iteration, &path, input.take().unwrap_or_default())
                        .await?;

                    let unsuccessful: Vec<&str> = executed
                        .iter()
                        .filter(|e| !e.succeeded())
                        .map(|e| e.id())
                        .collect();
                    if unsuccessful.is_empty() {
                        continue;
                    }

                    if graph_id != RESERVED_ROOT_ID && max_iterations > 0 && retries < max_iterations {
                        iteration += 1;
                        retries += 1;
                        tracing::info!(
                            "Graph {} not converged ({}), retry {}/{}",
                            graph_id,
                            unsuccessful.join(", "),
                            retries,
                            max_iterations
                        );
                        continue 'attempt;
                    }
                    tracing::info!(
                        "Graph {} stopped after unsuccessful node(s): {}",
                        graph_id,
                        unsuccessful.join(", ")
                    );
                    break;
                }
                return Ok(executed);
            }
        })
    }

    fn plan(&self, graph_id: &str) -> Result<&GraphPlan, PipeError> {
        self.graph
            .get(graph_id)
            .ok_or_else(|| PipeError::Execution(format!("Unknown graph: {}", graph_id)))
    }

    async fn run_layer(
        &self,
        plan: &GraphPlan,
        index: usize,
        iteration: u32,
        path: &IterationPath,
        input: String,
    ) -> Result<Vec<Arc<NodeExecutor>>, PipeError> {
        let current_path = extend(path, iteration);
        self.check_abort()?;

        let store = &self.deps.store;
        let history = store.all().await?;
        let previous = plan.previous_layer(index);

        let mut layer = Vec::new();
        let mut submitted = Vec::new();
        for id in &plan.layers()[index] {
            let executor = self
                .executors
                .get(id)
                .cloned()
                .ok_or_else(|| PipeError::Execution(format!("No executor for node {}", id)))?;

            let query: BTreeMap<String, IterationPath> = previous
                .iter()
                .chain(executor.config().needs.iter())
                .map(|need| (need.clone(), current_path.clone()))
                .collect();
            let mut prior = store.get_many(&query).await?;
            if prior.is_empty() {
                if let Some(parent) = &executor.config().parent_id {
                    prior.extend(store.get(parent, path).await?);
                }
            }

            match executor.prepare_input(prior, history.clone(), &input).await {
                Ok(()) => submitted.push(executor.clone()),
                Err(e) => executor.fail(e),
            }
            layer.push(executor);
        }

        let mut running = FuturesUnordered::new();
        for executor in submitted {
            let permit = self
                .workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipeError::Execution(format!("Worker pool closed: {}", e)))?;
            running.push(tokio::spawn(async move {
                let _permit = permit;
                executor.execute().await;
            }));
        }

        let mut join_error = None;
        while let Some(joined) = running.next().await {
            if let Err(e) = joined {
                tracing::error!("Node task failed to join: {}", e);
                if join_error.is_none() {
                    join_error = Some(PipeError::Execution(format!("Task join error: {}", e)));
                }
            }
        }
        if let Some(e) = join_error {
            return Err(e);
        }

        for executor in &layer {
            if let Some(record) = executor.persisted_record(&current_path) {
                store.put(record).await?;
            }
        }
        self.check_abort()?;

        let children = layer
            .iter()
            .filter(|e| e.config().is_graph())
            .map(|e| self.run(e.id(), iteration + 1, current_path.clone(), None));
        for result in join_all(children).await {
            result?;
        }

        Ok(layer)
    }

    /// Fail the whole run once any node anywhere sits in `Error`.
    fn check_abort(&self) -> Result<(), PipeError> {
        let failed: Vec<String> = self
            .executors
            .values()
            .filter(|e| e.state() == ExecutionState::Error)
            .map(|e| e.id().to_string())
            .collect();
        if failed.is_empty() && !self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !self.aborted.swap(true, Ordering::SeqCst) {
            self.deps.events.emit(ExecutionEvent::RunAborted {
                session_id: self.deps.session_id,
                failed: failed.clone(),
                timestamp: Utc::now(),
            });
        }
        let error = PipeError::Aborted { failed };
        tracing::error!("{}", error);
        Err(error)
    }
}

fn extend(path: &IterationPath, iteration: u32) -> IterationPath {
    let mut extended = path.clone();
    extended.push(iteration);
    extended
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_keeps_prefix() {
        let base = vec![0, 1];
        assert_eq!(extend(&base, 3), vec![0, 1, 3]);
        assert_eq!(base, vec![0, 1]);
        assert_eq!(extend(&Vec::new(), 0), vec![0]);
    }
}
