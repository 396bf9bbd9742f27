use pipecore::{Handler, HandlerContext, NodeError, StepData};
use std::sync::Arc;

/// Registry of handler backends, one per reference prefix.
///
/// Populated once before a run and shared read-only afterwards.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a backend. A later backend with the same prefix replaces the
    /// earlier one.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let prefix = handler.prefix().to_string();
        if let Some(pos) = self.handlers.iter().position(|h| h.prefix() == prefix) {
            tracing::warn!("Replacing handler backend for prefix: {}", prefix);
            self.handlers[pos] = handler;
        } else {
            tracing::info!("Registering handler backend: {}", prefix);
            self.handlers.push(handler);
        }
    }

    /// Backend whose prefix starts `reference`; the longest prefix wins.
    pub fn find(&self, reference: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers
            .iter()
            .filter(|h| reference.starts_with(h.prefix()))
            .max_by_key(|h| h.prefix().len())
    }

    /// Whether `reference` resolves to a backend that knows its name.
    pub fn accepts(&self, reference: &str) -> bool {
        match self.find(reference) {
            Some(handler) => {
                let names = handler.names();
                names.is_empty() || names.iter().any(|n| n == handler.body(reference))
            }
            None => false,
        }
    }

    /// Run the handler named by `reference` against `record`.
    pub async fn dispatch(
        &self,
        reference: &str,
        ctx: HandlerContext<'_>,
        record: &mut StepData,
    ) -> Result<(), NodeError> {
        let handler = self
            .find(reference)
            .ok_or_else(|| NodeError::HandlerNotRegistered {
                reference: reference.to_string(),
                registered: self.registered_names(),
            })?;
        tracing::trace!("Dispatching {} for node {}", reference, record.node_id);
        handler.invoke(reference, ctx, record).await
    }

    /// Fully qualified names of every built-in the registered backends expose.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .flat_map(|h| {
                let prefix = h.prefix().to_string();
                h.names().into_iter().map(move |n| format!("{}{}", prefix, n))
            })
            .collect();
        names.sort();
        names
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.prefix().to_string()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipecore::DataMap;

    struct Tagging {
        prefix: &'static str,
        names: Vec<String>,
    }

    #[async_trait]
    impl Handler for Tagging {
        fn prefix(&self) -> &str {
            self.prefix
        }

        fn names(&self) -> Vec<String> {
            self.names.clone()
        }

        async fn invoke(
            &self,
            reference: &str,
            _ctx: HandlerContext<'_>,
            record: &mut StepData,
        ) -> Result<(), NodeError> {
            record.text = format!("{}:{}", self.prefix, self.body(reference));
            Ok(())
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Tagging {
            prefix: "py::",
            names: vec!["clean".to_string()],
        }));
        registry.register(Arc::new(Tagging {
            prefix: "py::fast::",
            names: Vec::new(),
        }));
        registry
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let registry = registry();
        let config = DataMap::new();
        let ctx = HandlerContext {
            prior: &[],
            all: &[],
            global_config: &config,
            input: "",
        };
        let mut record = StepData::new("a", "s");

        registry.dispatch("py::fast::sum", ctx, &mut record).await.unwrap();
        assert_eq!(record.text, "py::fast:::sum");

        registry.dispatch("py::clean", ctx, &mut record).await.unwrap();
        assert_eq!(record.text, "py:::clean");
    }

    #[tokio::test]
    async fn test_miss_lists_registered_names() {
        let registry = registry();
        let config = DataMap::new();
        let ctx = HandlerContext {
            prior: &[],
            all: &[],
            global_config: &config,
            input: "",
        };
        let mut record = StepData::new("a", "s");

        let err = registry.dispatch("js::x", ctx, &mut record).await.unwrap_err();
        match err {
            NodeError::HandlerNotRegistered { registered, .. } => {
                assert_eq!(registered, vec!["py::clean".to_string()])
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(registry.accepts("py::clean"));
        assert!(!registry.accepts("py::dirty"));
        assert!(registry.accepts("py::fast::anything"));
    }
}
