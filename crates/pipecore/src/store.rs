//! Storage of execution records.
//!
//! The [`ResultStore`] trait is the contract the scheduler relies on; any
//! backend honouring it can replace [`InMemoryStore`]. Every getter hands
//! back owned copies, so callers can never alias stored history.

use crate::{IterationPath, StepData, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Full history in insertion order.
    async fn all(&self) -> Result<Vec<StepData>, StoreError>;

    /// Every record for `id`, ordered by start time ascending.
    async fn all_by_id(&self, id: &str) -> Result<Vec<StepData>, StoreError>;

    /// Exact match on `(id, iteration_path)`.
    async fn get(&self, id: &str, path: &[u32]) -> Result<Option<StepData>, StoreError>;

    /// Best-effort batch lookup; unmatched entries are skipped.
    async fn get_many(
        &self,
        query: &BTreeMap<String, IterationPath>,
    ) -> Result<Vec<StepData>, StoreError>;

    /// Append a record and make it the latest for its key.
    async fn put(&self, record: StepData) -> Result<(), StoreError>;

    async fn first_by_id(&self, id: &str) -> Result<Option<StepData>, StoreError> {
        Ok(self.all_by_id(id).await?.into_iter().next())
    }

    async fn last_by_id(&self, id: &str) -> Result<Option<StepData>, StoreError> {
        Ok(self.all_by_id(id).await?.into_iter().last())
    }
}

#[derive(Default)]
struct Inner {
    records: Vec<StepData>,
    by_key: HashMap<(String, IterationPath), usize>,
    /// Positions per id, kept sorted by record start time
    by_id: HashMap<String, Vec<usize>>,
}

/// Default store: append-only history behind a point index and a per-id
/// time-ordered index.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn all(&self) -> Result<Vec<StepData>, StoreError> {
        Ok(self.inner.read().await.records.clone())
    }

    async fn all_by_id(&self, id: &str) -> Result<Vec<StepData>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .get(id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| inner.records[pos].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, id: &str, path: &[u32]) -> Result<Option<StepData>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_key
            .get(&(id.to_string(), path.to_vec()))
            .map(|&pos| inner.records[pos].clone()))
    }

    async fn get_many(
        &self,
        query: &BTreeMap<String, IterationPath>,
    ) -> Result<Vec<StepData>, StoreError> {
        let inner = self.inner.read().await;
        Ok(query
            .iter()
            .filter_map(|(id, path)| inner.by_key.get(&(id.clone(), path.clone())))
            .map(|&pos| inner.records[pos].clone())
            .collect())
    }

    async fn put(&self, record: StepData) -> Result<(), StoreError> {
        tracing::trace!("Storing {} at {:?}", record.node_id, record.iteration_path);
        let mut inner = self.inner.write().await;
        let pos = inner.records.len();
        let key = (record.node_id.clone(), record.iteration_path.clone());
        let start = record.start;
        let id = record.node_id.clone();
        inner.records.push(record);
        inner.by_key.insert(key, pos);

        // Insert after any record with an equal or earlier start so ties keep
        // insertion order.
        let Inner { records, by_id, .. } = &mut *inner;
        let positions = by_id.entry(id).or_default();
        let at = positions.partition_point(|&p| records[p].start <= start);
        positions.insert(at, pos);
        Ok(())
    }
}
