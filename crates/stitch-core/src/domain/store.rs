//! Operation store contract
//!
//! The engine only needs to load an operation by id, insert a new one and
//! update an existing one conditionally on its version. Durable backends
//! live outside this crate and implement [`OperationStore`].

use async_trait::async_trait;

use super::operation::{Operation, OperationId, OperationStatus};
use crate::CoreError;

/// Persistence for [`Operation`] records
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Find an operation by id
    async fn get(&self, id: &OperationId) -> Result<Option<Operation>, CoreError>;

    /// Insert a new operation. Fails if the id already exists.
    async fn insert(&self, operation: &Operation) -> Result<(), CoreError>;

    /// Replace the stored operation if its version is still `expected_version`.
    ///
    /// Returns the new version on success and `CoreError::VersionConflict`
    /// when another writer got there first. Exactly one of several writers
    /// racing on the same version may succeed.
    async fn update(&self, operation: &Operation, expected_version: u64)
        -> Result<u64, CoreError>;

    /// List operations, optionally filtered by status
    async fn list(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>, CoreError>;

    /// Delete an operation and its tape
    async fn delete(&self, id: &OperationId) -> Result<(), CoreError>;
}

/// Memory implementation for tests and single-process use
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tracing::trace;

    /// In-memory operation store backed by a concurrent map. Conditional
    /// updates hold the shard lock for the compare and the write.
    #[derive(Clone)]
    pub struct MemoryOperationStore {
        operations: Arc<DashMap<String, Operation>>,
    }

    impl MemoryOperationStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self {
                operations: Arc::new(DashMap::with_capacity(64)),
            }
        }

        /// Number of stored operations
        pub fn len(&self) -> usize {
            self.operations.len()
        }

        /// Whether the store is empty
        pub fn is_empty(&self) -> bool {
            self.operations.is_empty()
        }
    }

    impl Default for MemoryOperationStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl OperationStore for MemoryOperationStore {
        async fn get(&self, id: &OperationId) -> Result<Option<Operation>, CoreError> {
            Ok(self.operations.get(&id.0).map(|op| op.clone()))
        }

        async fn insert(&self, operation: &Operation) -> Result<(), CoreError> {
            match self.operations.entry(operation.id.0.clone()) {
                Entry::Occupied(_) => Err(CoreError::StoreError(format!(
                    "Operation already exists: {}",
                    operation.id
                ))),
                Entry::Vacant(slot) => {
                    slot.insert(operation.clone());
                    trace!(operation_id = %operation.id, "Inserted operation");
                    Ok(())
                }
            }
        }

        async fn update(
            &self,
            operation: &Operation,
            expected_version: u64,
        ) -> Result<u64, CoreError> {
            let mut stored = self
                .operations
                .get_mut(&operation.id.0)
                .ok_or_else(|| CoreError::OperationNotFound(operation.id.to_string()))?;

            if stored.version != expected_version {
                return Err(CoreError::VersionConflict {
                    id: operation.id.to_string(),
                    expected: expected_version,
                    found: stored.version,
                });
            }

            let mut next = operation.clone();
            next.version = expected_version + 1;
            *stored = next;
            trace!(
                operation_id = %operation.id,
                version = expected_version + 1,
                status = %operation.status,
                "Updated operation"
            );
            Ok(expected_version + 1)
        }

        async fn list(
            &self,
            status: Option<OperationStatus>,
        ) -> Result<Vec<Operation>, CoreError> {
            Ok(self
                .operations
                .iter()
                .filter(|entry| status.map_or(true, |s| entry.status == s))
                .map(|entry| entry.value().clone())
                .collect())
        }

        async fn delete(&self, id: &OperationId) -> Result<(), CoreError> {
            self.operations.remove(&id.0);
            Ok(())
        }
    }

}
