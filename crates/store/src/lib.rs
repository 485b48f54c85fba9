//! Object store views: the read/subscribe/mutate surface the engine runs
//! against, plus the in-process [`MemoryStore`] used by tests and demos.
//!
//! A store view is scoped to one cluster. Reads are cache-style (absence is
//! `Ok(None)`, never an error); mutations are assumed to provide per-object
//! optimistic-concurrency safety on the other end.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use speil_core::{ChangeEvent, KindId, Result, Uid};

mod memory;

pub use memory::MemoryStore;

/// Result of a preconditioned delete. Absence and identity mismatch are
/// successes carrying information, not errors: both mean the precondition
/// world no longer exists and there is nothing left to destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    AlreadyGone,
    UidMismatch,
}

/// Aborts the task backing a subscription, when there is one.
#[derive(Debug)]
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    /// Handle for subscriptions with no backing task (in-process stores).
    pub fn detached() -> Self {
        Self { task: None }
    }

    pub fn for_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A live change-notification subscription.
pub struct EventStream {
    pub rx: mpsc::Receiver<ChangeEvent>,
    pub cancel: CancelHandle,
}

/// Read-through view over one cluster's resources.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object. Absence is `Ok(None)`.
    async fn get(&self, kind: &KindId, namespace: &str, name: &str) -> Result<Option<Value>>;

    /// List a namespace, optionally filtered by an equality label selector
    /// (`k=v[,k2=v2]`).
    async fn list(
        &self,
        kind: &KindId,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Subscribe to change notifications for one kind in one namespace.
    async fn subscribe(&self, kind: &KindId, namespace: &str) -> Result<EventStream>;
}

/// Mutation surface on top of [`ObjectStore`]. Only the remote side of a
/// reflection is ever mutated.
#[async_trait]
pub trait MutableStore: ObjectStore {
    /// Merge-apply `desired`: non-metadata sections are asserted wholesale,
    /// metadata labels/annotations per key; fields nobody asserts stay
    /// untouched. Creates the object when absent. Returns the stored object.
    async fn apply(&self, kind: &KindId, namespace: &str, desired: &Value) -> Result<Value>;

    /// Delete iff the live object still carries `expected_uid`.
    async fn delete(
        &self,
        kind: &KindId,
        namespace: &str,
        name: &str,
        expected_uid: Uid,
    ) -> Result<DeleteStatus>;
}
