//! Result aggregation
//!
//! Folds resolved child outcomes back into the delegation tree and evicts
//! consumed subtrees. A batch merge keeps request order no matter which
//! child finished first.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::task::{Outcome, TaskId};
use crate::tree::TaskTree;

/// Collects child outcomes and merges them into the parent's view.
#[derive(Clone)]
pub struct ResultAggregator {
    tree: Arc<Mutex<TaskTree>>,
}

impl ResultAggregator {
    pub fn new(tree: Arc<Mutex<TaskTree>>) -> Self {
        Self { tree }
    }

    /// Record a task's terminal outcome in the tree.
    ///
    /// Resolution is idempotent: the first outcome wins, so a completion
    /// racing a cancellation sweep settles on whichever arrived first.
    pub fn resolve(&self, id: TaskId, outcome: &Outcome) {
        let applied = self.tree.lock().record_outcome(id, outcome.clone());
        if applied {
            debug!(task_id = %id, ok = outcome.is_ok(), "Task resolved");
        }
    }

    /// Resolve a batch of children and hand their outcomes back in the
    /// order they were requested, regardless of completion order. Each
    /// child's subtree is evicted once its outcome is taken.
    pub fn resolve_batch(&self, children: Vec<(TaskId, Outcome)>) -> Vec<Outcome> {
        let mut merged = Vec::with_capacity(children.len());
        let mut tree = self.tree.lock();
        for (id, outcome) in children {
            tree.record_outcome(id, outcome.clone());
            tree.evict(id);
            merged.push(outcome);
        }
        merged
    }

    /// Take a resolved task's outcome and evict its subtree. Returns `None`
    /// if the task is unknown or was never resolved.
    pub fn consume(&self, id: TaskId) -> Option<Outcome> {
        let mut tree = self.tree.lock();
        let node = tree.evict(id)?;
        node.outcome().cloned()
    }
}
