//! Delegation tree management
//!
//! Flat, parent-indexed store of task contexts. The tree is acyclic by
//! construction (children always attach under an existing parent with depth
//! parent + 1) and is mutated only by the router and the aggregator, behind a
//! single lock. Cancellation is propagated through child tokens, so
//! cancelling a node sweeps its whole subtree.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ConclaveError;
use crate::role::RoleId;
use crate::task::{ChainLink, Outcome, TaskId, TaskStatus};

/// One unit of work in flight: its role, position in the delegation tree,
/// and (once terminal) its outcome.
#[derive(Debug)]
pub struct TaskContext {
    id: TaskId,
    role: RoleId,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    description: String,
    status: TaskStatus,
    depth: u32,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    outcome: Option<Outcome>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn role(&self) -> &RoleId {
        &self.role
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }
}

/// Manages the delegation tree.
pub struct TaskTree {
    /// All contexts by task ID
    nodes: HashMap<TaskId, TaskContext>,
    /// Root task ID
    root: Option<TaskId>,
}

impl TaskTree {
    /// Create a new empty tree
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
        }
    }

    /// Create the root context at depth 0 with a fresh cancellation token.
    pub fn create_root(
        &mut self,
        role: RoleId,
        description: impl Into<String>,
        deadline: Option<Duration>,
    ) -> TaskId {
        let id = TaskId::new();
        let node = TaskContext {
            id,
            role,
            parent: None,
            children: Vec::new(),
            description: description.into(),
            status: TaskStatus::Pending,
            depth: 0,
            deadline,
            cancel: CancellationToken::new(),
            outcome: None,
        };
        self.nodes.insert(id, node);
        self.root = Some(id);
        id
    }

    /// Create a child context under `parent`.
    ///
    /// The child's depth is parent + 1 and its cancellation token is a child
    /// of the parent's, so cancelling the parent reaches it automatically.
    pub fn create_child(
        &mut self,
        parent: TaskId,
        role: RoleId,
        description: impl Into<String>,
        deadline: Option<Duration>,
    ) -> Result<TaskId, ConclaveError> {
        let (depth, cancel) = {
            let parent_node = self
                .nodes
                .get(&parent)
                .ok_or_else(|| ConclaveError::TaskNotFound(parent.to_string()))?;
            (parent_node.depth + 1, parent_node.cancel.child_token())
        };

        let id = TaskId::new();
        let node = TaskContext {
            id,
            role,
            parent: Some(parent),
            children: Vec::new(),
            description: description.into(),
            status: TaskStatus::Pending,
            depth,
            deadline,
            cancel,
            outcome: None,
        };
        self.nodes.insert(id, node);

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }

        Ok(id)
    }

    /// Get a context by ID
    pub fn get(&self, id: TaskId) -> Option<&TaskContext> {
        self.nodes.get(&id)
    }

    /// Get the root task ID
    pub fn root(&self) -> Option<TaskId> {
        self.root
    }

    pub fn role(&self, id: TaskId) -> Option<RoleId> {
        self.nodes.get(&id).map(|n| n.role.clone())
    }

    pub fn depth(&self, id: TaskId) -> Option<u32> {
        self.nodes.get(&id).map(|n| n.depth)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.nodes.get(&id).map(|n| n.status)
    }

    pub fn token(&self, id: TaskId) -> Option<CancellationToken> {
        self.nodes.get(&id).map(|n| n.cancel.clone())
    }

    /// Apply a status transition. Illegal transitions are dropped, which is
    /// what keeps the lifecycle monotonic no matter who calls this.
    pub fn set_status(&mut self, id: TaskId, next: TaskStatus) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.status.can_transition(next) => {
                node.status = next;
                true
            }
            Some(node) => {
                warn!(
                    task_id = %id,
                    from = %node.status,
                    to = %next,
                    "Ignoring illegal status transition"
                );
                false
            }
            None => false,
        }
    }

    /// Record a terminal outcome. The first resolution wins; later attempts
    /// (e.g. a late completion racing a cancellation sweep) are ignored.
    pub fn record_outcome(&mut self, id: TaskId, outcome: Outcome) -> bool {
        let terminal = if outcome.is_ok() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        match self.nodes.get_mut(&id) {
            Some(node) if !node.status.is_terminal() => {
                node.status = terminal;
                node.outcome = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Ancestor chain of `id`, nearest first (excludes `id` itself).
    pub fn ancestors(&self, id: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(pid) = current {
            out.push(pid);
            current = self.nodes.get(&pid).and_then(|n| n.parent);
        }
        out
    }

    /// Whether `from` or any of its ancestors is the given role working on a
    /// structurally identical task. Used for delegation-loop detection: the
    /// same role with a genuinely different sub-task is allowed.
    pub fn ancestor_matches(&self, from: TaskId, role: &RoleId, description: &str) -> bool {
        let mut current = Some(from);
        while let Some(id) = current {
            match self.nodes.get(&id) {
                Some(node) => {
                    if &node.role == role && node.description == description {
                        return true;
                    }
                    current = node.parent;
                }
                None => break,
            }
        }
        false
    }

    /// Delegation chain from the root down to `id`, for failure reporting.
    pub fn chain(&self, id: TaskId) -> Vec<ChainLink> {
        let mut links: Vec<ChainLink> = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            match self.nodes.get(&cid) {
                Some(node) => {
                    links.push(ChainLink {
                        role: node.role.clone(),
                        task: node.description.clone(),
                    });
                    current = node.parent;
                }
                None => break,
            }
        }
        links.reverse();
        links
    }

    /// All task ids in the subtree rooted at `id`, including `id`.
    pub fn subtree(&self, id: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }

    /// Remove a consumed subtree from the store and detach it from its
    /// parent. Returns the evicted context for `id` itself.
    pub fn evict(&mut self, id: TaskId) -> Option<TaskContext> {
        for descendant in self.subtree(id) {
            if descendant != id {
                self.nodes.remove(&descendant);
            }
        }

        let node = self.nodes.remove(&id)?;
        if let Some(pid) = node.parent {
            if let Some(parent) = self.nodes.get_mut(&pid) {
                parent.children.retain(|c| *c != id);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Some(node)
    }

    /// Get total task count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for TaskTree {
    fn default() -> Self {
        Self::new()
    }
}
