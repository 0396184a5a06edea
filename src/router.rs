//! Delegation router - routes units of work to roles and drives the tree
//!
//! A root task is created for one role; whenever the active role needs work
//! outside its scope it delegates a sub-task to another role. The router
//! validates every delegation (role exists, requested capabilities fit the
//! target's declared set, no loop, bounded depth), spawns the child, and
//! suspends the parent until the child resolves. Independent children issued
//! in one batch run concurrently on a bounded worker pool, and their results
//! come back in request order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::ResultAggregator;
use crate::capability::{Capability, CapabilitySet};
use crate::error::ConclaveError;
use crate::gateway::ToolGateway;
use crate::role::{RoleDefinition, RoleId, RoleRegistry};
use crate::task::{Outcome, TaskFailure, TaskId, TaskStatus};
use crate::tree::TaskTree;

/// Router policy knobs. The defaults are policy, not contract: tune per
/// deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum delegation depth before `DepthExceeded`
    pub max_depth: u32,
    /// Retries for failed idempotent tool calls (0 = no implicit retry)
    pub tool_retries: u32,
    /// Worker-pool size for concurrently running tasks
    pub max_concurrency: usize,
    /// Optional deadline applied to root tasks
    pub root_deadline: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            tool_retries: 0,
            max_concurrency: 4,
            root_deadline: None,
        }
    }
}

/// Lifecycle notifications emitted by the router, for observers (UI, audit).
///
/// Best effort: if nobody subscribed, events are dropped silently. Child
/// resolution events are always emitted before the parent's own outcome is
/// delivered.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A task began running
    TaskStarted { id: TaskId, role: RoleId },
    /// A delegation was accepted and a child created
    TaskDelegated { parent: TaskId, child: TaskId, role: RoleId },
    /// A task reached a terminal status
    TaskResolved {
        id: TaskId,
        role: RoleId,
        status: TaskStatus,
        error: Option<ConclaveError>,
    },
}

/// A request to hand a sub-task to another role.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    role: RoleId,
    task: String,
    capabilities: Option<CapabilitySet>,
    deadline: Option<Duration>,
}

impl DelegationRequest {
    pub fn new(role: impl Into<RoleId>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
            capabilities: None,
            deadline: None,
        }
    }

    /// Narrow the capabilities requested for the child. Must be a subset of
    /// the target role's declared set or the delegation is rejected. When
    /// absent, the target's full declared set is assumed.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Deadline for the child task and its subtree.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn role(&self) -> &RoleId {
        &self.role
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

/// The external collaborator that drives one task: in production the
/// model-invocation loop, in tests a scripted closure. The core never
/// prompts a model or parses a response; it only hands the runner a scope.
#[async_trait]
pub trait RoleRunner: Send + Sync {
    async fn run(&self, scope: TaskScope) -> Result<Value, ConclaveError>;
}

/// Adapter turning an async closure into a [`RoleRunner`].
pub struct FnRunner<F>(F);

impl<F> FnRunner<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> RoleRunner for FnRunner<F>
where
    F: Fn(TaskScope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ConclaveError>> + Send,
{
    async fn run(&self, scope: TaskScope) -> Result<Value, ConclaveError> {
        (self.0)(scope).await
    }
}

/// A running task's view of the system, handed to its [`RoleRunner`].
///
/// Everything a role can do goes through here: tool calls via the gateway,
/// sub-tasks via the router. The scope also carries the task's worker-pool
/// slot, which is given back while the task is suspended on its children.
pub struct TaskScope {
    router: Arc<DelegationRouter>,
    id: TaskId,
    role: Arc<RoleDefinition>,
    description: String,
    cancel: CancellationToken,
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl TaskScope {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn role_id(&self) -> &RoleId {
        self.role.id()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        self.role.capabilities()
    }

    /// The opaque persona blob configured for this role.
    pub fn persona(&self) -> &str {
        self.role.persona()
    }

    /// The task description this scope is working on.
    pub fn task(&self) -> &str {
        &self.description
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Invoke a tool under this task's role. Denied operations never reach
    /// the collaborator.
    pub async fn invoke(&self, capability: Capability, args: Value) -> Result<Value, ConclaveError> {
        self.router.invoke_tool(self.id, capability, args).await
    }

    /// Delegate one sub-task and suspend until it resolves.
    pub async fn delegate(&self, request: DelegationRequest) -> Outcome {
        let mut outcomes = self.delegate_many(vec![request]).await;
        outcomes.pop().unwrap_or_else(|| {
            Err(TaskFailure::new(ConclaveError::Config("empty delegation batch".into())))
        })
    }

    /// Delegate a batch of independent sub-tasks, run them concurrently, and
    /// get their outcomes back in request order.
    ///
    /// This is the task's only suspension point. The worker-pool slot is
    /// released for the duration and taken back before execution resumes.
    pub async fn delegate_many(&self, requests: Vec<DelegationRequest>) -> Vec<Outcome> {
        let released = self.slot.lock().take();
        let had_slot = released.is_some();
        drop(released);

        let outcomes = self.router.delegate_many(self.id, requests).await;

        if had_slot {
            if let Ok(permit) = Arc::clone(&self.router.slots).acquire_owned().await {
                *self.slot.lock() = Some(permit);
            }
        }
        outcomes
    }
}

/// The delegation router.
///
/// Owns the task tree for its lifetime; only the router and the aggregator
/// ever mutate it, behind one lock.
pub struct DelegationRouter {
    registry: Arc<RoleRegistry>,
    gateway: Arc<ToolGateway>,
    runner: Arc<dyn RoleRunner>,
    config: RouterConfig,
    tree: Arc<Mutex<TaskTree>>,
    aggregator: ResultAggregator,
    slots: Arc<Semaphore>,
    /// Join handles for in-flight children, swept on cancellation
    handles: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    /// Lifecycle event subscriber, if any
    events: Mutex<Option<mpsc::UnboundedSender<RouterEvent>>>,
}

impl DelegationRouter {
    pub fn new(
        registry: Arc<RoleRegistry>,
        gateway: Arc<ToolGateway>,
        runner: Arc<dyn RoleRunner>,
        config: RouterConfig,
    ) -> Arc<Self> {
        let tree = Arc::new(Mutex::new(TaskTree::new()));
        Arc::new(Self {
            registry,
            gateway,
            runner,
            slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            aggregator: ResultAggregator::new(Arc::clone(&tree)),
            tree,
            config,
            handles: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
        })
    }

    /// Subscribe to lifecycle events. A new subscription replaces any
    /// previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RouterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: RouterEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Run a root task to completion and return its terminal outcome.
    ///
    /// This is the only entry point for surrounding CLI/UI code. Internal
    /// task ids never appear in the outcome; failures carry the taxonomy
    /// error plus the role/task delegation chain that produced them.
    #[instrument(skip_all, fields(role = %role))]
    pub async fn run_root_task(self: &Arc<Self>, role: RoleId, task: impl Into<String>) -> Outcome {
        let task = task.into();

        // an unregistered root role is a configuration fault; no task
        // context is created for it
        if let Err(err) = self.registry.lookup(&role) {
            warn!(role = %role, "Refusing root task for unregistered role");
            return Err(TaskFailure::new(err));
        }

        let root = self
            .tree
            .lock()
            .create_root(role.clone(), task, self.config.root_deadline);
        info!(task_id = %root, "Root task started");

        let outcome = Arc::clone(self).execute(root).await;
        self.aggregator.resolve(root, &outcome);
        self.emit(RouterEvent::TaskResolved {
            id: root,
            role: role.clone(),
            status: if outcome.is_ok() { TaskStatus::Succeeded } else { TaskStatus::Failed },
            error: outcome.as_ref().err().map(|f| f.error.clone()),
        });
        self.aggregator.consume(root);

        match &outcome {
            Ok(_) => info!(task_id = %root, "Root task succeeded"),
            Err(failure) => warn!(task_id = %root, error = %failure, "Root task failed"),
        }
        outcome
    }

    /// Delegate one sub-task on behalf of `parent`.
    pub async fn delegate(
        self: &Arc<Self>,
        parent: TaskId,
        request: DelegationRequest,
    ) -> Outcome {
        let mut outcomes = self.delegate_many(parent, vec![request]).await;
        outcomes.pop().unwrap_or_else(|| {
            Err(TaskFailure::new(ConclaveError::Config("empty delegation batch".into())))
        })
    }

    /// Delegate a batch of sub-tasks on behalf of `parent`.
    ///
    /// Every request is validated and its child created before any child
    /// starts. Children run concurrently; outcomes come back in request
    /// order regardless of completion order. A validation failure occupies
    /// its slot in the result without affecting its siblings.
    pub async fn delegate_many(
        self: &Arc<Self>,
        parent: TaskId,
        requests: Vec<DelegationRequest>,
    ) -> Vec<Outcome> {
        if requests.is_empty() {
            return Vec::new();
        }

        let prepared: Vec<Result<TaskId, TaskFailure>> =
            requests.iter().map(|r| self.prepare_child(parent, r)).collect();

        // the parent is suspended on its children from here on; it never
        // returns to direct execution status
        if prepared.iter().any(|p| p.is_ok()) {
            self.tree.lock().set_status(parent, TaskStatus::Delegated);
        }

        let receivers: Vec<Option<oneshot::Receiver<Outcome>>> = prepared
            .iter()
            .map(|slot| slot.as_ref().ok().map(|child| self.spawn_child(*child)))
            .collect();

        // join in request order; completion order does not matter
        let mut joined: Vec<(TaskId, Outcome)> = Vec::new();
        for (slot, receiver) in prepared.iter().zip(receivers) {
            if let (Ok(child), Some(receiver)) = (slot, receiver) {
                let outcome = match receiver.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.failure(*child, ConclaveError::Cancelled)),
                };
                joined.push((*child, outcome));
            }
        }

        {
            let mut handles = self.handles.lock();
            for (child, _) in &joined {
                handles.remove(child);
            }
        }

        let mut merged = self.aggregator.resolve_batch(joined).into_iter();
        prepared
            .into_iter()
            .map(|slot| match slot {
                Ok(_) => merged.next().unwrap_or_else(|| {
                    Err(TaskFailure::new(ConclaveError::Config(
                        "missing child outcome".into(),
                    )))
                }),
                Err(failure) => Err(failure),
            })
            .collect()
    }

    /// Invoke a tool for a task, applying the retry policy.
    ///
    /// Only failures of tools marked idempotent are retried, and only up to
    /// the configured count. Capability denials are never retried; the
    /// answer would not change.
    pub async fn invoke_tool(
        &self,
        task: TaskId,
        capability: Capability,
        args: Value,
    ) -> Result<Value, ConclaveError> {
        let role = self
            .tree
            .lock()
            .role(task)
            .ok_or_else(|| ConclaveError::TaskNotFound(task.to_string()))?;

        let mut attempt = 0;
        loop {
            match self.gateway.invoke(task, &role, capability, args.clone()).await {
                Err(ConclaveError::Tool(err))
                    if attempt < self.config.tool_retries
                        && self.gateway.is_idempotent(capability) =>
                {
                    attempt += 1;
                    warn!(
                        task_id = %task,
                        capability = %capability,
                        attempt,
                        error = %err,
                        "Retrying idempotent tool call"
                    );
                }
                other => return other,
            }
        }
    }

    /// Cancel a task and, transitively, every in-flight descendant.
    pub fn cancel(&self, id: TaskId) {
        if let Some(token) = self.tree.lock().token(id) {
            info!(task_id = %id, "Cancelling task subtree");
            token.cancel();
        }
    }

    /// Validate one delegation request and create its pending child.
    fn prepare_child(
        &self,
        parent: TaskId,
        request: &DelegationRequest,
    ) -> Result<TaskId, TaskFailure> {
        // 1. target role must be registered
        let target = match self.registry.lookup(&request.role) {
            Ok(target) => target,
            Err(err) => return Err(self.failure(parent, err)),
        };

        // 2. requested capabilities must fit the target's declared set
        if let Some(requested) = &request.capabilities {
            if let Some(missing) = requested.first_missing_from(target.capabilities()) {
                return Err(self.failure(
                    parent,
                    ConclaveError::CapabilityDenied {
                        role: request.role.to_string(),
                        capability: missing.to_string(),
                    },
                ));
            }
        }

        let mut tree = self.tree.lock();

        // 3. same role, structurally identical task up the chain is a loop
        if tree.ancestor_matches(parent, &request.role, &request.task) {
            let chain = tree.chain(parent);
            return Err(TaskFailure::with_chain(
                ConclaveError::DelegationLoop { role: request.role.to_string() },
                chain,
            ));
        }

        // 4. bounded depth
        let depth = match tree.depth(parent) {
            Some(parent_depth) => parent_depth + 1,
            None => {
                return Err(TaskFailure::new(ConclaveError::TaskNotFound(parent.to_string())))
            }
        };
        if depth > self.config.max_depth {
            let chain = tree.chain(parent);
            return Err(TaskFailure::with_chain(
                ConclaveError::DepthExceeded { depth, max: self.config.max_depth },
                chain,
            ));
        }

        let child = tree
            .create_child(parent, request.role.clone(), request.task.as_str(), request.deadline)
            .map_err(TaskFailure::new)?;

        drop(tree);
        debug!(
            parent_id = %parent,
            child_id = %child,
            role = %request.role,
            depth,
            "Delegation accepted"
        );
        self.emit(RouterEvent::TaskDelegated {
            parent,
            child,
            role: request.role.clone(),
        });
        Ok(child)
    }

    /// Spawn a child's execution. The spawned task resolves the child in the
    /// tree itself, so a child settles even if its parent has been cancelled
    /// and is no longer listening.
    fn spawn_child(self: &Arc<Self>, child: TaskId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let role = router.tree.lock().role(child);
            let outcome = Arc::clone(&router).execute(child).await;
            router.aggregator.resolve(child, &outcome);
            if let Some(role) = role {
                router.emit(RouterEvent::TaskResolved {
                    id: child,
                    role,
                    status: if outcome.is_ok() { TaskStatus::Succeeded } else { TaskStatus::Failed },
                    error: outcome.as_ref().err().map(|f| f.error.clone()),
                });
            }
            let _ = tx.send(outcome);
        });
        self.handles.lock().insert(child, handle);
        rx
    }

    /// Drive one task to a terminal outcome.
    #[instrument(skip_all, fields(task_id = %id))]
    async fn execute(self: Arc<Self>, id: TaskId) -> Outcome {
        let (role_id, description, cancel, deadline) = {
            let tree = self.tree.lock();
            match tree.get(id) {
                Some(node) => (
                    node.role().clone(),
                    node.description().to_string(),
                    node.cancel_token(),
                    node.deadline(),
                ),
                None => {
                    return Err(TaskFailure::new(ConclaveError::TaskNotFound(id.to_string())))
                }
            }
        };

        let role = match self.registry.lookup(&role_id) {
            Ok(role) => role,
            Err(err) => return Err(self.failure(id, err)),
        };

        // wait for a worker slot, unless the task is cancelled first
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.failure(id, ConclaveError::Cancelled));
            }
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(self.failure(id, ConclaveError::Config("worker pool closed".into())));
                }
            },
        };

        self.tree.lock().set_status(id, TaskStatus::Running);
        debug!(role = %role_id, "Task running");
        self.emit(RouterEvent::TaskStarted { id, role: role_id.clone() });

        let scope = TaskScope {
            router: Arc::clone(&self),
            id,
            role,
            description,
            cancel: cancel.clone(),
            slot: Mutex::new(Some(permit)),
        };

        let mut work = self.runner.run(scope);

        let result = if let Some(deadline) = deadline {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ConclaveError::Cancelled),
                res = tokio::time::timeout(deadline, &mut work) => {
                    res.unwrap_or(Err(ConclaveError::Timeout))
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ConclaveError::Cancelled),
                res = &mut work => res,
            }
        };

        match result {
            Ok(value) => Ok(value),
            Err(err @ (ConclaveError::Cancelled | ConclaveError::Timeout)) => {
                // stop the whole subtree; every child settles before this
                // task's outcome is delivered
                cancel.cancel();
                drop(work);
                self.drain_subtree(id).await;
                Err(self.failure(id, err))
            }
            Err(err) => Err(self.failure(id, err)),
        }
    }

    /// Await every in-flight descendant of `id` until it has resolved.
    async fn drain_subtree(&self, id: TaskId) {
        let descendants: Vec<TaskId> = self
            .tree
            .lock()
            .subtree(id)
            .into_iter()
            .filter(|d| *d != id)
            .collect();

        let handles: Vec<JoinHandle<()>> = {
            let mut map = self.handles.lock();
            descendants.iter().filter_map(|d| map.remove(d)).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Build a failed outcome carrying the delegation chain down to `id`.
    fn failure(&self, id: TaskId, error: ConclaveError) -> TaskFailure {
        let chain = self.tree.lock().chain(id);
        TaskFailure::with_chain(error, chain)
    }
}
