//! Tool gateway - the sole capability enforcement point
//!
//! Every operation request anywhere in the delegation tree passes through
//! [`ToolGateway::invoke`]. No other component holds a reference to the
//! external tool collaborators, so this is the only place a capability
//! violation can occur. Role identity implies nothing beyond what the check
//! here grants.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::error::ConclaveError;
use crate::role::{RoleId, RoleRegistry};
use crate::task::TaskId;

/// Failure of an external tool collaborator, carried unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Identity of the caller, handed to the tool alongside its arguments.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub task: TaskId,
    pub role: RoleId,
    pub capability: Capability,
}

/// An external tool collaborator. One tool per capability kind.
///
/// Tools declaring themselves idempotent opt in to the router's retry
/// policy; everything else runs exactly once.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, invocation: ToolInvocation, args: Value) -> Result<Value, ToolError>;

    fn idempotent(&self) -> bool {
        false
    }
}

/// One audited gateway decision.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub task: TaskId,
    pub role: RoleId,
    pub capability: Capability,
    pub granted: bool,
}

/// Mediates every operation request against the caller's capability set.
pub struct ToolGateway {
    registry: Arc<RoleRegistry>,
    tools: HashMap<Capability, Arc<dyn Tool>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl ToolGateway {
    pub fn new(registry: Arc<RoleRegistry>) -> Self {
        Self {
            registry,
            tools: HashMap::new(),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Wire a tool to a capability kind. Happens before the gateway is
    /// shared; there is no registration after startup.
    pub fn register_tool(&mut self, capability: Capability, tool: Arc<dyn Tool>) {
        self.tools.insert(capability, tool);
    }

    /// Chainable form of [`register_tool`](Self::register_tool).
    pub fn with_tool(mut self, capability: Capability, tool: Arc<dyn Tool>) -> Self {
        self.register_tool(capability, tool);
        self
    }

    /// Whether the tool behind `capability` is marked idempotent.
    pub fn is_idempotent(&self, capability: Capability) -> bool {
        self.tools.get(&capability).map(|t| t.idempotent()).unwrap_or(false)
    }

    /// Invoke a tool on behalf of a task.
    ///
    /// Checks the capability against the caller's role, records the decision
    /// in the audit log either way, and only then forwards to the tool. A
    /// denial never reaches the collaborator, so it can have no side effect.
    pub async fn invoke(
        &self,
        task: TaskId,
        role: &RoleId,
        capability: Capability,
        args: Value,
    ) -> Result<Value, ConclaveError> {
        let definition = self.registry.lookup(role)?;
        let granted = definition.capabilities().contains(capability);

        self.audit.lock().push(AuditRecord {
            task,
            role: role.clone(),
            capability,
            granted,
        });

        if !granted {
            warn!(task_id = %task, role = %role, capability = %capability, "Capability denied");
            return Err(ConclaveError::CapabilityDenied {
                role: role.to_string(),
                capability: capability.to_string(),
            });
        }

        let tool = self.tools.get(&capability).ok_or_else(|| {
            ConclaveError::Tool(ToolError::new(format!(
                "no tool registered for {}",
                capability
            )))
        })?;

        debug!(task_id = %task, role = %role, capability = %capability, "Invoking tool");

        let invocation = ToolInvocation {
            task,
            role: role.clone(),
            capability,
        };
        tool.call(invocation, args).await.map_err(ConclaveError::Tool)
    }

    /// Full audit trail, in invocation order.
    pub fn audit(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }

    /// Audit trail filtered to one task.
    pub fn audit_for(&self, task: TaskId) -> Vec<AuditRecord> {
        self.audit.lock().iter().filter(|r| r.task == task).cloned().collect()
    }
}
