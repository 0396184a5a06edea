//! Conclave error types

use thiserror::Error;

use crate::gateway::ToolError;

/// Errors that can occur in the conclave system.
///
/// Configuration errors (`UnknownRole` at startup, `DuplicateRole`) are fatal:
/// a router is never built over an invalid role table. Everything else is
/// local to the task that raised it and travels back to the parent as a
/// failed outcome, so the whole taxonomy is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConclaveError {
    /// Role is not registered
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Role id registered twice
    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    /// Operation outside the role's capability set
    #[error("Capability denied: role '{role}' may not use {capability}")]
    CapabilityDenied { role: String, capability: String },

    /// Delegation to an ancestor role with an identical task
    #[error("Delegation loop: role '{role}' is already working on this exact task")]
    DelegationLoop { role: String },

    /// Delegation chain grew past the configured maximum
    #[error("Delegation depth exceeded: {depth} > max {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// Task was cancelled, directly or through an ancestor
    #[error("Task cancelled")]
    Cancelled,

    /// Task deadline elapsed
    #[error("Task deadline exceeded")]
    Timeout,

    /// External tool collaborator failed
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Task id no longer present in the tree
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
