//! # Conclave
//!
//! Role-scoped task delegation engine - the closed assembly.
//!
//! This crate implements the coordination core for an LLM-backed coding
//! assistant built from fixed personas (coder, researcher, planner,
//! reviewer): each role carries a frozen capability set, every tool call is
//! checked at a single gateway, and roles hand sub-tasks to each other
//! through a validated delegation tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DELEGATION ROUTER                        │
//! │  ┌────────────┐  ┌───────────────┐  ┌──────────────────┐    │
//! │  │ Validation │  │  Worker Pool  │  │ Result Aggregator│    │
//! │  └────────────┘  └───────────────┘  └──────────────────┘    │
//! └──────────────┬───────────────────────────────┬──────────────┘
//!                │ delegate                      │ invoke
//!                ▼                               ▼
//!      ┌──────────────────┐            ┌──────────────────┐
//!      │    TASK TREE     │            │   TOOL GATEWAY   │
//!      │  coder (root)    │            │ capability check │
//!      │  ├─ researcher   │            │ + audit trail    │
//!      │  └─ planner      │            └────────┬─────────┘
//!      └──────────────────┘                     │
//!                                               ▼
//!                                      external tools
//!                                  (read, write, search, …)
//! ```
//!
//! ## Key Concepts
//!
//! - **Role**: a named behavioral profile bound to a fixed capability set
//!   and an opaque persona blob
//! - **Capability**: an operation kind a role is permitted to invoke
//! - **Delegation**: a task handing a sub-task to a new task under a
//!   possibly different role
//! - **Task tree**: flat, parent-indexed store of every unit of work in
//!   flight, cancellable by subtree
//! - **Gateway**: the sole mediator between tasks and external operations

pub mod aggregator;
pub mod capability;
pub mod error;
pub mod gateway;
pub mod role;
pub mod router;
pub mod task;
pub mod tree;

pub use aggregator::ResultAggregator;
pub use capability::{Capability, CapabilitySet};
pub use error::ConclaveError;
pub use gateway::{AuditRecord, Tool, ToolError, ToolGateway, ToolInvocation};
pub use role::{RoleDefinition, RoleId, RoleRegistry, RoleRegistryBuilder};
pub use router::{
    DelegationRequest, DelegationRouter, FnRunner, RoleRunner, RouterConfig, RouterEvent,
    TaskScope,
};
pub use task::{ChainLink, Outcome, TaskFailure, TaskId, TaskStatus};
pub use tree::{TaskContext, TaskTree};
