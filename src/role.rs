//! Role definitions and the frozen role registry
//!
//! A role binds an identifier to a fixed capability set and an opaque persona
//! blob (the natural-language behavioral configuration fed to the model
//! collaborator). The registry is built once at startup and is read-only
//! afterwards, so concurrent lookups need no synchronization.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capability::{Capability, CapabilitySet};
use crate::error::ConclaveError;

/// Canonical role id: full-scope implementation agent
pub const CODER: &str = "coder";
/// Canonical role id: read-only exploration agent
pub const RESEARCHER: &str = "researcher";
/// Canonical role id: plan-writing agent
pub const PLANNER: &str = "planner";
/// Canonical role id: read-only review agent
pub const REVIEWER: &str = "reviewer";

const CODER_PERSONA: &str = "\
You are the coder, the primary implementation agent. You own the working \
tree: read, write, search, and run commands as needed. Hand research off to \
the researcher, plans to the planner, and finished work to the reviewer.";

const RESEARCHER_PERSONA: &str = "\
You are the researcher, a read-only exploration agent. Locate code, trace \
call paths, and summarize findings. You never modify the working tree.";

const PLANNER_PERSONA: &str = "\
You are the planner. Study the codebase and produce step-by-step \
implementation plans. Your writes are limited to plan artifacts.";

const REVIEWER_PERSONA: &str = "\
You are the reviewer, a read-only analysis agent. Inspect changes for \
correctness, style, and missed edge cases, and report concrete findings.";

/// Identifier for a role.
///
/// Role ids are configuration-defined names rather than generated ids, so a
/// delegation request can be written against a stable vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A registered role: id, frozen capability set, opaque persona blob.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    id: RoleId,
    capabilities: CapabilitySet,
    persona: String,
}

impl RoleDefinition {
    pub fn new(
        id: impl Into<RoleId>,
        capabilities: CapabilitySet,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities,
            persona: persona.into(),
        }
    }

    pub fn id(&self) -> &RoleId {
        &self.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// The persona blob. Opaque to the core: stored and handed to the model
    /// collaborator verbatim, never parsed.
    pub fn persona(&self) -> &str {
        &self.persona
    }
}

/// Serialized form of one role in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub id: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub persona: String,
}

/// Serialized role table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTable {
    pub roles: Vec<RoleConfig>,
}

/// Builder for a [`RoleRegistry`]. Consumed on `build`, which is what makes
/// the registry immutable afterwards.
#[derive(Debug, Default)]
pub struct RoleRegistryBuilder {
    roles: HashMap<RoleId, Arc<RoleDefinition>>,
}

impl RoleRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role. Fails with `DuplicateRole` if the id is taken.
    pub fn register(mut self, definition: RoleDefinition) -> Result<Self, ConclaveError> {
        let id = definition.id().clone();
        if self.roles.contains_key(&id) {
            return Err(ConclaveError::DuplicateRole(id.to_string()));
        }
        info!(role = %id, capabilities = %definition.capabilities(), "Registered role");
        self.roles.insert(id, Arc::new(definition));
        Ok(self)
    }

    pub fn build(self) -> RoleRegistry {
        RoleRegistry { roles: self.roles }
    }
}

/// The frozen role table.
///
/// No mutation operation exists after `build`, which guarantees that a task's
/// effective permissions are decidable purely from its role id for its whole
/// lifetime.
#[derive(Debug)]
pub struct RoleRegistry {
    roles: HashMap<RoleId, Arc<RoleDefinition>>,
}

impl RoleRegistry {
    pub fn builder() -> RoleRegistryBuilder {
        RoleRegistryBuilder::new()
    }

    /// Registry preloaded with the four canonical roles.
    pub fn with_defaults() -> Self {
        let planner_caps: CapabilitySet = [
            Capability::ReadFile,
            Capability::Search,
            Capability::WriteFile,
            Capability::CreatePlan,
        ]
        .into_iter()
        .collect();

        // Fixed table, so duplicate registration cannot happen here.
        let builder = Self::builder()
            .register(RoleDefinition::new(CODER, CapabilitySet::full(), CODER_PERSONA))
            .and_then(|b| {
                b.register(RoleDefinition::new(
                    RESEARCHER,
                    CapabilitySet::read_only(),
                    RESEARCHER_PERSONA,
                ))
            })
            .and_then(|b| {
                // The write_file tool is expected to confine planner writes
                // to plan-artifact paths; the grant itself lives here.
                b.register(RoleDefinition::new(PLANNER, planner_caps, PLANNER_PERSONA))
            })
            .and_then(|b| {
                b.register(RoleDefinition::new(
                    REVIEWER,
                    CapabilitySet::read_only(),
                    REVIEWER_PERSONA,
                ))
            });

        match builder {
            Ok(b) => b.build(),
            Err(_) => unreachable!("default role table has unique ids"),
        }
    }

    /// Look up a role. Fails with `UnknownRole` if absent.
    pub fn lookup(&self, id: &RoleId) -> Result<Arc<RoleDefinition>, ConclaveError> {
        self.roles
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownRole(id.to_string()))
    }

    pub fn contains(&self, id: &RoleId) -> bool {
        self.roles.contains_key(id)
    }

    pub fn role_ids(&self) -> Vec<RoleId> {
        self.roles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Build a registry from a serialized role table.
    ///
    /// Errors here are startup-fatal by design: routing never begins over an
    /// invalid role table.
    pub fn from_json_str(json: &str) -> Result<Self, ConclaveError> {
        let table: RoleTable = serde_json::from_str(json)
            .map_err(|e| ConclaveError::Config(format!("invalid role table: {}", e)))?;

        let mut builder = Self::builder();
        for role in table.roles {
            builder = builder.register(RoleDefinition::new(
                role.id,
                role.capabilities.into(),
                role.persona,
            ))?;
        }
        Ok(builder.build())
    }

    /// Load a role table from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, ConclaveError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConclaveError::Config(format!("cannot read role table {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }
}
