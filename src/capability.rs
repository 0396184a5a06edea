//! Capability model for roles
//!
//! Defines the operation kinds a role may invoke and the immutable set type
//! that scopes a role for its entire lifetime.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation kinds that can be granted to a role.
///
/// The set is extensible: adding a kind here requires no change to the
/// router or the gateway, only a tool registration for the new kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read file contents
    ReadFile,
    /// Write or edit files
    WriteFile,
    /// Search the workspace (grep/glob style)
    Search,
    /// Run shell commands
    ExecuteShell,
    /// Produce a plan artifact
    CreatePlan,
}

impl Capability {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ReadFile => "read_file",
            Capability::WriteFile => "write_file",
            Capability::Search => "search",
            Capability::ExecuteShell => "execute_shell",
            Capability::CreatePlan => "create_plan",
        }
    }

    /// All recognized capability kinds
    pub fn all() -> impl Iterator<Item = Capability> {
        [
            Capability::ReadFile,
            Capability::WriteFile,
            Capability::Search,
            Capability::ExecuteShell,
            Capability::CreatePlan,
        ]
        .into_iter()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_file" => Ok(Capability::ReadFile),
            "write_file" => Ok(Capability::WriteFile),
            "search" => Ok(Capability::Search),
            "execute_shell" => Ok(Capability::ExecuteShell),
            "create_plan" => Ok(Capability::CreatePlan),
            _ => Err(format!("Invalid capability: {}", s)),
        }
    }
}

/// An immutable set of capabilities.
///
/// There are no add/remove operations: a set is built once, bound to a role
/// definition at registration, and never changes for the rest of the run.
/// Effective permissions for any task are therefore decidable from its role
/// id alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Empty set (a role that may invoke nothing)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set containing every recognized capability
    pub fn full() -> Self {
        Capability::all().collect()
    }

    /// Read-only scope: file reads and searches
    pub fn read_only() -> Self {
        [Capability::ReadFile, Capability::Search].into_iter().collect()
    }

    /// Check membership
    pub fn contains(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check whether every capability in `self` is also in `other`
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.capabilities.is_subset(&other.capabilities)
    }

    /// First capability present here but absent from `other`, if any
    pub fn first_missing_from(&self, other: &CapabilitySet) -> Option<Capability> {
        self.capabilities.iter().copied().find(|c| !other.contains(*c))
    }

    /// Iterate in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(capabilities: Vec<Capability>) -> Self {
        capabilities.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(cap.as_str())?;
            first = false;
        }
        Ok(())
    }
}
