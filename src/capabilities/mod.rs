//! Synthesized capabilities: catalog, lifecycle, secrets, storage and the
//! sandboxed executor.

pub mod catalog;
pub mod crypto;
pub mod executor;
pub mod secrets;
pub mod storage;

pub use catalog::Catalog;
pub use executor::{ExecutionOutput, Executor};
pub use secrets::SecretStore;
pub use storage::StorageStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix that marks a tool name as a catalog capability.
pub const TOOL_PREFIX: &str = "cap_";

/// Lifecycle state of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Building,
    Active,
    Failed,
    Disabled,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `active` can only be left through an explicit disable.  Same-state
    /// moves are not transitions and are rejected here; re-registration of
    /// an active capability goes through [`Catalog::register`].
    pub fn can_transition_to(&self, next: CapabilityStatus) -> bool {
        use CapabilityStatus::*;
        matches!(
            (self, next),
            (Building, Active | Failed | Disabled)
                | (Active, Disabled)
                | (Failed, Building | Active | Disabled)
                | (Disabled, Active | Building)
        )
    }
}

impl std::fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapabilityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "building" => Ok(Self::Building),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "disabled" => Ok(Self::Disabled),
            other => anyhow::bail!("unknown capability status: {other}"),
        }
    }
}

/// A cataloged capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: i64,
    pub status: CapabilityStatus,
    pub input_schema: Value,
    pub output_schema: Value,
    pub tags: Vec<String>,
    /// Directory holding `main.py`, `requirements.txt`, `manifest.json`, `RUN.md`.
    pub path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Capability {
    pub fn is_active(&self) -> bool {
        self.status == CapabilityStatus::Active
    }

    /// Name under which the capability is exposed to the model.
    pub fn tool_name(&self) -> String {
        format!("{TOOL_PREFIX}{}", self.name)
    }
}

/// Input for [`Catalog::create`].
#[derive(Debug, Clone, Default)]
pub struct NewCapability {
    pub name: String,
    pub description: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub tags: Vec<String>,
}

/// Partial metadata update; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct CapabilityUpdate {
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// A credential a capability expects in `context["secrets"]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequiredSecret {
    pub name: String,
    pub description: String,
}

/// Final artifacts handed over by the builder on registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub description: String,
    pub main_py: String,
    pub requirements_txt: String,
    pub input_schema: Value,
    pub tags: Option<Vec<String>>,
    pub required_secrets: Vec<RequiredSecret>,
}

/// `manifest.json` persisted next to the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub description: String,
    pub version: i64,
    pub input_schema: Value,
    pub required_secrets: Vec<RequiredSecret>,
    pub created_at: String,
    pub updated_at: String,
}

/// Code files of a capability.
#[derive(Debug, Clone)]
pub struct CapabilityFiles {
    pub main_py: String,
    pub requirements_txt: String,
}

#[cfg(test)]
mod tests {
    use super::CapabilityStatus::*;

    #[test]
    fn active_only_leaves_through_disable() {
        assert!(Active.can_transition_to(Disabled));
        assert!(!Active.can_transition_to(Failed));
        assert!(!Active.can_transition_to(Building));
    }

    #[test]
    fn building_reaches_every_terminal_state() {
        for next in [Active, Failed, Disabled] {
            assert!(Building.can_transition_to(next));
        }
        assert!(!Building.can_transition_to(Building));
    }

    #[test]
    fn status_parses_from_str() {
        assert_eq!("failed".parse::<super::CapabilityStatus>().unwrap(), Failed);
        assert!("gone".parse::<super::CapabilityStatus>().is_err());
    }
}
