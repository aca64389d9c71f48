use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::RotationPolicy;

/// Storage flavor of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultType {
    Memory,
    File,
}

/// Free-form backend parameters. File vaults understand `path` (required)
/// and `compress` (`zstd` or absent).
pub type VaultParams = BTreeMap<String, String>;

/// Configuration of one vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub vault_type: VaultType,
    #[serde(default)]
    pub params: VaultParams,
    #[serde(default)]
    pub filter_id: Option<Uuid>,
    #[serde(default)]
    pub rotation_policy_id: Option<Uuid>,
    #[serde(default)]
    pub retention: Option<RetentionRules>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Owning node in a clustered deployment; ignored by the engine.
    #[serde(default)]
    pub node_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl VaultConfig {
    pub fn new(name: impl Into<String>, vault_type: VaultType) -> VaultConfig {
        VaultConfig {
            id: Uuid::now_v7(),
            name: name.into(),
            vault_type,
            params: VaultParams::new(),
            filter_id: None,
            rotation_policy_id: None,
            retention: None,
            enabled: true,
            node_id: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn filter(mut self, id: Uuid) -> Self {
        self.filter_id = Some(id);
        self
    }

    pub fn rotation_policy(mut self, id: Uuid) -> Self {
        self.rotation_policy_id = Some(id);
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.params.get("path").map(|s| s.as_str())
    }

    pub fn compress(&self) -> bool {
        self.params.get("compress").map(|v| v == "zstd").unwrap_or(false)
    }
}

/// A named, reusable filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub id: Uuid,
    pub name: String,
    pub expression: String,
}

impl FilterConfig {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> FilterConfig {
        FilterConfig {
            id: Uuid::now_v7(),
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// A named rotation policy vaults can reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPolicyConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub policy: RotationPolicy,
}

impl RotationPolicyConfig {
    pub fn new(name: impl Into<String>, policy: RotationPolicy) -> RotationPolicyConfig {
        RotationPolicyConfig {
            id: Uuid::now_v7(),
            name: name.into(),
            policy,
        }
    }
}

/// Retention limits. The engine stores and reports these; the retention
/// cron runner enforcing them is an external collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionRules {
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
    #[serde(default)]
    pub max_chunks: Option<u64>,
}

/// The whole persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub vaults: BTreeMap<Uuid, VaultConfig>,
    #[serde(default)]
    pub filters: BTreeMap<Uuid, FilterConfig>,
    #[serde(default)]
    pub rotation_policies: BTreeMap<Uuid, RotationPolicyConfig>,
}

impl ConfigData {
    pub fn vault_by_name(&self, name: &str) -> Option<&VaultConfig> {
        self.vaults.values().find(|v| v.name == name)
    }
}
