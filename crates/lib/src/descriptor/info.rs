//! Live deployment records reported by the registry.
//!
//! Unlike descriptors these describe what is running, not what is
//! deployed, and they never enter the descriptor tree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A well-known adapter registered outside any application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterInfo {
  pub id: String,
  pub proxy: String,
  pub replica_group_id: String,
}

/// A well-known object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectInfo {
  pub id: String,
  pub proxy: String,
  #[serde(rename = "type")]
  pub type_id: String,
}

/// Static facts about a node host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
  pub name: String,
  pub os: String,
  pub hostname: String,
  pub release: String,
  pub version: String,
  pub machine: String,
  pub processors: u32,
  pub data_dir: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
  #[default]
  Inactive,
  Activating,
  ActivationTimedOut,
  Active,
  Deactivating,
  Destroying,
  Destroyed,
}

impl fmt::Display for ServerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      ServerState::Inactive => "inactive",
      ServerState::Activating => "activating",
      ServerState::ActivationTimedOut => "activation-timed-out",
      ServerState::Active => "active",
      ServerState::Deactivating => "deactivating",
      ServerState::Destroying => "destroying",
      ServerState::Destroyed => "destroyed",
    };
    f.write_str(label)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDynamicInfo {
  pub id: String,
  pub state: ServerState,
  pub pid: Option<u32>,
  pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterDynamicInfo {
  pub id: String,
  /// Empty when the adapter is inactive.
  pub proxy: String,
}

/// Everything a node reports when it comes up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDynamicInfo {
  pub info: NodeInfo,
  pub servers: Vec<ServerDynamicInfo>,
  pub adapters: Vec<AdapterDynamicInfo>,
}
