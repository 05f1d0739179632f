//! Live state reported by nodes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::descriptor::{AdapterDynamicInfo, NodeDynamicInfo, ServerDynamicInfo, ServerState};

/// What every node that is up currently runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeState {
  nodes: BTreeMap<String, NodeDynamicInfo>,
}

impl RuntimeState {
  pub fn node_up(&mut self, info: NodeDynamicInfo) {
    debug!(node = %info.info.name, servers = info.servers.len(), "node up");
    self.nodes.insert(info.info.name.clone(), info);
  }

  pub fn node_down(&mut self, name: &str) -> bool {
    debug!(node = name, "node down");
    self.nodes.remove(name).is_some()
  }

  /// Records a server state change. Returns false if the node is not up.
  pub fn update_server(&mut self, node: &str, info: ServerDynamicInfo) -> bool {
    let Some(entry) = self.nodes.get_mut(node) else {
      return false;
    };
    match entry.servers.iter_mut().find(|s| s.id == info.id) {
      Some(existing) => *existing = info,
      None => entry.servers.push(info),
    }
    true
  }

  /// Records an adapter activation or deactivation. Returns false if the
  /// node is not up.
  pub fn update_adapter(&mut self, node: &str, info: AdapterDynamicInfo) -> bool {
    let Some(entry) = self.nodes.get_mut(node) else {
      return false;
    };
    match entry.adapters.iter_mut().find(|a| a.id == info.id) {
      Some(existing) => *existing = info,
      None => entry.adapters.push(info),
    }
    true
  }

  pub fn is_up(&self, node: &str) -> bool {
    self.nodes.contains_key(node)
  }

  pub fn node(&self, name: &str) -> Option<&NodeDynamicInfo> {
    self.nodes.get(name)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &NodeDynamicInfo> {
    self.nodes.values()
  }

  /// State of a server; servers on nodes that are down are inactive.
  pub fn server_state(&self, node: &str, server: &str) -> ServerState {
    self
      .nodes
      .get(node)
      .and_then(|n| n.servers.iter().find(|s| s.id == server))
      .map(|s| s.state)
      .unwrap_or_default()
  }
}
