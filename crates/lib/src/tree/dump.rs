//! Structural snapshots of a subtree.

use std::fmt::Write;

use serde::Serialize;

use super::{NodeId, Tree, TreeNode};

/// A handle-free copy of a subtree's structure and pending-change state.
///
/// Two dumps compare equal when the subtrees have the same ids, child
/// order, flags, modified state, removal sets and payload labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeDump {
  pub id: String,
  pub label: String,
  pub editable: bool,
  pub ephemeral: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub modified: Option<bool>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub removed: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<TreeDump>,
}

impl TreeDump {
  /// Renders the dump as an indented outline.
  pub fn render(&self) -> String {
    let mut out = String::new();
    self.render_into(&mut out, 0);
    out
  }

  fn render_into(&self, out: &mut String, depth: usize) {
    let _ = write!(out, "{}{}", "  ".repeat(depth), self.id);
    if !self.label.is_empty() {
      let _ = write!(out, " [{}]", self.label);
    }
    if self.modified == Some(true) {
      out.push_str(" *");
    }
    if self.ephemeral {
      out.push_str(" (new)");
    }
    if !self.removed.is_empty() {
      let _ = write!(out, " -{{{}}}", self.removed.join(","));
    }
    out.push('\n');
    for child in &self.children {
      child.render_into(out, depth + 1);
    }
  }

  /// Total number of nodes in the dump.
  pub fn count(&self) -> usize {
    1 + self.children.iter().map(TreeDump::count).sum::<usize>()
  }
}

impl<T> Tree<T> {
  /// Dumps the subtree rooted at `id`, labelling payloads with `label`.
  pub fn dump_with(&self, id: NodeId, label: &impl Fn(&T) -> String) -> Option<TreeDump> {
    let node = self.get(id)?;
    Some(self.dump_node(node, label))
  }

  fn dump_node(&self, node: &TreeNode<T>, label: &impl Fn(&T) -> String) -> TreeDump {
    let state = node.editable_state();
    TreeDump {
      id: node.id.clone(),
      label: label(&node.payload),
      editable: node.editable,
      ephemeral: node.ephemeral,
      modified: state.map(|s| s.is_modified()),
      removed: state
        .map(|s| s.removed_ids().map(str::to_string).collect())
        .unwrap_or_default(),
      children: node
        .children
        .iter()
        .filter_map(|c| self.get(*c))
        .map(|child| self.dump_node(child, label))
        .collect(),
    }
  }
}
