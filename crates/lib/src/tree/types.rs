//! Node, shape and editable-state types for the mirror tree.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Handle to a node stored in a [`Tree`](super::Tree).
///
/// Handles carry a generation so that a handle to a released node never
/// aliases a node later stored in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
  pub(super) index: u32,
  pub(super) generation: u32,
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}.{}", self.index, self.generation)
  }
}

/// Pending-change bookkeeping of an editable container.
///
/// `modified` is set by any accepted local edit below the container and
/// stays set until [`Editable::commit`]. `removed` lists the ids of
/// committed children deleted since then; an id appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Editable {
  modified: bool,
  removed: BTreeSet<String>,
}

impl Editable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_modified(&self) -> bool {
    self.modified
  }

  pub fn mark_modified(&mut self) {
    self.modified = true;
  }

  /// Records the removal of a committed child. Returns false if the id was
  /// already recorded.
  pub fn record_removed(&mut self, id: &str) -> bool {
    self.removed.insert(id.to_string())
  }

  pub fn removed_ids(&self) -> impl Iterator<Item = &str> {
    self.removed.iter().map(String::as_str)
  }

  /// Clears the modified flag and the removal set.
  pub fn commit(&mut self) {
    self.modified = false;
    self.removed.clear();
  }
}

/// The closed set of node variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeShape {
  /// Holds no children.
  Leaf,
  /// Holds children; has no pending-change state of its own.
  Container,
  /// Holds children and tracks local modifications and removals.
  EditableContainer(Editable),
  /// An editable container whose children are templates.
  TemplateContainer(Editable),
}

impl NodeShape {
  pub fn accepts_children(&self) -> bool {
    !matches!(self, NodeShape::Leaf)
  }

  pub fn editable_state(&self) -> Option<&Editable> {
    match self {
      NodeShape::EditableContainer(state) | NodeShape::TemplateContainer(state) => Some(state),
      NodeShape::Leaf | NodeShape::Container => None,
    }
  }

  pub fn editable_state_mut(&mut self) -> Option<&mut Editable> {
    match self {
      NodeShape::EditableContainer(state) | NodeShape::TemplateContainer(state) => Some(state),
      NodeShape::Leaf | NodeShape::Container => None,
    }
  }
}

/// Everything needed to create a node.
#[derive(Debug, Clone)]
pub struct NodeSpec<T> {
  pub id: String,
  pub shape: NodeShape,
  /// False when the node displays resolved values and cannot be edited.
  pub editable: bool,
  /// True for nodes not yet committed to any container.
  pub ephemeral: bool,
  pub payload: T,
}

impl<T> NodeSpec<T> {
  pub fn new(id: impl Into<String>, shape: NodeShape, payload: T) -> Self {
    Self {
      id: id.into(),
      shape,
      editable: true,
      ephemeral: false,
      payload,
    }
  }

  pub fn leaf(id: impl Into<String>, payload: T) -> Self {
    Self::new(id, NodeShape::Leaf, payload)
  }

  pub fn container(id: impl Into<String>, payload: T) -> Self {
    Self::new(id, NodeShape::Container, payload)
  }

  pub fn editable_container(id: impl Into<String>, state: Editable, payload: T) -> Self {
    Self::new(id, NodeShape::EditableContainer(state), payload)
  }

  pub fn template_container(id: impl Into<String>, state: Editable, payload: T) -> Self {
    Self::new(id, NodeShape::TemplateContainer(state), payload)
  }

  pub fn editable(mut self, editable: bool) -> Self {
    self.editable = editable;
    self
  }

  pub fn ephemeral(mut self, ephemeral: bool) -> Self {
    self.ephemeral = ephemeral;
    self
  }
}

/// A node stored in the tree.
#[derive(Debug, Clone)]
pub struct TreeNode<T> {
  pub(super) id: String,
  pub(super) shape: NodeShape,
  pub(super) editable: bool,
  pub(super) ephemeral: bool,
  pub(super) parent: Option<NodeId>,
  pub(super) children: Vec<NodeId>,
  pub(super) payload: T,
}

impl<T> TreeNode<T> {
  pub(super) fn from_spec(spec: NodeSpec<T>) -> Self {
    Self {
      id: spec.id,
      shape: spec.shape,
      editable: spec.editable,
      ephemeral: spec.ephemeral,
      parent: None,
      children: Vec::new(),
      payload: spec.payload,
    }
  }

  /// Id, unique among siblings.
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn shape(&self) -> &NodeShape {
    &self.shape
  }

  pub fn is_editable(&self) -> bool {
    self.editable
  }

  pub fn is_ephemeral(&self) -> bool {
    self.ephemeral
  }

  pub fn set_ephemeral(&mut self, ephemeral: bool) {
    self.ephemeral = ephemeral;
  }

  pub fn parent(&self) -> Option<NodeId> {
    self.parent
  }

  /// Children in ascending id order.
  pub fn children(&self) -> &[NodeId] {
    &self.children
  }

  pub fn payload(&self) -> &T {
    &self.payload
  }

  pub fn payload_mut(&mut self) -> &mut T {
    &mut self.payload
  }

  pub fn editable_state(&self) -> Option<&Editable> {
    self.shape.editable_state()
  }

  pub fn editable_state_mut(&mut self) -> Option<&mut Editable> {
    self.shape.editable_state_mut()
  }
}

/// Errors from structural tree operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
  /// Two children of one container would share an id.
  #[error("duplicate id '{id}' in {container}")]
  DuplicateId { container: String, id: String },

  #[error("stale node handle {0}")]
  StaleHandle(NodeId),

  #[error("'{0}' cannot hold children")]
  NotAContainer(String),

  #[error("node {0} is already attached")]
  AlreadyAttached(NodeId),

  #[error("the root node cannot be detached")]
  DetachRoot,
}

/// A subtree unlinked from its parent, kept alive for reattachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Detached {
  pub node: NodeId,
  pub parent: NodeId,
}
