//! Arena-backed mirror tree.
//!
//! Nodes live in a flat slot table and refer to each other through
//! [`NodeId`] handles; a node knows its parent's handle but holds no
//! reference into it. Children of a container are kept in ascending id
//! order and ids are unique among siblings, so two trees built from the
//! same descriptors dump identically.
//!
//! Subtrees can be detached and later reattached without being rebuilt,
//! which is what [`Transaction`] uses to restore exactly what it replaced.

mod dump;
mod transaction;
mod types;

pub use dump::TreeDump;
pub use transaction::Transaction;
pub use types::*;

#[derive(Debug, Clone)]
struct Slot<T> {
  generation: u32,
  node: Option<TreeNode<T>>,
}

/// A tree of `T` payloads.
#[derive(Debug, Clone)]
pub struct Tree<T> {
  slots: Vec<Slot<T>>,
  free: Vec<u32>,
  root: NodeId,
  live: usize,
}

impl<T> Tree<T> {
  /// Creates a tree holding only `root`.
  pub fn new(root: NodeSpec<T>) -> Self {
    let mut tree = Self {
      slots: Vec::new(),
      free: Vec::new(),
      root: NodeId { index: 0, generation: 0 },
      live: 0,
    };
    tree.root = tree.create(root);
    tree
  }

  pub fn root(&self) -> NodeId {
    self.root
  }

  /// Number of live nodes, attached or not.
  pub fn len(&self) -> usize {
    self.live
  }

  pub fn is_empty(&self) -> bool {
    self.live == 0
  }

  pub fn get(&self, id: NodeId) -> Option<&TreeNode<T>> {
    self
      .slots
      .get(id.index as usize)
      .filter(|slot| slot.generation == id.generation)
      .and_then(|slot| slot.node.as_ref())
  }

  pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode<T>> {
    self
      .slots
      .get_mut(id.index as usize)
      .filter(|slot| slot.generation == id.generation)
      .and_then(|slot| slot.node.as_mut())
  }

  pub fn node(&self, id: NodeId) -> Result<&TreeNode<T>, TreeError> {
    self.get(id).ok_or(TreeError::StaleHandle(id))
  }

  pub fn node_mut(&mut self, id: NodeId) -> Result<&mut TreeNode<T>, TreeError> {
    self.get_mut(id).ok_or(TreeError::StaleHandle(id))
  }

  pub fn payload(&self, id: NodeId) -> Option<&T> {
    self.get(id).map(TreeNode::payload)
  }

  /// Children of `id` in id order; empty for stale handles.
  pub fn children(&self, id: NodeId) -> &[NodeId] {
    self.get(id).map(TreeNode::children).unwrap_or(&[])
  }

  /// Finds the child of `parent` with the given id.
  pub fn find_child(&self, parent: NodeId, id: &str) -> Option<NodeId> {
    let children = self.children(parent);
    children
      .binary_search_by(|child| self.child_id(*child).cmp(id))
      .ok()
      .map(|pos| children[pos])
  }

  /// Follows a path of child ids starting at `from`.
  pub fn resolve_path(&self, from: NodeId, path: &[&str]) -> Option<NodeId> {
    path
      .iter()
      .try_fold(from, |current, segment| self.find_child(current, segment))
  }

  /// Ids from the root down to `id`.
  pub fn path(&self, id: NodeId) -> Vec<String> {
    let mut path: Vec<String> = self.ancestors(id).iter().map(|n| self.child_id(*n).to_string()).collect();
    path.reverse();
    path
  }

  /// [`Tree::path`] joined with `/`.
  pub fn path_string(&self, id: NodeId) -> String {
    self.path(id).join("/")
  }

  /// `id` followed by its ancestors up to the topmost one.
  pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let mut current = self.get(id).map(|_| id);
    while let Some(node) = current {
      chain.push(node);
      current = self.get(node).and_then(TreeNode::parent);
    }
    chain
  }

  /// The closest node at or above `id` that tracks pending changes.
  pub fn nearest_editable(&self, id: NodeId) -> Option<NodeId> {
    self
      .ancestors(id)
      .into_iter()
      .find(|n| self.get(*n).is_some_and(|node| node.editable_state().is_some()))
  }

  /// True if `id` or any of its ancestors is ephemeral.
  pub fn is_ephemeral(&self, id: NodeId) -> bool {
    self
      .ancestors(id)
      .into_iter()
      .any(|n| self.get(n).is_some_and(TreeNode::is_ephemeral))
  }

  /// `id` and all its descendants, in pre-order.
  pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![id];
    while let Some(node) = stack.pop() {
      if let Some(n) = self.get(node) {
        out.push(node);
        stack.extend(n.children.iter().rev().copied());
      }
    }
    out
  }

  /// Stores a node without attaching it anywhere.
  pub fn create(&mut self, spec: NodeSpec<T>) -> NodeId {
    let node = TreeNode::from_spec(spec);
    self.live += 1;
    match self.free.pop() {
      Some(index) => {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.node = Some(node);
        NodeId {
          index,
          generation: slot.generation,
        }
      }
      None => {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
          generation: 0,
          node: Some(node),
        });
        NodeId { index, generation: 0 }
      }
    }
  }

  /// Attaches an unattached node under `parent`, keeping id order.
  ///
  /// # Errors
  ///
  /// [`TreeError::DuplicateId`] if `parent` already has a child with the
  /// same id; the tree is left unchanged.
  pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
    let child_node = self.node(child)?;
    if child_node.parent.is_some() || child == self.root {
      return Err(TreeError::AlreadyAttached(child));
    }
    let child_id = child_node.id.clone();

    let parent_node = self.node(parent)?;
    if !parent_node.shape.accepts_children() {
      return Err(TreeError::NotAContainer(self.path_string(parent)));
    }
    let position = match parent_node
      .children
      .binary_search_by(|c| self.child_id(*c).cmp(child_id.as_str()))
    {
      Ok(_) => {
        return Err(TreeError::DuplicateId {
          container: self.path_string(parent),
          id: child_id,
        });
      }
      Err(position) => position,
    };

    self.node_mut(parent)?.children.insert(position, child);
    self.node_mut(child)?.parent = Some(parent);
    Ok(())
  }

  /// Creates a node and attaches it under `parent`.
  pub fn add(&mut self, parent: NodeId, spec: NodeSpec<T>) -> Result<NodeId, TreeError> {
    let child = self.create(spec);
    if let Err(err) = self.attach(parent, child) {
      self.release(child);
      return Err(err);
    }
    Ok(child)
  }

  /// Unlinks a subtree from its parent without releasing it.
  pub fn detach(&mut self, id: NodeId) -> Result<Detached, TreeError> {
    if id == self.root {
      return Err(TreeError::DetachRoot);
    }
    let parent = self.node(id)?.parent.ok_or(TreeError::StaleHandle(id))?;
    self.node_mut(parent)?.children.retain(|c| *c != id);
    self.node_mut(id)?.parent = None;
    Ok(Detached { node: id, parent })
  }

  /// Puts a detached subtree back under its former parent.
  pub fn reattach(&mut self, detached: Detached) -> Result<(), TreeError> {
    self.attach(detached.parent, detached.node)
  }

  /// Frees `id` and its descendants, unlinking it first if attached.
  pub fn release(&mut self, id: NodeId) {
    if id == self.root || self.get(id).is_none() {
      return;
    }
    if self.get(id).and_then(TreeNode::parent).is_some() {
      let _ = self.detach(id);
    }
    for node in self.descendants(id) {
      let slot = &mut self.slots[node.index as usize];
      if slot.node.take().is_some() {
        self.live -= 1;
        self.free.push(node.index);
      }
    }
  }

  /// Detaches and frees a subtree.
  pub fn remove(&mut self, id: NodeId) -> Result<(), TreeError> {
    let detached = self.detach(id)?;
    self.release(detached.node);
    Ok(())
  }

  fn child_id(&self, id: NodeId) -> &str {
    self.get(id).map(TreeNode::id).unwrap_or("")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tree() -> Tree<&'static str> {
    Tree::new(NodeSpec::container("root", "root"))
  }

  fn ids(tree: &Tree<&'static str>, parent: NodeId) -> Vec<String> {
    tree
      .children(parent)
      .iter()
      .map(|c| tree.node(*c).unwrap().id().to_string())
      .collect()
  }

  #[test]
  fn children_are_kept_in_id_order() {
    let mut tree = tree();
    let root = tree.root();
    for id in ["b", "c", "a"] {
      tree.add(root, NodeSpec::leaf(id, "leaf")).unwrap();
    }
    assert_eq!(ids(&tree, root), vec!["a", "b", "c"]);
    assert!(tree.find_child(root, "b").is_some());
    assert!(tree.find_child(root, "z").is_none());
  }

  #[test]
  fn duplicate_sibling_ids_are_rejected() {
    let mut tree = tree();
    let root = tree.root();
    tree.add(root, NodeSpec::leaf("a", "first")).unwrap();
    let before = tree.len();

    let err = tree.add(root, NodeSpec::leaf("a", "second")).unwrap_err();

    assert_eq!(
      err,
      TreeError::DuplicateId {
        container: "root".to_string(),
        id: "a".to_string(),
      }
    );
    assert_eq!(tree.len(), before);
    assert_eq!(tree.payload(tree.find_child(root, "a").unwrap()), Some(&"first"));
  }

  #[test]
  fn same_id_is_allowed_in_different_containers() {
    let mut tree = tree();
    let root = tree.root();
    let x = tree.add(root, NodeSpec::container("x", "c")).unwrap();
    let y = tree.add(root, NodeSpec::container("y", "c")).unwrap();
    tree.add(x, NodeSpec::leaf("same", "l")).unwrap();
    tree.add(y, NodeSpec::leaf("same", "l")).unwrap();
    assert_eq!(tree.path_string(tree.find_child(y, "same").unwrap()), "root/y/same");
  }

  #[test]
  fn leaves_cannot_hold_children() {
    let mut tree = tree();
    let root = tree.root();
    let leaf = tree.add(root, NodeSpec::leaf("leaf", "l")).unwrap();
    let err = tree.add(leaf, NodeSpec::leaf("child", "c")).unwrap_err();
    assert_eq!(err, TreeError::NotAContainer("root/leaf".to_string()));
  }

  #[test]
  fn detach_and_reattach_restore_position() {
    let mut tree = tree();
    let root = tree.root();
    for id in ["a", "b", "c"] {
      tree.add(root, NodeSpec::leaf(id, "leaf")).unwrap();
    }
    let b = tree.find_child(root, "b").unwrap();

    let detached = tree.detach(b).unwrap();
    assert_eq!(ids(&tree, root), vec!["a", "c"]);
    tree.reattach(detached).unwrap();

    assert_eq!(ids(&tree, root), vec!["a", "b", "c"]);
    assert_eq!(tree.find_child(root, "b"), Some(b));
  }

  #[test]
  fn released_handles_go_stale() {
    let mut tree = tree();
    let root = tree.root();
    let parent = tree.add(root, NodeSpec::container("p", "p")).unwrap();
    let child = tree.add(parent, NodeSpec::leaf("c", "c")).unwrap();

    tree.remove(parent).unwrap();

    assert!(tree.get(parent).is_none());
    assert!(tree.get(child).is_none());
    assert_eq!(tree.len(), 1);

    let reused = tree.add(root, NodeSpec::leaf("n", "n")).unwrap();
    assert_ne!(reused, parent);
    assert!(tree.get(parent).is_none());
  }

  #[test]
  fn root_cannot_be_detached() {
    let mut tree = tree();
    let root = tree.root();
    assert_eq!(tree.detach(root).unwrap_err(), TreeError::DetachRoot);
  }

  #[test]
  fn nearest_editable_walks_up() {
    let mut tree = tree();
    let root = tree.root();
    let editable = tree
      .add(root, NodeSpec::editable_container("e", Editable::new(), "e"))
      .unwrap();
    let inner = tree.add(editable, NodeSpec::container("inner", "i")).unwrap();
    let leaf = tree.add(inner, NodeSpec::leaf("leaf", "l")).unwrap();

    assert_eq!(tree.nearest_editable(leaf), Some(editable));
    assert_eq!(tree.nearest_editable(root), None);
  }

  #[test]
  fn ephemeral_flag_is_inherited() {
    let mut tree = tree();
    let root = tree.root();
    let pending = tree.add(root, NodeSpec::container("p", "p").ephemeral(true)).unwrap();
    let child = tree.add(pending, NodeSpec::leaf("c", "c")).unwrap();
    assert!(tree.is_ephemeral(child));
    assert!(!tree.is_ephemeral(root));
  }

  #[test]
  fn descendants_are_preorder() {
    let mut tree = tree();
    let root = tree.root();
    let a = tree.add(root, NodeSpec::container("a", "a")).unwrap();
    tree.add(a, NodeSpec::leaf("a1", "l")).unwrap();
    tree.add(root, NodeSpec::leaf("b", "b")).unwrap();

    let order: Vec<_> = tree
      .descendants(root)
      .into_iter()
      .map(|n| tree.node(n).unwrap().id().to_string())
      .collect();
    assert_eq!(order, vec!["root", "a", "a1", "b"]);
  }
}
