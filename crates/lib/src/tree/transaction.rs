//! Journaled structural changes with exact rollback.
//!
//! A [`Transaction`] records every insert, removal and replacement it
//! performs. Replaced and removed subtrees are only detached, not freed,
//! so rolling back reattaches the very same nodes in reverse order and the
//! tree ends up exactly as it was. Committing frees what was detached.
//!
//! Dropping a transaction without committing rolls it back.

use tracing::error;

use super::{Detached, NodeId, Tree, TreeError};

#[derive(Debug)]
enum Step {
  Inserted(NodeId),
  Removed(Detached),
  Replaced { new: NodeId, old: Detached },
}

/// A set of tree changes applied together or not at all.
#[derive(Debug)]
pub struct Transaction<'a, T> {
  tree: &'a mut Tree<T>,
  journal: Vec<Step>,
}

impl<'a, T> Transaction<'a, T> {
  pub fn begin(tree: &'a mut Tree<T>) -> Self {
    Self {
      tree,
      journal: Vec::new(),
    }
  }

  pub fn tree(&self) -> &Tree<T> {
    &*self.tree
  }

  /// Number of changes applied so far.
  pub fn len(&self) -> usize {
    self.journal.len()
  }

  pub fn is_empty(&self) -> bool {
    self.journal.is_empty()
  }

  /// Builds an unattached subtree with `build` and attaches it under
  /// `parent`.
  ///
  /// On failure nothing built by this call survives.
  pub fn insert<E>(&mut self, parent: NodeId, build: impl FnOnce(&mut Tree<T>) -> Result<NodeId, E>) -> Result<NodeId, E>
  where
    E: From<TreeError>,
  {
    let new = build(&mut *self.tree)?;
    if let Err(err) = self.tree.attach(parent, new) {
      self.tree.release(new);
      return Err(err.into());
    }
    self.journal.push(Step::Inserted(new));
    Ok(new)
  }

  /// Detaches a subtree; it is freed on commit.
  pub fn remove(&mut self, node: NodeId) -> Result<(), TreeError> {
    let detached = self.tree.detach(node)?;
    self.journal.push(Step::Removed(detached));
    Ok(())
  }

  /// Replaces `old` with a subtree built by `build`, under the same parent.
  ///
  /// The replacement may carry a different id; it is re-sorted among its
  /// siblings. On failure `old` is back in place.
  pub fn replace<E>(&mut self, old: NodeId, build: impl FnOnce(&mut Tree<T>) -> Result<NodeId, E>) -> Result<NodeId, E>
  where
    E: From<TreeError>,
  {
    let detached = self.tree.detach(old)?;
    let new = match build(&mut *self.tree) {
      Ok(new) => new,
      Err(err) => {
        self.tree.reattach(detached)?;
        return Err(err);
      }
    };
    if let Err(err) = self.tree.attach(detached.parent, new) {
      self.tree.release(new);
      self.tree.reattach(detached)?;
      return Err(err.into());
    }
    self.journal.push(Step::Replaced { new, old: detached });
    Ok(new)
  }

  /// Keeps every change and frees the detached subtrees.
  pub fn commit(mut self) -> usize {
    let journal = std::mem::take(&mut self.journal);
    let applied = journal.len();
    for step in journal {
      match step {
        Step::Inserted(_) => {}
        Step::Removed(old) | Step::Replaced { old, .. } => self.tree.release(old.node),
      }
    }
    applied
  }

  /// Undoes every change in reverse order.
  pub fn rollback(mut self) {
    self.undo();
  }

  fn undo(&mut self) {
    while let Some(step) = self.journal.pop() {
      let restored = match step {
        Step::Inserted(new) => self.tree.remove(new),
        Step::Removed(old) => self.tree.reattach(old),
        Step::Replaced { new, old } => self.tree.remove(new).and_then(|_| self.tree.reattach(old)),
      };
      if let Err(err) = restored {
        error!(error = %err, "failed to restore tree during rollback");
      }
    }
  }
}

impl<T> Drop for Transaction<'_, T> {
  fn drop(&mut self) {
    self.undo();
  }
}

#[cfg(test)]
mod tests {
  use super::super::{NodeSpec, TreeDump};
  use super::*;

  fn tree() -> Tree<String> {
    let mut tree = Tree::new(NodeSpec::container("root", String::new()));
    let root = tree.root();
    for id in ["a", "b", "c"] {
      let parent = tree.add(root, NodeSpec::container(id, format!("v1-{id}"))).unwrap();
      tree.add(parent, NodeSpec::leaf("leaf", "x".to_string())).unwrap();
    }
    tree
  }

  fn dump(tree: &Tree<String>) -> TreeDump {
    tree.dump_with(tree.root(), &|label: &String| label.clone()).unwrap()
  }

  fn build(id: &'static str, label: &'static str) -> impl FnOnce(&mut Tree<String>) -> Result<NodeId, TreeError> {
    move |tree: &mut Tree<String>| Ok(tree.create(NodeSpec::container(id, label.to_string())))
  }

  #[test]
  fn commit_keeps_changes_and_frees_old_nodes() {
    let mut tree = tree();
    let root = tree.root();
    let a = tree.find_child(root, "a").unwrap();
    let c = tree.find_child(root, "c").unwrap();
    let before = tree.len();

    let mut tx = Transaction::begin(&mut tree);
    tx.replace(a, build("a", "v2-a")).unwrap();
    tx.remove(c).unwrap();
    tx.insert(root, build("d", "v2-d")).unwrap();
    assert_eq!(tx.commit(), 3);

    // a lost its leaf, c and its leaf are gone, d was added
    assert_eq!(tree.len(), before - 1 - 2 + 1);
    assert!(tree.get(a).is_none());
    let labels: Vec<_> = dump(&tree).children.into_iter().map(|c| c.label).collect();
    assert_eq!(labels, vec!["v2-a", "v1-b", "v2-d"]);
  }

  #[test]
  fn rollback_restores_the_exact_nodes() {
    let mut tree = tree();
    let root = tree.root();
    let a = tree.find_child(root, "a").unwrap();
    let b = tree.find_child(root, "b").unwrap();
    let before = dump(&tree);
    let len = tree.len();

    let mut tx = Transaction::begin(&mut tree);
    tx.replace(a, build("z", "renamed")).unwrap();
    tx.remove(b).unwrap();
    tx.insert(root, build("d", "new")).unwrap();
    tx.rollback();

    assert_eq!(dump(&tree), before);
    assert_eq!(tree.len(), len);
    assert_eq!(tree.find_child(root, "a"), Some(a));
    assert_eq!(tree.find_child(root, "b"), Some(b));
  }

  #[test]
  fn failed_replace_puts_old_node_back() {
    let mut tree = tree();
    let root = tree.root();
    let a = tree.find_child(root, "a").unwrap();
    let before = dump(&tree);

    let mut tx = Transaction::begin(&mut tree);
    // renaming a to b collides with the existing sibling
    let err = tx.replace(a, build("b", "clash")).unwrap_err();
    assert!(matches!(err, TreeError::DuplicateId { .. }));
    assert!(tx.is_empty());
    tx.rollback();

    assert_eq!(dump(&tree), before);
    assert_eq!(tree.find_child(root, "a"), Some(a));
  }

  #[test]
  fn failed_build_leaves_nothing_behind() {
    let mut tree = tree();
    let root = tree.root();
    let len = tree.len();

    let mut tx = Transaction::begin(&mut tree);
    let result: Result<NodeId, TreeError> = tx.insert(root, |tree| {
      let partial = tree.create(NodeSpec::container("p", String::new()));
      tree.release(partial);
      Err(TreeError::NotAContainer("p".to_string()))
    });
    assert!(result.is_err());
    drop(tx);

    assert_eq!(tree.len(), len);
  }

  #[test]
  fn dropping_without_commit_rolls_back() {
    let mut tree = tree();
    let root = tree.root();
    let before = dump(&tree);

    {
      let mut tx = Transaction::begin(&mut tree);
      tx.insert(root, build("e", "dropped")).unwrap();
    }

    assert_eq!(dump(&tree), before);
  }
}
