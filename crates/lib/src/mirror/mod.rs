//! The client-side mirror of the registry.
//!
//! A [`Mirror`] owns the descriptor tree of every application the registry
//! deploys. For each application it keeps two descriptors outside the
//! tree: the `committed` baseline last known to match the registry and the
//! `working` copy that local edits change. The tree always shows the
//! working copy, resolved.
//!
//! ```text
//! <root>
//! └── <application>            editable: description, variables
//!     ├── nodes                editable: removed nodes
//!     │   └── <node>           editable: removed servers
//!     │       └── <server>
//!     │           ├── adapters
//!     │           ├── db-envs
//!     │           └── services (IceBox only)
//!     ├── replica-groups       editable: removed groups
//!     ├── server-templates     template container
//!     └── service-templates    template container
//! ```
//!
//! Edits go through [`Mirror::apply_edit`]; registry pushes go through the
//! synchronization layer, which is the only caller of the event methods.

mod build;
mod edit;
mod entity;
mod events;
mod fanout;
#[cfg(test)]
mod fixtures;
mod runtime;

use std::collections::BTreeMap;

use tracing::debug;

use crate::descriptor::{
  AdapterInfo, ApplicationDescriptor, ApplicationUpdateDescriptor, NodeUpdateDescriptor, ObjectInfo, Variables,
};
use crate::resolver::Resolver;
use crate::tree::{Editable, NodeId, NodeSpec, Tree, TreeDump};

pub use build::BuildError;
pub use edit::{Edit, EditError, EditOutcome, Pending};
pub use entity::{
  ADAPTERS, DB_ENVS, Entity, EntityKind, NODES, NodeEntity, REPLICA_GROUPS, SERVER_TEMPLATES, SERVICE_TEMPLATES,
  SERVICES, ServerEntity, ServerEntry, ServiceEntity,
};
pub use fanout::ChildSelector;
pub use runtime::RuntimeState;

/// Per-application bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct ApplicationState {
  pub(crate) handle: NodeId,
  pub(crate) working: ApplicationDescriptor,
  pub(crate) committed: ApplicationDescriptor,
  /// Unsaved entities shown in the tree but absent from `working`.
  pub(crate) pending: BTreeMap<NodeId, Pending>,
}

/// The mirror tree and the tables that live next to it.
#[derive(Debug)]
pub struct Mirror {
  tree: Tree<Entity>,
  applications: BTreeMap<String, ApplicationState>,
  adapters: BTreeMap<String, AdapterInfo>,
  objects: BTreeMap<String, ObjectInfo>,
  runtime: RuntimeState,
  selected: Option<NodeId>,
}

impl Default for Mirror {
  fn default() -> Self {
    Self::new()
  }
}

impl Mirror {
  pub fn new() -> Self {
    Self {
      tree: Tree::new(NodeSpec::container("", Entity::Root)),
      applications: BTreeMap::new(),
      adapters: BTreeMap::new(),
      objects: BTreeMap::new(),
      runtime: RuntimeState::default(),
      selected: None,
    }
  }

  /// Drops everything, leaving an empty root.
  pub fn clear(&mut self) {
    debug!(applications = self.applications.len(), "clearing mirror");
    *self = Self::new();
  }

  pub fn tree(&self) -> &Tree<Entity> {
    &self.tree
  }

  pub fn entity(&self, id: NodeId) -> Option<&Entity> {
    self.tree.payload(id)
  }

  pub fn application_names(&self) -> impl Iterator<Item = &str> {
    self.applications.keys().map(String::as_str)
  }

  /// The working descriptor of an application.
  pub fn application(&self, name: &str) -> Option<&ApplicationDescriptor> {
    self.applications.get(name).map(|state| &state.working)
  }

  /// The descriptor as last committed.
  pub fn committed(&self, name: &str) -> Option<&ApplicationDescriptor> {
    self.applications.get(name).map(|state| &state.committed)
  }

  pub fn application_node(&self, name: &str) -> Option<NodeId> {
    self.applications.get(name).map(|state| state.handle)
  }

  /// Looks up a node by its path below an application.
  pub fn find(&self, application: &str, path: &[&str]) -> Option<NodeId> {
    self.tree.resolve_path(self.application_node(application)?, path)
  }

  pub fn server_node(&self, application: &str, node: &str, server: &str) -> Option<NodeId> {
    self.find(application, &[NODES, node, server])
  }

  pub fn server(&self, application: &str, node: &str, server: &str) -> Option<&ServerEntity> {
    match self.entity(self.server_node(application, node, server)?)? {
      Entity::Server(entity) => Some(entity),
      _ => None,
    }
  }

  /// The scope used to resolve a server's values.
  pub fn server_resolver(&self, application: &str, node: &str, server: &str) -> Option<&Resolver> {
    self.server(application, node, server).map(|s| &s.resolver)
  }

  /// Name of the application a tree node belongs to.
  pub fn application_of(&self, id: NodeId) -> Option<String> {
    let ancestors = self.tree.ancestors(id);
    let top = *ancestors.iter().rev().nth(1)?;
    match self.tree.payload(top)? {
      Entity::Application { name } => Some(name.clone()),
      _ => None,
    }
  }

  pub fn selected(&self) -> Option<NodeId> {
    self.selected.filter(|id| self.tree.get(*id).is_some())
  }

  pub fn select(&mut self, id: Option<NodeId>) {
    self.selected = id;
  }

  pub fn adapters(&self) -> &BTreeMap<String, AdapterInfo> {
    &self.adapters
  }

  pub fn objects(&self) -> &BTreeMap<String, ObjectInfo> {
    &self.objects
  }

  pub fn runtime(&self) -> &RuntimeState {
    &self.runtime
  }

  pub fn dump(&self) -> TreeDump {
    self.dump_node(self.tree.root()).unwrap_or_else(|| TreeDump {
      id: String::new(),
      label: String::new(),
      editable: true,
      ephemeral: false,
      modified: None,
      removed: Vec::new(),
      children: Vec::new(),
    })
  }

  pub fn dump_node(&self, id: NodeId) -> Option<TreeDump> {
    self.tree.dump_with(id, &Entity::summary)
  }

  /// Returns true if an application has uncommitted changes.
  pub fn is_modified(&self, application: &str) -> bool {
    let Some(state) = self.applications.get(application) else {
      return false;
    };
    std::iter::once(state.handle)
      .chain(self.tree.descendants(state.handle))
      .filter_map(|id| self.tree.get(id)?.editable_state())
      .any(|editable| editable.is_modified() || editable.removed_ids().next().is_some())
  }

  /// Unsaved entities of an application.
  pub fn pending(&self, application: &str) -> impl Iterator<Item = (NodeId, &Pending)> {
    self
      .applications
      .get(application)
      .into_iter()
      .flat_map(|state| state.pending.iter().map(|(id, pending)| (*id, pending)))
  }

  /// Makes the working copy the new baseline and clears every editable
  /// state of the application.
  pub fn commit(&mut self, application: &str) -> bool {
    let Some(state) = self.applications.get_mut(application) else {
      return false;
    };
    state.committed = state.working.clone();
    let handle = state.handle;
    for id in std::iter::once(handle).chain(self.tree.descendants(handle)) {
      if let Some(editable) = self.tree.get_mut(id).and_then(|node| node.editable_state_mut()) {
        editable.commit();
      }
    }
    debug!(application, "committed local changes");
    true
  }

  /// Throws away local edits and rebuilds the application from its
  /// committed descriptor. Unsaved entities are kept where possible.
  pub fn discard(&mut self, application: &str) -> Result<(), EditError> {
    let state = self
      .applications
      .get(application)
      .ok_or_else(|| EditError::UnknownApplication(application.to_string()))?;
    let committed = state.committed.clone();
    self.rebuild_application(&committed, &BTreeMap::new())?;
    if let Some(state) = self.applications.get_mut(application) {
      state.working = committed;
    }
    self.revive_pending(application);
    Ok(())
  }

  /// Collects the incremental update that brings the committed baseline to
  /// the working copy. `None` when nothing changed.
  ///
  /// Removals come from the editable states' removed ids; everything else
  /// is a diff of the two descriptors.
  pub fn update_descriptor(&self, application: &str) -> Option<ApplicationUpdateDescriptor> {
    if !self.is_modified(application) {
      return None;
    }
    let state = self.applications.get(application)?;
    let (working, committed) = (&state.working, &state.committed);
    let removed = |path: &[&str]| -> Vec<String> {
      self
        .tree
        .resolve_path(state.handle, path)
        .and_then(|id| self.tree.get(id)?.editable_state())
        .map(|editable| editable.removed_ids().map(str::to_string).collect())
        .unwrap_or_default()
    };

    let mut update = ApplicationUpdateDescriptor::new(application);
    if working.description != committed.description {
      update.description = Some(working.description.clone());
    }
    (update.variables, update.remove_variables) = diff_variables(&committed.variables, &working.variables);

    update.replica_groups = working
      .replica_groups
      .iter()
      .filter(|group| committed.replica_group(&group.id) != Some(*group))
      .cloned()
      .collect();
    update.remove_replica_groups = removed(&[REPLICA_GROUPS]);

    update.server_templates = working
      .server_templates
      .iter()
      .filter(|(id, template)| committed.server_templates.get(*id) != Some(*template))
      .map(|(id, template)| (id.clone(), template.clone()))
      .collect();
    update.remove_server_templates = removed(&[SERVER_TEMPLATES]);

    update.service_templates = working
      .service_templates
      .iter()
      .filter(|(id, template)| committed.service_templates.get(*id) != Some(*template))
      .map(|(id, template)| (id.clone(), template.clone()))
      .collect();
    update.remove_service_templates = removed(&[SERVICE_TEMPLATES]);

    update.remove_nodes = removed(&[NODES]);
    for (name, node) in &working.nodes {
      let remove_servers = removed(&[NODES, name]);
      let before = committed.nodes.get(name);
      if before == Some(node) && remove_servers.is_empty() {
        continue;
      }
      let empty = Variables::new();
      let (variables, remove_variables) = diff_variables(before.map_or(&empty, |b| &b.variables), &node.variables);
      update.nodes.push(NodeUpdateDescriptor {
        name: name.clone(),
        description: (before.map(|b| &b.description) != Some(&node.description)).then(|| node.description.clone()),
        variables,
        remove_variables,
        server_instances: node.server_instances.clone(),
        servers: node.servers.clone(),
        remove_servers,
        load_factor: (before.map(|b| &b.load_factor) != Some(&node.load_factor)).then(|| node.load_factor.clone()),
      });
    }

    (!update.is_empty()).then_some(update)
  }

  /// Editable states of an application's subtree, keyed by path below the
  /// application.
  fn capture_states(&self, application: &str) -> BTreeMap<Vec<String>, Editable> {
    let Some(handle) = self.application_node(application) else {
      return BTreeMap::new();
    };
    let base = self.tree.path(handle).len();
    std::iter::once(handle)
      .chain(self.tree.descendants(handle))
      .filter(|id| !self.tree.is_ephemeral(*id))
      .filter_map(|id| {
        let state = self.tree.get(id)?.editable_state()?.clone();
        Some((self.tree.path(id).split_off(base), state))
      })
      .collect()
  }

  fn restore_states(&mut self, handle: NodeId, states: &BTreeMap<Vec<String>, Editable>) {
    for (path, state) in states {
      let segments: Vec<&str> = path.iter().map(String::as_str).collect();
      if let Some(id) = self.tree.resolve_path(handle, &segments)
        && let Some(editable) = self.tree.get_mut(id).and_then(|node| node.editable_state_mut())
      {
        *editable = state.clone();
      }
    }
  }
}

/// Splits the difference between two variable maps into upserts and
/// removed names.
fn diff_variables(before: &Variables, after: &Variables) -> (Variables, Vec<String>) {
  let set = after
    .iter()
    .filter(|(name, value)| before.get(*name) != Some(*value))
    .map(|(name, value)| (name.clone(), value.clone()))
    .collect();
  let removed = before.keys().filter(|name| !after.contains_key(*name)).cloned().collect();
  (set, removed)
}
