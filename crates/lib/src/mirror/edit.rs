//! Local edits and the transactional update protocol.
//!
//! An edit is either *simple*, touching display fields of one entity, or
//! *complex*. A complex edit runs in four steps:
//!
//! 1. the working descriptor is cloned and the edit is applied to the clone
//! 2. every affected tree location is located, fanning out to template
//!    instances where needed, and turned into an insert, replace or remove
//! 3. the locations are rebuilt from the clone inside one [`Transaction`]
//! 4. on success the clone becomes the working descriptor and the touched
//!    containers are marked modified; on failure the transaction restores
//!    every location in reverse order and the working descriptor is
//!    untouched
//!
//! A failed edit leaves the tree, its editable states and the working
//! descriptor exactly as they were.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::descriptor::{
  ApplicationDescriptor, NodeDescriptor, ReplicaGroupDescriptor, ServerDescriptor, ServiceDescriptor,
  ServiceInstanceDescriptor, TemplateDescriptor, Variables,
};
use crate::sync::WriteAccess;
use crate::tree::{Editable, NodeId, Transaction, Tree, TreeError};

use super::Mirror;
use super::build::{self, BuildError};
use super::entity::{Entity, NODES, REPLICA_GROUPS, SERVER_TEMPLATES, SERVICE_TEMPLATES, ServerEntry};

/// A change to an application's working descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
  SetDescription(String),
  SetVariables(Variables),
  SetNodeDescription { node: String, description: String },
  SetNodeLoadFactor { node: String, load_factor: String },
  SetNodeVariables { node: String, variables: Variables },
  AddNode { name: String, descriptor: NodeDescriptor },
  RemoveNode(String),
  AddServer { node: String, server: ServerEntry },
  /// Replaces the server currently resolving to `id`; the replacement may
  /// resolve to a different id.
  ReplaceServer { node: String, id: String, server: ServerEntry },
  RemoveServer { node: String, id: String },
  AddServerTemplate { id: String, template: TemplateDescriptor<ServerDescriptor> },
  UpdateServerTemplate { id: String, template: TemplateDescriptor<ServerDescriptor> },
  RemoveServerTemplate(String),
  AddServiceTemplate { id: String, template: TemplateDescriptor<ServiceDescriptor> },
  UpdateServiceTemplate { id: String, template: TemplateDescriptor<ServiceDescriptor> },
  RemoveServiceTemplate(String),
  AddReplicaGroup(ReplicaGroupDescriptor),
  UpdateReplicaGroup(ReplicaGroupDescriptor),
  RemoveReplicaGroup(String),
}

impl Edit {
  /// Simple edits change display fields only and never rebuild anything.
  pub fn is_simple(&self) -> bool {
    matches!(
      self,
      Edit::SetDescription(_) | Edit::SetNodeDescription { .. } | Edit::SetNodeLoadFactor { .. }
    )
  }

  fn name(&self) -> &'static str {
    match self {
      Edit::SetDescription(_) => "set-description",
      Edit::SetVariables(_) => "set-variables",
      Edit::SetNodeDescription { .. } => "set-node-description",
      Edit::SetNodeLoadFactor { .. } => "set-node-load-factor",
      Edit::SetNodeVariables { .. } => "set-node-variables",
      Edit::AddNode { .. } => "add-node",
      Edit::RemoveNode(_) => "remove-node",
      Edit::AddServer { .. } => "add-server",
      Edit::ReplaceServer { .. } => "replace-server",
      Edit::RemoveServer { .. } => "remove-server",
      Edit::AddServerTemplate { .. } => "add-server-template",
      Edit::UpdateServerTemplate { .. } => "update-server-template",
      Edit::RemoveServerTemplate(_) => "remove-server-template",
      Edit::AddServiceTemplate { .. } => "add-service-template",
      Edit::UpdateServiceTemplate { .. } => "update-service-template",
      Edit::RemoveServiceTemplate(_) => "remove-service-template",
      Edit::AddReplicaGroup(_) => "add-replica-group",
      Edit::UpdateReplicaGroup(_) => "update-replica-group",
      Edit::RemoveReplicaGroup(_) => "remove-replica-group",
    }
  }
}

#[derive(Debug, Error)]
pub enum EditError {
  #[error("application '{0}' does not exist")]
  UnknownApplication(String),

  #[error("{0} does not exist")]
  NotFound(String),

  /// A location could not be rebuilt; the whole edit was rolled back.
  #[error("update failed at {path}: {source}")]
  UpdateFailed {
    path: String,
    #[source]
    source: BuildError,
  },

  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error("removing {0} requires write access")]
  WriteAccessRequired(String),

  #[error("{0} cannot be removed")]
  NotRemovable(String),

  #[error("node {0} is not an unsaved entity")]
  NotPending(NodeId),

  /// Saving an unsaved entity failed; it was recreated as `restored`.
  #[error("saving failed, kept as unsaved: {source}")]
  PromotionFailed {
    restored: NodeId,
    #[source]
    source: Box<EditError>,
  },
}

/// What an accepted edit did to the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditOutcome {
  /// Handles of inserted and rebuilt locations, in application order.
  pub applied: Vec<NodeId>,
  /// Paths of removed locations.
  pub removed: Vec<String>,
  /// The node to show after the edit.
  pub selected: Option<NodeId>,
}

/// An entity created locally and not yet part of the working descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
  Node { name: String, descriptor: NodeDescriptor },
  Server { node: String, server: ServerEntry },
  ServerTemplate { id: String, template: TemplateDescriptor<ServerDescriptor> },
  ServiceTemplate { id: String, template: TemplateDescriptor<ServiceDescriptor> },
  ReplicaGroup(ReplicaGroupDescriptor),
}

impl Pending {
  fn parent_path(&self) -> Vec<&str> {
    match self {
      Pending::Node { .. } => vec![NODES],
      Pending::Server { node, .. } => vec![NODES, node.as_str()],
      Pending::ServerTemplate { .. } => vec![SERVER_TEMPLATES],
      Pending::ServiceTemplate { .. } => vec![SERVICE_TEMPLATES],
      Pending::ReplicaGroup(_) => vec![REPLICA_GROUPS],
    }
  }

  fn build(&self, tree: &mut Tree<Entity>, app: &ApplicationDescriptor) -> Result<NodeId, BuildError> {
    match self {
      Pending::Node { name, descriptor } => build::node(tree, app, name, descriptor, Editable::new()),
      Pending::Server { node, server } => {
        let descriptor = app.nodes.get(node).ok_or_else(|| BuildError::UnknownNode(node.clone()))?;
        build::server(tree, app, node, &build::node_resolver(app, node, descriptor), server)
      }
      Pending::ServerTemplate { id, template } => Ok(build::server_template(tree, id, template)),
      Pending::ServiceTemplate { id, template } => Ok(build::service_template(tree, id, template)),
      Pending::ReplicaGroup(group) => Ok(build::replica_group(tree, group)),
    }
  }

  /// The edit that adds this entity to the working descriptor.
  pub fn into_edit(self) -> Edit {
    match self {
      Pending::Node { name, descriptor } => Edit::AddNode { name, descriptor },
      Pending::Server { node, server } => Edit::AddServer { node, server },
      Pending::ServerTemplate { id, template } => Edit::AddServerTemplate { id, template },
      Pending::ServiceTemplate { id, template } => Edit::AddServiceTemplate { id, template },
      Pending::ReplicaGroup(group) => Edit::AddReplicaGroup(group),
    }
  }
}

/// How to produce a location from the edited descriptor.
#[derive(Debug)]
enum Blueprint {
  Node { name: String, state: Editable },
  Server { node: String, entry: ServerEntry },
  Service { server: NodeId, instance: ServiceInstanceDescriptor },
  ServerTemplate(String, TemplateDescriptor<ServerDescriptor>),
  ServiceTemplate(String, TemplateDescriptor<ServiceDescriptor>),
  ReplicaGroup(ReplicaGroupDescriptor),
}

impl Blueprint {
  fn build(&self, tree: &mut Tree<Entity>, app: &ApplicationDescriptor) -> Result<NodeId, BuildError> {
    match self {
      Blueprint::Node { name, state } => {
        let descriptor = app.nodes.get(name).ok_or_else(|| BuildError::UnknownNode(name.clone()))?;
        build::node(tree, app, name, descriptor, state.clone())
      }
      Blueprint::Server { node, entry } => {
        let descriptor = app.nodes.get(node).ok_or_else(|| BuildError::UnknownNode(node.clone()))?;
        build::server(tree, app, node, &build::node_resolver(app, node, descriptor), entry)
      }
      Blueprint::Service { server, instance } => {
        let parent = tree.node(*server)?;
        let Entity::Server(entity) = parent.payload() else {
          return Err(TreeError::StaleHandle(*server).into());
        };
        let (resolver, editable) = (entity.resolver.clone(), parent.is_editable());
        build::service(tree, app, &resolver, instance, editable)
      }
      Blueprint::ServerTemplate(id, template) => Ok(build::server_template(tree, id, template)),
      Blueprint::ServiceTemplate(id, template) => Ok(build::service_template(tree, id, template)),
      Blueprint::ReplicaGroup(group) => Ok(build::replica_group(tree, group)),
    }
  }
}

/// Which editable state a rebuilt location marks modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
  /// The nearest editable container above the location.
  Parent,
  /// The rebuilt node itself.
  Itself,
  /// Nothing; the edit marks its owner explicitly.
  Skip,
}

#[derive(Debug)]
enum Action {
  Insert { parent: NodeId, blueprint: Blueprint },
  Replace { target: NodeId, blueprint: Blueprint, mark: Mark },
  Remove { target: NodeId },
}

#[derive(Debug, Default)]
struct Plan {
  actions: Vec<Action>,
  /// Editable containers to mark in addition to the per-action marks.
  marks: Vec<NodeId>,
  /// Removed committed ids, recorded in the given container.
  removals: Vec<(NodeId, String)>,
}

#[derive(Debug)]
enum Applied {
  Built(NodeId),
  Removed(String),
}

#[derive(Debug, Clone, Copy)]
enum ServerSlot {
  Plain(usize),
  Instance(usize),
}

/// Finds the declaration of the server resolving to `id` on `node`.
fn server_slot(app: &ApplicationDescriptor, node: &str, id: &str) -> Option<ServerSlot> {
  let descriptor = app.nodes.get(node)?;
  let resolver = build::node_resolver(app, node, descriptor);
  if let Some(index) = descriptor.servers.iter().position(|s| resolver.substitute(&s.id) == id) {
    return Some(ServerSlot::Plain(index));
  }
  descriptor
    .server_instances
    .iter()
    .position(|instance| app.server_instance_id(&resolver, instance).is_ok_and(|resolved| resolved == id))
    .map(ServerSlot::Instance)
}

fn remove_slot(descriptor: &mut NodeDescriptor, slot: ServerSlot) {
  match slot {
    ServerSlot::Plain(index) => {
      descriptor.servers.remove(index);
    }
    ServerSlot::Instance(index) => {
      descriptor.server_instances.remove(index);
    }
  }
}

fn push_entry(descriptor: &mut NodeDescriptor, entry: &ServerEntry) {
  match entry {
    ServerEntry::Plain(server) => descriptor.servers.push(server.clone()),
    ServerEntry::Instance(instance) => descriptor.server_instances.push(instance.clone()),
  }
}

/// Drops inline references to service template `id`. Returns true if any
/// service was dropped.
fn drop_service_instances(server: &mut ServerDescriptor, id: &str) -> bool {
  let Some(services) = server.services.as_mut() else {
    return false;
  };
  let before = services.len();
  services.retain(|s| !s.is_template_instance() || s.template != id);
  services.len() != before
}

impl Mirror {
  /// Applies an edit to an application.
  ///
  /// # Errors
  ///
  /// [`EditError::UpdateFailed`] names the first location that could not
  /// be rebuilt; nothing has changed in that case.
  pub fn apply_edit(
    &mut self,
    _access: &WriteAccess,
    application: &str,
    edit: Edit,
  ) -> Result<EditOutcome, EditError> {
    if edit.is_simple() {
      return self.apply_simple(application, edit);
    }

    let state = self
      .applications
      .get(application)
      .ok_or_else(|| EditError::UnknownApplication(application.to_string()))?;
    let mut next = state.working.clone();
    let plan = self.plan(application, &mut next, &edit)?;
    let unchanged = state.working == next;
    debug!(application, edit = edit.name(), locations = plan.actions.len(), unchanged, "applying edit");

    let results = self.run(&next, &plan.actions)?;

    let mut marks = plan.marks.clone();
    let mut outcome = EditOutcome::default();
    for (action, result) in plan.actions.iter().zip(results) {
      match (action, result) {
        (Action::Insert { parent, .. }, Applied::Built(new)) => {
          marks.extend(self.tree.nearest_editable(*parent));
          outcome.applied.push(new);
        }
        (Action::Replace { mark, .. }, Applied::Built(new)) => {
          match mark {
            Mark::Parent => marks.extend(
              self
                .tree
                .get(new)
                .and_then(|node| node.parent())
                .and_then(|parent| self.tree.nearest_editable(parent)),
            ),
            Mark::Itself => marks.push(new),
            Mark::Skip => {}
          }
          outcome.applied.push(new);
        }
        (_, Applied::Built(new)) => outcome.applied.push(new),
        (_, Applied::Removed(path)) => outcome.removed.push(path),
      }
    }
    // rebuilt locations of an edit that changed nothing stay unmodified
    if unchanged {
      marks.clear();
    }
    for id in marks {
      if let Some(editable) = self.tree.get_mut(id).and_then(|node| node.editable_state_mut()) {
        editable.mark_modified();
      }
    }
    for (container, id) in &plan.removals {
      if let Some(editable) = self.tree.get_mut(*container).and_then(|node| node.editable_state_mut()) {
        editable.mark_modified();
        editable.record_removed(id);
      }
    }

    outcome.selected = match plan.actions.first() {
      Some(Action::Remove { .. }) => plan
        .removals
        .first()
        .map(|(container, _)| *container)
        .or_else(|| plan.marks.first().copied()),
      _ => outcome.applied.first().copied(),
    };
    self.selected = outcome.selected;
    if let Some(state) = self.applications.get_mut(application) {
      state.working = next;
    }
    self.revive_pending(application);

    info!(
      application,
      edit = edit.name(),
      applied = outcome.applied.len(),
      removed = outcome.removed.len(),
      "edit applied"
    );
    Ok(outcome)
  }

  fn apply_simple(&mut self, application: &str, edit: Edit) -> Result<EditOutcome, EditError> {
    let state = self
      .applications
      .get_mut(application)
      .ok_or_else(|| EditError::UnknownApplication(application.to_string()))?;
    let handle = state.handle;
    let mut changed = true;

    let target = match &edit {
      Edit::SetDescription(description) => {
        changed = state.working.description != *description;
        state.working.description = description.clone();
        handle
      }
      Edit::SetNodeDescription { node, .. } | Edit::SetNodeLoadFactor { node, .. } => {
        let id = self
          .tree
          .resolve_path(handle, &[NODES, node])
          .filter(|id| !self.tree.is_ephemeral(*id))
          .ok_or_else(|| EditError::NotFound(format!("{application}/{NODES}/{node}")))?;
        let descriptor = state
          .working
          .nodes
          .get_mut(node)
          .ok_or_else(|| EditError::NotFound(format!("{application}/{NODES}/{node}")))?;
        let entity = match self.tree.get_mut(id).map(|n| n.payload_mut()) {
          Some(Entity::Node(entity)) => entity,
          _ => return Err(EditError::NotFound(format!("{application}/{NODES}/{node}"))),
        };
        if let Edit::SetNodeDescription { description, .. } = &edit {
          changed = descriptor.description != *description;
          descriptor.description = description.clone();
          entity.description = entity.resolver.substitute(description);
        } else if let Edit::SetNodeLoadFactor { load_factor, .. } = &edit {
          changed = descriptor.load_factor != *load_factor;
          descriptor.load_factor = load_factor.clone();
          entity.load_factor = entity.resolver.substitute(load_factor);
        }
        id
      }
      _ => return Err(EditError::NotFound(edit.name().to_string())),
    };

    if changed && let Some(editable) = self.tree.get_mut(target).and_then(|node| node.editable_state_mut()) {
      editable.mark_modified();
    }
    self.selected = Some(target);
    debug!(application, edit = edit.name(), changed, "simple edit applied");
    Ok(EditOutcome {
      applied: Vec::new(),
      removed: Vec::new(),
      selected: Some(target),
    })
  }

  fn locate(&self, application: &str, path: &[&str]) -> Result<NodeId, EditError> {
    self
      .find(application, path)
      .filter(|id| !self.tree.is_ephemeral(*id))
      .ok_or_else(|| EditError::NotFound(format!("{application}/{}", path.join("/"))))
  }

  fn editable_state(&self, id: NodeId) -> Editable {
    self
      .tree
      .get(id)
      .and_then(|node| node.editable_state())
      .cloned()
      .unwrap_or_default()
  }

  /// Applies `edit` to `next` and lists the tree locations to rebuild.
  fn plan(&self, application: &str, next: &mut ApplicationDescriptor, edit: &Edit) -> Result<Plan, EditError> {
    let committed = self
      .committed(application)
      .ok_or_else(|| EditError::UnknownApplication(application.to_string()))?;
    let not_found = |what: &str| EditError::NotFound(format!("{application}/{what}"));
    let mut plan = Plan::default();

    match edit {
      Edit::SetDescription(_) | Edit::SetNodeDescription { .. } | Edit::SetNodeLoadFactor { .. } => {}

      Edit::SetVariables(variables) => {
        next.variables = variables.clone();
        plan.marks.push(self.locate(application, &[])?);
        let nodes = self.locate(application, &[NODES])?;
        for child in self.tree.children(nodes) {
          if let Some(Entity::Node(node)) = self.tree.payload(*child)
            && !self.tree.is_ephemeral(*child)
          {
            plan.actions.push(Action::Replace {
              target: *child,
              blueprint: Blueprint::Node {
                name: node.name.clone(),
                state: self.editable_state(*child),
              },
              mark: Mark::Skip,
            });
          }
        }
      }

      Edit::SetNodeVariables { node, variables } => {
        let target = self.locate(application, &[NODES, node])?;
        next.nodes.get_mut(node).ok_or_else(|| not_found(node))?.variables = variables.clone();
        plan.actions.push(Action::Replace {
          target,
          blueprint: Blueprint::Node {
            name: node.clone(),
            state: self.editable_state(target),
          },
          mark: Mark::Itself,
        });
      }

      Edit::AddNode { name, descriptor } => {
        let parent = self.locate(application, &[NODES])?;
        next.nodes.insert(name.clone(), descriptor.clone());
        plan.actions.push(Action::Insert {
          parent,
          blueprint: Blueprint::Node {
            name: name.clone(),
            state: Editable::new(),
          },
        });
      }

      Edit::RemoveNode(name) => {
        let target = self.locate(application, &[NODES, name])?;
        next.nodes.remove(name).ok_or_else(|| not_found(name))?;
        self.plan_removal(&mut plan, target, committed.nodes.contains_key(name));
      }

      Edit::AddServer { node, server } => {
        let parent = self.locate(application, &[NODES, node])?;
        push_entry(next.nodes.get_mut(node).ok_or_else(|| not_found(node))?, server);
        plan.actions.push(Action::Insert {
          parent,
          blueprint: Blueprint::Server {
            node: node.clone(),
            entry: server.clone(),
          },
        });
      }

      Edit::ReplaceServer { node, id, server } => {
        let target = self.locate(application, &[NODES, node, id])?;
        let slot = server_slot(next, node, id).ok_or_else(|| not_found(id))?;
        let descriptor = next.nodes.get_mut(node).ok_or_else(|| not_found(node))?;
        match (slot, server) {
          (ServerSlot::Plain(index), ServerEntry::Plain(replacement)) => descriptor.servers[index] = replacement.clone(),
          (ServerSlot::Instance(index), ServerEntry::Instance(replacement)) => {
            descriptor.server_instances[index] = replacement.clone()
          }
          (slot, entry) => {
            remove_slot(descriptor, slot);
            push_entry(descriptor, entry);
          }
        }
        plan.actions.push(Action::Replace {
          target,
          blueprint: Blueprint::Server {
            node: node.clone(),
            entry: server.clone(),
          },
          mark: Mark::Parent,
        });
        // the new id is only known after the rebuild; a rename shows up as
        // the old id being removed
        let renamed = match server {
          ServerEntry::Plain(plain) => {
            let descriptor = next.nodes.get(node).ok_or_else(|| not_found(node))?;
            build::node_resolver(next, node, descriptor).substitute(&plain.id) != *id
          }
          ServerEntry::Instance(_) => server_slot(next, node, id).is_none(),
        };
        if renamed && server_slot(committed, node, id).is_some() {
          let container = self.locate(application, &[NODES, node])?;
          plan.removals.push((container, id.clone()));
        }
      }

      Edit::RemoveServer { node, id } => {
        let target = self.locate(application, &[NODES, node, id])?;
        let slot = server_slot(next, node, id).ok_or_else(|| not_found(id))?;
        remove_slot(next.nodes.get_mut(node).ok_or_else(|| not_found(node))?, slot);
        self.plan_removal(&mut plan, target, server_slot(committed, node, id).is_some());
      }

      Edit::AddServerTemplate { id, template } => {
        let parent = self.locate(application, &[SERVER_TEMPLATES])?;
        next.server_templates.insert(id.clone(), template.clone());
        plan.actions.push(Action::Insert {
          parent,
          blueprint: Blueprint::ServerTemplate(id.clone(), template.clone()),
        });
      }

      Edit::UpdateServerTemplate { id, template } => {
        let target = self.locate(application, &[SERVER_TEMPLATES, id])?;
        *next.server_templates.get_mut(id).ok_or_else(|| not_found(id))? = template.clone();
        plan.actions.push(Action::Replace {
          target,
          blueprint: Blueprint::ServerTemplate(id.clone(), template.clone()),
          mark: Mark::Parent,
        });
        for instance in self.server_template_instances(application, id) {
          if let Some(Entity::Server(server)) = self.tree.payload(instance) {
            plan.actions.push(Action::Replace {
              target: instance,
              blueprint: Blueprint::Server {
                node: server.node.clone(),
                entry: server.origin.clone(),
              },
              mark: Mark::Parent,
            });
          }
        }
      }

      Edit::RemoveServerTemplate(id) => {
        let target = self.locate(application, &[SERVER_TEMPLATES, id])?;
        next.server_templates.remove(id).ok_or_else(|| not_found(id))?;
        for node in next.nodes.values_mut() {
          node.server_instances.retain(|instance| instance.template != *id);
        }
        self.plan_removal(&mut plan, target, committed.server_templates.contains_key(id));
        for instance in self.server_template_instances(application, id) {
          let existed = match (self.tree.get(instance), self.tree.payload(instance)) {
            (Some(node), Some(Entity::Server(server))) => server_slot(committed, &server.node, node.id()).is_some(),
            _ => false,
          };
          self.plan_removal(&mut plan, instance, existed);
        }
      }

      Edit::AddServiceTemplate { id, template } => {
        let parent = self.locate(application, &[SERVICE_TEMPLATES])?;
        next.service_templates.insert(id.clone(), template.clone());
        plan.actions.push(Action::Insert {
          parent,
          blueprint: Blueprint::ServiceTemplate(id.clone(), template.clone()),
        });
      }

      Edit::UpdateServiceTemplate { id, template } => {
        let target = self.locate(application, &[SERVICE_TEMPLATES, id])?;
        *next.service_templates.get_mut(id).ok_or_else(|| not_found(id))? = template.clone();
        plan.actions.push(Action::Replace {
          target,
          blueprint: Blueprint::ServiceTemplate(id.clone(), template.clone()),
          mark: Mark::Parent,
        });
        for instance in self.service_template_instances(application, id) {
          let server = self.enclosing_server(instance);
          if let (Some(server), Some(Entity::Service(service))) = (server, self.tree.payload(instance)) {
            plan.actions.push(Action::Replace {
              target: instance,
              blueprint: Blueprint::Service {
                server,
                instance: service.instance.clone(),
              },
              mark: Mark::Parent,
            });
          }
        }
      }

      Edit::RemoveServiceTemplate(id) => {
        let target = self.locate(application, &[SERVICE_TEMPLATES, id])?;
        next.service_templates.remove(id).ok_or_else(|| not_found(id))?;
        for server in next.nodes.values_mut().flat_map(|node| node.servers.iter_mut()) {
          drop_service_instances(server, id);
        }
        let mut templates_changed = false;
        for template in next.server_templates.values_mut() {
          templates_changed |= drop_service_instances(&mut template.descriptor, id);
        }
        if templates_changed {
          plan.marks.push(self.locate(application, &[SERVER_TEMPLATES])?);
        }
        self.plan_removal(&mut plan, target, committed.service_templates.contains_key(id));
        for instance in self.service_template_instances(application, id) {
          self.plan_removal(&mut plan, instance, false);
        }
      }

      Edit::AddReplicaGroup(group) => {
        let parent = self.locate(application, &[REPLICA_GROUPS])?;
        next.replica_groups.push(group.clone());
        plan.actions.push(Action::Insert {
          parent,
          blueprint: Blueprint::ReplicaGroup(group.clone()),
        });
      }

      Edit::UpdateReplicaGroup(group) => {
        let target = self.locate(application, &[REPLICA_GROUPS, &group.id])?;
        let existing = next
          .replica_groups
          .iter_mut()
          .find(|g| g.id == group.id)
          .ok_or_else(|| not_found(&group.id))?;
        *existing = group.clone();
        plan.actions.push(Action::Replace {
          target,
          blueprint: Blueprint::ReplicaGroup(group.clone()),
          mark: Mark::Parent,
        });
      }

      Edit::RemoveReplicaGroup(id) => {
        let target = self.locate(application, &[REPLICA_GROUPS, id])?;
        let before = next.replica_groups.len();
        next.replica_groups.retain(|g| g.id != *id);
        if next.replica_groups.len() == before {
          return Err(not_found(id));
        }
        self.plan_removal(&mut plan, target, committed.replica_group(id).is_some());
        // servers still referring to the group fail to rebuild
        for server in self.replica_group_users(application, id) {
          if let Some(Entity::Server(entity)) = self.tree.payload(server) {
            plan.actions.push(Action::Replace {
              target: server,
              blueprint: Blueprint::Server {
                node: entity.node.clone(),
                entry: entity.origin.clone(),
              },
              mark: Mark::Parent,
            });
          }
        }
      }
    }

    Ok(plan)
  }

  /// Plans the removal of `target`, recording its id in the nearest
  /// editable container when it existed at the last commit.
  fn plan_removal(&self, plan: &mut Plan, target: NodeId, existed: bool) {
    let container = self
      .tree
      .get(target)
      .and_then(|node| node.parent())
      .and_then(|parent| self.tree.nearest_editable(parent));
    if let (Some(container), Some(node)) = (container, self.tree.get(target)) {
      if existed {
        plan.removals.push((container, node.id().to_string()));
      } else {
        plan.marks.push(container);
      }
    }
    plan.actions.push(Action::Remove { target });
  }

  fn enclosing_server(&self, id: NodeId) -> Option<NodeId> {
    self
      .tree
      .ancestors(id)
      .into_iter()
      .find(|a| matches!(self.tree.payload(*a), Some(Entity::Server(_))))
  }

  /// Runs every action in one transaction.
  fn run(&mut self, next: &ApplicationDescriptor, actions: &[Action]) -> Result<Vec<Applied>, EditError> {
    let mut tx = Transaction::begin(&mut self.tree);
    let mut results = Vec::with_capacity(actions.len());

    for action in actions {
      let result = match action {
        Action::Insert { parent, blueprint } => {
          let path = tx.tree().path_string(*parent);
          tx.insert(*parent, |tree| blueprint.build(tree, next))
            .map(Applied::Built)
            .map_err(|source| (path, source))
        }
        Action::Replace { target, blueprint, .. } => {
          let path = tx.tree().path_string(*target);
          tx.replace(*target, |tree| blueprint.build(tree, next))
            .map(Applied::Built)
            .map_err(|source| (path, source))
        }
        Action::Remove { target } => {
          let path = tx.tree().path_string(*target);
          match tx.remove(*target) {
            Ok(()) => Ok(Applied::Removed(path)),
            Err(err) => Err((path, BuildError::from(err))),
          }
        }
      };

      match result {
        Ok(applied) => results.push(applied),
        Err((path, source)) => {
          error!(path = %path, error = %source, undone = tx.len(), "update failed, rolling back");
          tx.rollback();
          return Err(EditError::UpdateFailed { path, source });
        }
      }
    }

    tx.commit();
    Ok(results)
  }

  /// Shows a new, unsaved entity in the tree.
  ///
  /// # Errors
  ///
  /// [`TreeError::DuplicateId`] if its container already has a child with
  /// the same id.
  pub fn create_ephemeral(&mut self, application: &str, pending: Pending) -> Result<NodeId, EditError> {
    let id = self.insert_pending(application, pending)?;
    self.selected = Some(id);
    Ok(id)
  }

  fn insert_pending(&mut self, application: &str, pending: Pending) -> Result<NodeId, EditError> {
    let state = self
      .applications
      .get(application)
      .ok_or_else(|| EditError::UnknownApplication(application.to_string()))?;
    let parent_path = pending.parent_path();
    let parent = self
      .tree
      .resolve_path(state.handle, &parent_path)
      .ok_or_else(|| EditError::NotFound(format!("{application}/{}", parent_path.join("/"))))?;
    let path = self.tree.path_string(parent);

    let id = pending
      .build(&mut self.tree, &state.working)
      .map_err(|source| EditError::UpdateFailed { path, source })?;
    self.tree.node_mut(id)?.set_ephemeral(true);
    if let Err(err) = self.tree.attach(parent, id) {
      self.tree.release(id);
      return Err(err.into());
    }

    if let Some(state) = self.applications.get_mut(application) {
      state.pending.insert(id, pending);
    }
    debug!(application, node = %id, "created unsaved entity");
    Ok(id)
  }

  /// Adds an unsaved entity to the working descriptor.
  ///
  /// On failure the entity is put back, still unsaved and under the same
  /// handle, which [`EditError::PromotionFailed`] carries.
  pub fn promote(&mut self, access: &WriteAccess, id: NodeId) -> Result<EditOutcome, EditError> {
    let application = self.application_of(id).ok_or(EditError::NotPending(id))?;
    let pending = self
      .applications
      .get(&application)
      .and_then(|state| state.pending.get(&id))
      .cloned()
      .ok_or(EditError::NotPending(id))?;

    let detached = self.tree.detach(id)?;
    if let Some(state) = self.applications.get_mut(&application) {
      state.pending.remove(&id);
    }

    match self.apply_edit(access, &application, pending.clone().into_edit()) {
      Ok(outcome) => {
        self.tree.release(detached.node);
        Ok(outcome)
      }
      Err(source) => {
        if let Err(err) = self.tree.reattach(detached) {
          error!(application = %application, error = %err, "failed to restore unsaved entity");
          self.tree.release(detached.node);
          return Err(source);
        }
        if let Some(state) = self.applications.get_mut(&application) {
          state.pending.insert(id, pending);
        }
        self.selected = Some(id);
        Err(EditError::PromotionFailed {
          restored: id,
          source: Box::new(source),
        })
      }
    }
  }

  /// Removes a node.
  ///
  /// Unsaved entities are simply dropped. Anything else is removed from
  /// the working descriptor through an edit, which needs write access;
  /// `Ok(None)` means nothing but the unsaved entity was affected.
  pub fn destroy(&mut self, id: NodeId, access: Option<&WriteAccess>) -> Result<Option<EditOutcome>, EditError> {
    let path = self.tree.path_string(id);
    let application = self
      .application_of(id)
      .ok_or_else(|| EditError::NotRemovable(path.clone()))?;

    let is_pending = self
      .applications
      .get(&application)
      .is_some_and(|state| state.pending.contains_key(&id));
    if is_pending {
      self.tree.remove(id)?;
      if let Some(state) = self.applications.get_mut(&application) {
        state.pending.remove(&id);
      }
      debug!(path = %path, "dropped unsaved entity");
      return Ok(None);
    }
    if self.tree.is_ephemeral(id) {
      return Err(EditError::NotRemovable(path));
    }

    let access = access.ok_or_else(|| EditError::WriteAccessRequired(path.clone()))?;
    let node = self.tree.node(id)?;
    let edit = match node.payload() {
      Entity::Node(entity) => Edit::RemoveNode(entity.name.clone()),
      Entity::Server(entity) => Edit::RemoveServer {
        node: entity.node.clone(),
        id: node.id().to_string(),
      },
      Entity::ServerTemplate(_) => Edit::RemoveServerTemplate(node.id().to_string()),
      Entity::ServiceTemplate(_) => Edit::RemoveServiceTemplate(node.id().to_string()),
      Entity::ReplicaGroup(group) => Edit::RemoveReplicaGroup(group.id.clone()),
      _ => return Err(EditError::NotRemovable(path)),
    };
    self.apply_edit(access, &application, edit).map(Some)
  }

  /// Recreates unsaved entities whose nodes went away with a rebuilt
  /// ancestor. Entities that no longer fit are dropped.
  pub(super) fn revive_pending(&mut self, application: &str) {
    let Some(state) = self.applications.get_mut(application) else {
      return;
    };
    let lost: BTreeSet<NodeId> = state
      .pending
      .keys()
      .filter(|id| self.tree.get(**id).is_none())
      .copied()
      .collect();
    let lost: Vec<Pending> = lost.iter().filter_map(|id| state.pending.remove(id)).collect();

    for pending in lost {
      if let Err(err) = self.insert_pending(application, pending) {
        warn!(application, error = %err, "dropped unsaved entity that no longer fits");
      }
    }
  }
}
