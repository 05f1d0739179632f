//! Incremental application updates.
//!
//! An [`ApplicationUpdateDescriptor`] lists what changed in an application:
//! upserted entries plus explicit `remove_*` id lists. Applying one is
//! tolerant of replays: removing an absent id and upserting an identical
//! entry are both no-ops, so an update echoed back by the registry after a
//! local save leaves the descriptor unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resolver::{ResolveError, Resolver};

use super::types::{
  ApplicationDescriptor, NodeDescriptor, ReplicaGroupDescriptor, ServerDescriptor, ServerInstanceDescriptor,
  ServiceDescriptor, TemplateDescriptor, Variables,
};

/// Changes to one node of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUpdateDescriptor {
  pub name: String,
  pub description: Option<String>,
  pub variables: Variables,
  pub remove_variables: Vec<String>,
  /// Server instances to add or replace, matched by resolved server id.
  pub server_instances: Vec<ServerInstanceDescriptor>,
  /// Plain servers to add or replace, matched by id.
  pub servers: Vec<ServerDescriptor>,
  pub remove_servers: Vec<String>,
  pub load_factor: Option<String>,
}

/// Changes to an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationUpdateDescriptor {
  pub name: String,
  pub description: Option<String>,
  pub variables: Variables,
  pub remove_variables: Vec<String>,
  pub replica_groups: Vec<ReplicaGroupDescriptor>,
  pub remove_replica_groups: Vec<String>,
  pub server_templates: BTreeMap<String, TemplateDescriptor<ServerDescriptor>>,
  pub remove_server_templates: Vec<String>,
  pub service_templates: BTreeMap<String, TemplateDescriptor<ServiceDescriptor>>,
  pub remove_service_templates: Vec<String>,
  pub nodes: Vec<NodeUpdateDescriptor>,
  pub remove_nodes: Vec<String>,
}

impl ApplicationUpdateDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }

  /// Returns true if applying this update would change nothing.
  pub fn is_empty(&self) -> bool {
    self.description.is_none()
      && self.variables.is_empty()
      && self.remove_variables.is_empty()
      && self.replica_groups.is_empty()
      && self.remove_replica_groups.is_empty()
      && self.server_templates.is_empty()
      && self.remove_server_templates.is_empty()
      && self.service_templates.is_empty()
      && self.remove_service_templates.is_empty()
      && self.nodes.is_empty()
      && self.remove_nodes.is_empty()
  }
}

impl ApplicationDescriptor {
  /// Applies an incremental update in place.
  ///
  /// Templates are updated before nodes so that server instances in the
  /// update resolve against the new templates.
  ///
  /// # Errors
  ///
  /// Fails when a server instance's id cannot be resolved (unknown template
  /// or missing parameter). The descriptor may be partially updated in that
  /// case; callers apply updates to a clone.
  pub fn apply_update(&mut self, update: &ApplicationUpdateDescriptor) -> Result<(), ResolveError> {
    let previous = self.clone();
    if let Some(description) = &update.description {
      self.description = description.clone();
    }
    merge_variables(&mut self.variables, &update.variables, &update.remove_variables);

    self
      .replica_groups
      .retain(|rg| !update.remove_replica_groups.contains(&rg.id));
    for group in &update.replica_groups {
      match self.replica_groups.iter_mut().find(|rg| rg.id == group.id) {
        Some(existing) => *existing = group.clone(),
        None => self.replica_groups.push(group.clone()),
      }
    }

    for id in &update.remove_server_templates {
      self.server_templates.remove(id);
    }
    for (id, template) in &update.server_templates {
      self.server_templates.insert(id.clone(), template.clone());
    }
    for id in &update.remove_service_templates {
      self.service_templates.remove(id);
    }
    for (id, template) in &update.service_templates {
      self.service_templates.insert(id.clone(), template.clone());
    }

    for name in &update.remove_nodes {
      self.nodes.remove(name);
    }
    for node_update in &update.nodes {
      let mut node = self.nodes.get(&node_update.name).cloned().unwrap_or_default();
      self.update_node(&previous, &mut node, node_update)?;
      self.nodes.insert(node_update.name.clone(), node);
    }

    Ok(())
  }

  /// Existing instances are matched against `remove_servers` under both the
  /// previous and the updated scope, so removing a template together with
  /// its instances works in one update.
  fn update_node(
    &self,
    previous: &ApplicationDescriptor,
    node: &mut NodeDescriptor,
    update: &NodeUpdateDescriptor,
  ) -> Result<(), ResolveError> {
    let previous_resolver = Resolver::for_application(previous).for_node(&update.name, &node.variables);
    if let Some(description) = &update.description {
      node.description = description.clone();
    }
    if let Some(load_factor) = &update.load_factor {
      node.load_factor = load_factor.clone();
    }
    merge_variables(&mut node.variables, &update.variables, &update.remove_variables);

    let node_resolver = Resolver::for_application(self).for_node(&update.name, &node.variables);

    node
      .servers
      .retain(|s| !update.remove_servers.contains(&node_resolver.substitute(&s.id)));
    let mut kept = Vec::with_capacity(node.server_instances.len());
    for instance in node.server_instances.drain(..) {
      let current = self.server_instance_id(&node_resolver, &instance);
      let before = previous.server_instance_id(&previous_resolver, &instance).ok();
      let removed = |id: &String| update.remove_servers.contains(id);
      if current.as_ref().is_ok_and(removed) || before.as_ref().is_some_and(removed) {
        continue;
      }
      kept.push((current?, instance));
    }

    // an upserted server replaces a same-id server of the other kind
    for server in &update.servers {
      let id = node_resolver.substitute(&server.id);
      kept.retain(|(existing, _)| *existing != id);
      match node.servers.iter_mut().find(|s| node_resolver.substitute(&s.id) == id) {
        Some(existing) => *existing = server.clone(),
        None => node.servers.push(server.clone()),
      }
    }
    for instance in &update.server_instances {
      let id = self.server_instance_id(&node_resolver, instance)?;
      node.servers.retain(|s| node_resolver.substitute(&s.id) != id);
      match kept.iter_mut().find(|(existing, _)| *existing == id) {
        Some(entry) => entry.1 = instance.clone(),
        None => kept.push((id, instance.clone())),
      }
    }
    node.server_instances = kept.into_iter().map(|(_, instance)| instance).collect();

    Ok(())
  }

  /// Resolves the id a server instance would have on the node described by
  /// `node_resolver`.
  pub fn server_instance_id(
    &self,
    node_resolver: &Resolver,
    instance: &ServerInstanceDescriptor,
  ) -> Result<String, ResolveError> {
    let template = self
      .server_templates
      .get(&instance.template)
      .ok_or_else(|| ResolveError::MissingTemplate {
        kind: crate::resolver::TemplateKind::Server,
        id: instance.template.clone(),
      })?;
    let resolver = node_resolver.for_instance(&instance.template, template, &instance.parameter_values)?;
    Ok(resolver.substitute(&template.descriptor.id))
  }
}

fn merge_variables(target: &mut Variables, set: &Variables, remove: &[String]) {
  for name in remove {
    target.remove(name);
  }
  for (name, value) in set {
    target.insert(name.clone(), value.clone());
  }
}
