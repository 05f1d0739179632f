//! Locating every tree location that instantiates a template.
//!
//! Nothing is indexed: each query walks the application's `nodes` subtree
//! in pre-order. Children are kept in id order, so results always come
//! out in the same order for the same tree. Unsaved entities are skipped.

use crate::resolver::TemplateKind;
use crate::tree::NodeId;

use super::entity::{ADAPTERS, DB_ENVS, Entity, NODES, SERVICES};
use super::Mirror;

/// Which child container of an instance to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelector {
  Adapters,
  DbEnvs,
  Services,
}

impl ChildSelector {
  fn id(self) -> &'static str {
    match self {
      ChildSelector::Adapters => ADAPTERS,
      ChildSelector::DbEnvs => DB_ENVS,
      ChildSelector::Services => SERVICES,
    }
  }
}

impl Mirror {
  /// Committed tree locations below the application's nodes, in pre-order.
  fn walk(&self, application: &str) -> Vec<NodeId> {
    let Some(nodes) = self.find(application, &[NODES]) else {
      return Vec::new();
    };
    self
      .tree
      .descendants(nodes)
      .into_iter()
      .filter(|id| !self.tree.is_ephemeral(*id))
      .collect()
  }

  /// Servers instantiated from server template `template`.
  pub fn server_template_instances(&self, application: &str, template: &str) -> Vec<NodeId> {
    self
      .walk(application)
      .into_iter()
      .filter(|id| match self.tree.payload(*id) {
        Some(Entity::Server(server)) => server.origin.template() == Some(template),
        _ => false,
      })
      .collect()
  }

  /// Services instantiated from service template `template`, including
  /// those inside servers that are themselves template instances.
  pub fn service_template_instances(&self, application: &str, template: &str) -> Vec<NodeId> {
    self
      .walk(application)
      .into_iter()
      .filter(|id| match self.tree.payload(*id) {
        Some(Entity::Service(service)) => {
          service.instance.is_template_instance() && service.instance.template == template
        }
        _ => false,
      })
      .collect()
  }

  /// Instances of a template of either kind.
  pub fn template_instances(&self, application: &str, kind: TemplateKind, template: &str) -> Vec<NodeId> {
    match kind {
      TemplateKind::Server => self.server_template_instances(application, template),
      TemplateKind::Service => self.service_template_instances(application, template),
    }
  }

  /// The `selector` container of every instance of `template`, one per
  /// instance that has one.
  pub fn find_instance_containers(
    &self,
    application: &str,
    kind: TemplateKind,
    template: &str,
    selector: ChildSelector,
  ) -> Vec<NodeId> {
    self
      .template_instances(application, kind, template)
      .into_iter()
      .filter_map(|instance| self.tree.find_child(instance, selector.id()))
      .collect()
  }

  /// Servers with an adapter, directly or in one of their services, that
  /// refers to replica group `group`.
  pub fn replica_group_users(&self, application: &str, group: &str) -> Vec<NodeId> {
    let mut servers = Vec::new();
    for id in self.walk(application) {
      let Some(Entity::Adapter(adapter)) = self.tree.payload(id) else {
        continue;
      };
      if adapter.replica_group_id != group {
        continue;
      }
      let server = self
        .tree
        .ancestors(id)
        .into_iter()
        .find(|a| matches!(self.tree.payload(*a), Some(Entity::Server(_))));
      if let Some(server) = server
        && !servers.contains(&server)
      {
        servers.push(server);
      }
    }
    servers
  }
}
