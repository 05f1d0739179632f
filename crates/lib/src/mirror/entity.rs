//! Payloads carried by mirror tree nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{
  AdapterDescriptor, DbEnvDescriptor, ReplicaGroupDescriptor, ServerDescriptor, ServerInstanceDescriptor,
  ServiceDescriptor, ServiceInstanceDescriptor, TemplateDescriptor,
};
use crate::resolver::Resolver;

pub const NODES: &str = "nodes";
pub const REPLICA_GROUPS: &str = "replica-groups";
pub const SERVER_TEMPLATES: &str = "server-templates";
pub const SERVICE_TEMPLATES: &str = "service-templates";
pub const ADAPTERS: &str = "adapters";
pub const DB_ENVS: &str = "db-envs";
pub const SERVICES: &str = "services";

/// How a server is declared on its node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerEntry {
  Plain(ServerDescriptor),
  Instance(ServerInstanceDescriptor),
}

impl ServerEntry {
  /// The server template this entry instantiates, if any.
  pub fn template(&self) -> Option<&str> {
    match self {
      ServerEntry::Plain(_) => None,
      ServerEntry::Instance(instance) => Some(&instance.template),
    }
  }
}

#[derive(Debug, Clone)]
pub struct NodeEntity {
  pub name: String,
  pub description: String,
  pub load_factor: String,
  pub resolver: Resolver,
}

#[derive(Debug, Clone)]
pub struct ServerEntity {
  /// Name of the node declaring the server.
  pub node: String,
  pub origin: ServerEntry,
  /// The unresolved descriptor the server was built from: the plain
  /// descriptor, or the template's with instance properties appended.
  pub raw: ServerDescriptor,
  pub resolved: ServerDescriptor,
  /// Scope of the server, with `server` bound.
  pub resolver: Resolver,
}

#[derive(Debug, Clone)]
pub struct ServiceEntity {
  pub instance: ServiceInstanceDescriptor,
  pub resolved: ServiceDescriptor,
  pub resolver: Resolver,
}

/// What a tree node stands for.
#[derive(Debug, Clone)]
pub enum Entity {
  Root,
  Application { name: String },
  Nodes,
  Node(NodeEntity),
  Server(Box<ServerEntity>),
  Services,
  Service(Box<ServiceEntity>),
  Adapters,
  Adapter(AdapterDescriptor),
  DbEnvs,
  DbEnv(DbEnvDescriptor),
  ReplicaGroups,
  ReplicaGroup(ReplicaGroupDescriptor),
  ServerTemplates,
  ServerTemplate(Box<TemplateDescriptor<ServerDescriptor>>),
  ServiceTemplates,
  ServiceTemplate(Box<TemplateDescriptor<ServiceDescriptor>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Root,
  Application,
  Nodes,
  Node,
  Server,
  Services,
  Service,
  Adapters,
  Adapter,
  DbEnvs,
  DbEnv,
  ReplicaGroups,
  ReplicaGroup,
  ServerTemplates,
  ServerTemplate,
  ServiceTemplates,
  ServiceTemplate,
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      EntityKind::Root => "root",
      EntityKind::Application => "application",
      EntityKind::Nodes => "nodes",
      EntityKind::Node => "node",
      EntityKind::Server => "server",
      EntityKind::Services => "services",
      EntityKind::Service => "service",
      EntityKind::Adapters => "adapters",
      EntityKind::Adapter => "adapter",
      EntityKind::DbEnvs => "db-envs",
      EntityKind::DbEnv => "db-env",
      EntityKind::ReplicaGroups => "replica-groups",
      EntityKind::ReplicaGroup => "replica-group",
      EntityKind::ServerTemplates => "server-templates",
      EntityKind::ServerTemplate => "server-template",
      EntityKind::ServiceTemplates => "service-templates",
      EntityKind::ServiceTemplate => "service-template",
    };
    f.write_str(name)
  }
}

impl Entity {
  pub fn kind(&self) -> EntityKind {
    match self {
      Entity::Root => EntityKind::Root,
      Entity::Application { .. } => EntityKind::Application,
      Entity::Nodes => EntityKind::Nodes,
      Entity::Node(_) => EntityKind::Node,
      Entity::Server(_) => EntityKind::Server,
      Entity::Services => EntityKind::Services,
      Entity::Service(_) => EntityKind::Service,
      Entity::Adapters => EntityKind::Adapters,
      Entity::Adapter(_) => EntityKind::Adapter,
      Entity::DbEnvs => EntityKind::DbEnvs,
      Entity::DbEnv(_) => EntityKind::DbEnv,
      Entity::ReplicaGroups => EntityKind::ReplicaGroups,
      Entity::ReplicaGroup(_) => EntityKind::ReplicaGroup,
      Entity::ServerTemplates => EntityKind::ServerTemplates,
      Entity::ServerTemplate(_) => EntityKind::ServerTemplate,
      Entity::ServiceTemplates => EntityKind::ServiceTemplates,
      Entity::ServiceTemplate(_) => EntityKind::ServiceTemplate,
    }
  }

  /// One-line label used in tree dumps.
  ///
  /// Labels carry the resolved values that edits change, so a dump taken
  /// before and after an edit differs whenever the edit had any effect.
  pub fn summary(&self) -> String {
    match self {
      Entity::Node(node) if node.description.is_empty() => "node".to_string(),
      Entity::Node(node) => format!("node: {}", node.description),
      Entity::Server(server) => {
        let mut label = match server.origin.template() {
          Some(template) => format!("server <{template}>"),
          None => "server".to_string(),
        };
        if server.resolved.is_icebox() {
          label.push_str(" icebox");
        }
        for property in &server.resolved.properties {
          label.push_str(&format!(" {}={}", property.name, property.value));
        }
        label
      }
      Entity::Service(service) => {
        let mut label = if service.instance.is_template_instance() {
          format!("service <{}>", service.instance.template)
        } else {
          "service".to_string()
        };
        for property in &service.resolved.properties {
          label.push_str(&format!(" {}={}", property.name, property.value));
        }
        label
      }
      Entity::Adapter(adapter) if adapter.replica_group_id.is_empty() => format!("adapter {}", adapter.endpoints),
      Entity::Adapter(adapter) => format!("adapter {} -> {}", adapter.endpoints, adapter.replica_group_id),
      Entity::DbEnv(db_env) => format!("db-env {}", db_env.db_home),
      Entity::ReplicaGroup(group) => format!("replica-group {}", group.load_balancing),
      Entity::ServerTemplate(template) => format!("server-template ({})", template.parameters.join(", ")),
      Entity::ServiceTemplate(template) => format!("service-template ({})", template.parameters.join(", ")),
      other => other.kind().to_string(),
    }
  }
}
