//! Building mirror subtrees from descriptors.
//!
//! Every builder returns a detached subtree. If a builder fails, whatever
//! it had created is released before the error is returned, so callers
//! never have to clean up after a failed build.

use thiserror::Error;

use crate::descriptor::{
  AdapterDescriptor, ApplicationDescriptor, DbEnvDescriptor, NodeDescriptor, ObjectDescriptor, PropertyDescriptor,
  ReplicaGroupDescriptor, ServerDescriptor, ServiceDescriptor, ServiceInstanceDescriptor, TemplateDescriptor,
};
use crate::resolver::{ResolveError, Resolver, TemplateKind};
use crate::tree::{Editable, NodeId, NodeSpec, Tree, TreeError};

use super::entity::{
  ADAPTERS, DB_ENVS, Entity, NODES, NodeEntity, REPLICA_GROUPS, SERVER_TEMPLATES, SERVICE_TEMPLATES, SERVICES,
  ServerEntity, ServerEntry, ServiceEntity,
};

/// Why a location could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("adapter '{adapter}' refers to unknown replica group '{group}'")]
  UnknownReplicaGroup { adapter: String, group: String },

  #[error("node '{0}' does not exist")]
  UnknownNode(String),
}

type EntityTree = Tree<Entity>;

/// Runs `fill` on a freshly created node, releasing it if `fill` fails.
fn scoped(
  tree: &mut EntityTree,
  spec: NodeSpec<Entity>,
  fill: impl FnOnce(&mut EntityTree, NodeId) -> Result<(), BuildError>,
) -> Result<NodeId, BuildError> {
  let id = tree.create(spec);
  match fill(&mut *tree, id) {
    Ok(()) => Ok(id),
    Err(err) => {
      tree.release(id);
      Err(err)
    }
  }
}

/// Attaches a detached subtree, releasing it if the attach fails.
fn attach(tree: &mut EntityTree, parent: NodeId, child: NodeId) -> Result<(), BuildError> {
  tree.attach(parent, child).map_err(|err| {
    tree.release(child);
    BuildError::from(err)
  })
}

/// Builds a whole application.
pub fn application(tree: &mut EntityTree, app: &ApplicationDescriptor) -> Result<NodeId, BuildError> {
  let spec = NodeSpec::editable_container(&app.name, Editable::new(), Entity::Application { name: app.name.clone() });
  scoped(tree, spec, |tree, root| {
    let nodes = tree.add(root, NodeSpec::editable_container(NODES, Editable::new(), Entity::Nodes))?;
    for (name, descriptor) in &app.nodes {
      let child = node(tree, app, name, descriptor, Editable::new())?;
      attach(tree, nodes, child)?;
    }

    let groups = tree.add(
      root,
      NodeSpec::editable_container(REPLICA_GROUPS, Editable::new(), Entity::ReplicaGroups),
    )?;
    for group in &app.replica_groups {
      let child = replica_group(tree, group);
      attach(tree, groups, child)?;
    }

    let templates = tree.add(
      root,
      NodeSpec::template_container(SERVER_TEMPLATES, Editable::new(), Entity::ServerTemplates),
    )?;
    for (id, template) in &app.server_templates {
      let child = server_template(tree, id, template);
      attach(tree, templates, child)?;
    }

    let templates = tree.add(
      root,
      NodeSpec::template_container(SERVICE_TEMPLATES, Editable::new(), Entity::ServiceTemplates),
    )?;
    for (id, template) in &app.service_templates {
      let child = service_template(tree, id, template);
      attach(tree, templates, child)?;
    }
    Ok(())
  })
}

/// The resolver of node `name` in `app`.
pub fn node_resolver(app: &ApplicationDescriptor, name: &str, descriptor: &NodeDescriptor) -> Resolver {
  Resolver::for_application(app).for_node(name, &descriptor.variables)
}

/// Builds a node and all of its servers. `state` becomes the node's
/// editable state, which lets a rebuilt node keep its pending removals.
pub fn node(
  tree: &mut EntityTree,
  app: &ApplicationDescriptor,
  name: &str,
  descriptor: &NodeDescriptor,
  state: Editable,
) -> Result<NodeId, BuildError> {
  let resolver = node_resolver(app, name, descriptor);
  let entity = Entity::Node(NodeEntity {
    name: name.to_string(),
    description: resolver.substitute(&descriptor.description),
    load_factor: resolver.substitute(&descriptor.load_factor),
    resolver: resolver.clone(),
  });

  scoped(tree, NodeSpec::editable_container(name, state, entity), |tree, id| {
    let entries = descriptor
      .servers
      .iter()
      .cloned()
      .map(ServerEntry::Plain)
      .chain(descriptor.server_instances.iter().cloned().map(ServerEntry::Instance));
    for entry in entries {
      let child = server(tree, app, name, &resolver, &entry)?;
      attach(tree, id, child)?;
    }
    Ok(())
  })
}

/// Builds a server declared on node `node_name`.
///
/// Instances resolve their template in a scope that binds the template's
/// parameters; their subtree is read-only since edits go to the template.
pub fn server(
  tree: &mut EntityTree,
  app: &ApplicationDescriptor,
  node_name: &str,
  node_resolver: &Resolver,
  entry: &ServerEntry,
) -> Result<NodeId, BuildError> {
  let (raw, resolver, editable) = match entry {
    ServerEntry::Plain(descriptor) => (descriptor.clone(), node_resolver.clone(), true),
    ServerEntry::Instance(instance) => {
      let template = app
        .server_templates
        .get(&instance.template)
        .ok_or_else(|| ResolveError::MissingTemplate {
          kind: TemplateKind::Server,
          id: instance.template.clone(),
        })?;
      let resolver = node_resolver.for_instance(&instance.template, template, &instance.parameter_values)?;
      let mut raw = template.descriptor.clone();
      raw.properties.extend(instance.properties.iter().cloned());
      (raw, resolver, false)
    }
  };

  let id = resolver.substitute(&raw.id);
  let resolver = resolver.with_binding("server", &id);
  let resolved = resolve_server(&raw, &resolver);
  let services = raw.services.clone();
  let entity = Entity::Server(Box::new(ServerEntity {
    node: node_name.to_string(),
    origin: entry.clone(),
    raw,
    resolved: resolved.clone(),
    resolver: resolver.clone(),
  }));

  scoped(tree, NodeSpec::container(id, entity).editable(editable), |tree, server| {
    adapters_and_db_envs(tree, app, server, &resolved.adapters, &resolved.db_envs, editable)?;
    if let Some(services) = services {
      let container = tree.add(server, NodeSpec::container(SERVICES, Entity::Services).editable(editable))?;
      for instance in &services {
        let child = service(tree, app, &resolver, instance, editable)?;
        attach(tree, container, child)?;
      }
    }
    Ok(())
  })
}

/// Builds one IceBox service in the scope of its server.
pub fn service(
  tree: &mut EntityTree,
  app: &ApplicationDescriptor,
  server_resolver: &Resolver,
  instance: &ServiceInstanceDescriptor,
  editable: bool,
) -> Result<NodeId, BuildError> {
  let (mut raw, resolver, editable) = match &instance.descriptor {
    Some(descriptor) => (descriptor.clone(), server_resolver.clone(), editable),
    None => {
      let template = app
        .service_templates
        .get(&instance.template)
        .ok_or_else(|| ResolveError::MissingTemplate {
          kind: TemplateKind::Service,
          id: instance.template.clone(),
        })?;
      let resolver = server_resolver.for_instance(&instance.template, template, &instance.parameter_values)?;
      (template.descriptor.clone(), resolver, false)
    }
  };
  raw.properties.extend(instance.properties.iter().cloned());

  let name = resolver.substitute(&raw.name);
  let resolver = resolver.with_binding("service", &name);
  let resolved = resolve_service(&raw, &resolver);
  let entity = Entity::Service(Box::new(ServiceEntity {
    instance: instance.clone(),
    resolved: resolved.clone(),
    resolver,
  }));

  scoped(tree, NodeSpec::container(name, entity).editable(editable), |tree, service| {
    adapters_and_db_envs(tree, app, service, &resolved.adapters, &resolved.db_envs, editable)
  })
}

fn adapters_and_db_envs(
  tree: &mut EntityTree,
  app: &ApplicationDescriptor,
  parent: NodeId,
  adapters: &[AdapterDescriptor],
  db_envs: &[DbEnvDescriptor],
  editable: bool,
) -> Result<(), BuildError> {
  let container = tree.add(parent, NodeSpec::container(ADAPTERS, Entity::Adapters).editable(editable))?;
  for adapter in adapters {
    if !adapter.replica_group_id.is_empty() && app.replica_group(&adapter.replica_group_id).is_none() {
      return Err(BuildError::UnknownReplicaGroup {
        adapter: adapter.name.clone(),
        group: adapter.replica_group_id.clone(),
      });
    }
    tree.add(
      container,
      NodeSpec::leaf(&adapter.name, Entity::Adapter(adapter.clone())).editable(editable),
    )?;
  }

  let container = tree.add(parent, NodeSpec::container(DB_ENVS, Entity::DbEnvs).editable(editable))?;
  for db_env in db_envs {
    tree.add(
      container,
      NodeSpec::leaf(&db_env.name, Entity::DbEnv(db_env.clone())).editable(editable),
    )?;
  }
  Ok(())
}

pub fn replica_group(tree: &mut EntityTree, group: &ReplicaGroupDescriptor) -> NodeId {
  tree.create(NodeSpec::leaf(&group.id, Entity::ReplicaGroup(group.clone())))
}

pub fn server_template(tree: &mut EntityTree, id: &str, template: &TemplateDescriptor<ServerDescriptor>) -> NodeId {
  tree.create(NodeSpec::leaf(id, Entity::ServerTemplate(Box::new(template.clone()))))
}

pub fn service_template(tree: &mut EntityTree, id: &str, template: &TemplateDescriptor<ServiceDescriptor>) -> NodeId {
  tree.create(NodeSpec::leaf(id, Entity::ServiceTemplate(Box::new(template.clone()))))
}

fn resolve_properties(properties: &[PropertyDescriptor], resolver: &Resolver) -> Vec<PropertyDescriptor> {
  properties
    .iter()
    .map(|p| PropertyDescriptor::new(resolver.substitute(&p.name), resolver.substitute(&p.value)))
    .collect()
}

fn resolve_adapter(adapter: &AdapterDescriptor, resolver: &Resolver) -> AdapterDescriptor {
  AdapterDescriptor {
    name: resolver.substitute(&adapter.name),
    description: resolver.substitute(&adapter.description),
    id: resolver.substitute(&adapter.id),
    replica_group_id: resolver.substitute(&adapter.replica_group_id),
    endpoints: resolver.substitute(&adapter.endpoints),
    register_process: adapter.register_process,
    server_lifetime: adapter.server_lifetime,
    objects: adapter
      .objects
      .iter()
      .map(|o| ObjectDescriptor {
        id: resolver.substitute(&o.id),
        type_id: resolver.substitute(&o.type_id),
      })
      .collect(),
  }
}

fn resolve_db_env(db_env: &DbEnvDescriptor, resolver: &Resolver) -> DbEnvDescriptor {
  DbEnvDescriptor {
    name: resolver.substitute(&db_env.name),
    description: resolver.substitute(&db_env.description),
    db_home: resolver.substitute(&db_env.db_home),
    properties: resolve_properties(&db_env.properties, resolver),
  }
}

/// Substitutes every text field of a server. Services are left as
/// declared; each is resolved in its own scope.
fn resolve_server(raw: &ServerDescriptor, resolver: &Resolver) -> ServerDescriptor {
  ServerDescriptor {
    id: resolver.substitute(&raw.id),
    exe: resolver.substitute(&raw.exe),
    pwd: resolver.substitute(&raw.pwd),
    options: raw.options.iter().map(|o| resolver.substitute(o)).collect(),
    envs: raw.envs.iter().map(|e| resolver.substitute(e)).collect(),
    activation: resolver.substitute(&raw.activation),
    description: resolver.substitute(&raw.description),
    properties: resolve_properties(&raw.properties, resolver),
    adapters: raw.adapters.iter().map(|a| resolve_adapter(a, resolver)).collect(),
    db_envs: raw.db_envs.iter().map(|d| resolve_db_env(d, resolver)).collect(),
    services: raw.services.clone(),
  }
}

fn resolve_service(raw: &ServiceDescriptor, resolver: &Resolver) -> ServiceDescriptor {
  ServiceDescriptor {
    name: resolver.substitute(&raw.name),
    entry: resolver.substitute(&raw.entry),
    description: resolver.substitute(&raw.description),
    properties: resolve_properties(&raw.properties, resolver),
    adapters: raw.adapters.iter().map(|a| resolve_adapter(a, resolver)).collect(),
    db_envs: raw.db_envs.iter().map(|d| resolve_db_env(d, resolver)).collect(),
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::descriptor::ServerInstanceDescriptor;

  fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  fn app() -> ApplicationDescriptor {
    let mut app = ApplicationDescriptor::new("demo");
    app.variables.insert("host".to_string(), "example.org".to_string());
    let template = TemplateDescriptor::new(ServerDescriptor {
      id: "${name}".to_string(),
      exe: "/usr/bin/${name}".to_string(),
      adapters: vec![AdapterDescriptor {
        name: "Main".to_string(),
        endpoints: "tcp -h ${host} -p ${port}".to_string(),
        ..Default::default()
      }],
      ..Default::default()
    })
    .with_parameter("name", None)
    .with_parameter("port", Some("9000"));
    app.server_templates.insert("T".to_string(), template);
    let mut node = NodeDescriptor::default();
    node.server_instances.push(ServerInstanceDescriptor::new("T", values(&[("name", "S1")])));
    app.nodes.insert("N1".to_string(), node);
    app
  }

  #[test]
  fn application_layout() {
    let app = app();
    let mut tree = Tree::new(NodeSpec::container("", Entity::Root));
    let root = tree.root();
    let id = application(&mut tree, &app).unwrap();
    tree.attach(root, id).unwrap();

    let ids: Vec<_> = tree.children(id).iter().map(|c| tree.node(*c).unwrap().id().to_string()).collect();
    assert_eq!(ids, vec![NODES, REPLICA_GROUPS, SERVER_TEMPLATES, SERVICE_TEMPLATES]);

    let server = tree.resolve_path(id, &[NODES, "N1", "S1"]).unwrap();
    let node = tree.node(server).unwrap();
    assert!(!node.is_editable());
    let Entity::Server(entity) = node.payload() else {
      panic!("expected a server");
    };
    assert_eq!(entity.resolved.exe, "/usr/bin/S1");
    assert_eq!(entity.resolved.adapters[0].endpoints, "tcp -h example.org -p 9000");
    assert_eq!(entity.resolver.find("server"), Some("S1"));
    assert!(tree.resolve_path(server, &[ADAPTERS, "Main"]).is_some());
  }

  #[test]
  fn failed_build_releases_partial_subtree() {
    let mut app = app();
    app.server_templates.get_mut("T").unwrap().descriptor.adapters[0].replica_group_id = "missing".to_string();
    let mut tree = Tree::new(NodeSpec::container("", Entity::Root));

    let err = application(&mut tree, &app).unwrap_err();

    assert_eq!(
      err,
      BuildError::UnknownReplicaGroup {
        adapter: "Main".to_string(),
        group: "missing".to_string()
      }
    );
    assert_eq!(tree.len(), 1);
  }

  #[test]
  fn missing_template_is_reported() {
    let mut app = app();
    app.server_templates.clear();
    let mut tree = Tree::new(NodeSpec::container("", Entity::Root));

    let err = application(&mut tree, &app).unwrap_err();

    assert!(matches!(err, BuildError::Resolve(ResolveError::MissingTemplate { .. })));
    assert_eq!(tree.len(), 1);
  }

  #[test]
  fn duplicate_adapter_names_collide() {
    let mut app = app();
    let template = app.server_templates.get_mut("T").unwrap();
    template.descriptor.adapters.push(AdapterDescriptor {
      name: "Main".to_string(),
      ..Default::default()
    });
    let mut tree = Tree::new(NodeSpec::container("", Entity::Root));

    let err = application(&mut tree, &app).unwrap_err();

    assert!(matches!(err, BuildError::Tree(TreeError::DuplicateId { .. })));
    assert_eq!(tree.len(), 1);
  }

  #[test]
  fn icebox_services_resolve_in_server_scope() {
    let mut app = app();
    app.service_templates.insert(
      "Svc".to_string(),
      TemplateDescriptor::new(ServiceDescriptor {
        name: "${kind}".to_string(),
        entry: "${server}:${service}".to_string(),
        ..Default::default()
      })
      .with_parameter("kind", None),
    );
    let mut icebox = ServerDescriptor {
      id: "box".to_string(),
      ..Default::default()
    };
    icebox.services = Some(vec![ServiceInstanceDescriptor::of_template("Svc", values(&[("kind", "hello")]))]);
    app.nodes.get_mut("N1").unwrap().servers.push(icebox);
    let mut tree = Tree::new(NodeSpec::container("", Entity::Root));

    let id = application(&mut tree, &app).unwrap();

    let service = tree.resolve_path(id, &[NODES, "N1", "box", SERVICES, "hello"]).unwrap();
    let Entity::Service(entity) = tree.node(service).unwrap().payload() else {
      panic!("expected a service");
    };
    assert_eq!(entity.resolved.entry, "box:hello");
  }
}
