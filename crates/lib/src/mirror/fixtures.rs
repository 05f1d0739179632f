//! Descriptors shared by the mirror tests.

use std::collections::BTreeMap;

use crate::descriptor::{
  AdapterDescriptor, ApplicationDescriptor, NodeDescriptor, PropertyDescriptor, ServerDescriptor,
  ServerInstanceDescriptor, ServiceDescriptor, ServiceInstanceDescriptor, TemplateDescriptor,
};
use crate::registry::RegistrySnapshot;
use crate::tree::NodeId;

use super::{Mirror, NODES, ServerEntity};

pub fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
  pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Server template `T` (parameters `name`, `port` defaulting to 9000)
/// instantiated as `S1` on `N1` and as `S2` with port 9100 on `N2`. `N1`
/// also declares a plain server `db`.
pub fn two_instances() -> ApplicationDescriptor {
  let mut app = ApplicationDescriptor::new("demo");
  app.server_templates.insert(
    "T".to_string(),
    TemplateDescriptor::new(ServerDescriptor {
      id: "${name}".to_string(),
      exe: "/usr/bin/${name}".to_string(),
      adapters: vec![AdapterDescriptor {
        name: "Main".to_string(),
        endpoints: "tcp -p ${port}".to_string(),
        ..Default::default()
      }],
      ..Default::default()
    })
    .with_parameter("name", None)
    .with_parameter("port", Some("9000")),
  );

  let mut n1 = NodeDescriptor::default();
  n1.server_instances
    .push(ServerInstanceDescriptor::new("T", values(&[("name", "S1")])));
  n1.servers.push(ServerDescriptor {
    id: "db".to_string(),
    exe: "dbserver".to_string(),
    ..Default::default()
  });
  app.nodes.insert("N1".to_string(), n1);

  let mut n2 = NodeDescriptor::default();
  n2.server_instances.push(ServerInstanceDescriptor::new(
    "T",
    values(&[("name", "S2"), ("port", "9100")]),
  ));
  app.nodes.insert("N2".to_string(), n2);
  app
}

/// Service template `Svc` used once by a plain IceBox server `box` on
/// `N1` and once inside each instance of the IceBox server template `Box`,
/// which is instantiated on `N1` and `N2`.
pub fn nested_services() -> ApplicationDescriptor {
  let mut app = ApplicationDescriptor::new("demo");
  app.service_templates.insert(
    "Svc".to_string(),
    TemplateDescriptor::new(ServiceDescriptor {
      name: "${kind}".to_string(),
      entry: "${server}:${kind}".to_string(),
      ..Default::default()
    })
    .with_parameter("kind", None),
  );
  app.server_templates.insert(
    "Box".to_string(),
    TemplateDescriptor::new(ServerDescriptor {
      id: "${name}".to_string(),
      services: Some(vec![ServiceInstanceDescriptor::of_template(
        "Svc",
        values(&[("kind", "hello")]),
      )]),
      ..Default::default()
    })
    .with_parameter("name", None),
  );

  let mut n1 = NodeDescriptor::default();
  n1.servers.push(ServerDescriptor {
    id: "box".to_string(),
    services: Some(vec![
      ServiceInstanceDescriptor::of_template("Svc", values(&[("kind", "echo")])),
      ServiceInstanceDescriptor::inline(ServiceDescriptor {
        name: "inline".to_string(),
        ..Default::default()
      }),
    ]),
    ..Default::default()
  });
  n1.server_instances
    .push(ServerInstanceDescriptor::new("Box", values(&[("name", "box1")])));
  app.nodes.insert("N1".to_string(), n1);

  let mut n2 = NodeDescriptor::default();
  n2.server_instances
    .push(ServerInstanceDescriptor::new("Box", values(&[("name", "box2")])));
  app.nodes.insert("N2".to_string(), n2);
  app
}

pub fn loaded(app: ApplicationDescriptor) -> Mirror {
  let mut mirror = Mirror::new();
  mirror
    .load(&RegistrySnapshot {
      serial: 0,
      applications: vec![app],
      ..Default::default()
    })
    .unwrap();
  mirror
}

pub fn server<'a>(mirror: &'a Mirror, node: &str, id: &str) -> &'a ServerEntity {
  mirror
    .server("demo", node, id)
    .unwrap_or_else(|| panic!("no server {node}/{id}"))
}

pub fn with_property(mut template: TemplateDescriptor<ServerDescriptor>, name: &str, value: &str) -> TemplateDescriptor<ServerDescriptor> {
  template.descriptor.properties.push(PropertyDescriptor::new(name, value));
  template
}

/// Ids recorded as removed in the editable state at `path`.
pub fn removed_ids(mirror: &Mirror, path: &[&str]) -> Vec<String> {
  mirror
    .find("demo", path)
    .and_then(|id| mirror.tree().get(id)?.editable_state())
    .map(|state| state.removed_ids().map(str::to_string).collect())
    .unwrap_or_default()
}

pub fn is_modified_at(mirror: &Mirror, path: &[&str]) -> bool {
  mirror
    .find("demo", path)
    .and_then(|id| mirror.tree().get(id)?.editable_state())
    .is_some_and(|state| state.is_modified())
}

pub fn node_handle(mirror: &Mirror, node: &str) -> NodeId {
  mirror.find("demo", &[NODES, node]).unwrap()
}
