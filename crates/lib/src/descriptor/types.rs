//! Descriptor value types.
//!
//! Every record derives `serde` so that a descriptor imported from JSON is
//! structurally identical to one delivered by the registry snapshot.
//!
//! # Nesting
//!
//! ```text
//! ApplicationDescriptor
//! ├── variables
//! ├── replica_groups        (ReplicaGroupDescriptor)
//! ├── server_templates      (TemplateDescriptor<ServerDescriptor>)
//! ├── service_templates     (TemplateDescriptor<ServiceDescriptor>)
//! └── nodes                 (NodeDescriptor)
//!     ├── variables
//!     ├── server_instances  (ServerInstanceDescriptor)
//!     └── servers           (ServerDescriptor)
//!         ├── properties, adapters, db_envs
//!         └── services      (IceBox servers only)
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name → value bindings declared by an application or a node.
pub type Variables = BTreeMap<String, String>;

/// A single configuration property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
  pub name: String,
  pub value: String,
}

impl PropertyDescriptor {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }
}

/// Looks up a property by name; later entries override earlier ones.
pub fn find_property<'a>(properties: &'a [PropertyDescriptor], name: &str) -> Option<&'a str> {
  properties
    .iter()
    .rev()
    .find(|p| p.name == name)
    .map(|p| p.value.as_str())
}

/// A well-known object registered by an adapter or a replica group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDescriptor {
  pub id: String,
  #[serde(rename = "type")]
  pub type_id: String,
}

/// An object adapter hosted by a server or a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterDescriptor {
  /// Name, unique within the hosting server or service.
  pub name: String,
  pub description: String,
  /// Registry-wide adapter id.
  pub id: String,
  /// Replica group this adapter belongs to; empty when not replicated.
  pub replica_group_id: String,
  pub endpoints: String,
  pub register_process: bool,
  pub server_lifetime: bool,
  pub objects: Vec<ObjectDescriptor>,
}

/// A database environment used by a server or a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbEnvDescriptor {
  pub name: String,
  pub description: String,
  pub db_home: String,
  pub properties: Vec<PropertyDescriptor>,
}

/// An IceBox service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
  pub name: String,
  pub entry: String,
  pub description: String,
  pub properties: Vec<PropertyDescriptor>,
  pub adapters: Vec<AdapterDescriptor>,
  pub db_envs: Vec<DbEnvDescriptor>,
}

/// A service inside an IceBox server: either an instance of a service
/// template or an inline descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstanceDescriptor {
  /// Service template id; empty when `descriptor` is inline.
  pub template: String,
  pub parameter_values: BTreeMap<String, String>,
  pub descriptor: Option<ServiceDescriptor>,
  /// Properties appended to the instantiated service's own.
  pub properties: Vec<PropertyDescriptor>,
}

impl ServiceInstanceDescriptor {
  /// Creates an instance of the given service template.
  pub fn of_template(template: impl Into<String>, parameter_values: BTreeMap<String, String>) -> Self {
    Self {
      template: template.into(),
      parameter_values,
      ..Default::default()
    }
  }

  /// Wraps an inline service descriptor.
  pub fn inline(descriptor: ServiceDescriptor) -> Self {
    Self {
      descriptor: Some(descriptor),
      ..Default::default()
    }
  }

  pub fn is_template_instance(&self) -> bool {
    self.descriptor.is_none()
  }
}

/// A server, possibly an IceBox server hosting services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDescriptor {
  /// Server id, unique within its node.
  pub id: String,
  pub exe: String,
  pub pwd: String,
  pub options: Vec<String>,
  pub envs: Vec<String>,
  pub activation: String,
  pub description: String,
  pub properties: Vec<PropertyDescriptor>,
  pub adapters: Vec<AdapterDescriptor>,
  pub db_envs: Vec<DbEnvDescriptor>,
  /// Present only for IceBox servers.
  pub services: Option<Vec<ServiceInstanceDescriptor>>,
}

impl ServerDescriptor {
  pub fn is_icebox(&self) -> bool {
    self.services.is_some()
  }

  pub fn property(&self, name: &str) -> Option<&str> {
    find_property(&self.properties, name)
  }
}

/// A server stamped out from a server template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInstanceDescriptor {
  pub template: String,
  pub parameter_values: BTreeMap<String, String>,
  /// Properties appended to the instantiated server's own.
  pub properties: Vec<PropertyDescriptor>,
}

impl ServerInstanceDescriptor {
  pub fn new(template: impl Into<String>, parameter_values: BTreeMap<String, String>) -> Self {
    Self {
      template: template.into(),
      parameter_values,
      properties: Vec::new(),
    }
  }
}

/// A reusable descriptor with an ordered list of parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDescriptor<T> {
  pub descriptor: T,
  /// Parameter names in declaration order; names are unique.
  pub parameters: Vec<String>,
  /// Default values for a subset of `parameters`.
  pub parameter_defaults: BTreeMap<String, String>,
}

impl<T> TemplateDescriptor<T> {
  pub fn new(descriptor: T) -> Self {
    Self {
      descriptor,
      parameters: Vec::new(),
      parameter_defaults: BTreeMap::new(),
    }
  }

  /// Declares a parameter, optionally with a default value.
  pub fn with_parameter(mut self, name: impl Into<String>, default: Option<&str>) -> Self {
    let name = name.into();
    if let Some(default) = default {
      self.parameter_defaults.insert(name.clone(), default.to_string());
    }
    if !self.parameters.contains(&name) {
      self.parameters.push(name);
    }
    self
  }
}

/// A node and the servers deployed on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
  pub variables: Variables,
  pub server_instances: Vec<ServerInstanceDescriptor>,
  pub servers: Vec<ServerDescriptor>,
  pub load_factor: String,
  pub description: String,
}

/// A replica group grouping replicated adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaGroupDescriptor {
  pub id: String,
  pub load_balancing: String,
  pub description: String,
  pub objects: Vec<ObjectDescriptor>,
}

/// A complete application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationDescriptor {
  pub name: String,
  pub description: String,
  pub variables: Variables,
  pub replica_groups: Vec<ReplicaGroupDescriptor>,
  pub server_templates: BTreeMap<String, TemplateDescriptor<ServerDescriptor>>,
  pub service_templates: BTreeMap<String, TemplateDescriptor<ServiceDescriptor>>,
  pub nodes: BTreeMap<String, NodeDescriptor>,
}

impl ApplicationDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn replica_group(&self, id: &str) -> Option<&ReplicaGroupDescriptor> {
    self.replica_groups.iter().find(|rg| rg.id == id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn later_properties_override_earlier_ones() {
    let props = vec![
      PropertyDescriptor::new("Ice.Trace", "0"),
      PropertyDescriptor::new("Other", "x"),
      PropertyDescriptor::new("Ice.Trace", "2"),
    ];
    assert_eq!(find_property(&props, "Ice.Trace"), Some("2"));
    assert_eq!(find_property(&props, "Missing"), None);
  }

  #[test]
  fn with_parameter_keeps_declaration_order_and_uniqueness() {
    let template = TemplateDescriptor::new(ServerDescriptor::default())
      .with_parameter("name", None)
      .with_parameter("port", Some("9000"))
      .with_parameter("name", None);

    assert_eq!(template.parameters, vec!["name".to_string(), "port".to_string()]);
    assert_eq!(template.parameter_defaults.get("port").map(String::as_str), Some("9000"));
  }

  #[test]
  fn application_deserializes_with_missing_fields() {
    let json = r#"{
      "name": "demo",
      "nodes": { "node1": { "servers": [ { "id": "db", "exe": "dbserver" } ] } }
    }"#;

    let app: ApplicationDescriptor = serde_json::from_str(json).unwrap();
    assert_eq!(app.name, "demo");
    let node = &app.nodes["node1"];
    assert_eq!(node.servers[0].id, "db");
    assert!(!node.servers[0].is_icebox());
    assert!(app.server_templates.is_empty());
  }

  #[test]
  fn object_type_uses_wire_name() {
    let obj = ObjectDescriptor {
      id: "hello".to_string(),
      type_id: "::Demo::Hello".to_string(),
    };
    let json = serde_json::to_value(&obj).unwrap();
    assert_eq!(json["type"], "::Demo::Hello");
  }
}
