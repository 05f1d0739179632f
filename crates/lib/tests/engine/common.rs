//! Shared helpers for engine integration tests.

use std::sync::Arc;
use std::time::Duration;

use gridadmin_lib::config::SessionConfig;
use gridadmin_lib::descriptor::{
  AdapterDescriptor, ApplicationDescriptor, NodeDescriptor, ServerDescriptor, ServerInstanceDescriptor,
  TemplateDescriptor,
};
use gridadmin_lib::registry::{LocalRegistry, Registry};
use gridadmin_lib::sync::Session;
use tempfile::TempDir;

/// Settings for sessions that never lose their registry.
pub fn config(client: &str) -> SessionConfig {
  SessionConfig {
    init_timeout: Duration::from_secs(5),
    keep_alive_period: Duration::from_secs(3600),
    client_label: client.to_string(),
  }
}

/// Application `demo`: template `T` instantiated as `S1` on `N1`, next to
/// a plain server `db`.
pub fn demo() -> ApplicationDescriptor {
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
  let mut node = NodeDescriptor::default();
  node.server_instances.push(ServerInstanceDescriptor::new(
    "T",
    [("name".to_string(), "S1".to_string())].into(),
  ));
  node.servers.push(ServerDescriptor {
    id: "db".to_string(),
    exe: "dbserver".to_string(),
    ..Default::default()
  });
  app.nodes.insert("N1".to_string(), node);
  app
}

/// A registry directory that lives as long as the value.
pub struct TestRegistry {
  pub temp: TempDir,
}

impl TestRegistry {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Opens a new handle on the directory.
  pub fn open(&self, client: &str) -> Arc<LocalRegistry> {
    Arc::new(LocalRegistry::open(self.temp.path(), client).unwrap())
  }

  pub async fn connect(&self, registry: &Arc<LocalRegistry>, client: &str) -> Session {
    let registry: Arc<dyn Registry> = registry.clone();
    Session::connect(registry, &config(client)).await.unwrap()
  }

  /// Writes `app` to the registry through its own session.
  pub async fn seed(&self, app: ApplicationDescriptor) {
    let registry = self.open("seed");
    let session = self.connect(&registry, "seed").await;
    session.run(move |c| c.add_application(&app)).await.unwrap().unwrap();
    session.shutdown().await.unwrap();
  }
}
