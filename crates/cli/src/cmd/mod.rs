//! Subcommands and the registry connection they share.

mod import;
mod remove_server;
mod resolve;
mod set_property;
mod status;
mod tree;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tracing::debug;

use gridadmin_lib::config::{self, SessionConfig};
use gridadmin_lib::registry::{LocalRegistry, Registry};
use gridadmin_lib::sync::{Coordinator, Session};

pub use import::cmd_import;
pub use remove_server::cmd_remove_server;
pub use resolve::cmd_resolve;
pub use set_property::cmd_set_property;
pub use status::cmd_status;
pub use tree::cmd_tree;

/// A synchronized session over the local registry, driven from
/// synchronous command code.
pub struct Connection {
  runtime: Runtime,
  session: Session,
  registry: Arc<LocalRegistry>,
  config: SessionConfig,
}

impl Connection {
  pub fn open(registry: Option<PathBuf>) -> Result<Self> {
    let config = SessionConfig::from_env().context("Invalid session settings")?;
    let dir = config::registry_dir(registry).context("Failed to locate the registry")?;
    let registry = Arc::new(
      LocalRegistry::open(&dir, config.client_label.clone())
        .with_context(|| format!("Failed to open registry at {}", dir.display()))?,
    );
    debug!(registry = %registry.dir().display(), "connecting");

    let runtime = Runtime::new().context("Failed to create async runtime")?;
    let shared: Arc<dyn Registry> = registry.clone();
    let session = runtime
      .block_on(Session::connect(shared, &config))
      .context("Failed to synchronize with the registry")?;
    Ok(Self {
      runtime,
      session,
      registry,
      config,
    })
  }

  pub fn registry(&self) -> &LocalRegistry {
    &self.registry
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  /// Runs `f` against the synchronized coordinator.
  pub fn run<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&mut Coordinator) -> R + Send + 'static,
  {
    self.runtime.block_on(self.session.run(f)).context("Registry session closed")
  }

  /// Applies pending registry events, then shuts the session down.
  pub fn close(self) -> Result<()> {
    let Connection { runtime, session, .. } = self;
    runtime.block_on(async {
      session.flush().await?;
      session.shutdown().await
    })?;
    Ok(())
  }
}
