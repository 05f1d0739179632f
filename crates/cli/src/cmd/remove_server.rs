//! Implementation of the `gridadmin remove-server` command.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use super::Connection;
use crate::output::print_success;

/// Removes a server from the working copy and saves the application.
pub fn cmd_remove_server(registry: Option<PathBuf>, application: &str, node: &str, server: &str) -> Result<()> {
  let conn = Connection::open(registry)?;
  let (app, node_name, server_id) = (application.to_string(), node.to_string(), server.to_string());
  let result = conn.run(move |c| -> Result<Option<u64>> {
    let id = c
      .mirror()
      .server_node(&app, &node_name, &server_id)
      .ok_or_else(|| anyhow!("server '{server_id}' not found on node '{node_name}' of application '{app}'"))?;
    c.with_write_access(|ctx| -> Result<Option<u64>> {
      ctx.destroy(id).context("Removal rejected")?;
      Ok(ctx.save(&app)?)
    })?
  })?;
  conn.close()?;

  let serial = result?.context("Nothing to save")?;
  print_success(&format!(
    "Removed server '{server}' from node '{node}' of '{application}' (serial {serial})"
  ));
  Ok(())
}
