//! Implementation of the `gridadmin tree` command.

use std::path::PathBuf;

use anyhow::Result;

use super::Connection;
use crate::output::{print_info, print_json, print_tree};

/// Prints the mirror tree: every application with its nodes, servers,
/// replica groups and templates.
pub fn cmd_tree(registry: Option<PathBuf>, json: bool) -> Result<()> {
  let conn = Connection::open(registry)?;
  let dump = conn.run(|c| c.mirror().dump())?;
  conn.close()?;

  if json {
    return print_json(&dump.children);
  }
  if dump.children.is_empty() {
    print_info("No applications deployed.");
    return Ok(());
  }
  for application in &dump.children {
    print_tree(application, 0);
  }
  Ok(())
}
