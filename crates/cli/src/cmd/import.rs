//! Implementation of the `gridadmin import` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use gridadmin_lib::descriptor::ApplicationDescriptor;

use super::Connection;
use crate::output::print_success;

/// Adds the application described by `file` to the registry.
pub fn cmd_import(registry: Option<PathBuf>, file: &Path) -> Result<()> {
  let path = dunce::canonicalize(file).with_context(|| format!("Descriptor not found: {}", file.display()))?;
  let contents = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
  let descriptor: ApplicationDescriptor =
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
  let name = descriptor.name.clone();

  let conn = Connection::open(registry)?;
  let serial = conn
    .run(move |c| c.add_application(&descriptor))?
    .with_context(|| format!("Failed to import application '{name}'"))?;
  conn.close()?;

  print_success(&format!("Imported application '{name}' (serial {serial})"));
  Ok(())
}
