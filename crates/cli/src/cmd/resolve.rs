//! Implementation of the `gridadmin resolve` command.

use std::path::PathBuf;

use anyhow::{Result, bail};

use gridadmin_lib::substitution;

use super::Connection;
use crate::output::print_warning;

/// Prints `text` with every `${...}` reference substituted in the scope of
/// the given server.
pub fn cmd_resolve(registry: Option<PathBuf>, application: &str, node: &str, server: &str, text: &str) -> Result<()> {
  if let Err(err) = substitution::validate(text) {
    print_warning(&format!("{err}; the reference is kept verbatim"));
  }

  let conn = Connection::open(registry)?;
  let (app, node_name, server_id, input) = (
    application.to_string(),
    node.to_string(),
    server.to_string(),
    text.to_string(),
  );
  let resolved = conn.run(move |c| {
    c.mirror()
      .server_resolver(&app, &node_name, &server_id)
      .map(|resolver| resolver.substitute(&input))
  })?;
  conn.close()?;

  match resolved {
    Some(value) => {
      println!("{value}");
      Ok(())
    }
    None => bail!("server '{server}' not found on node '{node}' of application '{application}'"),
  }
}
