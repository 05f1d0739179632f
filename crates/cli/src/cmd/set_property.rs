//! Implementation of the `gridadmin set-property` command.
//!
//! Edits a server template and saves the application. The edit rebuilds
//! the template and every server instantiated from it in one transaction,
//! so a value that breaks any instance is rejected as a whole.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use gridadmin_lib::descriptor::PropertyDescriptor;
use gridadmin_lib::mirror::Edit;

use super::Connection;
use crate::output::{print_info, print_success};

pub fn cmd_set_property(
  registry: Option<PathBuf>,
  application: &str,
  template: &str,
  name: &str,
  value: &str,
) -> Result<()> {
  let conn = Connection::open(registry)?;
  let (app, id, property, new_value) = (
    application.to_string(),
    template.to_string(),
    name.to_string(),
    value.to_string(),
  );
  let result = conn.run(move |c| -> Result<(usize, Option<u64>)> {
    let mut descriptor = c
      .mirror()
      .application(&app)
      .ok_or_else(|| anyhow!("application '{app}' does not exist"))?
      .server_templates
      .get(&id)
      .cloned()
      .ok_or_else(|| anyhow!("server template '{id}' does not exist in '{app}'"))?;

    let properties = &mut descriptor.descriptor.properties;
    match properties.iter_mut().find(|p| p.name == property) {
      Some(existing) => existing.value = new_value,
      None => properties.push(PropertyDescriptor::new(property, new_value)),
    }

    let outcome = c
      .edit(&app, Edit::UpdateServerTemplate { id, template: descriptor })
      .context("Template update rejected")?;
    let serial = c.save(&app).context("Failed to save the application")?;
    Ok((outcome.applied.len(), serial))
  })?;
  conn.close()?;

  let (rebuilt, serial) = result?;
  match serial {
    Some(serial) => print_success(&format!(
      "Updated template '{template}' in '{application}': {rebuilt} location(s) rebuilt, saved at serial {serial}"
    )),
    None => print_info(&format!("Template '{template}' already has {name}={value}")),
  }
  Ok(())
}
