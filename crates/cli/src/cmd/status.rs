//! Implementation of the `gridadmin status` command.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use super::Connection;
use crate::output::{self, print_json, print_stat, print_success};

#[derive(Debug, Serialize)]
struct Status {
  registry: PathBuf,
  serial: Option<u64>,
  applications: Vec<String>,
  adapters: usize,
  objects: usize,
  nodes_up: Vec<String>,
}

pub fn cmd_status(registry: Option<PathBuf>, verbose: bool, json: bool) -> Result<()> {
  let conn = Connection::open(registry)?;
  let mut status = conn.run(|c| {
    let mirror = c.mirror();
    Status {
      registry: PathBuf::new(),
      serial: c.state().latest(),
      applications: mirror.application_names().map(str::to_string).collect(),
      adapters: mirror.adapters().len(),
      objects: mirror.objects().len(),
      nodes_up: mirror.runtime().nodes().map(|n| n.info.name.clone()).collect(),
    }
  })?;
  status.registry = conn.registry().dir().to_path_buf();
  let config = conn.config().clone();
  conn.close()?;

  if json {
    return print_json(&status);
  }

  print_success(&format!("Registry at {}", status.registry.display()));
  print_stat(
    "Serial",
    &status.serial.map_or_else(|| "-".to_string(), |s| s.to_string()),
  );
  print_stat("Applications", &status.applications.len().to_string());
  print_stat("Adapters", &status.adapters.to_string());
  print_stat("Objects", &status.objects.to_string());
  print_stat("Nodes up", &status.nodes_up.len().to_string());

  if verbose {
    if !status.applications.is_empty() {
      println!();
      println!("Applications:");
      for name in &status.applications {
        println!("  {} {}", output::symbols::INFO, name);
      }
    }
    println!();
    print_stat("Client", &config.client_label);
    print_stat("Init timeout", &humantime::format_duration(config.init_timeout).to_string());
    print_stat("Keep-alive", &humantime::format_duration(config.keep_alive_period).to_string());
  }

  Ok(())
}
