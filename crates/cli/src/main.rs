use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

/// gridadmin - inspect and edit deployments kept in a grid registry
#[derive(Parser)]
#[command(name = "gridadmin")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Registry directory (default: $GRIDADMIN_REGISTRY, then the data directory)
  #[arg(long, global = true, value_name = "DIR")]
  registry: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Add an application from a JSON descriptor
  Import {
    /// Path to the application descriptor
    file: PathBuf,
  },

  /// Print the descriptor tree
  Tree {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Show registry status
  Status {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Substitute `${...}` references in the scope of a server
  Resolve {
    application: String,
    node: String,
    server: String,
    text: String,
  },

  /// Set a property on a server template and save the application
  SetProperty {
    application: String,
    template: String,
    name: String,
    value: String,
  },

  /// Remove a server from a node and save the application
  RemoveServer {
    application: String,
    node: String,
    server: String,
  },
}

fn main() {
  let cli = Cli::parse();

  let level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(err) = run(cli) {
    output::print_error(&format!("{err:#}"));
    std::process::exit(1);
  }
}

fn run(cli: Cli) -> Result<()> {
  let registry = cli.registry;
  match cli.command {
    Commands::Import { file } => cmd::cmd_import(registry, &file),
    Commands::Tree { json } => cmd::cmd_tree(registry, json),
    Commands::Status { json } => cmd::cmd_status(registry, cli.verbose, json),
    Commands::Resolve {
      application,
      node,
      server,
      text,
    } => cmd::cmd_resolve(registry, &application, &node, &server, &text),
    Commands::SetProperty {
      application,
      template,
      name,
      value,
    } => cmd::cmd_set_property(registry, &application, &template, &name, &value),
    Commands::RemoveServer {
      application,
      node,
      server,
    } => cmd::cmd_remove_server(registry, &application, &node, &server),
  }
}
