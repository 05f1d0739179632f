//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output: colored status
//! messages, labelled values and the descriptor tree outline.

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use gridadmin_lib::tree::TreeDump;

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Prints a tree outline, dimming the labels of read-only nodes.
pub fn print_tree(dump: &TreeDump, depth: usize) {
  let indent = "  ".repeat(depth);
  let mut line = format!("{indent}{}", dump.id);
  if !dump.label.is_empty() {
    let label = format!("[{}]", dump.label);
    if dump.editable {
      line.push_str(&format!(" {label}"));
    } else {
      line.push_str(&format!(" {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed())));
    }
  }
  if dump.modified == Some(true) {
    line.push_str(&format!(" {}", "*".if_supports_color(Stream::Stdout, |s| s.yellow())));
  }
  if dump.ephemeral {
    line.push_str(&format!(" {}", "(new)".if_supports_color(Stream::Stdout, |s| s.green())));
  }
  if !dump.removed.is_empty() {
    let removed = format!("-{{{}}}", dump.removed.join(","));
    line.push_str(&format!(" {}", removed.if_supports_color(Stream::Stdout, |s| s.red())));
  }
  println!("{line}");
  for child in &dump.children {
    print_tree(child, depth + 1);
  }
}
