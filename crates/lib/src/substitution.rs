//! `${name}` parsing and substitution.
//!
//! Descriptor values may reference variables and template parameters with
//! `${name}`. Substitution is purely textual and recursive: the value bound
//! to a name is itself substituted before being inserted.
//!
//! # Rules
//!
//! - `${name}` is replaced by the value bound to `name`, if any.
//! - Unbound names are left verbatim as `${name}`.
//! - `$${` is an escape: it produces a literal `${` and never substitutes.
//! - An unterminated `${` (and an empty `${}`) is malformed; the text is
//!   kept verbatim. [`validate`] reports these, substitution never fails.
//! - A single `$` passes through unchanged.
//!
//! # Example
//!
//! ```
//! use gridadmin_lib::substitution::{parse, Segment};
//!
//! let segments = parse("tcp -p ${port}");
//! assert_eq!(segments, vec![
//!     Segment::Literal("tcp -p ".to_string()),
//!     Segment::Variable("port".to_string()),
//! ]);
//! ```

use thiserror::Error;
use tracing::warn;

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text, escapes already collapsed.
  Literal(String),

  /// A `${name}` reference.
  Variable(String),
}

/// Malformed references found by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
  #[error("unterminated variable reference at position {0}")]
  Unclosed(usize),

  #[error("empty variable reference at position {0}")]
  EmptyName(usize),
}

/// Source of values for [`substitute`].
pub trait Lookup {
  fn lookup(&self, name: &str) -> Option<&str>;
}

impl Lookup for std::collections::BTreeMap<String, String> {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.get(name).map(String::as_str)
  }
}

/// Parses text into literal and variable segments.
///
/// Never fails: malformed references are returned as literal text.
pub fn parse(input: &str) -> Vec<Segment> {
  scan(input).0
}

/// Reports the first malformed reference in `input`, if any.
pub fn validate(input: &str) -> Result<(), SubstitutionError> {
  match scan(input).1 {
    Some(err) => Err(err),
    None => Ok(()),
  }
}

fn scan(input: &str) -> (Vec<Segment>, Option<SubstitutionError>) {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut first_error = None;
  let mut rest = input;
  let mut offset = 0;

  while let Some(pos) = rest.find('$') {
    literal.push_str(&rest[..pos]);
    let tail = &rest[pos..];

    if tail.starts_with("$${") {
      // Escaped: $${ -> ${ (literal)
      literal.push_str("${");
      rest = &tail[3..];
      offset += pos + 3;
      continue;
    }

    if let Some(body) = tail.strip_prefix("${") {
      match body.find('}') {
        Some(0) => {
          first_error.get_or_insert(SubstitutionError::EmptyName(offset + pos));
          literal.push_str("${}");
          rest = &body[1..];
          offset += pos + 3;
        }
        Some(end) => {
          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Variable(body[..end].to_string()));
          rest = &body[end + 1..];
          offset += pos + 2 + end + 1;
        }
        None => {
          // Unterminated: keep the remainder verbatim
          first_error.get_or_insert(SubstitutionError::Unclosed(offset + pos));
          literal.push_str(tail);
          rest = "";
        }
      }
      continue;
    }

    // Lone $, pass through
    literal.push('$');
    rest = &tail[1..];
    offset += pos + 1;
  }

  literal.push_str(rest);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  (segments, first_error)
}

/// Substitutes every `${name}` in `input` using `lookup`.
///
/// Bound values are substituted recursively. A name that refers back to
/// itself through its own value is left unresolved at the point of the
/// cycle.
///
/// Substitute a text once. An escaped `$${name}` comes out as `${name}`,
/// which a second pass would resolve.
pub fn substitute(input: &str, lookup: &impl Lookup) -> String {
  let mut active = Vec::new();
  substitute_inner(input, lookup, &mut active)
}

fn substitute_inner(input: &str, lookup: &impl Lookup, active: &mut Vec<String>) -> String {
  let mut result = String::with_capacity(input.len());

  for segment in parse(input) {
    match segment {
      Segment::Literal(text) => result.push_str(&text),
      Segment::Variable(name) => {
        if active.contains(&name) {
          warn!(variable = %name, "circular variable reference left unresolved");
          push_reference(&mut result, &name);
          continue;
        }
        match lookup.lookup(&name) {
          Some(value) => {
            active.push(name);
            let resolved = substitute_inner(value, lookup, active);
            active.pop();
            result.push_str(&resolved);
          }
          None => push_reference(&mut result, &name),
        }
      }
    }
  }

  result
}

fn push_reference(out: &mut String, name: &str) {
  out.push_str("${");
  out.push_str(name);
  out.push('}');
}
