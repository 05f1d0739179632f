//! Scoped variable and parameter resolution.
//!
//! A [`Resolver`] is a read-only chain of scopes consulted in order:
//!
//! 1. template parameters (only inside a template instance)
//! 2. predefined bindings (`application`, `node`, `server`, `service`)
//! 3. variable maps, innermost first (node variables, then application
//!    variables)
//!
//! The first scope that defines a name wins; scopes are never merged.
//! Resolution is lazy: nothing is expanded until [`Resolver::substitute`]
//! is asked for a value.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::{ApplicationDescriptor, TemplateDescriptor, Variables};
use crate::substitution::{self, Lookup};

/// Which template namespace an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
  Server,
  Service,
}

impl fmt::Display for TemplateKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TemplateKind::Server => write!(f, "server template"),
      TemplateKind::Service => write!(f, "service template"),
    }
  }
}

/// Errors raised while binding a template instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error("{kind} '{id}' does not exist")]
  MissingTemplate { kind: TemplateKind, id: String },

  #[error("template '{template}' requires a value for parameter '{parameter}'")]
  MissingParameter { template: String, parameter: String },

  #[error("template '{template}' has no parameter '{parameter}'")]
  UnknownParameter { template: String, parameter: String },
}

/// A chain of lookup scopes.
///
/// Cloning is cheap: inherited variable maps are shared.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
  parameters: BTreeMap<String, String>,
  predefined: BTreeMap<String, String>,
  variables: Vec<Arc<Variables>>,
}

impl Resolver {
  /// Creates an empty resolver that binds nothing.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates the root resolver of an application.
  pub fn for_application(app: &ApplicationDescriptor) -> Self {
    let mut predefined = BTreeMap::new();
    predefined.insert("application".to_string(), app.name.clone());
    Self {
      parameters: BTreeMap::new(),
      predefined,
      variables: vec![Arc::new(app.variables.clone())],
    }
  }

  /// Creates the scope of a node: binds `node` and puts the node's
  /// variables in front of the inherited ones.
  pub fn for_node(&self, name: &str, variables: &Variables) -> Self {
    let mut predefined = self.predefined.clone();
    predefined.insert("node".to_string(), name.to_string());
    let mut chain = Vec::with_capacity(self.variables.len() + 1);
    chain.push(Arc::new(variables.clone()));
    chain.extend(self.variables.iter().cloned());
    Self {
      parameters: BTreeMap::new(),
      predefined,
      variables: chain,
    }
  }

  /// Creates the scope of a template instance.
  ///
  /// Every declared parameter is bound from `values`, falling back to the
  /// template default. Values are substituted in the enclosing scope, so
  /// an instance may pass `${node}` or a variable as a parameter value.
  ///
  /// # Errors
  ///
  /// Fails when a parameter has neither a value nor a default, or when
  /// `values` names a parameter the template does not declare.
  pub fn for_instance<T>(
    &self,
    template_id: &str,
    template: &TemplateDescriptor<T>,
    values: &BTreeMap<String, String>,
  ) -> Result<Self, ResolveError> {
    if let Some(unknown) = values.keys().find(|name| !template.parameters.contains(name)) {
      return Err(ResolveError::UnknownParameter {
        template: template_id.to_string(),
        parameter: unknown.clone(),
      });
    }

    let mut parameters = BTreeMap::new();
    for name in &template.parameters {
      let raw = values
        .get(name)
        .or_else(|| template.parameter_defaults.get(name))
        .ok_or_else(|| ResolveError::MissingParameter {
          template: template_id.to_string(),
          parameter: name.clone(),
        })?;
      parameters.insert(name.clone(), self.substitute(raw));
    }

    Ok(Self {
      parameters,
      predefined: self.predefined.clone(),
      variables: self.variables.clone(),
    })
  }

  /// Adds a predefined binding such as `server` or `service`.
  pub fn with_binding(mut self, name: &str, value: &str) -> Self {
    self.predefined.insert(name.to_string(), value.to_string());
    self
  }

  /// Returns the raw value bound to `name` by the first scope defining it.
  pub fn find(&self, name: &str) -> Option<&str> {
    if let Some(value) = self.parameters.get(name) {
      return Some(value.as_str());
    }
    if let Some(value) = self.predefined.get(name) {
      return Some(value.as_str());
    }
    self
      .variables
      .iter()
      .find_map(|scope| scope.get(name))
      .map(String::as_str)
  }

  /// Substitutes `${name}` references in `text`. Pass raw descriptor text
  /// only, see [`substitution::substitute`].
  pub fn substitute(&self, text: &str) -> String {
    substitution::substitute(text, self)
  }

  /// Bound template parameters, empty outside a template instance.
  pub fn parameters(&self) -> &BTreeMap<String, String> {
    &self.parameters
  }

  /// Returns true if template parameters are bound in this scope.
  pub fn has_parameters(&self) -> bool {
    !self.parameters.is_empty()
  }
}

impl Lookup for Resolver {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.find(name)
  }
}
