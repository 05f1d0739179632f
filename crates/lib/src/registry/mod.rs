//! The remote registry contract.
//!
//! The engine only relies on what is described here: a one-shot snapshot
//! delivered through [`RegistryObserver::init`], a stream of serial-tagged
//! [`RegistryEvent`]s, an exclusive write lease and the application
//! mutations. [`LocalRegistry`] implements the contract on top of a
//! directory so that the engine can be driven without a remote service.

mod lease;
mod local;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{
  AdapterDynamicInfo, AdapterInfo, ApplicationDescriptor, ApplicationUpdateDescriptor, NodeDynamicInfo, ObjectInfo,
  ServerDynamicInfo,
};
use crate::resolver::ResolveError;

pub use lease::{Lease, LeaseMetadata};
pub use local::LocalRegistry;

/// Everything the registry knows, as of `serial`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySnapshot {
  pub serial: u64,
  pub applications: Vec<ApplicationDescriptor>,
  pub adapters: Vec<AdapterInfo>,
  pub objects: Vec<ObjectInfo>,
}

/// A change pushed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RegistryEvent {
  ApplicationAdded { descriptor: ApplicationDescriptor },
  ApplicationRemoved { name: String },
  ApplicationUpdated { update: ApplicationUpdateDescriptor },
  AdapterAdded { info: AdapterInfo },
  AdapterUpdated { info: AdapterInfo },
  AdapterRemoved { id: String },
  ObjectAdded { info: ObjectInfo },
  ObjectUpdated { info: ObjectInfo },
  ObjectRemoved { id: String },
  NodeUp { info: NodeDynamicInfo },
  NodeDown { name: String },
  ServerDynamicInfoUpdated { node: String, info: ServerDynamicInfo },
  AdapterDynamicInfoUpdated { node: String, info: AdapterDynamicInfo },
}

impl RegistryEvent {
  /// Short name used in logs.
  pub fn name(&self) -> &'static str {
    match self {
      RegistryEvent::ApplicationAdded { .. } => "application-added",
      RegistryEvent::ApplicationRemoved { .. } => "application-removed",
      RegistryEvent::ApplicationUpdated { .. } => "application-updated",
      RegistryEvent::AdapterAdded { .. } => "adapter-added",
      RegistryEvent::AdapterUpdated { .. } => "adapter-updated",
      RegistryEvent::AdapterRemoved { .. } => "adapter-removed",
      RegistryEvent::ObjectAdded { .. } => "object-added",
      RegistryEvent::ObjectUpdated { .. } => "object-updated",
      RegistryEvent::ObjectRemoved { .. } => "object-removed",
      RegistryEvent::NodeUp { .. } => "node-up",
      RegistryEvent::NodeDown { .. } => "node-down",
      RegistryEvent::ServerDynamicInfoUpdated { .. } => "server-dynamic-info-updated",
      RegistryEvent::AdapterDynamicInfoUpdated { .. } => "adapter-dynamic-info-updated",
    }
  }
}

/// An event together with the serial the registry reached by emitting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialEvent {
  pub serial: u64,
  #[serde(flatten)]
  pub event: RegistryEvent,
}

impl SerialEvent {
  pub fn new(serial: u64, event: RegistryEvent) -> Self {
    Self { serial, event }
  }
}

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error(
    "write access is held by {holder} (PID {pid})\n\
     If you're sure no other client is running, remove the lease file:\n  {lease_path}"
  )]
  AccessDenied {
    holder: String,
    pid: u32,
    lease_path: PathBuf,
  },

  #[error(
    "write access is held by another client (could not read lease metadata)\n\
     If you're sure no other client is running, remove the lease file:\n  {lease_path}"
  )]
  AccessDeniedUnknown { lease_path: PathBuf },

  #[error("write access is required for this operation")]
  NoWriteAccess,

  #[error("application '{0}' already exists")]
  ApplicationExists(String),

  #[error("application '{0}' does not exist")]
  UnknownApplication(String),

  #[error("update rejected: {0}")]
  InvalidUpdate(#[from] ResolveError),

  #[error("session lost: {0}")]
  SessionLost(String),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize registry state: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to acquire write access: {0}")]
  LockFailed(#[source] io::Error),
}

/// Receives the registry's push stream.
///
/// Callbacks may arrive on any thread; implementations forward them to
/// the mirror's owner instead of touching it directly.
pub trait RegistryObserver: Send + Sync {
  fn init(&self, snapshot: RegistrySnapshot);
  fn event(&self, event: SerialEvent);
}

/// Operations the engine invokes on the registry.
///
/// Calls may block on the remote side.
pub trait Registry: Send + Sync {
  /// Registers `observer`; the registry answers with a snapshot through
  /// [`RegistryObserver::init`] and then streams events.
  fn register_observer(&self, observer: Arc<dyn RegistryObserver>) -> Result<(), RegistryError>;

  /// Stops pushing to an observer passed to
  /// [`Registry::register_observer`]. Unknown observers are ignored.
  fn unregister_observer(&self, observer: &Arc<dyn RegistryObserver>) -> Result<(), RegistryError>;

  /// Acquires the exclusive write lease and returns the serial in effect.
  fn start_update(&self) -> Result<u64, RegistryError>;

  fn finish_update(&self) -> Result<(), RegistryError>;

  /// Pings the session; an error means the session is gone.
  fn keep_alive(&self) -> Result<(), RegistryError>;

  /// Each mutation returns the serial of the event it produced.
  fn add_application(&self, descriptor: &ApplicationDescriptor) -> Result<u64, RegistryError>;

  fn update_application(&self, update: &ApplicationUpdateDescriptor) -> Result<u64, RegistryError>;

  fn remove_application(&self, name: &str) -> Result<u64, RegistryError>;
}
