//! Keeping the mirror in step with the registry.
//!
//! [`SyncState`] tracks the serial of the last applied event and the write
//! lease. The [`Coordinator`] owns the mirror together with that state and
//! is the only place registry events and registry mutations meet the tree.
//! [`Session`] runs a coordinator on a dedicated owner thread, marshals
//! observer callbacks onto it and watches the session with keep-alives.

mod coordinator;
mod session;
mod state;

use thiserror::Error;

use crate::mirror::EditError;
use crate::registry::RegistryError;

pub use coordinator::{Coordinator, DeferredAction, LeaseStatus, WriteContext};
pub use session::{Session, SessionError};
pub use state::SyncState;

/// Proof that the write lease is held.
///
/// Only the coordinator hands these out, so code that receives one runs
/// while the mirror is at least as recent as the lease.
#[derive(Debug)]
pub struct WriteAccess {
  _private: (),
}

impl WriteAccess {
  pub(crate) fn grant() -> Self {
    Self { _private: () }
  }
}

#[derive(Debug, Error)]
pub enum SyncError {
  #[error("event serial {received} out of sequence, expected {expected}")]
  ProtocolViolation { expected: u64, received: u64 },

  #[error("session lost: {0}")]
  SessionLost(String),

  #[error("write access denied: {0}")]
  AccessDenied(#[source] RegistryError),

  #[error("mirror is not synchronized with the registry")]
  NotInitialized,

  #[error("mirror is at serial {latest}, write access needs serial {required}")]
  Behind { latest: u64, required: u64 },

  #[error("write access released more often than acquired")]
  LeaseNotHeld,

  #[error("event {serial} left the mirror inconsistent: {source}")]
  InvalidState {
    serial: u64,
    #[source]
    source: EditError,
  },

  #[error(transparent)]
  Edit(#[from] EditError),

  #[error(transparent)]
  Registry(#[from] RegistryError),
}

impl SyncError {
  /// Returns true if the mirror was invalidated and has to be rebuilt from
  /// a fresh snapshot.
  pub fn requires_resync(&self) -> bool {
    matches!(
      self,
      SyncError::ProtocolViolation { .. } | SyncError::SessionLost(_) | SyncError::InvalidState { .. }
    )
  }
}
