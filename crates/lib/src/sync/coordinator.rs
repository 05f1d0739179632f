//! The owner of the mirror.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::descriptor::ApplicationDescriptor;
use crate::mirror::{Edit, EditError, EditOutcome, Mirror};
use crate::registry::{Registry, RegistryError, RegistrySnapshot, SerialEvent};
use crate::tree::NodeId;

use super::{SyncError, SyncState, WriteAccess};

/// Work that needs the write lease and a mirror at least as recent as the
/// lease.
pub type DeferredAction = Box<dyn FnOnce(&mut WriteContext<'_>) + Send>;

/// What happened to work submitted with [`Coordinator::on_write_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
  Executed,
  /// The mirror lags behind the lease; the work runs once serial `until`
  /// has been applied.
  Deferred { until: u64 },
}

/// The mirror and the registry, while the write lease is held.
pub struct WriteContext<'a> {
  mirror: &'a mut Mirror,
  registry: &'a dyn Registry,
  access: &'a WriteAccess,
}

impl WriteContext<'_> {
  pub fn mirror(&self) -> &Mirror {
    &*self.mirror
  }

  pub fn mirror_mut(&mut self) -> &mut Mirror {
    &mut *self.mirror
  }

  pub fn access(&self) -> &WriteAccess {
    self.access
  }

  pub fn edit(&mut self, application: &str, edit: Edit) -> Result<EditOutcome, EditError> {
    self.mirror.apply_edit(self.access, application, edit)
  }

  /// Adds an unsaved entity to the working descriptor.
  pub fn promote(&mut self, id: NodeId) -> Result<EditOutcome, EditError> {
    self.mirror.promote(self.access, id)
  }

  pub fn destroy(&mut self, id: NodeId) -> Result<Option<EditOutcome>, EditError> {
    self.mirror.destroy(id, Some(self.access))
  }

  /// Sends an application's local changes to the registry and commits
  /// them. Returns the serial of the resulting registry event, or `None`
  /// when there was nothing to send.
  pub fn save(&mut self, application: &str) -> Result<Option<u64>, SyncError> {
    let Some(update) = self.mirror.update_descriptor(application) else {
      debug!(application, "nothing to save");
      return Ok(None);
    };
    let serial = self.registry.update_application(&update)?;
    self.mirror.commit(application);
    info!(application, serial, "saved local changes");
    Ok(Some(serial))
  }
}

/// Owns the mirror and applies registry events to it in serial order.
pub struct Coordinator {
  mirror: Mirror,
  state: SyncState,
  registry: Arc<dyn Registry>,
  deferred: VecDeque<DeferredAction>,
}

impl fmt::Debug for Coordinator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Coordinator")
      .field("state", &self.state)
      .field("deferred", &self.deferred.len())
      .finish_non_exhaustive()
  }
}

impl Coordinator {
  pub fn new(registry: Arc<dyn Registry>) -> Self {
    Self {
      mirror: Mirror::new(),
      state: SyncState::new(),
      registry,
      deferred: VecDeque::new(),
    }
  }

  pub fn mirror(&self) -> &Mirror {
    &self.mirror
  }

  /// Mutable access for edits that need no write access, such as unsaved
  /// entities and selection.
  pub fn mirror_mut(&mut self) -> &mut Mirror {
    &mut self.mirror
  }

  pub fn state(&self) -> &SyncState {
    &self.state
  }

  pub fn registry(&self) -> &Arc<dyn Registry> {
    &self.registry
  }

  pub fn is_synchronized(&self) -> bool {
    self.state.is_initialized()
  }

  pub fn deferred(&self) -> usize {
    self.deferred.len()
  }

  /// Seeds the mirror from a snapshot, discarding whatever it held.
  pub fn initialize(&mut self, snapshot: &RegistrySnapshot) -> Result<(), SyncError> {
    self.drop_deferred();
    self.return_lease();
    self.state.reset();
    if let Err(source) = self.mirror.load(snapshot) {
      self.mirror.clear();
      return Err(SyncError::InvalidState {
        serial: snapshot.serial,
        source,
      });
    }
    self.state.initialize(snapshot.serial);
    info!(serial = snapshot.serial, "mirror synchronized");
    Ok(())
  }

  /// Applies one pushed event.
  ///
  /// # Errors
  ///
  /// Errors for which [`SyncError::requires_resync`] holds have already
  /// cleared the mirror.
  pub fn apply_event(&mut self, event: &SerialEvent) -> Result<(), SyncError> {
    if !self.state.is_initialized() {
      return Err(SyncError::NotInitialized);
    }
    if let Err(err) = self.state.advance(event.serial) {
      error!(serial = event.serial, error = %err, "event out of sequence");
      self.invalidate();
      return Err(err);
    }
    if let Err(source) = self.mirror.apply_event(&event.event) {
      error!(serial = event.serial, event = event.event.name(), error = %source, "failed to apply event");
      self.invalidate();
      return Err(SyncError::InvalidState {
        serial: event.serial,
        source,
      });
    }
    debug!(serial = event.serial, event = event.event.name(), "applied event");
    self.run_deferred();
    Ok(())
  }

  /// Clears the mirror and every serial after a lost session.
  pub fn session_lost(&mut self, reason: &str) -> SyncError {
    error!(reason, "registry session lost");
    self.invalidate();
    SyncError::SessionLost(reason.to_string())
  }

  /// Drops the mirror, the serials, the lease and pending work.
  pub fn invalidate(&mut self) {
    self.drop_deferred();
    self.return_lease();
    self.state.reset();
    self.mirror.clear();
  }

  /// Hands a held lease back to the registry whatever its reference count,
  /// before the state that tracks it is reset.
  fn return_lease(&mut self) {
    if !self.state.holds_lease() {
      return;
    }
    match self.registry.finish_update() {
      Ok(()) => debug!(references = self.state.write_count(), "write access returned with the mirror"),
      Err(err) => warn!(error = %err, "failed to return write access"),
    }
  }

  fn drop_deferred(&mut self) {
    if !self.deferred.is_empty() {
      warn!(actions = self.deferred.len(), "dropping work waiting for write access");
      self.deferred.clear();
    }
  }

  /// Takes the write lease, or another reference to it.
  ///
  /// # Errors
  ///
  /// [`SyncError::AccessDenied`] when another client holds the lease;
  /// nothing is changed then.
  pub fn acquire_write_access(&mut self) -> Result<LeaseStatus, SyncError> {
    if !self.state.is_initialized() {
      return Err(SyncError::NotInitialized);
    }
    if self.state.needs_lease() {
      let serial = self.registry.start_update().map_err(|err| match err {
        err @ (RegistryError::AccessDenied { .. } | RegistryError::AccessDeniedUnknown { .. }) => {
          SyncError::AccessDenied(err)
        }
        err => SyncError::Registry(err),
      })?;
      self.state.lease_granted(serial);
      debug!(write_serial = serial, "write access acquired");
    } else {
      self.state.lease_reentered();
    }

    Ok(match self.state.write_serial() {
      Some(until) if !self.state.caught_up() => LeaseStatus::Deferred { until },
      _ => LeaseStatus::Executed,
    })
  }

  /// Drops one reference to the lease, handing it back to the registry
  /// with the last one.
  pub fn release_write_access(&mut self) -> Result<(), SyncError> {
    if self.state.release()? {
      self.registry.finish_update()?;
      debug!("write access released");
    }
    Ok(())
  }

  /// Runs `f` under the write lease, releasing it afterwards.
  ///
  /// # Errors
  ///
  /// [`SyncError::Behind`] when the mirror has not caught up with the
  /// lease; use [`Coordinator::on_write_access`] to wait instead.
  pub fn with_write_access<R>(&mut self, f: impl FnOnce(&mut WriteContext<'_>) -> R) -> Result<R, SyncError> {
    if let LeaseStatus::Deferred { until } = self.acquire_write_access()? {
      let latest = self.state.latest().unwrap_or_default();
      self.release_write_access()?;
      return Err(SyncError::Behind {
        latest,
        required: until,
      });
    }
    let access = WriteAccess::grant();
    let mut ctx = WriteContext {
      mirror: &mut self.mirror,
      registry: self.registry.as_ref(),
      access: &access,
    };
    let result = f(&mut ctx);
    self.release_write_access()?;
    Ok(result)
  }

  /// Runs `action` under the write lease, now if the mirror is recent
  /// enough, otherwise as soon as an event brings it there. The lease is
  /// released once the action has run.
  pub fn on_write_access(&mut self, action: DeferredAction) -> Result<LeaseStatus, SyncError> {
    let status = self.acquire_write_access()?;
    match status {
      LeaseStatus::Executed => {
        self.execute(action);
        self.release_write_access()?;
      }
      LeaseStatus::Deferred { until } => {
        debug!(until, latest = ?self.state.latest(), "deferring work until the mirror catches up");
        self.deferred.push_back(action);
      }
    }
    Ok(status)
  }

  fn execute(&mut self, action: DeferredAction) {
    let access = WriteAccess::grant();
    let mut ctx = WriteContext {
      mirror: &mut self.mirror,
      registry: self.registry.as_ref(),
      access: &access,
    };
    action(&mut ctx);
  }

  fn run_deferred(&mut self) {
    while self.state.caught_up() {
      let Some(action) = self.deferred.pop_front() else {
        break;
      };
      self.execute(action);
      if let Err(err) = self.release_write_access() {
        error!(error = %err, "failed to release write access after deferred work");
      }
    }
  }

  /// Applies an edit under the write lease.
  pub fn edit(&mut self, application: &str, edit: Edit) -> Result<EditOutcome, SyncError> {
    Ok(self.with_write_access(|ctx| ctx.edit(application, edit))??)
  }

  /// Sends an application's local changes to the registry.
  pub fn save(&mut self, application: &str) -> Result<Option<u64>, SyncError> {
    self.with_write_access(|ctx| ctx.save(application))?
  }

  /// Adds a whole application to the registry. The mirror picks it up from
  /// the resulting event.
  pub fn add_application(&mut self, descriptor: &ApplicationDescriptor) -> Result<u64, SyncError> {
    Ok(self.with_write_access(|ctx| ctx.registry.add_application(descriptor))??)
  }

  pub fn remove_application(&mut self, name: &str) -> Result<u64, SyncError> {
    Ok(self.with_write_access(|ctx| ctx.registry.remove_application(name))??)
  }
}
