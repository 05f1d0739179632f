//! Serial and lease bookkeeping.

use super::SyncError;

/// The counters the synchronization layer keeps next to the mirror.
///
/// `latest` is the serial of the last applied event, `None` until a
/// snapshot has been loaded. `write_serial` is the registry's serial at the
/// moment the lease was granted; work done under the lease waits until
/// `latest` has reached it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
  latest: Option<u64>,
  write_serial: Option<u64>,
  write_count: u32,
}

impl SyncState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Starts over from a snapshot taken at `serial`.
  pub fn initialize(&mut self, serial: u64) {
    self.latest = Some(serial);
  }

  pub fn is_initialized(&self) -> bool {
    self.latest.is_some()
  }

  pub fn latest(&self) -> Option<u64> {
    self.latest
  }

  pub fn write_serial(&self) -> Option<u64> {
    self.write_serial
  }

  pub fn write_count(&self) -> u32 {
    self.write_count
  }

  pub fn holds_lease(&self) -> bool {
    self.write_count > 0
  }

  /// Accepts the next event serial.
  ///
  /// # Errors
  ///
  /// [`SyncError::ProtocolViolation`] unless `serial` directly follows the
  /// last applied one; the state is left untouched.
  pub fn advance(&mut self, serial: u64) -> Result<(), SyncError> {
    let latest = self.latest.ok_or(SyncError::NotInitialized)?;
    let expected = latest + 1;
    if serial != expected {
      return Err(SyncError::ProtocolViolation {
        expected,
        received: serial,
      });
    }
    self.latest = Some(serial);
    Ok(())
  }

  /// True once every event visible when the lease was granted has been
  /// applied. Always true without a lease.
  pub fn caught_up(&self) -> bool {
    match (self.write_serial, self.latest) {
      (None, _) => true,
      (Some(required), Some(latest)) => latest >= required,
      (Some(_), None) => false,
    }
  }

  /// Returns true if the lease is not held yet and must be requested from
  /// the registry before [`SyncState::lease_granted`].
  pub fn needs_lease(&self) -> bool {
    self.write_count == 0
  }

  /// Records the first acquisition of the lease.
  pub fn lease_granted(&mut self, write_serial: u64) {
    self.write_serial = Some(write_serial);
    self.write_count = 1;
  }

  /// Records a nested acquisition of a lease already held.
  pub fn lease_reentered(&mut self) {
    self.write_count += 1;
  }

  /// Drops one acquisition. Returns true when that was the last one and
  /// the lease should be handed back to the registry.
  pub fn release(&mut self) -> Result<bool, SyncError> {
    if self.write_count == 0 {
      return Err(SyncError::LeaseNotHeld);
    }
    self.write_count -= 1;
    if self.write_count == 0 {
      self.write_serial = None;
      return Ok(true);
    }
    Ok(false)
  }

  /// Forgets every serial and the lease.
  pub fn reset(&mut self) {
    *self = Self::default();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn consecutive_serials_are_accepted() {
    let mut state = SyncState::new();
    state.initialize(0);

    for serial in [1, 2, 3] {
      state.advance(serial).unwrap();
    }

    assert_eq!(state.latest(), Some(3));
  }

  #[test]
  fn gap_is_a_protocol_violation() {
    let mut state = SyncState::new();
    state.initialize(0);
    state.advance(1).unwrap();
    state.advance(2).unwrap();

    let err = state.advance(4).unwrap_err();

    assert!(matches!(
      err,
      SyncError::ProtocolViolation {
        expected: 3,
        received: 4
      }
    ));
    assert!(err.requires_resync());
    assert_eq!(state.latest(), Some(2));
  }

  #[test]
  fn replayed_serial_is_a_protocol_violation() {
    let mut state = SyncState::new();
    state.initialize(5);

    assert!(matches!(
      state.advance(5),
      Err(SyncError::ProtocolViolation {
        expected: 6,
        received: 5
      })
    ));
  }

  #[test]
  fn advance_before_initialize_fails() {
    let mut state = SyncState::new();
    assert!(matches!(state.advance(1), Err(SyncError::NotInitialized)));
  }

  #[test]
  fn lease_is_reference_counted() {
    let mut state = SyncState::new();
    state.initialize(3);

    assert!(state.needs_lease());
    state.lease_granted(5);
    state.lease_reentered();
    assert_eq!(state.write_count(), 2);
    assert!(!state.caught_up());

    assert!(!state.release().unwrap());
    assert!(state.holds_lease());
    assert!(state.release().unwrap());
    assert!(!state.holds_lease());
    assert!(state.caught_up());
    assert!(matches!(state.release(), Err(SyncError::LeaseNotHeld)));
  }

  #[test]
  fn caught_up_once_write_serial_is_reached() {
    let mut state = SyncState::new();
    state.initialize(3);
    state.lease_granted(5);

    state.advance(4).unwrap();
    assert!(!state.caught_up());
    state.advance(5).unwrap();
    assert!(state.caught_up());
  }

  #[test]
  fn reset_forgets_everything() {
    let mut state = SyncState::new();
    state.initialize(3);
    state.lease_granted(3);

    state.reset();

    assert_eq!(state, SyncState::default());
    assert!(!state.is_initialized());
  }
}
