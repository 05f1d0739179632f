//! A registry kept in a local directory.
//!
//! The directory holds `registry.json`, the serialized [`RegistrySnapshot`],
//! and the `.lease` file. Every change bumps the serial, rewrites the state
//! atomically and is pushed to the observers registered through the same
//! handle.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::descriptor::{ApplicationDescriptor, ApplicationUpdateDescriptor};

use super::lease::Lease;
use super::{Registry, RegistryError, RegistryEvent, RegistryObserver, RegistrySnapshot, SerialEvent};

pub const STATE_FILENAME: &str = "registry.json";

#[derive(Default)]
struct Inner {
  lease: Option<Lease>,
  observers: Vec<Arc<dyn RegistryObserver>>,
}

pub struct LocalRegistry {
  dir: PathBuf,
  client: String,
  inner: Mutex<Inner>,
}

impl std::fmt::Debug for LocalRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LocalRegistry")
      .field("dir", &self.dir)
      .field("client", &self.client)
      .finish_non_exhaustive()
  }
}

impl LocalRegistry {
  /// Opens the registry in `dir`, creating the directory if needed.
  /// `client` is recorded in the lease while this handle holds it.
  pub fn open(dir: impl AsRef<Path>, client: impl Into<String>) -> Result<Self, RegistryError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|source| RegistryError::Write {
      path: dir.to_path_buf(),
      source,
    })?;
    let dir = dunce::canonicalize(dir).map_err(|source| RegistryError::Read {
      path: dir.to_path_buf(),
      source,
    })?;
    debug!(dir = %dir.display(), "opened local registry");
    Ok(Self {
      dir,
      client: client.into(),
      inner: Mutex::new(Inner::default()),
    })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn state_path(&self) -> PathBuf {
    self.dir.join(STATE_FILENAME)
  }

  /// The current state as stored on disk.
  pub fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
    let path = self.state_path();
    let contents = match fs::read_to_string(&path) {
      Ok(contents) => contents,
      Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RegistrySnapshot::default()),
      Err(source) => return Err(RegistryError::Read { path, source }),
    };
    serde_json::from_str(&contents).map_err(|source| RegistryError::Parse { path, source })
  }

  fn store(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
    let path = self.state_path();
    let write_err = |source| RegistryError::Write {
      path: path.clone(),
      source,
    };
    let mut file = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
    serde_json::to_writer_pretty(&mut file, snapshot).map_err(RegistryError::Serialize)?;
    file.flush().map_err(write_err)?;
    file.persist(&path).map_err(|err| write_err(err.error))?;
    Ok(())
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Records a change made on the registry side, such as a node coming up,
  /// and pushes it to the observers. Returns the new serial.
  ///
  /// Application changes made here bypass the lease.
  pub fn report(&self, event: RegistryEvent) -> Result<u64, RegistryError> {
    let inner = self.lock();
    self.commit_event(&inner, event)
  }

  fn commit_event(&self, inner: &Inner, event: RegistryEvent) -> Result<u64, RegistryError> {
    let mut state = self.snapshot()?;
    apply(&mut state, &event)?;
    state.serial += 1;
    self.store(&state)?;

    info!(serial = state.serial, event = event.name(), "registry changed");
    let event = SerialEvent::new(state.serial, event);
    for observer in &inner.observers {
      observer.event(event.clone());
    }
    Ok(state.serial)
  }

  fn require_lease(&self, inner: &Inner) -> Result<(), RegistryError> {
    if inner.lease.is_none() {
      return Err(RegistryError::NoWriteAccess);
    }
    Ok(())
  }
}

/// Applies `event` to a stored state.
fn apply(state: &mut RegistrySnapshot, event: &RegistryEvent) -> Result<(), RegistryError> {
  match event {
    RegistryEvent::ApplicationAdded { descriptor } => {
      if state.applications.iter().any(|app| app.name == descriptor.name) {
        return Err(RegistryError::ApplicationExists(descriptor.name.clone()));
      }
      state.applications.push(descriptor.clone());
    }
    RegistryEvent::ApplicationRemoved { name } => {
      let before = state.applications.len();
      state.applications.retain(|app| &app.name != name);
      if state.applications.len() == before {
        return Err(RegistryError::UnknownApplication(name.clone()));
      }
    }
    RegistryEvent::ApplicationUpdated { update } => {
      let app = state
        .applications
        .iter_mut()
        .find(|app| app.name == update.name)
        .ok_or_else(|| RegistryError::UnknownApplication(update.name.clone()))?;
      let mut next = app.clone();
      next.apply_update(update)?;
      *app = next;
    }
    RegistryEvent::AdapterAdded { info } | RegistryEvent::AdapterUpdated { info } => {
      state.adapters.retain(|a| a.id != info.id);
      state.adapters.push(info.clone());
    }
    RegistryEvent::AdapterRemoved { id } => state.adapters.retain(|a| &a.id != id),
    RegistryEvent::ObjectAdded { info } | RegistryEvent::ObjectUpdated { info } => {
      state.objects.retain(|o| o.id != info.id);
      state.objects.push(info.clone());
    }
    RegistryEvent::ObjectRemoved { id } => state.objects.retain(|o| &o.id != id),
    RegistryEvent::NodeUp { .. }
    | RegistryEvent::NodeDown { .. }
    | RegistryEvent::ServerDynamicInfoUpdated { .. }
    | RegistryEvent::AdapterDynamicInfoUpdated { .. } => {}
  }
  Ok(())
}

impl Registry for LocalRegistry {
  fn register_observer(&self, observer: Arc<dyn RegistryObserver>) -> Result<(), RegistryError> {
    let mut inner = self.lock();
    let snapshot = self.snapshot()?;
    debug!(serial = snapshot.serial, "observer registered");
    observer.init(snapshot);
    inner.observers.push(observer);
    Ok(())
  }

  fn unregister_observer(&self, observer: &Arc<dyn RegistryObserver>) -> Result<(), RegistryError> {
    let mut inner = self.lock();
    let before = inner.observers.len();
    inner
      .observers
      .retain(|registered| !std::ptr::addr_eq(Arc::as_ptr(registered), Arc::as_ptr(observer)));
    if inner.observers.len() < before {
      debug!(remaining = inner.observers.len(), "observer unregistered");
    }
    Ok(())
  }

  fn start_update(&self) -> Result<u64, RegistryError> {
    let mut inner = self.lock();
    if inner.lease.is_none() {
      inner.lease = Some(Lease::acquire(&self.dir, &self.client)?);
    }
    let serial = self.snapshot()?.serial;
    debug!(serial, client = %self.client, "write lease taken");
    Ok(serial)
  }

  fn finish_update(&self) -> Result<(), RegistryError> {
    if self.lock().lease.take().is_some() {
      debug!(client = %self.client, "write lease returned");
    }
    Ok(())
  }

  fn keep_alive(&self) -> Result<(), RegistryError> {
    if !self.dir.is_dir() {
      return Err(RegistryError::SessionLost(format!("{} is gone", self.dir.display())));
    }
    Ok(())
  }

  fn add_application(&self, descriptor: &ApplicationDescriptor) -> Result<u64, RegistryError> {
    let inner = self.lock();
    self.require_lease(&inner)?;
    self.commit_event(
      &inner,
      RegistryEvent::ApplicationAdded {
        descriptor: descriptor.clone(),
      },
    )
  }

  fn update_application(&self, update: &ApplicationUpdateDescriptor) -> Result<u64, RegistryError> {
    let inner = self.lock();
    self.require_lease(&inner)?;
    self.commit_event(&inner, RegistryEvent::ApplicationUpdated { update: update.clone() })
  }

  fn remove_application(&self, name: &str) -> Result<u64, RegistryError> {
    let inner = self.lock();
    self.require_lease(&inner)?;
    self.commit_event(&inner, RegistryEvent::ApplicationRemoved { name: name.to_string() })
  }
}
