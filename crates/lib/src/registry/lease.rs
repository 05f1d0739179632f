//! The exclusive write lease of a local registry.
//!
//! The lease is an OS advisory lock on `<dir>/.lease` (flock on Unix,
//! LockFileEx on Windows). The holder writes its metadata into the file so
//! that a client refused the lease can say who has it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::RegistryError;

pub const LEASE_FILENAME: &str = ".lease";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub client: String,
  pub registry: PathBuf,
}

/// A held write lease; dropping it releases the lock.
#[derive(Debug)]
pub struct Lease {
  file: File,
  path: PathBuf,
}

impl Lease {
  /// Takes the lease of the registry in `dir` without waiting.
  ///
  /// # Errors
  ///
  /// [`RegistryError::AccessDenied`] naming the holder when another client
  /// has the lease.
  pub fn acquire(dir: &Path, client: &str) -> Result<Self, RegistryError> {
    let path = dir.join(LEASE_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(|source| RegistryError::Write {
        path: path.clone(),
        source,
      })?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(contention_error(&path));
      }
      return Err(RegistryError::LockFailed(err));
    }

    let lease = Lease { file, path };
    lease.write_metadata(client, dir)?;
    Ok(lease)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Reads the metadata through the held handle.
  pub fn read_metadata(&self) -> io::Result<LeaseMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn write_metadata(&self, client: &str, dir: &Path) -> Result<(), RegistryError> {
    let metadata = LeaseMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      client: client.to_string(),
      registry: dir.to_path_buf(),
    };
    let write_err = |source| RegistryError::Write {
      path: self.path.clone(),
      source,
    };

    self.file.set_len(0).map_err(write_err)?;
    let mut writer = io::BufWriter::new(&self.file);
    writer.seek(SeekFrom::Start(0)).map_err(write_err)?;
    serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| write_err(io::Error::other(e)))?;
    writer.flush().map_err(write_err)?;
    Ok(())
  }
}

fn contention_error(path: &Path) -> RegistryError {
  if let Ok(mut file) = File::open(path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LeaseMetadata>(&contents)
    {
      return RegistryError::AccessDenied {
        holder: metadata.client,
        pid: metadata.pid,
        lease_path: path.to_path_buf(),
      };
    }
  }
  RegistryError::AccessDeniedUnknown {
    lease_path: path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is valid zero-initialized and the handle is open.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
