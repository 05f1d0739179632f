//! Session settings and well-known locations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const APP_NAME: &str = "gridadmin";

pub const ENV_INIT_TIMEOUT: &str = "GRIDADMIN_INIT_TIMEOUT";
pub const ENV_KEEP_ALIVE: &str = "GRIDADMIN_KEEP_ALIVE";
pub const ENV_CLIENT: &str = "GRIDADMIN_CLIENT";
pub const ENV_REGISTRY: &str = "GRIDADMIN_REGISTRY";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid duration in {var}: '{value}': {source}")]
  InvalidDuration {
    var: &'static str,
    value: String,
    #[source]
    source: humantime::DurationError,
  },

  #[error("{var} must not be zero")]
  ZeroDuration { var: &'static str },

  #[error("cannot locate the data directory: {0} is not set")]
  NoHome(&'static str),
}

/// How a session talks to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
  /// How long to wait for the initial snapshot.
  pub init_timeout: Duration,
  pub keep_alive_period: Duration,
  /// Recorded in the write lease so that contention names the holder.
  pub client_label: String,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      init_timeout: Duration::from_secs(10),
      keep_alive_period: Duration::from_secs(5),
      client_label: APP_NAME.to_string(),
    }
  }
}

impl SessionConfig {
  /// Defaults overridden by `GRIDADMIN_INIT_TIMEOUT`, `GRIDADMIN_KEEP_ALIVE`
  /// and `GRIDADMIN_CLIENT`.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();
    if let Some(timeout) = env_duration(ENV_INIT_TIMEOUT)? {
      config.init_timeout = timeout;
    }
    if let Some(period) = env_duration(ENV_KEEP_ALIVE)? {
      config.keep_alive_period = period;
    }
    if let Ok(label) = std::env::var(ENV_CLIENT)
      && !label.is_empty()
    {
      config.client_label = label;
    }
    Ok(config)
  }
}

fn env_duration(var: &'static str) -> Result<Option<Duration>, ConfigError> {
  let Ok(value) = std::env::var(var) else {
    return Ok(None);
  };
  let duration = humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
    var,
    value: value.clone(),
    source,
  })?;
  if duration.is_zero() {
    return Err(ConfigError::ZeroDuration { var });
  }
  Ok(Some(duration))
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> Result<PathBuf, ConfigError> {
  let appdata = std::env::var("APPDATA").map_err(|_| ConfigError::NoHome("APPDATA"))?;
  Ok(PathBuf::from(appdata).join(APP_NAME))
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> Result<PathBuf, ConfigError> {
  let data_home = match std::env::var("XDG_DATA_HOME") {
    Ok(dir) => PathBuf::from(dir),
    Err(_) => {
      let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome("HOME"))?;
      PathBuf::from(home).join(".local").join("share")
    }
  };
  Ok(data_home.join(APP_NAME))
}

/// The local registry directory: `explicit` if given, else
/// `GRIDADMIN_REGISTRY`, else `registry` under the data directory.
pub fn registry_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
  if let Some(dir) = explicit {
    return Ok(dir);
  }
  if let Ok(dir) = std::env::var(ENV_REGISTRY)
    && !dir.is_empty()
  {
    return Ok(PathBuf::from(dir));
  }
  Ok(data_dir()?.join("registry"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn defaults_without_environment() {
    temp_env::with_vars(
      [
        (ENV_INIT_TIMEOUT, None::<&str>),
        (ENV_KEEP_ALIVE, None::<&str>),
        (ENV_CLIENT, None::<&str>),
      ],
      || {
        assert_eq!(SessionConfig::from_env().unwrap(), SessionConfig::default());
      },
    );
  }

  #[test]
  #[serial]
  fn environment_overrides_defaults() {
    temp_env::with_vars(
      [
        (ENV_INIT_TIMEOUT, Some("250ms")),
        (ENV_KEEP_ALIVE, Some("1m")),
        (ENV_CLIENT, Some("ops-console")),
      ],
      || {
        let config = SessionConfig::from_env().unwrap();
        assert_eq!(config.init_timeout, Duration::from_millis(250));
        assert_eq!(config.keep_alive_period, Duration::from_secs(60));
        assert_eq!(config.client_label, "ops-console");
      },
    );
  }

  #[test]
  #[serial]
  fn malformed_duration_is_rejected() {
    temp_env::with_var(ENV_KEEP_ALIVE, Some("soon"), || {
      let err = SessionConfig::from_env().unwrap_err();
      assert!(matches!(err, ConfigError::InvalidDuration { var: ENV_KEEP_ALIVE, .. }));
    });
    temp_env::with_var(ENV_INIT_TIMEOUT, Some("0s"), || {
      assert!(matches!(
        SessionConfig::from_env(),
        Err(ConfigError::ZeroDuration { var: ENV_INIT_TIMEOUT })
      ));
    });
  }

  #[test]
  #[serial]
  fn explicit_registry_dir_wins() {
    temp_env::with_var(ENV_REGISTRY, Some("/from/env"), || {
      assert_eq!(
        registry_dir(Some(PathBuf::from("/explicit"))).unwrap(),
        PathBuf::from("/explicit")
      );
      assert_eq!(registry_dir(None).unwrap(), PathBuf::from("/from/env"));
    });
  }

  #[test]
  #[serial]
  #[cfg(not(windows))]
  fn registry_dir_follows_xdg() {
    temp_env::with_vars(
      [
        (ENV_REGISTRY, None::<&str>),
        ("XDG_DATA_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(
          registry_dir(None).unwrap(),
          PathBuf::from("/home/user/.local/share/gridadmin/registry")
        );
      },
    );
    temp_env::with_vars(
      [(ENV_REGISTRY, None::<&str>), ("XDG_DATA_HOME", Some("/data"))],
      || {
        assert_eq!(registry_dir(None).unwrap(), PathBuf::from("/data/gridadmin/registry"));
      },
    );
  }
}
