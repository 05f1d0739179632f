//! Running a coordinator against a live registry.
//!
//! The coordinator lives on one blocking owner thread. Observer callbacks,
//! keep-alive results and caller closures all reach it as messages on a
//! single channel, so the mirror is only ever touched from that thread.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::registry::{Registry, RegistryError, RegistryObserver, RegistrySnapshot, SerialEvent};

use super::{Coordinator, SyncError};

type Job = Box<dyn FnOnce(&mut Coordinator) + Send>;

enum Message {
  Init { generation: u64, snapshot: RegistrySnapshot },
  Event { generation: u64, event: SerialEvent },
  SessionLost(String),
  Resync,
  Run(Job),
  Shutdown,
}

#[derive(Debug, Error)]
pub enum SessionError {
  #[error("no snapshot from the registry within {0:?}")]
  InitTimeout(Duration),

  #[error("session is closed")]
  Closed,

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Sync(#[from] SyncError),

  #[error("session task failed: {0}")]
  Task(#[from] JoinError),
}

/// Forwards registry callbacks to the owner thread, tagged with the
/// registration they belong to.
struct ChannelObserver {
  generation: u64,
  tx: mpsc::UnboundedSender<Message>,
}

impl RegistryObserver for ChannelObserver {
  fn init(&self, snapshot: RegistrySnapshot) {
    let _ = self.tx.send(Message::Init {
      generation: self.generation,
      snapshot,
    });
  }

  fn event(&self, event: SerialEvent) {
    let _ = self.tx.send(Message::Event {
      generation: self.generation,
      event,
    });
  }
}

struct Owner {
  coordinator: Coordinator,
  registry: Arc<dyn Registry>,
  /// The registration whose messages are current.
  observer: Arc<dyn RegistryObserver>,
  rx: mpsc::UnboundedReceiver<Message>,
  tx: mpsc::UnboundedSender<Message>,
  generation: u64,
  /// Events that arrived before the snapshot of their registration.
  early: Vec<SerialEvent>,
  ready: Option<oneshot::Sender<Result<(), SyncError>>>,
}

impl Owner {
  fn run(mut self) {
    while let Some(message) = self.rx.blocking_recv() {
      match message {
        Message::Init { generation, snapshot } if generation == self.generation => self.init(snapshot),
        Message::Event { generation, event } if generation == self.generation => self.event(event),
        Message::Init { generation, .. } | Message::Event { generation, .. } => {
          debug!(generation, current = self.generation, "ignoring message from a stale registration");
        }
        Message::SessionLost(reason) => {
          self.coordinator.session_lost(&reason);
        }
        Message::Resync => self.resync(),
        Message::Run(job) => job(&mut self.coordinator),
        Message::Shutdown => break,
      }
    }
    self.coordinator.invalidate();
    if let Err(err) = self.registry.unregister_observer(&self.observer) {
      warn!(error = %err, "failed to unregister from the registry");
    }
    debug!("session owner stopped");
  }

  fn init(&mut self, snapshot: RegistrySnapshot) {
    let result = self.coordinator.initialize(&snapshot);
    if let Err(err) = &result {
      error!(error = %err, "failed to load registry snapshot");
    }
    let early = std::mem::take(&mut self.early);
    if result.is_ok() {
      for event in early.into_iter().filter(|event| event.serial > snapshot.serial) {
        if !self.apply(event) {
          break;
        }
      }
    }
    if let Some(ready) = self.ready.take() {
      let _ = ready.send(result);
    }
  }

  fn event(&mut self, event: SerialEvent) {
    if !self.coordinator.is_synchronized() {
      self.early.push(event);
      return;
    }
    self.apply(event);
  }

  /// Returns false if the event forced a resynchronization.
  fn apply(&mut self, event: SerialEvent) -> bool {
    match self.coordinator.apply_event(&event) {
      Ok(()) => true,
      Err(err) if err.requires_resync() => {
        warn!(error = %err, "resynchronizing with the registry");
        self.resync();
        false
      }
      Err(err) => {
        warn!(serial = event.serial, error = %err, "event not applied");
        true
      }
    }
  }

  /// Drops the mirror and registers a fresh observer; its snapshot seeds
  /// the mirror again.
  fn resync(&mut self) {
    self.coordinator.invalidate();
    self.early.clear();
    if let Err(err) = self.registry.unregister_observer(&self.observer) {
      warn!(error = %err, "failed to unregister the previous observer");
    }
    self.generation += 1;
    self.observer = Arc::new(ChannelObserver {
      generation: self.generation,
      tx: self.tx.clone(),
    });
    match self.registry.register_observer(self.observer.clone()) {
      Ok(()) => info!(generation = self.generation, "requested a new registry snapshot"),
      Err(err) => error!(error = %err, "failed to register with the registry"),
    }
  }
}

/// A live connection between a registry and a coordinator.
#[derive(Debug)]
pub struct Session {
  tx: mpsc::UnboundedSender<Message>,
  owner: Option<JoinHandle<()>>,
  keep_alive: JoinHandle<()>,
}

impl Session {
  /// Registers with `registry` and waits for its snapshot.
  ///
  /// # Errors
  ///
  /// [`SessionError::InitTimeout`] if no snapshot arrives within
  /// `config.init_timeout`.
  pub async fn connect(registry: Arc<dyn Registry>, config: &SessionConfig) -> Result<Self, SessionError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let observer: Arc<dyn RegistryObserver> = Arc::new(ChannelObserver {
      generation: 0,
      tx: tx.clone(),
    });

    let owner = Owner {
      coordinator: Coordinator::new(registry.clone()),
      registry: registry.clone(),
      observer: observer.clone(),
      rx,
      tx: tx.clone(),
      generation: 0,
      early: Vec::new(),
      ready: Some(ready_tx),
    };
    let owner = tokio::task::spawn_blocking(move || owner.run());
    let keep_alive = tokio::spawn(keep_alive(registry.clone(), tx.clone(), config.keep_alive_period));
    let session = Self {
      tx: tx.clone(),
      owner: Some(owner),
      keep_alive,
    };

    tokio::task::spawn_blocking(move || registry.register_observer(observer)).await??;

    match timeout(config.init_timeout, ready_rx).await {
      Ok(Ok(Ok(()))) => {
        info!(client = %config.client_label, "registry session established");
        Ok(session)
      }
      Ok(Ok(Err(err))) => Err(err.into()),
      Ok(Err(_)) => Err(SessionError::Closed),
      Err(_) => Err(SessionError::InitTimeout(config.init_timeout)),
    }
  }

  /// Runs `f` on the owner thread and returns its result.
  pub async fn run<R, F>(&self, f: F) -> Result<R, SessionError>
  where
    R: Send + 'static,
    F: FnOnce(&mut Coordinator) -> R + Send + 'static,
  {
    let (result_tx, result_rx) = oneshot::channel();
    let job: Job = Box::new(move |coordinator: &mut Coordinator| {
      let _ = result_tx.send(f(coordinator));
    });
    self.tx.send(Message::Run(job)).map_err(|_| SessionError::Closed)?;
    result_rx.await.map_err(|_| SessionError::Closed)
  }

  /// Waits until every message queued so far has been handled.
  pub async fn flush(&self) -> Result<(), SessionError> {
    self.run(|_| ()).await
  }

  /// Stops the owner thread and the keep-alive task.
  pub async fn shutdown(mut self) -> Result<(), SessionError> {
    self.keep_alive.abort();
    let _ = self.tx.send(Message::Shutdown);
    if let Some(owner) = self.owner.take() {
      owner.await?;
    }
    Ok(())
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    self.keep_alive.abort();
    let _ = self.tx.send(Message::Shutdown);
  }
}

/// Pings the registry and reports transitions between a live and a lost
/// session to the owner thread.
async fn keep_alive(registry: Arc<dyn Registry>, tx: mpsc::UnboundedSender<Message>, period: Duration) {
  let mut ticker = interval(period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  ticker.tick().await;

  let mut alive = true;
  loop {
    ticker.tick().await;
    let registry = registry.clone();
    let message = match tokio::task::spawn_blocking(move || registry.keep_alive()).await {
      Ok(Err(err)) if alive => {
        error!(error = %err, "keep-alive failed");
        alive = false;
        Message::SessionLost(err.to_string())
      }
      Ok(Ok(())) if !alive => {
        info!("registry reachable again");
        alive = true;
        Message::Resync
      }
      Ok(_) => continue,
      Err(err) => {
        error!(error = %err, "keep-alive task failed");
        break;
      }
    };
    if tx.send(message).is_err() {
      break;
    }
  }
}
