//! Applying registry pushes to the mirror.
//!
//! A pushed application update never silently loses the registry's view:
//!
//! - without local changes the application is rebuilt from the updated
//!   baseline
//! - with local changes the update is applied to both the baseline and the
//!   working copy and the result is rebuilt, keeping editable states; if
//!   that fails the local changes are dropped with a warning
//! - a pushed removal always wins

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::descriptor::{ApplicationDescriptor, ApplicationUpdateDescriptor};
use crate::registry::{RegistryEvent, RegistrySnapshot};
use crate::tree::{Editable, Transaction};

use super::build::{self, BuildError};
use super::{ApplicationState, EditError, Mirror};

impl Mirror {
  /// Replaces the mirror's contents with a registry snapshot.
  pub(crate) fn load(&mut self, snapshot: &RegistrySnapshot) -> Result<(), EditError> {
    self.clear();
    for descriptor in &snapshot.applications {
      self.application_added(descriptor)?;
    }
    self.adapters = snapshot.adapters.iter().map(|a| (a.id.clone(), a.clone())).collect();
    self.objects = snapshot.objects.iter().map(|o| (o.id.clone(), o.clone())).collect();
    info!(
      serial = snapshot.serial,
      applications = self.applications.len(),
      adapters = self.adapters.len(),
      objects = self.objects.len(),
      "mirror loaded"
    );
    Ok(())
  }

  pub(crate) fn apply_event(&mut self, event: &RegistryEvent) -> Result<(), EditError> {
    match event {
      RegistryEvent::ApplicationAdded { descriptor } => self.application_added(descriptor)?,
      RegistryEvent::ApplicationRemoved { name } => self.application_removed(name),
      RegistryEvent::ApplicationUpdated { update } => self.application_updated(update)?,
      RegistryEvent::AdapterAdded { info } | RegistryEvent::AdapterUpdated { info } => {
        self.adapters.insert(info.id.clone(), info.clone());
      }
      RegistryEvent::AdapterRemoved { id } => {
        self.adapters.remove(id);
      }
      RegistryEvent::ObjectAdded { info } | RegistryEvent::ObjectUpdated { info } => {
        self.objects.insert(info.id.clone(), info.clone());
      }
      RegistryEvent::ObjectRemoved { id } => {
        self.objects.remove(id);
      }
      RegistryEvent::NodeUp { info } => self.runtime.node_up(info.clone()),
      RegistryEvent::NodeDown { name } => {
        self.runtime.node_down(name);
      }
      RegistryEvent::ServerDynamicInfoUpdated { node, info } => {
        if !self.runtime.update_server(node, info.clone()) {
          debug!(node = %node, server = %info.id, "ignoring server update for node that is down");
        }
      }
      RegistryEvent::AdapterDynamicInfoUpdated { node, info } => {
        if !self.runtime.update_adapter(node, info.clone()) {
          debug!(node = %node, adapter = %info.id, "ignoring adapter update for node that is down");
        }
      }
    }
    Ok(())
  }

  fn application_added(&mut self, descriptor: &ApplicationDescriptor) -> Result<(), EditError> {
    if self.applications.contains_key(&descriptor.name) {
      warn!(application = %descriptor.name, "application added twice, replacing it");
      self.application_removed(&descriptor.name);
    }

    let root = self.tree.root();
    let handle = build::application(&mut self.tree, descriptor).map_err(|source| EditError::UpdateFailed {
      path: descriptor.name.clone(),
      source,
    })?;
    if let Err(err) = self.tree.attach(root, handle) {
      self.tree.release(handle);
      return Err(err.into());
    }

    self.applications.insert(
      descriptor.name.clone(),
      ApplicationState {
        handle,
        working: descriptor.clone(),
        committed: descriptor.clone(),
        pending: BTreeMap::new(),
      },
    );
    info!(application = %descriptor.name, nodes = descriptor.nodes.len(), "application added");
    Ok(())
  }

  fn application_removed(&mut self, name: &str) {
    let modified = self.is_modified(name);
    let Some(state) = self.applications.remove(name) else {
      warn!(application = name, "ignoring removal of unknown application");
      return;
    };
    if modified || !state.pending.is_empty() {
      warn!(application = name, "application removed by the registry, dropping local changes");
    }
    self.tree.release(state.handle);
    info!(application = name, "application removed");
  }

  fn application_updated(&mut self, update: &ApplicationUpdateDescriptor) -> Result<(), EditError> {
    let name = update.name.as_str();
    let state = self
      .applications
      .get(name)
      .ok_or_else(|| EditError::UnknownApplication(name.to_string()))?;
    let mut committed = state.committed.clone();
    let mut working = state.working.clone();
    committed.apply_update(update).map_err(|err| EditError::UpdateFailed {
      path: name.to_string(),
      source: BuildError::Resolve(err),
    })?;

    if !self.is_modified(name) {
      self.rebuild_application(&committed, &BTreeMap::new())?;
      self.set_descriptors(name, committed.clone(), committed);
      self.revive_pending(name);
      debug!(application = name, "application updated");
      return Ok(());
    }

    let states = self.capture_states(name);
    let merged = working
      .apply_update(update)
      .map_err(|err| EditError::UpdateFailed {
        path: name.to_string(),
        source: BuildError::Resolve(err),
      })
      .and_then(|()| self.rebuild_application(&working, &states));

    match merged {
      Ok(()) => {
        self.set_descriptors(name, committed, working);
        info!(application = name, "application updated, local changes kept");
      }
      Err(err) => {
        warn!(application = name, error = %err, "update conflicts with local changes, discarding them");
        self.rebuild_application(&committed, &BTreeMap::new())?;
        self.set_descriptors(name, committed.clone(), committed);
      }
    }
    self.revive_pending(name);
    Ok(())
  }

  fn set_descriptors(&mut self, name: &str, committed: ApplicationDescriptor, working: ApplicationDescriptor) {
    if let Some(state) = self.applications.get_mut(name) {
      state.committed = committed;
      state.working = working;
    }
  }

  /// Replaces an application's subtree with one built from `descriptor`,
  /// then restores the given editable states by path. On failure the old
  /// subtree stays in place.
  pub(super) fn rebuild_application(
    &mut self,
    descriptor: &ApplicationDescriptor,
    states: &BTreeMap<Vec<String>, Editable>,
  ) -> Result<(), EditError> {
    let old = self
      .application_node(&descriptor.name)
      .ok_or_else(|| EditError::UnknownApplication(descriptor.name.clone()))?;

    let mut tx = Transaction::begin(&mut self.tree);
    let handle = match tx.replace(old, |tree| build::application(tree, descriptor)) {
      Ok(handle) => handle,
      Err(source) => {
        tx.rollback();
        return Err(EditError::UpdateFailed {
          path: descriptor.name.clone(),
          source,
        });
      }
    };
    tx.commit();

    self.restore_states(handle, states);
    if let Some(state) = self.applications.get_mut(&descriptor.name) {
      state.handle = handle;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use crate::descriptor::{
    AdapterInfo, NodeUpdateDescriptor, ObjectInfo, ServerDescriptor, ServerDynamicInfo, ServerInstanceDescriptor,
    ServerState,
  };
  use crate::mirror::fixtures::*;
  use crate::mirror::{Edit, NODES, ServerEntry};
  use crate::sync::WriteAccess;
  use tracing_test::traced_test;

  use super::*;

  fn updated(update: ApplicationUpdateDescriptor) -> RegistryEvent {
    RegistryEvent::ApplicationUpdated { update }
  }

  fn traced_template(mirror: &Mirror) -> ApplicationUpdateDescriptor {
    let template = mirror.application("demo").unwrap().server_templates["T"].clone();
    let mut update = ApplicationUpdateDescriptor::new("demo");
    update
      .server_templates
      .insert("T".to_string(), with_property(template, "Ice.Trace", "2"));
    update
  }

  #[test]
  fn update_without_local_changes_rebuilds() {
    let mut mirror = loaded(two_instances());

    mirror.apply_event(&updated(traced_template(&mirror))).unwrap();

    assert_eq!(server(&mirror, "N1", "S1").resolved.property("Ice.Trace"), Some("2"));
    assert_eq!(server(&mirror, "N2", "S2").resolved.property("Ice.Trace"), Some("2"));
    assert!(!mirror.is_modified("demo"));
    assert_eq!(mirror.application("demo"), mirror.committed("demo"));
  }

  #[test]
  fn update_merges_with_local_changes() {
    let mut mirror = loaded(two_instances());
    mirror
      .apply_edit(
        &WriteAccess::grant(),
        "demo",
        Edit::RemoveServer {
          node: "N1".to_string(),
          id: "db".to_string(),
        },
      )
      .unwrap();
    let mut update = traced_template(&mirror);
    update.variables.insert("env".to_string(), "prod".to_string());

    mirror.apply_event(&updated(update)).unwrap();

    let (working, committed) = (mirror.application("demo").unwrap(), mirror.committed("demo").unwrap());
    assert_eq!(working.variables["env"], "prod");
    assert_eq!(committed.variables["env"], "prod");
    assert!(working.nodes["N1"].servers.is_empty());
    assert_eq!(committed.nodes["N1"].servers.len(), 1);
    assert!(mirror.server("demo", "N1", "db").is_none());
    assert_eq!(server(&mirror, "N1", "S1").resolved.property("Ice.Trace"), Some("2"));
    assert_eq!(removed_ids(&mirror, &[NODES, "N1"]), vec!["db".to_string()]);
    assert!(mirror.is_modified("demo"));
  }

  #[test]
  #[traced_test]
  fn conflicting_update_discards_local_changes() {
    let mut mirror = loaded(two_instances());
    mirror
      .apply_edit(
        &WriteAccess::grant(),
        "demo",
        Edit::AddServer {
          node: "N2".to_string(),
          server: ServerEntry::Instance(ServerInstanceDescriptor::new("T", values(&[("name", "S3")]))),
        },
      )
      .unwrap();
    assert!(mirror.server("demo", "N2", "S3").is_some());

    let mut update = ApplicationUpdateDescriptor::new("demo");
    update.remove_server_templates.push("T".to_string());
    for (node, server) in [("N1", "S1"), ("N2", "S2")] {
      update.nodes.push(NodeUpdateDescriptor {
        name: node.to_string(),
        remove_servers: vec![server.to_string()],
        ..Default::default()
      });
    }
    mirror.apply_event(&updated(update)).unwrap();

    assert!(mirror.server("demo", "N2", "S3").is_none());
    assert!(mirror.server("demo", "N1", "S1").is_none());
    assert!(mirror.server("demo", "N1", "db").is_some());
    assert!(!mirror.is_modified("demo"));
    assert_eq!(mirror.application("demo"), mirror.committed("demo"));
    assert!(logs_contain("update conflicts with local changes"));
  }

  #[test]
  fn removal_wins_over_local_changes() {
    let mut mirror = loaded(two_instances());
    mirror
      .apply_edit(&WriteAccess::grant(), "demo", Edit::RemoveNode("N2".to_string()))
      .unwrap();

    mirror
      .apply_event(&RegistryEvent::ApplicationRemoved {
        name: "demo".to_string(),
      })
      .unwrap();

    assert!(mirror.application("demo").is_none());
    assert_eq!(mirror.application_names().count(), 0);
    assert_eq!(mirror.tree().len(), 1);
  }

  #[test]
  fn added_application_replaces_one_with_the_same_name() {
    let mut mirror = loaded(two_instances());
    let mut replacement = ApplicationDescriptor::new("demo");
    replacement.nodes.insert("N7".to_string(), Default::default());

    mirror
      .apply_event(&RegistryEvent::ApplicationAdded {
        descriptor: replacement.clone(),
      })
      .unwrap();

    assert_eq!(mirror.application("demo"), Some(&replacement));
    assert!(mirror.find("demo", &[NODES, "N7"]).is_some());
    assert!(mirror.find("demo", &[NODES, "N1"]).is_none());
  }

  #[test]
  fn update_for_unknown_application_fails() {
    let mut mirror = loaded(two_instances());

    let err = mirror
      .apply_event(&updated(ApplicationUpdateDescriptor::new("other")))
      .unwrap_err();

    assert!(matches!(err, EditError::UnknownApplication(name) if name == "other"));
  }

  #[test]
  fn unbuildable_snapshot_is_rejected() {
    let mut app = two_instances();
    app.nodes.get_mut("N1").unwrap().servers.push(ServerDescriptor {
      id: "S1".to_string(),
      ..Default::default()
    });
    let mut mirror = Mirror::new();

    let err = mirror
      .load(&RegistrySnapshot {
        serial: 3,
        applications: vec![app],
        ..Default::default()
      })
      .unwrap_err();

    assert!(matches!(err, EditError::UpdateFailed { .. }));
  }

  #[test]
  fn snapshot_tables_are_kept_up_to_date() {
    let mut mirror = Mirror::new();
    mirror
      .load(&RegistrySnapshot {
        serial: 1,
        applications: Vec::new(),
        adapters: vec![AdapterInfo {
          id: "Locator".to_string(),
          proxy: "locator:tcp -p 4061".to_string(),
          ..Default::default()
        }],
        objects: vec![ObjectInfo {
          id: "IceGrid/Query".to_string(),
          ..Default::default()
        }],
      })
      .unwrap();
    assert_eq!(mirror.adapters().len(), 1);

    mirror
      .apply_event(&RegistryEvent::AdapterRemoved {
        id: "Locator".to_string(),
      })
      .unwrap();
    mirror
      .apply_event(&RegistryEvent::ObjectUpdated {
        info: ObjectInfo {
          id: "IceGrid/Query".to_string(),
          proxy: "query".to_string(),
          ..Default::default()
        },
      })
      .unwrap();

    assert!(mirror.adapters().is_empty());
    assert_eq!(mirror.objects()["IceGrid/Query"].proxy, "query");
  }

  #[test]
  fn runtime_events_for_down_nodes_are_dropped() {
    let mut mirror = loaded(two_instances());
    let active = ServerDynamicInfo {
      id: "S1".to_string(),
      state: ServerState::Active,
      ..Default::default()
    };

    mirror
      .apply_event(&RegistryEvent::ServerDynamicInfoUpdated {
        node: "N1".to_string(),
        info: active,
      })
      .unwrap();

    assert!(!mirror.runtime().is_up("N1"));
    assert_eq!(mirror.runtime().server_state("N1", "S1"), ServerState::Inactive);
  }
}
