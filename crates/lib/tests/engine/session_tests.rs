use gridadmin_lib::descriptor::{NodeDynamicInfo, NodeInfo, PropertyDescriptor};
use gridadmin_lib::mirror::{Edit, EditError};
use gridadmin_lib::registry::RegistryEvent;
use gridadmin_lib::sync::{LeaseStatus, SyncError};

use super::common::{TestRegistry, demo};

fn traced(app: &gridadmin_lib::descriptor::ApplicationDescriptor) -> Edit {
  let mut template = app.server_templates["T"].clone();
  template.descriptor.properties.push(PropertyDescriptor::new("Ice.Trace", "1"));
  Edit::UpdateServerTemplate {
    id: "T".to_string(),
    template,
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn new_session_starts_from_the_stored_state() {
  let registry = TestRegistry::new();
  registry.seed(demo()).await;

  let handle = registry.open("console");
  let session = registry.connect(&handle, "console").await;

  let (latest, app, resolved) = session
    .run(|c| {
      let resolved = c.mirror().server("demo", "N1", "S1").map(|s| s.resolved.exe.clone());
      (c.state().latest(), c.mirror().application("demo").cloned(), resolved)
    })
    .await
    .unwrap();
  assert_eq!(latest, Some(1));
  assert_eq!(app, Some(demo()));
  assert_eq!(resolved.as_deref(), Some("/usr/bin/S1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn saved_edit_reaches_every_session_on_the_handle() {
  let registry = TestRegistry::new();
  registry.seed(demo()).await;
  let handle = registry.open("console");
  let editor = registry.connect(&handle, "editor").await;
  let viewer = registry.connect(&handle, "viewer").await;

  let serial = editor
    .run(|c| {
      let edit = traced(c.mirror().application("demo").unwrap());
      c.edit("demo", edit)?;
      assert!(c.mirror().is_modified("demo"));
      c.save("demo")
    })
    .await
    .unwrap()
    .unwrap();
  assert_eq!(serial, Some(2));
  editor.flush().await.unwrap();
  viewer.flush().await.unwrap();

  let seen = |c: &mut gridadmin_lib::sync::Coordinator| {
    (
      c.state().latest(),
      c.mirror().is_modified("demo"),
      c.mirror()
        .server("demo", "N1", "S1")
        .and_then(|s| s.resolved.property("Ice.Trace").map(str::to_string)),
    )
  };
  assert_eq!(editor.run(seen).await.unwrap(), (Some(2), false, Some("1".to_string())));
  assert_eq!(viewer.run(seen).await.unwrap(), (Some(2), false, Some("1".to_string())));

  let stored = handle.snapshot().unwrap();
  assert_eq!(stored.serial, 2);
  assert_eq!(
    stored.applications[0].server_templates["T"].descriptor.properties[0].value,
    "1"
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_edit_changes_nothing() {
  let registry = TestRegistry::new();
  registry.seed(demo()).await;
  let handle = registry.open("console");
  let session = registry.connect(&handle, "console").await;

  let (result, unchanged) = session
    .run(|c| {
      let before = c.mirror().dump();
      let result = c.edit("demo", Edit::RemoveServerTemplate("missing".to_string()));
      (result, c.mirror().dump() == before && !c.mirror().is_modified("demo"))
    })
    .await
    .unwrap();

  assert!(matches!(result, Err(SyncError::Edit(EditError::NotFound(_)))));
  assert!(unchanged);
  assert_eq!(session.run(|c| c.state().write_count()).await.unwrap(), 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn second_client_is_refused_while_the_lease_is_held() {
  let registry = TestRegistry::new();
  registry.seed(demo()).await;
  let first_handle = registry.open("first");
  let second_handle = registry.open("second");
  let first = registry.connect(&first_handle, "first").await;
  let second = registry.connect(&second_handle, "second").await;

  let status = first.run(|c| c.acquire_write_access()).await.unwrap().unwrap();
  assert_eq!(status, LeaseStatus::Executed);

  let refused = second
    .run(|c| {
      let edit = traced(c.mirror().application("demo").unwrap());
      let result = c.edit("demo", edit);
      (result, c.mirror().is_modified("demo"), c.state().holds_lease())
    })
    .await
    .unwrap();
  assert!(matches!(refused.0, Err(SyncError::AccessDenied(_))));
  assert!(!refused.1);
  assert!(!refused.2);

  first.run(|c| c.release_write_access()).await.unwrap().unwrap();
  let accepted = second
    .run(|c| {
      let edit = traced(c.mirror().application("demo").unwrap());
      c.edit("demo", edit).map(|outcome| outcome.applied.len())
    })
    .await
    .unwrap();
  assert_eq!(accepted.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn reported_runtime_events_are_applied() {
  let registry = TestRegistry::new();
  let handle = registry.open("console");
  let session = registry.connect(&handle, "console").await;

  handle
    .report(RegistryEvent::NodeUp {
      info: NodeDynamicInfo {
        info: NodeInfo {
          name: "N1".to_string(),
          ..Default::default()
        },
        ..Default::default()
      },
    })
    .unwrap();
  session.flush().await.unwrap();

  let (latest, up) = session
    .run(|c| (c.state().latest(), c.mirror().runtime().is_up("N1")))
    .await
    .unwrap();
  assert_eq!(latest, Some(1));
  assert!(up);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_application_leaves_the_mirror() {
  let registry = TestRegistry::new();
  registry.seed(demo()).await;
  let handle = registry.open("console");
  let session = registry.connect(&handle, "console").await;

  let serial = session.run(|c| c.remove_application("demo")).await.unwrap().unwrap();
  session.flush().await.unwrap();

  assert_eq!(serial, 2);
  let names = session
    .run(|c| c.mirror().application_names().map(str::to_string).collect::<Vec<_>>())
    .await
    .unwrap();
  assert!(names.is_empty());
  assert!(handle.snapshot().unwrap().applications.is_empty());
}
