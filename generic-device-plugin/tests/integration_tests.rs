//! Integration tests for the generic device plugin.
//!
//! These tests build real directory trees in a temp dir and drive the plugin
//! through the device plugin protocol.

use device_plugin_api::{
    AllocateRequest, DevicePlugin, DeviceSpec, ListAndWatchResponse, PluginError,
};
use generic_device_plugin::discovery::{device_id, PathGroup, ResourceSpec};
use generic_device_plugin::metrics::PluginMetrics;
use generic_device_plugin::plugin::{GenericPlugin, WatchState, DEVICE_CHECK_INTERVAL};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn pattern(dir: &Path, glob: &str) -> String {
    format!("{}/{}", glob::Pattern::escape(dir.to_str().unwrap()), glob)
}

fn touch(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"").unwrap();
    }
}

fn create_plugin(groups: Vec<PathGroup>) -> Arc<GenericPlugin> {
    let spec = ResourceSpec {
        resource: "example.com/generic".to_string(),
        groups,
    };
    let metrics = PluginMetrics::new(&spec.resource).unwrap();
    Arc::new(GenericPlugin::new(spec, metrics))
}

fn start_watch(
    plugin: &Arc<GenericPlugin>,
) -> (
    mpsc::Receiver<ListAndWatchResponse>,
    JoinHandle<device_plugin_api::Result<()>>,
) {
    let (tx, rx) = mpsc::channel(8);
    let plugin = Arc::clone(plugin);
    let handle = tokio::spawn(async move { plugin.list_and_watch(tx).await });
    (rx, handle)
}

fn ids(response: &ListAndWatchResponse) -> HashSet<String> {
    response.devices.iter().map(|d| d.id.clone()).collect()
}

#[tokio::test]
async fn test_end_to_end_count_two() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1", "a2"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 2)]);
    plugin.refresh().await.unwrap();

    let devices = plugin.devices().await;
    assert_eq!(devices.len(), 4);

    let a1 = temp_dir.path().join("a1").to_str().unwrap().to_string();
    let a2 = temp_dir.path().join("a2").to_str().unwrap().to_string();
    let expected: HashSet<String> = [
        device_id(0, &[&a1]),
        device_id(1, &[&a1]),
        device_id(0, &[&a2]),
        device_id(1, &[&a2]),
    ]
    .into_iter()
    .collect();
    let actual: HashSet<String> = devices.iter().map(|d| d.id.clone()).collect();
    assert_eq!(actual, expected);

    for id in &actual {
        let paths = plugin.device_paths(id).await.unwrap();
        assert!(paths == vec![a1.clone()] || paths == vec![a2.clone()]);
    }
}

#[tokio::test]
async fn test_truncation_policy() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["dev0", "dev1", "dev2"]);
    touch(temp_dir.path(), &["sys0", "sys1", "sys2", "sys3", "sys4"]);

    let plugin = create_plugin(vec![PathGroup::new(
        [pattern(temp_dir.path(), "dev*"), pattern(temp_dir.path(), "sys*")],
        3,
    )]);
    plugin.refresh().await.unwrap();

    assert_eq!(plugin.devices().await.len(), 3 * 3);
    assert_eq!(plugin.metrics().devices(), 9);
}

#[tokio::test]
async fn test_determinism_across_plugins() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1", "a2", "b1", "b2"]);

    let groups = vec![
        PathGroup::new([pattern(temp_dir.path(), "a*"), pattern(temp_dir.path(), "b*")], 2),
    ];
    let first = create_plugin(groups.clone());
    let second = create_plugin(groups);

    first.refresh().await.unwrap();
    second.refresh().await.unwrap();

    assert_eq!(first.devices().await, second.devices().await);
    for device in first.devices().await {
        assert_eq!(
            first.device_paths(&device.id).await,
            second.device_paths(&device.id).await
        );
    }
}

#[tokio::test]
async fn test_membership_change_detection() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1", "a2"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 1)]);
    plugin.refresh().await.unwrap();
    assert!(plugin.refresh().await.unwrap());

    let a2 = temp_dir.path().join("a2").to_str().unwrap().to_string();
    let removed_id = device_id(0, &[&a2]);
    assert!(plugin.device_paths(&removed_id).await.is_some());

    std::fs::remove_file(temp_dir.path().join("a2")).unwrap();

    assert!(!plugin.refresh().await.unwrap());
    let devices = plugin.devices().await;
    assert_eq!(devices.len(), 1);
    assert!(devices.iter().all(|d| d.id != removed_id));
    assert!(plugin.device_paths(&removed_id).await.is_none());
}

#[tokio::test]
async fn test_failed_refresh_leaves_table_untouched() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1"]);

    // The first group resolves fine, the second is malformed
    let plugin = create_plugin(vec![
        PathGroup::new([pattern(temp_dir.path(), "a*")], 1),
        PathGroup::new(["/dev/[".to_string()], 1),
    ]);

    let err = plugin.refresh().await.unwrap_err();
    assert!(matches!(err, PluginError::Discovery { ref pattern, .. } if pattern == "/dev/["));
    assert!(plugin.devices().await.is_empty());
    assert_eq!(plugin.metrics().devices(), 0);
}

#[tokio::test]
async fn test_allocation_atomicity() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 1)]);
    plugin.refresh().await.unwrap();
    let valid = plugin.devices().await[0].id.clone();

    let err = plugin
        .allocate(AllocateRequest::new(vec![vec![valid.clone(), "missing".to_string()]]))
        .await
        .unwrap_err();
    assert_eq!(err, PluginError::DeviceNotFound("missing".to_string()));

    // A bad id in a later container request fails the whole call too
    let err = plugin
        .allocate(AllocateRequest::new(vec![
            vec![valid.clone()],
            vec!["missing".to_string()],
        ]))
        .await
        .unwrap_err();
    assert_eq!(err, PluginError::DeviceNotFound("missing".to_string()));
    assert_eq!(plugin.metrics().allocations(), 0);
}

#[tokio::test]
async fn test_binding_fidelity() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["dev0", "ctl0"]);

    let plugin = create_plugin(vec![PathGroup::new(
        [pattern(temp_dir.path(), "dev*"), pattern(temp_dir.path(), "ctl*")],
        1,
    )]);
    plugin.refresh().await.unwrap();

    let p1 = temp_dir.path().join("dev0").to_str().unwrap().to_string();
    let p2 = temp_dir.path().join("ctl0").to_str().unwrap().to_string();
    let id = device_id(0, &[&p1, &p2]);

    let response = plugin
        .allocate(AllocateRequest::new(vec![vec![id]]))
        .await
        .unwrap();

    assert_eq!(response.container_responses.len(), 1);
    let bindings = &response.container_responses[0].devices;
    assert_eq!(
        bindings,
        &vec![
            DeviceSpec {
                container_path: p1.clone(),
                host_path: p1,
                permissions: "mrw".to_string(),
            },
            DeviceSpec {
                container_path: p2.clone(),
                host_path: p2,
                permissions: "mrw".to_string(),
            },
        ]
    );
    assert_eq!(plugin.metrics().allocations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watch_pushes_initial_list() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1", "a2"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 2)]);
    let (mut rx, handle) = start_watch(&plugin);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.devices.len(), 4);
    assert!(first.devices.iter().all(|d| d.health.is_healthy()));

    drop(rx);
    handle.await.unwrap().unwrap();
    assert!(matches!(plugin.watch_state(), WatchState::Terminated(_)));
}

#[tokio::test(start_paused = true)]
async fn test_watch_skips_unchanged_ticks() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 1)]);
    let (mut rx, handle) = start_watch(&plugin);

    rx.recv().await.unwrap();

    // Several refresh ticks pass without a filesystem change
    let wait = DEVICE_CHECK_INTERVAL * 3 + Duration::from_secs(1);
    let next = tokio::time::timeout(wait, rx.recv()).await;
    assert!(next.is_err(), "unchanged inventory must not be pushed");

    drop(rx);
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_pushes_on_change() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1", "a2"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 1)]);
    let (mut rx, handle) = start_watch(&plugin);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.devices.len(), 2);

    std::fs::remove_file(temp_dir.path().join("a2")).unwrap();

    let second = rx.recv().await.unwrap();
    assert_eq!(second.devices.len(), 1);
    assert!(ids(&second).is_subset(&ids(&first)));

    touch(temp_dir.path(), &["a3"]);

    let third = rx.recv().await.unwrap();
    assert_eq!(third.devices.len(), 2);
    assert_eq!(ids(&third).difference(&ids(&first)).count(), 1);

    drop(rx);
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_fails_on_bad_pattern() {
    let plugin = create_plugin(vec![PathGroup::new(["/dev/[".to_string()], 1)]);
    let (mut rx, handle) = start_watch(&plugin);

    assert!(rx.recv().await.is_none());
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginError::Discovery { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_allocation_during_watch() {
    let temp_dir = TempDir::new().unwrap();
    touch(temp_dir.path(), &["a1"]);

    let plugin = create_plugin(vec![PathGroup::new([pattern(temp_dir.path(), "a*")], 1)]);
    let (mut rx, handle) = start_watch(&plugin);

    let listed = rx.recv().await.unwrap();
    let response = plugin
        .allocate(AllocateRequest::new(vec![vec![listed.devices[0].id.clone()]]))
        .await
        .unwrap();
    assert_eq!(response.container_responses[0].devices.len(), 1);

    drop(rx);
    handle.await.unwrap().unwrap();
}
