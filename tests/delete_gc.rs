//! Delete/GC safety against the in-memory runtime.

use devpush::adapter::{AdapterContext, ComponentAdapter};
use devpush::devfile::{ContainerUnit, Devfile};
use devpush::labels;
use devpush::runtime::fake::{FakeRuntime, Op};
use devpush::runtime::{ContainerInfo, MountInfo, MountKind, Runtime};
use std::collections::BTreeMap;
use std::sync::Arc;

fn minimal_devfile() -> Devfile {
    Devfile {
        schema_version: "2.0.0".to_string(),
        components: vec![ContainerUnit {
            name: "runtime".to_string(),
            image: "alpine".to_string(),
            mount_sources: true,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn adapter_for(runtime: Arc<FakeRuntime>, component: &str) -> ComponentAdapter {
    let dynamic: Arc<dyn Runtime> = runtime;
    ComponentAdapter::with_runtime(
        AdapterContext {
            component_name: component.to_string(),
            devfile: minimal_devfile(),
        },
        dynamic,
    )
}

fn selector(component: &str) -> BTreeMap<String, String> {
    labels::component_labels(component)
}

fn container(id: &str, component: &str, volumes: &[&str]) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        labels: labels::component_labels(component),
        mounts: volumes
            .iter()
            .map(|name| MountInfo {
                name: name.to_string(),
                target: format!("/mnt/{}", name),
                kind: MountKind::Volume,
            })
            .collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn delete_missing_component_succeeds_with_warning() {
    let runtime = Arc::new(FakeRuntime::new());
    let adapter = adapter_for(runtime.clone(), "ghost");

    adapter.delete(&selector("ghost")).await.unwrap();
    assert!(runtime.ops().is_empty());
}

#[tokio::test]
async fn shared_volume_survives_until_its_owner_is_deleted() {
    let runtime = Arc::new(FakeRuntime::new());
    // A volume owned by component B, but mounted into A's container too.
    runtime.add_volume("shared-vol", labels::storage_volume_labels("comp-b", "shared"));
    runtime.add_container(container("a-1", "comp-a", &["shared-vol"]));
    runtime.add_container(container("b-1", "comp-b", &["shared-vol"]));

    // Deleting A removes A's container but must keep the volume: A does not
    // own it, and B still mounts it.
    adapter_for(runtime.clone(), "comp-a")
        .delete(&selector("comp-a"))
        .await
        .unwrap();
    assert!(runtime.volumes().iter().any(|v| v.name == "shared-vol"));
    assert!(runtime.containers().iter().all(|c| c.id != "a-1"));

    // Deleting B afterward removes the volume: owned, mounted, unprotected.
    adapter_for(runtime.clone(), "comp-b")
        .delete(&selector("comp-b"))
        .await
        .unwrap();
    assert!(runtime.volumes().is_empty());
}

#[tokio::test]
async fn foreign_mounted_volume_is_protected_even_when_owned() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data-vol", labels::storage_volume_labels("comp-a", "data"));
    runtime.add_container(container("a-1", "comp-a", &["data-vol"]));
    // An unmanaged container (no component label match) also mounts it.
    runtime.add_container(container("rogue", "someone-else", &["data-vol"]));

    adapter_for(runtime.clone(), "comp-a")
        .delete(&selector("comp-a"))
        .await
        .unwrap();

    assert!(runtime.volumes().iter().any(|v| v.name == "data-vol"));
}

#[tokio::test]
async fn near_miss_labels_never_match_the_ownership_predicate() {
    let runtime = Arc::new(FakeRuntime::new());

    let mut near_type = labels::component_labels("comp-a");
    near_type.insert(labels::TYPE.to_string(), "source-but-not-really".to_string());
    runtime.add_volume("lookalike-1", near_type);

    let mut near_key = labels::component_labels("comp-a");
    near_key.insert("storage-name-but-not-really".to_string(), "x".to_string());
    runtime.add_volume("lookalike-2", near_key);

    runtime.add_container(container("a-1", "comp-a", &["lookalike-1", "lookalike-2"]));

    adapter_for(runtime.clone(), "comp-a")
        .delete(&selector("comp-a"))
        .await
        .unwrap();

    // Containers go, lookalike volumes stay.
    assert!(runtime.containers().is_empty());
    assert_eq!(runtime.volumes().len(), 2);
    assert!(runtime.ops_where(|op| matches!(op, Op::RemoveVolume(_))).is_empty());
}

#[tokio::test]
async fn unmounted_owned_volumes_are_kept() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("orphan-vol", labels::storage_volume_labels("comp-a", "orphan"));
    runtime.add_container(container("a-1", "comp-a", &[]));

    adapter_for(runtime.clone(), "comp-a")
        .delete(&selector("comp-a"))
        .await
        .unwrap();

    // Owned but never mounted into a removed container: not deleted.
    assert!(runtime.volumes().iter().any(|v| v.name == "orphan-vol"));
}

#[tokio::test]
async fn system_volumes_are_collected_with_the_component() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("src-vol", labels::source_volume_labels("comp-a"));
    runtime.add_volume("boot-vol", labels::bootstrap_volume_labels("comp-a"));
    runtime.add_container(container("a-1", "comp-a", &["src-vol", "boot-vol"]));

    adapter_for(runtime.clone(), "comp-a")
        .delete(&selector("comp-a"))
        .await
        .unwrap();

    assert!(runtime.volumes().is_empty());
}
