//! Volume/storage reconciliation.
//!
//! Declared volumes resolve to deterministic platform names so repeated
//! pushes reuse the same volume instead of accumulating duplicates. The two
//! system volumes (source-sync and bootstrap) are singletons per component,
//! looked up by label and created with collision-resistant names; finding
//! more than one of either is fatal.

use crate::adapter::{AdapterError, Result};
use crate::devfile::DevfileVolume;
use crate::runtime::{ContainerSpec, MountSpec, Runtime, VolumeInfo};
use crate::{env, labels};
use std::collections::BTreeMap;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

/// Deterministic platform name of a declared volume.
pub(crate) fn storage_volume_name(declared: &str, component: &str) -> String {
    format!("{}-{}", component, declared)
}

/// Collision-resistant name for a per-component system volume.
fn system_volume_name(kind: &str, component: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", kind, component, &suffix[..8])
}

fn volumes_matching(volumes: &[VolumeInfo], selector: &BTreeMap<String, String>) -> Vec<String> {
    let mut names: Vec<String> = volumes
        .iter()
        .filter(|v| labels::matches(&v.labels, selector))
        .map(|v| v.name.clone())
        .collect();
    names.sort();
    names
}

/// Ensure every declared volume exists; returns declared-name → platform-name.
pub(crate) async fn ensure_storage(
    runtime: &dyn Runtime,
    component: &str,
    declared: &[DevfileVolume],
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    if declared.is_empty() {
        return Ok(resolved);
    }

    let existing = runtime.list_volumes().await?;
    for volume in declared {
        let selector = labels::storage_volume_labels(component, &volume.name);
        let found = volumes_matching(&existing, &selector);
        let platform_name = match found.first() {
            Some(name) => {
                debug!(component, volume = %volume.name, "reusing storage volume {}", name);
                name.clone()
            }
            None => {
                let name = storage_volume_name(&volume.name, component);
                runtime
                    .create_volume(&name, volume.size.as_deref(), &selector)
                    .await?;
                info!(component, volume = %volume.name, "created storage volume {}", name);
                name
            }
        };
        resolved.insert(volume.name.clone(), platform_name);
    }
    Ok(resolved)
}

/// Ensure the component's source-sync volume exists and return its name.
pub(crate) async fn ensure_source_volume(
    runtime: &dyn Runtime,
    component: &str,
) -> Result<String> {
    let selector = labels::source_volume_labels(component);
    let found = volumes_matching(&runtime.list_volumes().await?, &selector);
    match found.len() {
        0 => {
            let name = system_volume_name(labels::TYPE_SOURCE, component);
            runtime.create_volume(&name, None, &selector).await?;
            info!(component, "created source volume {}", name);
            Ok(name)
        }
        1 => Ok(found.into_iter().next().unwrap_or_default()),
        _ => Err(AdapterError::DuplicateSystemVolume {
            kind: labels::TYPE_SOURCE,
            component: component.to_string(),
        }),
    }
}

/// Ensure the component's bootstrap volume exists; when the component is new,
/// additionally run the one-shot init workload that populates it.
pub(crate) async fn ensure_bootstrap_volume(
    runtime: &dyn Runtime,
    component: &str,
    component_is_new: bool,
) -> Result<String> {
    let selector = labels::bootstrap_volume_labels(component);
    let found = volumes_matching(&runtime.list_volumes().await?, &selector);
    let volume_name = match found.len() {
        0 => {
            let name = system_volume_name(labels::TYPE_BOOTSTRAP, component);
            runtime.create_volume(&name, None, &selector).await?;
            info!(component, "created bootstrap volume {}", name);
            name
        }
        1 => found.into_iter().next().unwrap_or_default(),
        _ => {
            return Err(AdapterError::DuplicateSystemVolume {
                kind: labels::TYPE_BOOTSTRAP,
                component: component.to_string(),
            });
        }
    };

    if component_is_new {
        initialize_bootstrap_volume(runtime, component, &volume_name).await?;
    }

    Ok(volume_name)
}

/// Run the throwaway bootstrap workload: pull the support image, mount the
/// volume, copy the payload in, wait for completion under a hard bound and
/// remove the workload.
async fn initialize_bootstrap_volume(
    runtime: &dyn Runtime,
    component: &str,
    volume_name: &str,
) -> Result<()> {
    let image = env::bootstrap_image();
    info!(component, "initializing bootstrap volume from {}", image);

    runtime.pull_image(&image).await?;

    let spec = ContainerSpec {
        image,
        entrypoint: vec!["/usr/bin/cp".to_string()],
        args: vec![
            "-r".to_string(),
            env::BOOTSTRAP_PAYLOAD_DIR.to_string(),
            env::SUPERVISOR_MOUNT_PATH.to_string(),
        ],
        labels: labels::bootstrap_volume_labels(component),
        mounts: vec![MountSpec {
            volume: volume_name.to_string(),
            target: env::SUPERVISOR_MOUNT_PATH.to_string(),
        }],
        ..Default::default()
    };

    let container_id = runtime.create_container(&spec).await?;

    match timeout(env::BOOTSTRAP_WAIT_TIMEOUT, runtime.wait_container(&container_id)).await {
        Err(_) => {
            // Leave a clean slate; the timeout itself is the reported error.
            let _ = runtime.remove_container(&container_id).await;
            Err(AdapterError::BootstrapTimeout {
                seconds: env::BOOTSTRAP_WAIT_TIMEOUT.as_secs(),
            })
        }
        Ok(Err(e)) => {
            let _ = runtime.remove_container(&container_id).await;
            Err(e.into())
        }
        Ok(Ok(exit_code)) if exit_code != 0 => {
            let _ = runtime.remove_container(&container_id).await;
            Err(AdapterError::BootstrapFailed { exit_code })
        }
        Ok(Ok(_)) => {
            runtime.remove_container(&container_id).await?;
            debug!(component, "bootstrap volume initialized");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{FakeRuntime, Op};

    #[tokio::test]
    async fn test_storage_names_are_deterministic() {
        let runtime = FakeRuntime::new();
        let declared = vec![DevfileVolume {
            name: "data".to_string(),
            size: Some("1Gi".to_string()),
        }];

        let first = ensure_storage(&runtime, "web", &declared).await.unwrap();
        let second = ensure_storage(&runtime, "web", &declared).await.unwrap();
        assert_eq!(first, second);
        // Only one create ever happened.
        let creates = runtime.ops_where(|op| matches!(op, Op::CreateVolume(_)));
        assert_eq!(creates.len(), 1);
    }

    #[tokio::test]
    async fn test_source_volume_is_idempotent() {
        let runtime = FakeRuntime::new();
        let first = ensure_source_volume(&runtime, "web").await.unwrap();
        let second = ensure_source_volume(&runtime, "web").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_source_volumes_are_fatal() {
        let runtime = FakeRuntime::new();
        runtime.add_volume("src-a", labels::source_volume_labels("web"));
        runtime.add_volume("src-b", labels::source_volume_labels("web"));
        assert!(matches!(
            ensure_source_volume(&runtime, "web").await,
            Err(AdapterError::DuplicateSystemVolume { kind: "source", .. })
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_runs_only_for_new_components() {
        let runtime = FakeRuntime::new();

        ensure_bootstrap_volume(&runtime, "web", true).await.unwrap();
        let bootstrap_runs = runtime.ops_where(|op| matches!(op, Op::WaitContainer(_)));
        assert_eq!(bootstrap_runs.len(), 1);
        // The throwaway workload was removed again.
        assert!(runtime.containers().is_empty());

        runtime.clear_ops();
        ensure_bootstrap_volume(&runtime, "web", false).await.unwrap();
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_reports_exit_code() {
        let runtime = FakeRuntime::new();
        runtime.set_wait_exit_code(2);
        match ensure_bootstrap_volume(&runtime, "web", true).await {
            Err(AdapterError::BootstrapFailed { exit_code }) => assert_eq!(exit_code, 2),
            other => panic!("expected BootstrapFailed, got {:?}", other.map(|_| ())),
        }
        // The failed workload is still cleaned up.
        assert!(runtime.containers().is_empty());
    }
}
