//! Delete/GC reconciliation.
//!
//! A volume is deleted only when all three hold: it is labeled as owned by
//! the target component (exact keys, see [`crate::labels::is_owned_volume`]),
//! it was physically mounted into one of the component's removed containers,
//! and it is not simultaneously mounted into any other component's container.
//! Deleting a missing component succeeds with a warning so delete stays
//! idempotent.

use crate::adapter::{AdapterError, Result};
use crate::labels;
use crate::runtime::{MountKind, Runtime};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub(crate) async fn delete_component(
    runtime: &dyn Runtime,
    selector: &BTreeMap<String, String>,
) -> Result<()> {
    let component = selector
        .get(labels::COMPONENT)
        .ok_or(AdapterError::MissingComponentLabel)?
        .clone();

    // Platform-wide snapshot, unfiltered: volumes mounted anywhere outside
    // this component are protected no matter what their labels claim.
    let all_containers = runtime.list_containers().await?;

    let mut protected: BTreeSet<String> = BTreeSet::new();
    for container in &all_containers {
        if container.label(labels::COMPONENT) == Some(component.as_str()) {
            continue;
        }
        for mount in &container.mounts {
            protected.insert(mount.name.clone());
        }
    }

    let component_containers: Vec<_> = all_containers
        .iter()
        .filter(|c| c.label(labels::COMPONENT) == Some(component.as_str()))
        .collect();

    if component_containers.is_empty() {
        warn!(component = %component, "component does not exist; nothing to delete");
        return Ok(());
    }

    let candidates: Vec<String> = runtime
        .list_volumes()
        .await?
        .into_iter()
        .filter(|v| labels::is_owned_volume(&v.labels, &component))
        .map(|v| v.name)
        .collect();

    // Remove containers, collecting the names of the named volumes that were
    // actually mounted into them. Bind mounts are never collected.
    let mut mounted: BTreeSet<String> = BTreeSet::new();
    for container in &component_containers {
        debug!(component = %component, container = %container.id, "removing container");
        runtime.remove_container(&container.id).await?;
        for mount in &container.mounts {
            if mount.kind == MountKind::Volume {
                mounted.insert(mount.name.clone());
            }
        }
    }

    for volume in &candidates {
        if protected.contains(volume) {
            debug!(volume = %volume, "volume mounted outside the component; keeping");
            continue;
        }
        if !mounted.contains(volume) {
            debug!(volume = %volume, "volume not mounted into a removed container; keeping");
            continue;
        }
        debug!(volume = %volume, "deleting volume");
        runtime.remove_volume(volume).await?;
    }

    info!(component = %component, "component deleted");
    Ok(())
}
