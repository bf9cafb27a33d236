//! Container/workload reconciliation.
//!
//! For each declared unit, in declaration order: zero observed containers
//! means create, one means diff-and-maybe-recreate, more than one is a fatal
//! consistency error. The image is pulled on every create path and never on
//! a no-op, so steady state costs no network round trips.

use crate::adapter::{AdapterError, Result};
use crate::devfile::{ContainerUnit, Devfile, DevfileCommand};
use crate::runtime::{ContainerInfo, ContainerSpec, MountKind, MountSpec, PortSpec, Runtime};
use crate::{env, labels};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Reconcile all declared units. Returns whether the component can still be
/// considered pre-existing: any created or recreated unit flips this to
/// `false`, which forces downstream re-init and supervisor startup.
pub(crate) async fn reconcile_components(
    runtime: &dyn Runtime,
    devfile: &Devfile,
    component: &str,
    run_command: &DevfileCommand,
    storage_names: &BTreeMap<String, String>,
    source_volume: &str,
    bootstrap_volume: &str,
) -> Result<bool> {
    let mut component_exists = true;

    // Sequential by design: deterministic log output, and no parallel image
    // pulls hammering the daemon.
    for unit in &devfile.components {
        let desired = build_desired_spec(
            unit,
            component,
            run_command,
            storage_names,
            source_volume,
            bootstrap_volume,
        );

        let observed: Vec<ContainerInfo> = runtime
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| labels::matches(&c.labels, &labels::unit_labels(component, &unit.name)))
            .collect();

        match observed.len() {
            0 => {
                info!(component, alias = %unit.name, "creating container");
                runtime.pull_image(&desired.image).await?;
                runtime.create_container(&desired).await?;
                component_exists = false;
            }
            1 => {
                let current = &observed[0];
                if spec_differs(&desired, current) {
                    info!(component, alias = %unit.name, "container drifted, recreating");
                    runtime.remove_container(&current.id).await?;
                    runtime.pull_image(&desired.image).await?;
                    runtime.create_container(&desired).await?;
                    component_exists = false;
                } else {
                    debug!(component, alias = %unit.name, "container up to date");
                }
            }
            _ => {
                return Err(AdapterError::MultipleContainersForUnit {
                    alias: unit.name.clone(),
                });
            }
        }
    }

    Ok(component_exists)
}

/// Build the full desired spec of one unit, including the system mounts and
/// injected environment.
pub(crate) fn build_desired_spec(
    unit: &ContainerUnit,
    component: &str,
    run_command: &DevfileCommand,
    storage_names: &BTreeMap<String, String>,
    source_volume: &str,
    bootstrap_volume: &str,
) -> ContainerSpec {
    let mut entrypoint = unit.command.clone();
    let mut args = unit.args.clone();
    let mut env_vars: Vec<(String, String)> = unit
        .env
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();

    let mut mounts: Vec<MountSpec> = unit
        .volume_mounts
        .iter()
        .map(|m| MountSpec {
            // Declared names resolve through the storage map; a name the map
            // does not carry passes through verbatim (validation already
            // guarantees it is declared).
            volume: storage_names
                .get(&m.name)
                .cloned()
                .unwrap_or_else(|| m.name.clone()),
            target: m.path.clone(),
        })
        .collect();

    let hosts_run_command = run_command.component == unit.name;
    if hosts_run_command {
        mounts.push(MountSpec {
            volume: bootstrap_volume.to_string(),
            target: env::SUPERVISOR_MOUNT_PATH.to_string(),
        });

        // Only wrap the entrypoint when the unit does not declare its own;
        // a user entrypoint always wins.
        if entrypoint.is_empty() && args.is_empty() {
            entrypoint = vec![env::SUPERVISOR_BINARY.to_string()];
            args = vec!["-c".to_string(), env::SUPERVISOR_CONF.to_string()];
        }

        if !has_env(&env_vars, env::ENV_COMMAND_RUN) {
            env_vars.push((
                env::ENV_COMMAND_RUN.to_string(),
                run_command.command_line.clone(),
            ));
        }
        if !has_env(&env_vars, env::ENV_COMMAND_RUN_WORKING_DIR) {
            if let Some(dir) = &run_command.working_dir {
                env_vars.push((env::ENV_COMMAND_RUN_WORKING_DIR.to_string(), dir.clone()));
            }
        }
    }

    if unit.mount_sources {
        let source_mount = unit
            .source_mapping
            .clone()
            .unwrap_or_else(|| env::DEFAULT_SOURCE_MOUNT.to_string());
        mounts.push(MountSpec {
            volume: source_volume.to_string(),
            target: source_mount.clone(),
        });
        if !has_env(&env_vars, env::ENV_PROJECTS_ROOT) {
            env_vars.push((env::ENV_PROJECTS_ROOT.to_string(), source_mount));
        }
    }

    let ports = unit
        .endpoints
        .iter()
        .filter(|e| e.exposed)
        .map(|e| PortSpec {
            container_port: e.target_port,
            host_ip: Some(env::LOCALHOST_IP.to_string()),
            host_port: Some(e.target_port),
        })
        .collect();

    ContainerSpec {
        name: None,
        image: unit.image.clone(),
        entrypoint,
        args,
        env: env_vars,
        working_dir: None,
        labels: labels::unit_labels(component, &unit.name),
        mounts,
        ports,
    }
}

fn has_env(env: &[(String, String)], name: &str) -> bool {
    env.iter().any(|(k, _)| k == name)
}

/// Decide whether an observed container drifted from its desired spec.
///
/// Compared: image, entrypoint/args, environment (order-independent,
/// value-exact; image-provided variables in the observed set are tolerated),
/// the named-volume mount set (name + target) and the port binding set.
pub(crate) fn spec_differs(desired: &ContainerSpec, observed: &ContainerInfo) -> bool {
    if desired.image != observed.image {
        return true;
    }
    if desired.entrypoint != observed.entrypoint || desired.args != observed.args {
        return true;
    }

    let observed_env: BTreeMap<&str, &str> = observed
        .env
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    for (key, value) in &desired.env {
        if observed_env.get(key.as_str()) != Some(&value.as_str()) {
            return true;
        }
    }

    let desired_mounts: BTreeSet<(&str, &str)> = desired
        .mounts
        .iter()
        .map(|m| (m.volume.as_str(), m.target.as_str()))
        .collect();
    let observed_mounts: BTreeSet<(&str, &str)> = observed
        .mounts
        .iter()
        .filter(|m| m.kind == MountKind::Volume)
        .map(|m| (m.name.as_str(), m.target.as_str()))
        .collect();
    if desired_mounts != observed_mounts {
        return true;
    }

    let desired_ports: BTreeSet<&PortSpec> = desired.ports.iter().collect();
    let observed_ports: BTreeSet<&PortSpec> = observed.ports.iter().collect();
    desired_ports != observed_ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::{CommandGroupKind, EnvVar};
    use crate::runtime::MountInfo;

    fn run_command(alias: &str) -> DevfileCommand {
        DevfileCommand {
            id: "run".to_string(),
            command_line: "npm start".to_string(),
            working_dir: Some("/projects".to_string()),
            component: alias.to_string(),
            group: CommandGroupKind::Run,
            is_default: true,
            ..Default::default()
        }
    }

    fn unit(name: &str) -> ContainerUnit {
        ContainerUnit {
            name: name.to_string(),
            image: "node:18".to_string(),
            mount_sources: true,
            ..Default::default()
        }
    }

    fn observed_from(spec: &ContainerSpec) -> ContainerInfo {
        ContainerInfo {
            id: "c1".to_string(),
            labels: spec.labels.clone(),
            image: spec.image.clone(),
            entrypoint: spec.entrypoint.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            mounts: spec
                .mounts
                .iter()
                .map(|m| MountInfo {
                    name: m.volume.clone(),
                    target: m.target.clone(),
                    kind: MountKind::Volume,
                })
                .collect(),
            ports: spec.ports.clone(),
            running: true,
        }
    }

    #[test]
    fn test_run_unit_gets_supervisor_entrypoint_and_env() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );

        assert_eq!(spec.entrypoint, vec![env::SUPERVISOR_BINARY.to_string()]);
        assert!(spec.env.iter().any(|(k, v)| k == env::ENV_COMMAND_RUN && v == "npm start"));
        assert!(
            spec.env
                .iter()
                .any(|(k, _)| k == env::ENV_COMMAND_RUN_WORKING_DIR)
        );
        assert!(
            spec.mounts
                .iter()
                .any(|m| m.volume == "boot-vol" && m.target == env::SUPERVISOR_MOUNT_PATH)
        );
        assert!(
            spec.mounts
                .iter()
                .any(|m| m.volume == "src-vol" && m.target == env::DEFAULT_SOURCE_MOUNT)
        );
        assert!(
            spec.env
                .iter()
                .any(|(k, v)| k == env::ENV_PROJECTS_ROOT && v == env::DEFAULT_SOURCE_MOUNT)
        );
    }

    #[test]
    fn test_user_entrypoint_is_never_wrapped() {
        let mut custom = unit("runtime");
        custom.command = vec!["node".to_string()];
        custom.args = vec!["server.js".to_string()];

        let spec = build_desired_spec(
            &custom,
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        assert_eq!(spec.entrypoint, vec!["node"]);
        assert_eq!(spec.args, vec!["server.js"]);
    }

    #[test]
    fn test_user_env_is_not_overridden() {
        let mut custom = unit("runtime");
        custom
            .env
            .push(EnvVar::new(env::ENV_COMMAND_RUN, "custom run"));

        let spec = build_desired_spec(
            &custom,
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let values: Vec<&str> = spec
            .env
            .iter()
            .filter(|(k, _)| k == env::ENV_COMMAND_RUN)
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["custom run"]);
    }

    #[test]
    fn test_non_run_unit_has_no_supervisor_mount() {
        let spec = build_desired_spec(
            &unit("db"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        assert!(spec.mounts.iter().all(|m| m.volume != "boot-vol"));
        assert!(spec.entrypoint.is_empty());
    }

    #[test]
    fn test_source_mapping_overrides_mount_path() {
        let mut custom = unit("runtime");
        custom.source_mapping = Some("/app".to_string());

        let spec = build_desired_spec(
            &custom,
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        assert!(spec.mounts.iter().any(|m| m.volume == "src-vol" && m.target == "/app"));
        assert!(spec.env.iter().any(|(k, v)| k == env::ENV_PROJECTS_ROOT && v == "/app"));
    }

    #[test]
    fn test_identical_spec_does_not_differ() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let observed = observed_from(&spec);
        assert!(!spec_differs(&spec, &observed));
    }

    #[test]
    fn test_image_provided_env_is_tolerated() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let mut observed = observed_from(&spec);
        observed
            .env
            .push(("PATH".to_string(), "/usr/bin".to_string()));
        assert!(!spec_differs(&spec, &observed));
    }

    #[test]
    fn test_changed_image_differs() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let mut observed = observed_from(&spec);
        observed.image = "node:20".to_string();
        assert!(spec_differs(&spec, &observed));
    }

    #[test]
    fn test_changed_env_value_differs() {
        let mut custom = unit("runtime");
        custom.env.push(EnvVar::new("MODE", "dev"));
        let spec = build_desired_spec(
            &custom,
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let mut observed = observed_from(&spec);
        for (k, v) in observed.env.iter_mut() {
            if k.as_str() == "MODE" {
                *v = "prod".to_string();
            }
        }
        assert!(spec_differs(&spec, &observed));
    }

    #[test]
    fn test_missing_mount_differs() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let mut observed = observed_from(&spec);
        observed.mounts.retain(|m| m.name != "src-vol");
        assert!(spec_differs(&spec, &observed));
    }

    #[test]
    fn test_bind_mounts_are_ignored_in_diff() {
        let spec = build_desired_spec(
            &unit("runtime"),
            "web",
            &run_command("runtime"),
            &BTreeMap::new(),
            "src-vol",
            "boot-vol",
        );
        let mut observed = observed_from(&spec);
        observed.mounts.push(MountInfo {
            name: "/host/path".to_string(),
            target: "/mnt".to_string(),
            kind: MountKind::Bind,
        });
        assert!(!spec_differs(&spec, &observed));
    }
}
