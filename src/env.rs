//! Environment constants and fixed paths.
//!
//! Centralizes the names of injected environment variables, the supervisor
//! payload layout, and the bootstrap image reference used throughout the
//! adapter so the create and exec paths cannot drift apart.

use std::time::Duration;

/// Environment variable injected into containers that mount project sources,
/// pointing at the source mount path inside the container.
pub const ENV_PROJECTS_ROOT: &str = "DEVPUSH_PROJECTS_ROOT";

/// Environment variable carrying the resolved run command line, consumed by
/// the supervisor's managed program entry.
pub const ENV_COMMAND_RUN: &str = "DEVPUSH_COMMAND_RUN";

/// Environment variable carrying the run command's working directory.
pub const ENV_COMMAND_RUN_WORKING_DIR: &str = "DEVPUSH_COMMAND_RUN_WORKING_DIR";

/// Environment variable overriding the bootstrap image reference.
pub const ENV_BOOTSTRAP_IMAGE: &str = "DEVPUSH_BOOTSTRAP_IMAGE";

/// Default mount path for synced project sources when the container unit does
/// not declare a `sourceMapping` override.
pub const DEFAULT_SOURCE_MOUNT: &str = "/projects";

/// Mount path of the bootstrap volume inside managed containers.
pub const SUPERVISOR_MOUNT_PATH: &str = "/opt/devpush";

/// Path of the supervisor binary inside the bootstrap volume.
pub const SUPERVISOR_BINARY: &str = "/opt/devpush/bin/supervisord";

/// Path of the supervisor configuration file inside the bootstrap volume.
pub const SUPERVISOR_CONF: &str = "/opt/devpush/conf/devpush-supervisor.conf";

/// Name of the supervisor-managed program that wraps the run command.
pub const SUPERVISOR_RUN_PROGRAM: &str = "devrun";

/// Directory inside the bootstrap image whose contents are copied into the
/// bootstrap volume by the one-shot init workload.
pub const BOOTSTRAP_PAYLOAD_DIR: &str = "/opt/devpush-init/.";

/// Default bootstrap image holding the supervisor binary and its payload.
pub const DEFAULT_BOOTSTRAP_IMAGE: &str = "quay.io/devpush/bootstrap:latest";

/// Host address used for exposed endpoint bindings on the Docker backend.
pub const LOCALHOST_IP: &str = "127.0.0.1";

/// Upper bound on the bootstrap workload's run-to-completion wait.
pub const BOOTSTRAP_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Resolve the bootstrap image, honoring the override variable.
pub fn bootstrap_image() -> String {
    std::env::var(ENV_BOOTSTRAP_IMAGE).unwrap_or_else(|_| DEFAULT_BOOTSTRAP_IMAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_image_default() {
        // The override variable is not set in the test environment.
        assert_eq!(bootstrap_image(), DEFAULT_BOOTSTRAP_IMAGE);
    }
}
