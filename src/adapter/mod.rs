//! The component adapter: a platform-polymorphic reconciliation engine.
//!
//! [`ComponentAdapter`] binds a runtime backend, a validated devfile and a
//! component name, and drives the full push cycle: existence check → volume
//! reconciliation → container reconciliation → sync gate → command
//! execution. The same state machine serves both backends; platform
//! selection is an explicit constructor value, never ambient state.
//!
//! ## Push control flow
//!
//! ```text
//! push(params)
//!   ├─ validate devfile cross-references
//!   ├─ resolve init/build/run command slots (pre-flight)
//!   ├─ does_component_exist?
//!   ├─ ensure storage volumes (deterministic names)
//!   ├─ ensure bootstrap volume (+ one-shot init when new)
//!   ├─ ensure source volume
//!   ├─ reconcile containers (create / recreate-on-drift / no-op)
//!   ├─ locate sync target (first mount_sources unit)
//!   ├─ sync gate: new ∨ force ∨ changed files?
//!   └─ exec init? → build? → run (supervisor-controlled)
//! ```

mod delete;
mod exec;
mod reconcile;
mod storage;
mod sync;

use crate::devfile::{
    CommandError, CommandGroupKind, Devfile, DevfileError, resolve_group_command,
    resolve_test_command,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::labels;
use crate::runtime::{ContainerInfo, ExecSpec, LogStream, Runtime, RuntimeError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-invocation push parameters. Ephemeral; never persisted.
#[derive(Debug, Clone, Default)]
pub struct PushParameters {
    /// Component source root on the developer's machine.
    pub path: PathBuf,
    /// Ignore globs, applied when the core walks the full source tree.
    pub ignored_files: Vec<String>,
    /// Force a sync + exec cycle even without file changes.
    pub force_build: bool,
    /// Stream command output to the caller's terminal in real time.
    pub show: bool,
    /// Override for the init command id.
    pub init_command: Option<String>,
    /// Override for the build command id.
    pub build_command: Option<String>,
    /// Override for the run command id.
    pub run_command: Option<String>,
    /// Override for the debug command id.
    pub debug_command: Option<String>,
    /// Push in debug mode (the run slot resolves from the debug group).
    pub debug: bool,
    /// Local debug port (forwarded to the caller's tooling; unused by core).
    pub debug_port: u16,
    /// Externally computed, ignore-filtered set of changed files.
    pub watch_files: Vec<PathBuf>,
    /// Externally computed set of deleted files.
    pub watch_deleted_files: Vec<PathBuf>,
}

/// Everything the adapter needs to identify and describe one component.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Component name; the value of the `component` identity label.
    pub component_name: String,
    /// The validated descriptor.
    pub devfile: Devfile,
}

/// Target platform, threaded explicitly into the constructor.
#[derive(Debug, Clone)]
pub enum Platform {
    /// Local Docker/Podman daemon.
    Docker,
    /// Kubernetes namespace.
    Cluster {
        /// Namespace holding the component's pods and claims.
        namespace: String,
    },
}

/// Errors surfaced by adapter operations.
///
/// Validation and consistency failures are fatal and never retried; runtime
/// errors propagate immediately with operation context, leaving retry policy
/// to the caller.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Devfile cross-reference validation failed.
    #[error(transparent)]
    Devfile(#[from] DevfileError),

    /// Command resolution failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A runtime backend call failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// More than one container observed for one unit; indicates external
    /// interference or a broken label scheme.
    #[error("found multiple containers for component unit {alias}; refusing to push")]
    MultipleContainersForUnit {
        /// The offending unit alias.
        alias: String,
    },

    /// More than one system volume of the same type for one component.
    #[error("multiple {kind} volumes found for component {component}")]
    DuplicateSystemVolume {
        /// Volume type label value (`source` or `bootstrap`).
        kind: &'static str,
        /// The component name.
        component: String,
    },

    /// No observed container mounts the source volume; there is nowhere to
    /// sync to.
    #[error(
        "to sync files at least one container component must set mountSources: true"
    )]
    NoMountedSourceVolume,

    /// A declared unit has no observed container at exec time.
    #[error("no container found for component unit {alias}")]
    MissingUnitContainer {
        /// The missing unit alias.
        alias: String,
    },

    /// Delete was invoked without a component label.
    #[error("unable to delete component without a component label")]
    MissingComponentLabel,

    /// An operation requires the component to exist, and it does not.
    #[error("component {name} does not exist on the target platform")]
    ComponentNotFound {
        /// The component name.
        name: String,
    },

    /// The bootstrap workload did not reach a terminal state in time.
    /// Distinct from [`AdapterError::BootstrapFailed`] so infrastructure
    /// slowness can be told apart from a broken payload.
    #[error("bootstrap workload did not complete within {seconds}s")]
    BootstrapTimeout {
        /// The configured bound.
        seconds: u64,
    },

    /// The bootstrap workload exited non-zero.
    #[error("bootstrap workload failed with exit code {exit_code}")]
    BootstrapFailed {
        /// Remote exit code.
        exit_code: i64,
    },

    /// The devfile schema version predates test command groups.
    #[error("devfile version {version} does not support test commands")]
    TestsUnsupported {
        /// The declared schema version.
        version: String,
    },

    /// A devfile command exited non-zero.
    #[error("command {id} in container component {alias} failed with exit code {exit_code}")]
    CommandFailed {
        /// Devfile command id.
        id: String,
        /// Owning unit alias.
        alias: String,
        /// Remote exit code.
        exit_code: i64,
    },

    /// The exec transport failed while running a devfile command.
    #[error("command {id} in container component {alias} could not be executed")]
    CommandTransport {
        /// Devfile command id.
        id: String,
        /// Owning unit alias.
        alias: String,
        /// Underlying failure.
        #[source]
        source: RuntimeError,
    },

    /// A user-supplied exec command exited non-zero.
    #[error("command exited with code {exit_code}")]
    ExecFailed {
        /// Remote exit code.
        exit_code: i64,
    },
}

/// Result alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// The platform-polymorphic component adapter.
pub struct ComponentAdapter {
    ctx: AdapterContext,
    runtime: Arc<dyn Runtime>,
    events: Arc<dyn EventSink>,
}

impl ComponentAdapter {
    /// Construct an adapter for the given platform.
    ///
    /// # Errors
    ///
    /// Returns error if the platform client cannot be constructed.
    pub async fn new(platform: Platform, ctx: AdapterContext) -> Result<Self> {
        let runtime: Arc<dyn Runtime> = match platform {
            Platform::Docker => Arc::new(crate::runtime::docker::DockerRuntime::connect().await?),
            Platform::Cluster { namespace } => {
                Arc::new(crate::runtime::cluster::ClusterRuntime::connect(namespace).await?)
            }
        };
        Ok(Self::with_runtime(ctx, runtime))
    }

    /// Construct an adapter over an existing runtime (tests, embedding).
    pub fn with_runtime(ctx: AdapterContext, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            ctx,
            runtime,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replace the machine event sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The component name this adapter is bound to.
    pub fn component_name(&self) -> &str {
        &self.ctx.component_name
    }

    /// Observed containers belonging to one component.
    async fn component_containers(&self, component: &str) -> Result<Vec<ContainerInfo>> {
        let containers = self.runtime.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.label(labels::COMPONENT) == Some(component))
            .collect())
    }

    /// True if any observed container carries the component's identity label.
    ///
    /// Existence is always derived from the platform, never cached; a
    /// `Forbidden` probe failure propagates distinctly from not-found.
    pub async fn does_component_exist(&self, name: &str) -> Result<bool> {
        Ok(!self.component_containers(name).await?.is_empty())
    }

    /// Create or update the component to match the devfile, sync sources and
    /// run the push command groups.
    pub async fn push(&self, parameters: PushParameters) -> Result<()> {
        let component = self.ctx.component_name.clone();
        let devfile = &self.ctx.devfile;

        devfile.validate()?;

        // Pre-flight: a devfile that cannot produce a valid command set must
        // fail before any resource is touched.
        let commands = crate::devfile::resolve_push_commands(
            devfile,
            parameters.init_command.as_deref(),
            parameters.build_command.as_deref(),
            parameters.run_command.as_deref(),
            parameters.debug_command.as_deref(),
            parameters.debug,
        )?;

        let component_existed = self.does_component_exist(&component).await?;
        debug!(component = %component, existed = component_existed, "starting push");

        let storage_names =
            storage::ensure_storage(self.runtime.as_ref(), &component, &devfile.volumes).await?;

        let bootstrap_volume = storage::ensure_bootstrap_volume(
            self.runtime.as_ref(),
            &component,
            !component_existed,
        )
        .await?;

        let source_volume =
            storage::ensure_source_volume(self.runtime.as_ref(), &component).await?;

        // Reconcile every declared unit. The component counts as pre-existing
        // downstream only if no unit had to be (re)created.
        let component_exists = reconcile::reconcile_components(
            self.runtime.as_ref(),
            devfile,
            &component,
            &commands.run,
            &storage_names,
            &source_volume,
            &bootstrap_volume,
        )
        .await?;

        let containers = self.component_containers(&component).await?;

        let (sync_target, source_mount) =
            sync::locate_sync_target(&devfile.components, &containers, &source_volume)?;

        info!(component = %component, "syncing project files");
        let exec_required = sync::sync_files(
            self.runtime.as_ref(),
            &parameters,
            &sync_target,
            &source_mount,
            component_exists,
        )
        .await?;

        if exec_required {
            info!(component = %component, "executing devfile commands");
            exec::exec_push_commands(
                self.runtime.as_ref(),
                self.events.as_ref(),
                &commands,
                component_exists,
                parameters.show,
                &containers,
            )
            .await?;
        } else {
            debug!(component = %component, "no changes; skipping command execution");
        }

        Ok(())
    }

    /// Delete the component identified by `labels`, removing exactly the
    /// containers and volumes it exclusively owns.
    pub async fn delete(&self, labels: &BTreeMap<String, String>) -> Result<()> {
        delete::delete_component(self.runtime.as_ref(), labels).await
    }

    /// Run a test-group command in its container.
    pub async fn test(&self, command_name: Option<&str>, show: bool) -> Result<()> {
        let devfile = &self.ctx.devfile;
        if !devfile.supports_test_groups() {
            return Err(AdapterError::TestsUnsupported {
                version: devfile.schema_version.clone(),
            });
        }

        let command = resolve_test_command(devfile, command_name)?;
        let containers = self
            .component_containers(&self.ctx.component_name)
            .await?;
        if containers.is_empty() {
            return Err(AdapterError::ComponentNotFound {
                name: self.ctx.component_name.clone(),
            });
        }

        exec::run_devfile_command(
            self.runtime.as_ref(),
            self.events.as_ref(),
            &command,
            &containers,
            show,
        )
        .await
    }

    /// Stream logs of the container hosting the run (or debug) command.
    pub async fn log(&self, follow: bool, debug: bool) -> Result<LogStream> {
        let component = &self.ctx.component_name;
        if !self.does_component_exist(component).await? {
            return Err(AdapterError::ComponentNotFound {
                name: component.clone(),
            });
        }

        let group = if debug {
            CommandGroupKind::Debug
        } else {
            CommandGroupKind::Run
        };
        let command = resolve_group_command(&self.ctx.devfile, group, None)?.ok_or(
            CommandError::NoDefaultCommand { group },
        )?;

        let containers = self.component_containers(component).await?;
        let container = containers
            .iter()
            .find(|c| c.label(labels::ALIAS) == Some(command.component.as_str()))
            .ok_or_else(|| AdapterError::MissingUnitContainer {
                alias: command.component.clone(),
            })?;

        Ok(self.runtime.container_logs(&container.id, follow).await?)
    }

    /// Execute an arbitrary command in the run command's container, streaming
    /// output to the caller's terminal.
    pub async fn exec(&self, command: &[String]) -> Result<()> {
        let devfile = &self.ctx.devfile;
        let run = resolve_group_command(devfile, CommandGroupKind::Run, None)?
            .ok_or(CommandError::NoRunCommand)?;

        let containers = self
            .component_containers(&self.ctx.component_name)
            .await?;
        let container = containers
            .iter()
            .find(|c| c.label(labels::ALIAS) == Some(run.component.as_str()))
            .ok_or_else(|| AdapterError::MissingUnitContainer {
                alias: run.component.clone(),
            })?;

        let spec = ExecSpec {
            command: command.to_vec(),
            ..Default::default()
        };
        let live = exec::spawn_live_printer();
        let output = self.runtime.exec(&container.id, &spec, Some(live)).await?;

        if !output.success() {
            warn!(exit_code = output.exit_code, "exec command failed");
            return Err(AdapterError::ExecFailed {
                exit_code: output.exit_code,
            });
        }
        Ok(())
    }
}
