//! Runtime client facade.
//!
//! The adapter's state machine is written once against the narrow capability
//! traits in this module: [`ContainerStore`] for workload CRUD,
//! [`VolumeStore`] for named volumes, and [`Execer`] for in-container command
//! execution. [`Runtime`] is their union. Two real backends implement it —
//! [`docker::DockerRuntime`] over the local container daemon and
//! [`cluster::ClusterRuntime`] over a Kubernetes namespace — plus the
//! in-memory [`fake::FakeRuntime`] the tests run against.
//!
//! Observed state is normalized into [`ContainerInfo`]/[`VolumeInfo`] so the
//! reconciler diffs one vocabulary regardless of backend.

pub mod cluster;
pub mod docker;
pub mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Errors surfaced by runtime backends.
///
/// The core never retries these; they are wrapped with operation context by
/// the adapter and propagated to the caller. `Forbidden` is kept distinct
/// from `NotFound` so existence probes can tell permission problems from a
/// genuinely absent component.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Container daemon API error.
    #[error("container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Cluster API error.
    #[error("cluster API error: {0}")]
    Cluster(#[from] kube::Error),

    /// A named resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. `container`, `volume`).
        kind: &'static str,
        /// Resource name or id.
        name: String,
    },

    /// The platform denied access to a resource.
    #[error("access to {kind} {name} forbidden")]
    Forbidden {
        /// Resource kind.
        kind: &'static str,
        /// Resource name or id.
        name: String,
    },

    /// The exec transport failed before the remote process exited.
    #[error("execution transport error: {0}")]
    Exec(String),

    /// Local IO failure (archive construction, stream plumbing).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Streamed container logs. Dropping the stream releases the underlying
/// transport (the follow socket included).
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Kind of an observed mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A named, platform-managed volume.
    Volume,
    /// A host bind mount (never garbage-collected).
    Bind,
}

/// One observed mount of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Volume name (or host path for bind mounts).
    pub name: String,
    /// Mount path inside the container.
    pub target: String,
    /// Mount kind.
    pub kind: MountKind,
}

/// A desired or observed port binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PortSpec {
    /// Port the containerized process listens on.
    pub container_port: u16,
    /// Host address the port is published on, when exposed.
    pub host_ip: Option<String>,
    /// Host port the container port is published on, when exposed.
    pub host_port: Option<u16>,
}

/// A desired mount for container creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Platform volume name to mount.
    pub volume: String,
    /// Mount path inside the container.
    pub target: String,
}

/// Desired container state, built by the reconciler and consumed by
/// [`ContainerStore::create_container`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Optional platform name hint; backends generate one when absent.
    pub name: Option<String>,
    /// Image reference.
    pub image: String,
    /// Entrypoint; empty means the image default.
    pub entrypoint: Vec<String>,
    /// Entrypoint arguments.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Identity labels (see [`crate::labels`]).
    pub labels: BTreeMap<String, String>,
    /// Named volume mounts.
    pub mounts: Vec<MountSpec>,
    /// Port bindings.
    pub ports: Vec<PortSpec>,
}

/// Normalized observed container state.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    /// Platform-assigned id (Docker container id, pod name).
    pub id: String,
    /// Labels on the container.
    pub labels: BTreeMap<String, String>,
    /// Current image reference.
    pub image: String,
    /// Configured entrypoint.
    pub entrypoint: Vec<String>,
    /// Configured arguments.
    pub args: Vec<String>,
    /// Configured environment.
    pub env: Vec<(String, String)>,
    /// Observed mounts.
    pub mounts: Vec<MountInfo>,
    /// Observed port bindings.
    pub ports: Vec<PortSpec>,
    /// Whether the workload is currently running.
    pub running: bool,
}

impl ContainerInfo {
    /// Value of one label, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Normalized observed volume state.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    /// Platform volume name (PVC name on the cluster backend).
    pub name: String,
    /// Labels on the volume.
    pub labels: BTreeMap<String, String>,
}

/// One chunk of live exec output, forwarded while the remote process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// A chunk of standard output.
    Stdout(String),
    /// A chunk of standard error.
    Stderr(String),
}

/// Command to execute inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    /// Argv of the remote process.
    pub command: Vec<String>,
    /// Extra environment for the remote process.
    pub env: Vec<(String, String)>,
    /// Working directory for the remote process.
    pub working_dir: Option<String>,
    /// Allocate a TTY.
    pub tty: bool,
}

/// Collected output of a finished exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Collected standard output.
    pub stdout: String,
    /// Collected standard error.
    pub stderr: String,
    /// Remote process exit code.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Whether the remote process exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Workload CRUD capability.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Pull an image. A no-op on backends where the node pulls on schedule.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// List all containers the backend can see, managed or not, normalized.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Create and start a container from a desired spec; returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Block until the container reaches a terminal state; returns the exit
    /// code. Callers bound this with a timeout where one is required.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Stream container logs; `follow` keeps the stream open until dropped.
    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream>;

    /// Unpack a tar archive into `dest_path` inside the container.
    async fn upload_archive(&self, id: &str, dest_path: &str, archive: Bytes) -> Result<()>;
}

/// Named volume capability.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// List all volumes the backend can see, with their labels.
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Create a labeled volume; `size` is honored where the platform supports
    /// sized volumes. Returns the platform name.
    async fn create_volume(
        &self,
        name: &str,
        size: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Remove a volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// In-container command execution capability.
#[async_trait]
pub trait Execer: Send + Sync {
    /// Run a command inside a container, blocking until the remote process
    /// exits. Output is collected into the returned [`ExecOutput`]; when
    /// `live` is given, chunks are also forwarded as they arrive.
    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        live: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput>;
}

/// The full runtime client facade: everything the component adapter needs
/// from a platform.
pub trait Runtime: ContainerStore + VolumeStore + Execer {}

impl<T: ContainerStore + VolumeStore + Execer> Runtime for T {}
