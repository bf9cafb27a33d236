//! In-memory runtime for tests.
//!
//! A deterministic [`Runtime`] implementation holding containers and volumes
//! in memory. Every mutating call is recorded as an [`Op`], so tests can
//! assert not just end state but the exact side effects a reconciliation pass
//! produced (or, for idempotence, did not produce). Exec exit codes can be
//! scripted per command substring.
//!
//! [`Runtime`]: crate::runtime::Runtime

use crate::runtime::{
    ContainerInfo, ContainerSpec, ContainerStore, ExecOutput, ExecSpec, Execer, LogStream,
    MountInfo, MountKind, OutputChunk, Result, RuntimeError, VolumeInfo, VolumeStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One recorded side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// An image pull.
    PullImage(String),
    /// A container creation (records the assigned id).
    CreateContainer(String),
    /// A container removal.
    RemoveContainer(String),
    /// A wait-for-terminal call.
    WaitContainer(String),
    /// A volume creation.
    CreateVolume(String),
    /// A volume removal.
    RemoveVolume(String),
    /// An exec invocation.
    Exec {
        /// Target container id.
        container: String,
        /// Remote argv.
        command: Vec<String>,
    },
    /// An archive upload.
    UploadArchive {
        /// Target container id.
        container: String,
        /// Destination path inside the container.
        dest: String,
    },
}

#[derive(Default)]
struct State {
    containers: Vec<ContainerInfo>,
    volumes: Vec<VolumeInfo>,
    ops: Vec<Op>,
    exec_exit_codes: Vec<(String, i64)>,
    wait_exit_code: i64,
    next_id: u64,
}

/// Deterministic in-memory runtime backing the test suite.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    /// Fresh empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded side effects, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Recorded side effects matching a predicate.
    pub fn ops_where(&self, predicate: impl Fn(&Op) -> bool) -> Vec<Op> {
        self.ops().into_iter().filter(|op| predicate(op)).collect()
    }

    /// Forget recorded side effects (state is kept). Useful between pushes.
    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    /// Snapshot of current containers.
    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.state.lock().unwrap().containers.clone()
    }

    /// Snapshot of current volumes.
    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.state.lock().unwrap().volumes.clone()
    }

    /// Preseed an observed container (e.g. a foreign, unmanaged one).
    pub fn add_container(&self, info: ContainerInfo) {
        self.state.lock().unwrap().containers.push(info);
    }

    /// Preseed an observed volume.
    pub fn add_volume(&self, name: &str, labels: BTreeMap<String, String>) {
        self.state.lock().unwrap().volumes.push(VolumeInfo {
            name: name.to_string(),
            labels,
        });
    }

    /// Mount an extra volume into an existing container, as external
    /// interference would.
    pub fn attach_volume(&self, container_id: &str, volume: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.iter_mut().find(|c| c.id == container_id) {
            container.mounts.push(MountInfo {
                name: volume.to_string(),
                target: target.to_string(),
                kind: MountKind::Volume,
            });
        }
    }

    /// Script the exit code of any exec whose joined argv contains `needle`.
    pub fn set_exec_exit_code(&self, needle: &str, exit_code: i64) {
        self.state
            .lock()
            .unwrap()
            .exec_exit_codes
            .push((needle.to_string(), exit_code));
    }

    /// Script the exit code returned by `wait_container`.
    pub fn set_wait_exit_code(&self, exit_code: i64) {
        self.state.lock().unwrap().wait_exit_code = exit_code;
    }
}

#[async_trait]
impl ContainerStore for FakeRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::PullImage(image.to_string()));
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("fake-{}", state.next_id));

        let info = ContainerInfo {
            id: id.clone(),
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
        };
        state.containers.push(info);
        state.ops.push(Op::CreateContainer(id.clone()));
        Ok(id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(RuntimeError::NotFound {
                kind: "container",
                name: id.to_string(),
            });
        }
        state.ops.push(Op::RemoveContainer(id.to_string()));
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::WaitContainer(id.to_string()));
        if let Some(container) = state.containers.iter_mut().find(|c| c.id == id) {
            container.running = false;
        }
        Ok(state.wait_exit_code)
    }

    async fn container_logs(&self, _id: &str, _follow: bool) -> Result<LogStream> {
        Ok(Box::pin(tokio::io::empty()))
    }

    async fn upload_archive(&self, id: &str, dest_path: &str, _archive: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::UploadArchive {
            container: id.to_string(),
            dest: dest_path.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl VolumeStore for FakeRuntime {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self.volumes())
    }

    async fn create_volume(
        &self,
        name: &str,
        _size: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.volumes.push(VolumeInfo {
            name: name.to_string(),
            labels: labels.clone(),
        });
        state.ops.push(Op::CreateVolume(name.to_string()));
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.volumes.len();
        state.volumes.retain(|v| v.name != name);
        if state.volumes.len() == before {
            return Err(RuntimeError::NotFound {
                kind: "volume",
                name: name.to_string(),
            });
        }
        state.ops.push(Op::RemoveVolume(name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Execer for FakeRuntime {
    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        live: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.iter().any(|c| c.id == container_id) {
            return Err(RuntimeError::NotFound {
                kind: "container",
                name: container_id.to_string(),
            });
        }
        state.ops.push(Op::Exec {
            container: container_id.to_string(),
            command: spec.command.clone(),
        });

        let joined = spec.command.join(" ");
        let exit_code = state
            .exec_exit_codes
            .iter()
            .find(|(needle, _)| joined.contains(needle))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        drop(state);

        if let Some(sender) = live {
            let _ = sender.send(OutputChunk::Stdout(format!("{}\n", joined)));
        }

        Ok(ExecOutput {
            stdout: format!("{}\n", joined),
            stderr: String::new(),
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_list_containers() {
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec {
            image: "alpine".to_string(),
            labels: crate::labels::unit_labels("web", "runtime"),
            ..Default::default()
        };
        let id = runtime.create_container(&spec).await.unwrap();
        let listed = runtime.list_containers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(listed[0].running);
    }

    #[tokio::test]
    async fn test_scripted_exec_exit_code() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .create_container(&ContainerSpec {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        runtime.set_exec_exit_code("false", 1);
        let spec = ExecSpec {
            command: vec!["sh".to_string(), "-c".to_string(), "false".to_string()],
            ..Default::default()
        };
        let output = runtime.exec(&id, &spec, None).await.unwrap();
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn test_remove_missing_volume_is_not_found() {
        let runtime = FakeRuntime::new();
        assert!(matches!(
            runtime.remove_volume("nope").await,
            Err(RuntimeError::NotFound { .. })
        ));
    }
}
