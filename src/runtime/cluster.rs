//! Kubernetes runtime backend.
//!
//! Maps the runtime facade onto a single namespace: each declared container
//! unit becomes one labeled pod, declared volumes become persistent volume
//! claims, and exec rides the pod attach websocket. Image pulls are the
//! kubelet's job, so `pull_image` is a no-op here.
//!
//! Desired port bindings have no observable counterpart on a pod, so they are
//! recorded in a pod annotation at create time and read back during
//! normalization; the platform-agnostic diff then compares exactly what the
//! create path wrote.

use crate::runtime::{
    ContainerInfo, ContainerSpec, ContainerStore, ExecOutput, ExecSpec, Execer, LogStream,
    MountInfo, MountKind, OutputChunk, PortSpec, Result, RuntimeError, VolumeInfo, VolumeStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Annotation carrying the desired port bindings of a managed pod.
const PORTS_ANNOTATION: &str = "devpush.io/port-bindings";

/// Name of the single container inside a managed pod.
const POD_CONTAINER_NAME: &str = "runtime";

/// Runtime backend over a Kubernetes namespace.
#[derive(Clone)]
pub struct ClusterRuntime {
    client: Client,
    namespace: String,
}

impl ClusterRuntime {
    /// Connect using the ambient kubeconfig/in-cluster configuration.
    /// Credential handling itself is the environment's responsibility.
    ///
    /// # Errors
    ///
    /// Returns error if no cluster configuration can be inferred.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn map_api_error(e: kube::Error, kind: &'static str, name: &str) -> RuntimeError {
        match &e {
            kube::Error::Api(response) if response.code == 404 => RuntimeError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(response) if response.code == 403 => RuntimeError::Forbidden {
                kind,
                name: name.to_string(),
            },
            _ => RuntimeError::Cluster(e),
        }
    }

    fn normalize(pod: &Pod) -> ContainerInfo {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let labels: BTreeMap<String, String> = pod.metadata.labels.clone().unwrap_or_default();

        let spec = pod.spec.as_ref();
        let container = spec.and_then(|s| s.containers.first());

        // Resolve each volume mount back to the PVC it binds, if any.
        let claim_by_volume: BTreeMap<String, String> = spec
            .map(|s| {
                s.volumes
                    .iter()
                    .flatten()
                    .filter_map(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .map(|pvc| (v.name.clone(), pvc.claim_name.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mounts = container
            .and_then(|c| c.volume_mounts.as_ref())
            .map(|mounts| {
                mounts
                    .iter()
                    .map(|m| match claim_by_volume.get(&m.name) {
                        Some(claim) => MountInfo {
                            name: claim.clone(),
                            target: m.mount_path.clone(),
                            kind: MountKind::Volume,
                        },
                        None => MountInfo {
                            name: m.name.clone(),
                            target: m.mount_path.clone(),
                            kind: MountKind::Bind,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ports = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PORTS_ANNOTATION))
            .and_then(|json| serde_json::from_str::<Vec<PortSpec>>(json).ok())
            .unwrap_or_else(|| {
                container
                    .and_then(|c| c.ports.as_ref())
                    .map(|ports| {
                        ports
                            .iter()
                            .map(|p| PortSpec {
                                container_port: p.container_port as u16,
                                host_ip: None,
                                host_port: None,
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            });

        let env = container
            .and_then(|c| c.env.as_ref())
            .map(|env| {
                env.iter()
                    .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        ContainerInfo {
            id: name,
            labels,
            image: container
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            entrypoint: container
                .and_then(|c| c.command.clone())
                .unwrap_or_default(),
            args: container.and_then(|c| c.args.clone()).unwrap_or_default(),
            env,
            mounts,
            ports,
            running: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running"),
        }
    }

    fn build_pod(spec: &ContainerSpec) -> (String, Pod) {
        let name = spec.name.clone().unwrap_or_else(|| {
            let alias = spec
                .labels
                .get(crate::labels::ALIAS)
                .cloned()
                .unwrap_or_else(|| "workload".to_string());
            let component = spec
                .labels
                .get(crate::labels::COMPONENT)
                .cloned()
                .unwrap_or_else(|| "devpush".to_string());
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}-{}", component, alias, &suffix[..8])
        });

        let volumes: Vec<Volume> = spec
            .mounts
            .iter()
            .map(|m| Volume {
                name: m.volume.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: m.volume.clone(),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect();

        let volume_mounts: Vec<VolumeMount> = spec
            .mounts
            .iter()
            .map(|m| VolumeMount {
                name: m.volume.clone(),
                mount_path: m.target.clone(),
                ..Default::default()
            })
            .collect();

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                value_from: None,
            })
            .collect();

        let ports: Vec<ContainerPort> = spec
            .ports
            .iter()
            .map(|p| ContainerPort {
                container_port: i32::from(p.container_port),
                ..Default::default()
            })
            .collect();

        let mut annotations = BTreeMap::new();
        if let Ok(json) = serde_json::to_string(&spec.ports) {
            annotations.insert(PORTS_ANNOTATION.to_string(), json);
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(spec.labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: POD_CONTAINER_NAME.to_string(),
                    image: Some(spec.image.clone()),
                    command: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
                    args: (!spec.args.is_empty()).then(|| spec.args.clone()),
                    working_dir: spec.working_dir.clone(),
                    env: (!env.is_empty()).then_some(env),
                    volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
                    ports: (!ports.is_empty()).then_some(ports),
                    ..Default::default()
                }],
                volumes: (!volumes.is_empty()).then_some(volumes),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        (name, pod)
    }

    /// Shell-quote one argv element for transport through `sh -c`.
    fn quote(arg: &str) -> String {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }

    /// The pod exec endpoint has no working-dir or env parameters, so wrap
    /// the command in a shell when either is requested.
    fn shell_command(spec: &ExecSpec) -> Vec<String> {
        if spec.env.is_empty() && spec.working_dir.is_none() {
            return spec.command.clone();
        }

        let mut line = String::new();
        for (key, value) in &spec.env {
            line.push_str(&format!("export {}={} && ", key, Self::quote(value)));
        }
        if let Some(dir) = &spec.working_dir {
            line.push_str(&format!("cd {} && ", Self::quote(dir)));
        }
        line.push_str(
            &spec
                .command
                .iter()
                .map(|a| Self::quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        );

        vec!["sh".to_string(), "-c".to_string(), line]
    }

    fn exit_code_from_status(status: Option<Status>) -> i64 {
        let Some(status) = status else {
            return -1;
        };
        if status.status.as_deref() == Some("Success") {
            return 0;
        }
        status
            .details
            .and_then(|details| {
                details.causes.and_then(|causes| {
                    causes
                        .iter()
                        .find(|c| c.reason.as_deref() == Some("ExitCode"))
                        .and_then(|c| c.message.as_ref())
                        .and_then(|m| m.parse().ok())
                })
            })
            .unwrap_or(1)
    }

    async fn drain<R>(
        mut reader: R,
        stderr: bool,
        live: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> String
    where
        R: AsyncRead + Unpin,
    {
        let mut collected = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    collected.push_str(&text);
                    if let Some(sender) = &live {
                        let chunk = if stderr {
                            OutputChunk::Stderr(text)
                        } else {
                            OutputChunk::Stdout(text)
                        };
                        let _ = sender.send(chunk);
                    }
                }
            }
        }
        collected
    }
}

#[async_trait]
impl ContainerStore for ClusterRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        // The kubelet pulls on pod schedule.
        debug!("image pull of {} delegated to the cluster", image);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let pods = self.pods().list(&ListParams::default()).await?;
        Ok(pods.items.iter().map(Self::normalize).collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let (name, pod) = Self::build_pod(spec);
        debug!("creating pod {} for image {}", name, spec.image);
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Self::map_api_error(e, "pod", &name))?;
        info!("created pod {}", name);
        Ok(name)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        debug!("deleting pod {}", id);
        self.pods()
            .delete(id, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_api_error(e, "pod", id))?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        // Callers bound this loop with their own timeout.
        loop {
            let pod = self
                .pods()
                .get(id)
                .await
                .map_err(|e| Self::map_api_error(e, "pod", id))?;

            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();

            if phase == "Succeeded" || phase == "Failed" {
                let exit_code = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .and_then(|statuses| statuses.first())
                    .and_then(|status| status.state.as_ref())
                    .and_then(|state| state.terminated.as_ref())
                    .map(|terminated| i64::from(terminated.exit_code))
                    .unwrap_or(if phase == "Succeeded" { 0 } else { 1 });
                return Ok(exit_code);
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let params = kube::api::LogParams {
            follow,
            ..Default::default()
        };
        let stream = self
            .pods()
            .log_stream(id, &params)
            .await
            .map_err(|e| Self::map_api_error(e, "pod", id))?;
        Ok(Box::pin(stream.compat()))
    }

    async fn upload_archive(&self, id: &str, dest_path: &str, archive: Bytes) -> Result<()> {
        debug!("uploading archive to pod {} at {}", id, dest_path);
        let params = AttachParams::default()
            .stdin(true)
            .stdout(false)
            .stderr(true);
        let mut attached = self
            .pods()
            .exec(
                id,
                vec!["tar", "xmf", "-", "-C", dest_path],
                &params,
            )
            .await
            .map_err(|e| Self::map_api_error(e, "pod", id))?;

        let mut stdin = attached
            .stdin()
            .ok_or_else(|| RuntimeError::Exec("archive upload stdin unavailable".to_string()))?;
        stdin
            .write_all(&archive)
            .await
            .map_err(|e| RuntimeError::Exec(format!("archive upload failed: {}", e)))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| RuntimeError::Exec(format!("archive upload failed: {}", e)))?;
        drop(stdin);

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| RuntimeError::Exec(format!("archive unpack failed: {}", e)))?;

        let exit_code = Self::exit_code_from_status(status);
        if exit_code != 0 {
            return Err(RuntimeError::Exec(format!(
                "archive unpack exited with code {}",
                exit_code
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeStore for ClusterRuntime {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let claims = self.pvcs().list(&ListParams::default()).await?;
        Ok(claims
            .items
            .into_iter()
            .map(|claim| VolumeInfo {
                name: claim.metadata.name.unwrap_or_default(),
                labels: claim.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_volume(
        &self,
        name: &str,
        size: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_string(),
            Quantity(size.unwrap_or("1Gi").to_string()),
        );

        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pvcs()
            .create(&PostParams::default(), &claim)
            .await
            .map_err(|e| Self::map_api_error(e, "volume", name))?;
        info!("created persistent volume claim {}", name);
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        debug!("deleting persistent volume claim {}", name);
        self.pvcs()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_api_error(e, "volume", name))?;
        Ok(())
    }
}

#[async_trait]
impl Execer for ClusterRuntime {
    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        live: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        let command = Self::shell_command(spec);
        debug!("executing {:?} in pod {}", command, container_id);

        // A TTY merges stderr into stdout on the attach endpoint.
        let params = AttachParams::default()
            .stdout(true)
            .stderr(!spec.tty)
            .tty(spec.tty);
        let mut attached = self
            .pods()
            .exec(container_id, command, &params)
            .await
            .map_err(|e| Self::map_api_error(e, "pod", container_id))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();

        let stdout_task = async {
            match stdout_reader {
                Some(reader) => Self::drain(reader, false, live.clone()).await,
                None => String::new(),
            }
        };
        let stderr_task = async {
            match stderr_reader {
                Some(reader) => Self::drain(reader, true, live.clone()).await,
                None => String::new(),
            }
        };
        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| RuntimeError::Exec(format!("exec transport failed: {}", e)))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: Self::exit_code_from_status(status),
        })
    }
}
