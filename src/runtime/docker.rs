//! Docker/Podman runtime backend.
//!
//! Implements the runtime facade over the bollard Docker API with automatic
//! connection handling and a Podman socket fallback. All observed state is
//! normalized through container inspection so the reconciler compares the
//! same vocabulary it writes.

use crate::runtime::{
    ContainerInfo, ContainerSpec, ContainerStore, ExecOutput, ExecSpec, Execer, LogStream,
    MountInfo, MountKind, OutputChunk, PortSpec, Result, RuntimeError, VolumeInfo, VolumeStore,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runtime backend over a local Docker or Podman daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect to the local container daemon.
    ///
    /// Tries the platform defaults first (Unix socket, `DOCKER_HOST`), then
    /// the rootless and system Podman sockets.
    ///
    /// # Errors
    ///
    /// Returns error if no daemon is reachable.
    pub async fn connect() -> Result<Self> {
        let docker = Self::connect_daemon().await?;
        let runtime = Self {
            docker: Arc::new(docker),
        };
        runtime
            .docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Other(format!("failed to ping container runtime: {}", e)))?;
        Ok(runtime)
    }

    /// Wrap an existing bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }

    async fn connect_daemon() -> Result<Docker> {
        debug!("attempting to connect to container runtime");
        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let podman_socket = format!("unix://{}/run/podman/podman.sock", home);
                debug!("trying Podman socket: {}", podman_socket);
                match Docker::connect_with_socket(&podman_socket, 120, bollard::API_DEFAULT_VERSION)
                {
                    Ok(docker) => {
                        info!("connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman rootless socket failed: {}", e);
                    }
                }
            }

            let system_socket = "unix:///run/podman/podman.sock";
            debug!("trying system Podman socket: {}", system_socket);
            match Docker::connect_with_socket(system_socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman system socket failed: {}", e);
                }
            }
        }

        Err(RuntimeError::Other(
            "failed to connect to Docker or Podman; ensure a container daemon is running"
                .to_string(),
        ))
    }

    /// Map daemon status codes onto the facade's distinct error variants.
    fn map_api_error(e: bollard::errors::Error, kind: &'static str, name: &str) -> RuntimeError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound {
                kind,
                name: name.to_string(),
            },
            bollard::errors::Error::DockerResponseServerError {
                status_code: 403, ..
            } => RuntimeError::Forbidden {
                kind,
                name: name.to_string(),
            },
            e => RuntimeError::Api(e),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(
                id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| Self::map_api_error(e, "container", id))?;

        let config = inspect.config.unwrap_or_default();
        let env = config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let mounts = inspect
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                let kind = match m.typ {
                    Some(bollard::models::MountPointTypeEnum::VOLUME) => MountKind::Volume,
                    _ => MountKind::Bind,
                };
                MountInfo {
                    name: m.name.or(m.source).unwrap_or_default(),
                    target: m.destination.unwrap_or_default(),
                    kind,
                }
            })
            .collect();

        let mut ports = Vec::new();
        if let Some(bindings) = inspect.host_config.and_then(|hc| hc.port_bindings) {
            for (container_port, host_bindings) in bindings {
                let Some(port) = container_port
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                for binding in host_bindings.unwrap_or_default() {
                    ports.push(PortSpec {
                        container_port: port,
                        host_ip: binding.host_ip,
                        host_port: binding.host_port.and_then(|p| p.parse().ok()),
                    });
                }
            }
        }

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            labels: config
                .labels
                .unwrap_or_default()
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            image: config.image.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            args: config.cmd.unwrap_or_default(),
            env,
            mounts,
            ports,
            running: inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or(false),
        })
    }
}

#[async_trait]
impl ContainerStore for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("pull status: {}", status);
                    }
                }
                Err(e) => return Err(RuntimeError::Api(e)),
            }
        }
        debug!("pulled image {}", image);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let summaries = self
            .docker
            .list_containers(Some(bollard::container::ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(info) => containers.push(info),
                // A container can disappear between list and inspect.
                Err(RuntimeError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.volume.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            if port.host_port.is_some() {
                port_bindings.entry(key).or_default().get_or_insert_with(Vec::new).push(
                    PortBinding {
                        host_ip: port.host_ip.clone(),
                        host_port: port.host_port.map(|p| p.to_string()),
                    },
                );
            }
        }

        let config = bollard::container::Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: (!env.is_empty()).then_some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: (!mounts.is_empty()).then_some(mounts),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!("creating container for image {}", spec.image);
        let options = spec
            .name
            .as_deref()
            .map(|name| bollard::container::CreateContainerOptions {
                name,
                ..Default::default()
            });
        let response = self.docker.create_container(options, config).await?;

        self.docker
            .start_container(
                &response.id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;

        info!("started container {} ({})", &response.id[..12.min(response.id.len())], spec.image);
        Ok(response.id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        debug!("removing container {}", id);
        self.docker
            .remove_container(
                id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Self::map_api_error(e, "container", id))?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            id,
            Some(bollard::container::WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let mut exit_code = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => exit_code = response.status_code,
                // The daemon reports a non-zero exit as a wait error.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Ok(code);
                }
                Err(e) => return Err(RuntimeError::Api(e)),
            }
        }
        Ok(exit_code)
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let stream = self.docker.logs(
            id,
            Some(bollard::container::LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let bytes_stream = stream.map(|chunk| {
            chunk
                .map(|log| log.into_bytes())
                .map_err(std::io::Error::other)
        });
        Ok(Box::pin(tokio_util::io::StreamReader::new(bytes_stream)))
    }

    async fn upload_archive(&self, id: &str, dest_path: &str, archive: Bytes) -> Result<()> {
        debug!("uploading archive to {} at {}", id, dest_path);
        self.docker
            .upload_to_container(
                id,
                Some(bollard::container::UploadToContainerOptions {
                    path: dest_path,
                    ..Default::default()
                }),
                bollard::body_full(archive),
            )
            .await
            .map_err(|e| Self::map_api_error(e, "container", id))?;
        Ok(())
    }
}

#[async_trait]
impl VolumeStore for DockerRuntime {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let response = self
            .docker
            .list_volumes(None::<bollard::volume::ListVolumesOptions<String>>)
            .await?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name,
                labels: v.labels.into_iter().collect(),
            })
            .collect())
    }

    async fn create_volume(
        &self,
        name: &str,
        _size: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        // Local named volumes are unsized; the size hint only applies on the
        // cluster backend.
        let labels: HashMap<&str, &str> = labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let response = self
            .docker
            .create_volume(bollard::volume::CreateVolumeOptions {
                name,
                driver: "local",
                driver_opts: HashMap::new(),
                labels,
            })
            .await?;

        info!("created volume {}", response.name);
        Ok(response.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        debug!("removing volume {}", name);
        self.docker
            .remove_volume(name, Some(bollard::volume::RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| Self::map_api_error(e, "volume", name))?;
        Ok(())
    }
}

#[async_trait]
impl Execer for DockerRuntime {
    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        live: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        debug!("executing {:?} in container {}", spec.command, container_id);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(spec.command.clone()),
                    env: (!env.is_empty()).then_some(env),
                    working_dir: spec.working_dir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_api_error(e, "container", container_id))?;

        let start = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match start {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(result) = output.next().await {
                    match result {
                        Ok(log) => {
                            let text = log.to_string();
                            match log {
                                bollard::container::LogOutput::StdOut { .. } => {
                                    stdout.push_str(&text);
                                    if let Some(sender) = &live {
                                        let _ = sender.send(OutputChunk::Stdout(text));
                                    }
                                }
                                bollard::container::LogOutput::StdErr { .. } => {
                                    stderr.push_str(&text);
                                    if let Some(sender) = &live {
                                        let _ = sender.send(OutputChunk::Stderr(text));
                                    }
                                }
                                _ => {}
                            }
                        }
                        Err(e) => {
                            return Err(RuntimeError::Exec(format!(
                                "failed to read exec output: {}",
                                e
                            )));
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Exec("unexpected detached execution".to_string()));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!("exec finished with exit code {}", exit_code);

        if exit_code != 0 && !stderr.is_empty() {
            warn!("exec stderr: {}", stderr.trim_end());
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
