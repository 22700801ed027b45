//! Container runtime access.
//!
//! [`ContainerRuntime`] is the slice of the runtime API the daemon needs:
//! container listing/inspection with normalized label and env maps, exec
//! with piped I/O, stop/start, and volume-consumer lookup. [`DockerClient`]
//! implements it over bollard and additionally exposes the filtered event
//! stream (which is not object-safe and only the watcher consumes).

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, EventMessage, MountPointTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::BackupError;
use crate::Result;

/// One container mount, as reported by inspect.
#[derive(Debug, Clone)]
pub struct MountInfo {
    /// Mount type: "volume", "bind", "tmpfs" or "other".
    pub kind: String,
    /// Volume name, for volume mounts.
    pub name: String,
    /// Host path backing the mount.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
}

impl MountInfo {
    pub fn is_volume(&self) -> bool {
        self.kind == "volume"
    }
}

/// Normalized container state used throughout the daemon.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub running: bool,
    pub mounts: Vec<MountInfo>,
}

/// Result of running a command inside a container.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout + stderr.
    pub output: String,
}

/// The runtime operations the coordinator and producers depend on. Keeping
/// this behind a trait lets tests drive them without a Docker daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists all running containers with full inspect data.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Inspects a single container.
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo>;

    /// Returns every container (running or not) that mounts the named
    /// volume.
    async fn containers_using_volume(&self, volume_name: &str) -> Result<Vec<ContainerInfo>>;

    /// Runs a command inside a container, optionally piping `stdin` to it,
    /// and returns the exit code with the combined output.
    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput>;

    /// Runs a command inside a container, streaming its stdout into `out`.
    /// Stderr is discarded. Returns the exit code.
    async fn exec_streamed(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i64>;

    /// Stops a container, waiting up to `timeout_secs` before the runtime
    /// kills it.
    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()>;

    /// Starts a stopped container.
    async fn start_container(&self, container_id: &str) -> Result<()>;
}

pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the Docker daemon and verifies the connection with a ping.
    pub async fn connect(host: &str) -> Result<Self> {
        let docker = if host.is_empty() {
            Docker::connect_with_local_defaults()?
        } else if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?
        };

        docker.ping().await?;

        Ok(Self { docker })
    }

    /// Container lifecycle events (start/stop/die) as a stream.
    pub fn events(
        &self,
    ) -> impl Stream<Item = std::result::Result<EventMessage, bollard::errors::Error>> + '_ {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string(), "die".to_string()],
        );

        self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        let mut result = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            // Skip containers that disappear between list and inspect.
            if let Ok(info) = self.inspect(&id).await {
                result.push(info);
            }
        }

        Ok(result)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let resp = self.docker.inspect_container(container_id, None).await?;
        Ok(normalize_inspect(container_id, resp))
    }

    async fn containers_using_volume(&self, volume_name: &str) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![volume_name.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut result = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            if let Ok(info) = self.inspect(&id).await {
                result.push(info);
            }
        }

        Ok(result)
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        if let StartExecResults::Attached { mut output, input } =
            self.docker.start_exec(&exec.id, None).await?
        {
            if let Some(data) = stdin {
                // Feed stdin from a separate task so a full pipe cannot
                // deadlock against the output reader.
                tokio::spawn(async move {
                    let mut input = input;
                    let _ = input.write_all(&data).await;
                    let _ = input.shutdown().await;
                });
            } else {
                drop(input);
            }

            while let Some(chunk) = output.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.extend_from_slice(&message);
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.extend_from_slice(&message);
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        stdout.extend_from_slice(&stderr);
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&stdout).into_owned(),
        })
    }

    async fn exec_streamed(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i64> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, input } =
            self.docker.start_exec(&exec.id, None).await?
        {
            drop(input);
            while let Some(chunk) = output.next().await {
                if let bollard::container::LogOutput::StdOut { message } = chunk? {
                    out.write_all(&message).await.map_err(BackupError::Io)?;
                }
            }
        }

        out.flush().await.map_err(BackupError::Io)?;

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }
}

fn normalize_inspect(container_id: &str, resp: ContainerInspectResponse) -> ContainerInfo {
    let name = resp
        .name
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();

    let labels = resp
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    let env = resp
        .config
        .as_ref()
        .and_then(|c| c.env.clone())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let running = resp
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);

    let mounts = resp
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|m| MountInfo {
            kind: match m.typ {
                Some(MountPointTypeEnum::VOLUME) => "volume".to_string(),
                Some(MountPointTypeEnum::BIND) => "bind".to_string(),
                Some(MountPointTypeEnum::TMPFS) => "tmpfs".to_string(),
                _ => "other".to_string(),
            },
            name: m.name.unwrap_or_default(),
            source: m.source.unwrap_or_default(),
            destination: m.destination.unwrap_or_default(),
        })
        .collect();

    ContainerInfo {
        id: resp.id.unwrap_or_else(|| container_id.to_string()),
        name,
        labels,
        env,
        running,
        mounts,
    }
}
