//! Docker sandbox provider — local container execution.
//!
//! Generalizes `factory::sandbox::DockerSandbox` from "run this project's
//! pipeline command with the project directory bind-mounted" to "clone an
//! arbitrary repo into an ephemeral container, then exec the agent CLI
//! inside it". Container lifecycle (create/start/logs-stream/stop/remove),
//! image pull-if-missing, memory/cpu limits, and label-based pruning are
//! carried over verbatim in spirit; only the command construction and the
//! repo-provisioning step (done here via `git clone` exec'd in-container,
//! since there is no local project checkout to bind-mount) differ.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use super::{AgentInvocation, ExecutionStream, SandboxHandle, SandboxProvider};
use crate::errors::ProviderError;
use crate::task::{SandboxProviderKind, TaskId};

const LABEL: &str = "taskforge.sandbox";
const DEFAULT_MEMORY_BYTES: i64 = 4 * 1_073_741_824;
const DEFAULT_NANO_CPUS: i64 = 2_000_000_000;

pub struct DockerSandboxProvider {
    docker: Docker,
    default_image: String,
}

impl DockerSandboxProvider {
    pub async fn connect(default_image: impl Into<String>) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker, default_image: default_image.into() })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ProviderError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| ProviderError::CreateFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Run a command to completion inside the container and return its
    /// combined stdout+stderr plus exit code. Used for the clone/checkout/
    /// commit-push steps that must finish before the pipeline proceeds.
    async fn exec_sync(&self, container_id: &str, cmd: Vec<&str>) -> Result<(String, i32), ProviderError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?
        {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| ProviderError::CreateFailed(e.to_string()))?;
                output.push_str(&chunk.to_string());
            }
        }
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;
        Ok((output, inspect.exit_code.unwrap_or(0) as i32))
    }

    async fn create_and_clone(&self, task_id: &TaskId, repo_url: &str) -> Result<SandboxHandle, ProviderError> {
        self.ensure_image(&self.default_image).await?;

        let mut labels = HashMap::new();
        labels.insert(LABEL.to_string(), "true".to_string());
        labels.insert("taskforge.task-id".to_string(), task_id.clone());

        let host_config = HostConfig {
            memory: Some(DEFAULT_MEMORY_BYTES),
            nano_cpus: Some(DEFAULT_NANO_CPUS),
            mounts: Some(vec![Mount {
                target: Some("/workspace".to_string()),
                typ: Some(MountTypeEnum::TMPFS),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.default_image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = format!("taskforge-{task_id}");
        let response = self
            .docker
            .create_container(Some(CreateContainerOptions { name: &container_name, platform: None }), config)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        let (clone_output, clone_exit) = self
            .exec_sync(&response.id, vec!["git", "clone", repo_url, "."])
            .await?;
        if clone_exit != 0 {
            return Err(ProviderError::CreateFailed(format!("git clone failed: {clone_output}")));
        }

        Ok(SandboxHandle {
            task_id: task_id.clone(),
            provider: SandboxProviderKind::Docker,
            domain: None,
            native_id: response.id,
            created_at: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Docker
    }

    async fn create(&self, task_id: &TaskId, repo_url: &str, timeout: Duration) -> Result<SandboxHandle, ProviderError> {
        match tokio::time::timeout(timeout, self.create_and_clone(task_id, repo_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn run_shell(&self, handle: &SandboxHandle, cmd: Vec<String>) -> Result<super::ShellOutput, ProviderError> {
        let cmd: Vec<&str> = cmd.iter().map(String::as_str).collect();
        let (stdout, exit_code) = self.exec_sync(&handle.native_id, cmd).await?;
        Ok(super::ShellOutput { stdout, exit_code })
    }

    async fn execute_agent(&self, handle: &SandboxHandle, invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError> {
        let mut cmd_env: Vec<String> = invocation.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        cmd_env.sort();

        let cmd: Vec<&str> = invocation.agent_command.iter().map(String::as_str).collect();
        let exec = self
            .docker
            .create_exec(
                &handle.native_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(cmd_env.iter().map(String::as_str).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;

        let (line_tx, line_rx) = mpsc::channel(1000);
        let (exit_tx, exit_rx) = oneshot::channel();
        let docker = self.docker.clone();
        let exec_id = exec.id.clone();

        tokio::spawn(async move {
            let result = async {
                let started = docker
                    .start_exec(&exec_id, None)
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                if let StartExecResults::Attached { mut output, .. } = started {
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk.map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                        for line in chunk.to_string().lines() {
                            if line_tx.send(line.to_string()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let inspect = docker
                    .inspect_exec(&exec_id)
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                Ok(inspect.exit_code.unwrap_or(0) as i32)
            }
            .await;
            let _ = exit_tx.send(result);
        });

        Ok(ExecutionStream { lines: line_rx, exit: exit_rx })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let _ = self
            .docker
            .stop_container(&handle.native_id, Some(StopContainerOptions { t: 10 }))
            .await;
        self.docker
            .remove_container(&handle.native_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
            .map_err(|e| ProviderError::DestroyFailed(e.to_string()))
    }

    async fn is_alive(&self, handle: &SandboxHandle) -> bool {
        self.docker.inspect_container(&handle.native_id, None).await.is_ok()
    }
}

/// List containers this process started that are older than `max_age_secs`
/// and no longer tracked by the Sandbox Registry — the Docker leg of the
/// orphan sweep, generalizing `DockerSandbox::prune_stale_containers`.
pub async fn list_stale_container_ids(docker: &Docker, max_age_secs: i64) -> Result<Vec<String>, ProviderError> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![format!("{LABEL}=true")]);
    let containers = docker
        .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
        .await
        .map_err(|e| ProviderError::Other(e.into()))?;

    let now = chrono::Utc::now().timestamp();
    Ok(containers
        .into_iter()
        .filter(|c| now - c.created.unwrap_or(0) > max_age_secs)
        .filter_map(|c| c.id)
        .collect())
}
