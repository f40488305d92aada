//! Daytona sandbox provider — third-party cloud workspace service.
//!
//! Same thin-`reqwest`-client shape as `vercel.rs`/`e2b.rs`; Daytona calls
//! its instances "workspaces" and returns a `workspaceId`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::{AgentInvocation, ExecutionStream, SandboxHandle, SandboxProvider};
use crate::errors::ProviderError;
use crate::task::{SandboxProviderKind, TaskId};

const DEFAULT_BASE_URL: &str = "https://app.daytona.io/api/workspaces";

pub struct DaytonaSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DaytonaSandboxProvider {
    pub fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url: DEFAULT_BASE_URL.to_string(), api_key }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn create_workspace(&self, task_id: &TaskId, repo_url: &str) -> Result<SandboxHandle, ProviderError> {
        let request = CreateRequest { git_url: repo_url };
        let resp = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?
            .json::<CreateResponse>()
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        Ok(SandboxHandle {
            task_id: task_id.clone(),
            provider: SandboxProviderKind::Daytona,
            domain: resp.url,
            native_id: resp.workspace_id,
            created_at: chrono::Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "gitUrl")]
    git_url: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    url: Option<String>,
}

#[derive(Serialize)]
struct ExecRequest {
    command: Vec<String>,
    env: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct ExecResponse {
    result: String,
    code: i32,
}

#[async_trait]
impl SandboxProvider for DaytonaSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Daytona
    }

    async fn create(&self, task_id: &TaskId, repo_url: &str, timeout: Duration) -> Result<SandboxHandle, ProviderError> {
        match tokio::time::timeout(timeout, self.create_workspace(task_id, repo_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn run_shell(&self, handle: &SandboxHandle, cmd: Vec<String>) -> Result<super::ShellOutput, ProviderError> {
        let url = format!("{}/{}/toolbox/process/execute", self.base_url, handle.native_id);
        let request = ExecRequest { command: cmd, env: Default::default() };
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .json::<ExecResponse>()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
        Ok(super::ShellOutput { stdout: resp.result, exit_code: resp.code })
    }

    async fn execute_agent(&self, handle: &SandboxHandle, invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError> {
        let url = format!("{}/{}/toolbox/process/execute", self.base_url, handle.native_id);
        let request = ExecRequest { command: invocation.agent_command, env: invocation.env };

        let (line_tx, line_rx) = mpsc::channel(1000);
        let (exit_tx, exit_rx) = oneshot::channel();
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let result = async {
                let resp = client
                    .post(&url)
                    .bearer_auth(&api_key)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .json::<ExecResponse>()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                for line in resp.result.lines() {
                    if line_tx.send(line.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(resp.code)
            }
            .await;
            let _ = exit_tx.send(result);
        });

        Ok(ExecutionStream { lines: line_rx, exit: exit_rx })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let url = format!("{}/{}", self.base_url, handle.native_id);
        let resp = self.client.delete(&url).bearer_auth(&self.api_key).send().await;
        match resp {
            Ok(r) if r.status().is_success() || r.status() == reqwest::StatusCode::NOT_FOUND => Ok(()),
            Ok(r) => Err(ProviderError::DestroyFailed(format!("status {}", r.status()))),
            Err(e) => Err(ProviderError::DestroyFailed(e.to_string())),
        }
    }

    async fn is_alive(&self, handle: &SandboxHandle) -> bool {
        let url = format!("{}/{}", self.base_url, handle.native_id);
        self.client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
