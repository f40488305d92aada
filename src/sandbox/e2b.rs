//! E2B sandbox provider — third-party cloud sandbox service.
//!
//! Same thin-`reqwest`-client shape as `vercel.rs`; E2B's API keys go in
//! an `X-API-Key` header rather than a bearer token, and sandboxes are
//! addressed by `sandboxID` in the response body.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::{AgentInvocation, ExecutionStream, SandboxHandle, SandboxProvider};
use crate::errors::ProviderError;
use crate::task::{SandboxProviderKind, TaskId};

const DEFAULT_BASE_URL: &str = "https://api.e2b.dev/sandboxes";

pub struct E2bSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl E2bSandboxProvider {
    pub fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url: DEFAULT_BASE_URL.to_string(), api_key }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn create_sandbox(&self, task_id: &TaskId, repo_url: &str) -> Result<SandboxHandle, ProviderError> {
        let request = CreateRequest { repo_url };
        let resp = self
            .client
            .post(&self.base_url)
            .header("X-API-Key", &self.api_key)
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
            provider: SandboxProviderKind::E2b,
            domain: None,
            native_id: resp.sandbox_id,
            created_at: chrono::Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "repoUrl")]
    repo_url: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
}

#[derive(Serialize)]
struct ExecRequest {
    cmd: Vec<String>,
    envs: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct ExecResponse {
    stdout: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

#[async_trait]
impl SandboxProvider for E2bSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::E2b
    }

    async fn create(&self, task_id: &TaskId, repo_url: &str, timeout: Duration) -> Result<SandboxHandle, ProviderError> {
        match tokio::time::timeout(timeout, self.create_sandbox(task_id, repo_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn run_shell(&self, handle: &SandboxHandle, cmd: Vec<String>) -> Result<super::ShellOutput, ProviderError> {
        let url = format!("{}/{}/exec", self.base_url, handle.native_id);
        let request = ExecRequest { cmd, envs: Default::default() };
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .json::<ExecResponse>()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
        Ok(super::ShellOutput { stdout: resp.stdout, exit_code: resp.exit_code })
    }

    async fn execute_agent(&self, handle: &SandboxHandle, invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError> {
        let url = format!("{}/{}/exec", self.base_url, handle.native_id);
        let request = ExecRequest { cmd: invocation.agent_command, envs: invocation.env };

        let (line_tx, line_rx) = mpsc::channel(1000);
        let (exit_tx, exit_rx) = oneshot::channel();
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let result = async {
                let resp = client
                    .post(&url)
                    .header("X-API-Key", &api_key)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .json::<ExecResponse>()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                for line in resp.stdout.lines() {
                    if line_tx.send(line.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(resp.exit_code)
            }
            .await;
            let _ = exit_tx.send(result);
        });

        Ok(ExecutionStream { lines: line_rx, exit: exit_rx })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let url = format!("{}/{}", self.base_url, handle.native_id);
        let resp = self.client.delete(&url).header("X-API-Key", &self.api_key).send().await;
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
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
