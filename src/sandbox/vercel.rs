//! Vercel sandbox provider — cloud-managed compute.
//!
//! A thin `reqwest` client against Vercel's Sandbox REST API, following
//! the typed-request/typed-response-plus-auth-header shape
//! `factory::github::request_device_code`/`poll_for_token` use for
//! GitHub's REST and device-flow endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::{AgentInvocation, ExecutionStream, SandboxHandle, SandboxProvider};
use crate::errors::ProviderError;
use crate::task::{SandboxProviderKind, TaskId};

const DEFAULT_BASE_URL: &str = "https://api.vercel.com/v1/sandboxes";

pub struct VercelSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    team_id: Option<String>,
}

impl VercelSandboxProvider {
    pub fn new(token: String, team_id: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: DEFAULT_BASE_URL.to_string(), token, team_id }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(&self.token);
        match &self.team_id {
            Some(team_id) => builder.query(&[("teamId", team_id)]),
            None => builder,
        }
    }

    async fn create_sandbox(&self, task_id: &TaskId, repo_url: &str) -> Result<SandboxHandle, ProviderError> {
        let request = CreateRequest { source: SourceRepo { url: repo_url } };
        let resp = self
            .authed(self.client.post(&self.base_url).json(&request))
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
            provider: SandboxProviderKind::Vercel,
            domain: resp.domain,
            native_id: resp.sandbox_id,
            created_at: chrono::Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    source: SourceRepo<'a>,
}

#[derive(Serialize)]
struct SourceRepo<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "sandboxId")]
    sandbox_id: String,
    domain: Option<String>,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    cmd: &'a [String],
    env: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct ExecResponse {
    output: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

#[async_trait]
impl SandboxProvider for VercelSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Vercel
    }

    async fn create(&self, task_id: &TaskId, repo_url: &str, timeout: Duration) -> Result<SandboxHandle, ProviderError> {
        match tokio::time::timeout(timeout, self.create_sandbox(task_id, repo_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn run_shell(&self, handle: &SandboxHandle, cmd: Vec<String>) -> Result<super::ShellOutput, ProviderError> {
        let url = format!("{}/{}/exec", self.base_url, handle.native_id);
        let request = ExecRequest { cmd: &cmd, env: Default::default() };
        let resp = self
            .authed(self.client.post(&url).json(&request))
            .send()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
            .json::<ExecResponse>()
            .await
            .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
        Ok(super::ShellOutput { stdout: resp.output, exit_code: resp.exit_code })
    }

    async fn execute_agent(&self, handle: &SandboxHandle, invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError> {
        let url = format!("{}/{}/exec", self.base_url, handle.native_id);
        let request = ExecRequest { cmd: &invocation.agent_command, env: invocation.env };

        let (line_tx, line_rx) = mpsc::channel(1000);
        let (exit_tx, exit_rx) = oneshot::channel();
        let authed = self.authed(self.client.post(&url).json(&request));

        tokio::spawn(async move {
            let result = async {
                let resp = authed
                    .send()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?
                    .json::<ExecResponse>()
                    .await
                    .map_err(|e| ProviderError::AgentFailed(e.to_string()))?;
                for line in resp.output.lines() {
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
        let resp = self.authed(self.client.delete(&url)).send().await;
        match resp {
            Ok(r) if r.status().is_success() || r.status() == reqwest::StatusCode::NOT_FOUND => Ok(()),
            Ok(r) => Err(ProviderError::DestroyFailed(format!("status {}", r.status()))),
            Err(e) => Err(ProviderError::DestroyFailed(e.to_string())),
        }
    }

    async fn is_alive(&self, handle: &SandboxHandle) -> bool {
        let url = format!("{}/{}", self.base_url, handle.native_id);
        self.authed(self.client.get(&url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_vercel() {
        let provider = VercelSandboxProvider::new("token".into(), None);
        assert_eq!(provider.kind(), SandboxProviderKind::Vercel);
    }

    #[test]
    fn team_id_is_attached_as_query_param() {
        let provider = VercelSandboxProvider::new("token".into(), Some("team_123".into()));
        let builder = provider.authed(provider.client.get(&provider.base_url));
        let request = builder.build().unwrap();
        assert!(request.url().query().unwrap().contains("teamId=team_123"));
    }
}
