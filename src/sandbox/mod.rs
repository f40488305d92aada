//! Sandbox Provider Interface — abstraction over four concrete providers
//! (spec.md §4.3): one cloud-managed (Vercel), one local container
//! (Docker), and two third-party cloud services (E2B, Daytona).
//!
//! The trait shape follows `factory::agent_executor::TaskRunner`
//! (`async_trait`, one method per pipeline stage) generalized from a
//! single hardcoded provider to the four named in spec.md's
//! `sandboxProvider` domain.

pub mod daytona;
pub mod docker;
pub mod e2b;
pub mod registry;
pub mod vercel;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ProviderError;
use crate::task::{SandboxProviderKind, TaskId};

pub use registry::SandboxRegistry;

/// A live sandbox's process-wide identity, held by the `SandboxRegistry`
/// for out-of-band cancellation (spec.md §4.5). Not persisted — lost on
/// process restart, which the periodic orphan sweep accounts for.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub task_id: TaskId,
    pub provider: SandboxProviderKind,
    pub domain: Option<String>,
    /// Provider-native reference: a container id for Docker, a sandbox id
    /// for the cloud providers.
    pub native_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// What the Executor needs to invoke an agent once a sandbox exists and
/// the branch is checked out. Git configuration, branch checkout, and
/// dependency install happen via `run_shell` before this is called.
pub struct AgentInvocation {
    pub agent_command: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Result of a synchronous, non-streamed shell command run inside a
/// sandbox — used by the Executor's git-configuration, branch-checkout,
/// and commit/push stages, which need a command to finish and report an
/// exit code before the pipeline proceeds, unlike agent execution which
/// streams.
pub struct ShellOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// One streamed output line plus the exit status once the agent process
/// finishes. Providers stream lines via the channel and resolve `Ok(exit_code)`
/// on completion, matching the shape `DockerSandbox::run_pipeline` +
/// `DockerSandbox::wait` exposes as two separate calls, folded here into
/// one so every provider — local or remote — reports completion the same way.
pub struct ExecutionStream {
    pub lines: mpsc::Receiver<String>,
    pub exit: tokio::sync::oneshot::Receiver<Result<i32, ProviderError>>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> SandboxProviderKind;

    /// Provision a sandbox for `task_id`, cloning `repo_url` into it.
    /// Returns the handle to register in the `SandboxRegistry`. `timeout`
    /// is `min(task.maxDuration, provider cap)` (spec.md §4.2 stage 5);
    /// implementations bound their own provisioning work by it and return
    /// `ProviderError::Timeout` if it elapses first.
    async fn create(&self, task_id: &TaskId, repo_url: &str, timeout: Duration) -> Result<SandboxHandle, ProviderError>;

    /// Run a command to completion inside the sandbox (git config, branch
    /// checkout, commit/push) and report its exit code.
    async fn run_shell(&self, handle: &SandboxHandle, cmd: Vec<String>) -> Result<ShellOutput, ProviderError>;

    /// Run the agent invocation inside an already-created sandbox,
    /// streaming stdout/stderr lines as they arrive.
    async fn execute_agent(&self, handle: &SandboxHandle, invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError>;

    /// Tear down the sandbox. Idempotent: destroying an already-gone
    /// sandbox is not an error, since cancellation and normal completion
    /// can race to call this on the same handle.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError>;

    /// True if the sandbox is still known to the provider and running.
    /// Used by the orphan sweep to distinguish "still legitimately running"
    /// from "provider lost track of it, safe to forget".
    async fn is_alive(&self, handle: &SandboxHandle) -> bool;

    fn max_duration(&self) -> Duration {
        Duration::from_secs(self.kind().max_duration_secs())
    }
}
