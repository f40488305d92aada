//! Admission Layer — the synchronous half of task creation (spec.md §4.1):
//! authenticate, rate-limit, persist a `pending` Task row, and hand off to
//! the event bus. Everything past that point is the Executor's problem.
//!
//! Grounded in `factory::api::create_task_handler`'s shape: validate →
//! insert → emit → return 202-equivalent immediately, with branch-name
//! synthesis kicked off in the background rather than blocking the
//! response (the teacher does the analogous thing for its commit-message
//! generation call).

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use uuid::Uuid;

use crate::branch_namer::BranchNamer;
use crate::errors::AdmissionError;
use crate::events::EventBus;
use crate::ratelimit::RateLimiter;
use crate::sandbox::{SandboxProvider, SandboxRegistry};
use crate::store::DbHandle;
use crate::task::{AgentKind, MessageRole, SandboxProviderKind, Task, TaskId, TaskStatus};

/// Caller-supplied fields for `CreateTask`. `user_id`/`email` come from the
/// authenticated principal, never from the request body.
pub struct CreateTaskRequest {
    pub user_id: String,
    pub email: String,
    pub prompt: String,
    pub repo_url: String,
    pub selected_agent: AgentKind,
    pub selected_model: Option<String>,
    pub sandbox_provider: SandboxProviderKind,
    pub existing_branch_name: Option<String>,
    pub keep_alive: bool,
    pub max_duration: String,
    pub mcp_server_ids: Vec<String>,
    pub install_dependencies: bool,
}

pub struct Admission {
    db: DbHandle,
    rate_limiter: RateLimiter,
    events: EventBus,
    branch_namer: BranchNamer,
    registry: Arc<SandboxRegistry>,
    providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>>,
}

impl Admission {
    pub fn new(
        db: DbHandle,
        rate_limiter: RateLimiter,
        events: EventBus,
        branch_namer: BranchNamer,
        registry: Arc<SandboxRegistry>,
        providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>>,
    ) -> Self {
        Self { db, rate_limiter, events, branch_namer, registry, providers }
    }

    /// Create and admit a new task. Returns the `pending` row once
    /// persisted; branch-name synthesis and execution continue in the
    /// background.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, AdmissionError> {
        if request.prompt.trim().is_empty() {
            return Err(AdmissionError::InvalidInput("prompt must not be empty".into()));
        }
        if request.repo_url.trim().is_empty() {
            return Err(AdmissionError::InvalidInput("repoUrl must not be empty".into()));
        }

        let limit = self
            .rate_limiter
            .check_allowed(&request.user_id, &request.email)
            .await;
        if !limit.allowed {
            return Err(AdmissionError::RateLimitExceeded { reset_at: limit.reset_at });
        }

        let now = chrono::Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            prompt: request.prompt,
            repo_url: request.repo_url,
            selected_agent: request.selected_agent,
            selected_model: request.selected_model,
            sandbox_provider: request.sandbox_provider,
            status: TaskStatus::Pending,
            progress: 0,
            branch_name: None,
            existing_branch_name: request.existing_branch_name,
            logs: vec![],
            sandbox_url: None,
            pr_number: None,
            pr_url: None,
            keep_alive: request.keep_alive,
            max_duration: request.max_duration,
            mcp_server_ids: request.mcp_server_ids,
            install_dependencies: request.install_dependencies,
            current_sub_agent: None,
            sub_agent_activity: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let db = self.db.clone();
        let insertable = task.clone();
        db.call(move |conn| conn.insert_task(&insertable))
            .await
            .map_err(AdmissionError::Store)?;

        self.spawn_branch_synthesis(&task);
        self.events.emit(task.id.clone());

        Ok(task)
    }

    /// Kick off branch-name synthesis without blocking `create_task`'s
    /// response. The Executor's own fallback (spec.md §4.2 stage 4) covers
    /// the case where this loses the race against pipeline start.
    fn spawn_branch_synthesis(&self, task: &Task) {
        let db = self.db.clone();
        let task_id = task.id.clone();
        let prompt = task.prompt.clone();
        let repo_name = repo_name_from_url(&task.repo_url);
        let agent = task.selected_agent.as_str().to_string();
        let branch_namer = self.branch_namer.clone();
        tokio::spawn(async move {
            let suffix = random_suffix();
            let Some(name) = branch_namer.synthesize(&prompt, &repo_name, &agent, &suffix).await else {
                return;
            };
            let id = task_id.clone();
            if let Err(e) = db.call(move |conn| conn.set_branch_name(&id, &name)).await {
                tracing::error!(task_id = %task_id, error = %e, "failed to persist synthesized branch name");
            }
        });
    }

    /// `CancelTask`: flip a task's status to `stopped` if it hasn't
    /// already reached a terminal state, then dispatch `Destroy` on any
    /// live sandbox the Sandbox Registry still has registered for it
    /// (spec.md §4.1). A race with the Executor's own cleanup destroy is
    /// expected and harmless — `destroy` is idempotent.
    pub async fn cancel_task(&self, task_id: &TaskId, user_id: &str) -> Result<(), AdmissionError> {
        let task = self.load_owned_task(task_id, user_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let db = self.db.clone();
        let id = task_id.clone();
        db.call(move |conn| conn.set_status(&id, TaskStatus::Stopped))
            .await
            .map_err(AdmissionError::Store)?;

        if let Some(handle) = self.registry.get(task_id) {
            if let Some(provider) = self.providers.get(&handle.provider) {
                if let Err(e) = provider.destroy(&handle).await {
                    tracing::error!(task_id = %task_id, error = %e, "failed to destroy sandbox on cancel");
                }
            }
        }
        Ok(())
    }

    /// `AppendFollowUp`: attach a user message to a completed task and
    /// re-admit it for another pass, provided it is not already in flight.
    pub async fn append_follow_up(&self, task_id: &TaskId, user_id: &str, content: &str) -> Result<(), AdmissionError> {
        let task = self.load_owned_task(task_id, user_id).await?;
        if !task.status.is_terminal() {
            return Err(AdmissionError::InvalidInput("task is still running".into()));
        }
        if self.events.is_in_flight(task_id) {
            return Err(AdmissionError::InvalidInput("task is already queued".into()));
        }

        let db = self.db.clone();
        let id = task_id.clone();
        let message = content.to_string();
        db.call(move |conn| conn.insert_task_message(&id, MessageRole::User, &message))
            .await
            .map_err(AdmissionError::Store)?;

        let db = self.db.clone();
        let id = task_id.clone();
        db.call(move |conn| conn.set_status(&id, TaskStatus::Pending))
            .await
            .map_err(AdmissionError::Store)?;

        self.events.emit(task_id.clone());
        Ok(())
    }

    async fn load_owned_task(&self, task_id: &TaskId, user_id: &str) -> Result<Task, AdmissionError> {
        let db = self.db.clone();
        let id = task_id.clone();
        let task = db
            .call(move |conn| conn.get_task(&id))
            .await
            .map_err(AdmissionError::Store)?
            .ok_or_else(|| AdmissionError::NotFound(task_id.clone()))?;
        if task.user_id != user_id {
            return Err(AdmissionError::NotFound(task_id.clone()));
        }
        Ok(task)
    }
}

fn random_suffix() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

fn repo_name_from_url(repo_url: &str) -> String {
    repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or(repo_url)
        .to_string()
}
