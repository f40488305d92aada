//! Core data model: `Task`, `LogEntry`, `TaskMessage`, `Connector`.
//!
//! Shapes follow the teacher's `factory::models` pattern: plain `serde`
//! structs, `String` timestamps, and enums with explicit `as_str`/
//! `from_str` pairs rather than relying solely on `serde`'s rename
//! attributes (so the same string form is usable in raw SQL predicates).

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type TaskId = String;

/// Fallback when `maxDuration` is missing or unparsable — matches the
/// default `CreateTaskBody` sends (spec.md §6).
const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(30 * 60);

/// Parse shapes like `"30m"`, `"45s"`, `"1h"` into a `Duration`. Unparsable
/// input falls back to `DEFAULT_MAX_DURATION` rather than failing the task.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split_at = s.len().checked_sub(1)?;
    let (num, unit) = s.split_at(split_at);
    let value: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }

    /// True if this status is terminal — no further stage transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Cursor,
    Gemini,
    Opencode,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Cursor => "cursor",
            Self::Gemini => "gemini",
            Self::Opencode => "opencode",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "cursor" => Ok(Self::Cursor),
            "gemini" => Ok(Self::Gemini),
            "opencode" => Ok(Self::Opencode),
            _ => Err(format!("Invalid agent: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProviderKind {
    Vercel,
    Docker,
    E2b,
    Daytona,
}

impl SandboxProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vercel => "vercel",
            Self::Docker => "docker",
            Self::E2b => "e2b",
            Self::Daytona => "daytona",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "vercel" => Ok(Self::Vercel),
            "docker" => Ok(Self::Docker),
            "e2b" => Ok(Self::E2b),
            "daytona" => Ok(Self::Daytona),
            _ => Err(format!("Invalid sandbox provider: {}", s)),
        }
    }

    /// Provider-side ceiling on wall-clock duration, regardless of what the
    /// task requested. Docker (local) has no external billing constraint so
    /// it gets the longest leash.
    pub fn max_duration_secs(&self) -> u64 {
        match self {
            Self::Vercel => 45 * 60,
            Self::Docker => 60 * 60,
            Self::E2b => 30 * 60,
            Self::Daytona => 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEntryType {
    Info,
    Command,
    Error,
    Success,
}

impl LogEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Command => "command",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "info" => Ok(Self::Info),
            "command" => Ok(Self::Command),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(format!("Invalid log entry type: {}", s)),
        }
    }
}

/// One entry in a task's append-only transcript. `message` is assumed
/// already redacted by the time it reaches a `LogEntry` — see
/// `crate::redact::Redactor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub entry_type: LogEntryType,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl LogEntry {
    pub fn new(entry_type: LogEntryType, message: impl Into<String>) -> Self {
        Self {
            entry_type,
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// A follow-up message appended to a task after its first completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: i64,
    pub task_id: TaskId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Local,
    Remote,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            _ => Err(format!("Invalid connector type: {}", s)),
        }
    }
}

/// An MCP server configuration a user can attach to a task. `env_encrypted`
/// is opaque ciphertext at rest; only `CredentialStore::get_connector_env`
/// decrypts it, and only transiently inside the Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub connector_type: ConnectorType,
    pub command: Option<String>,
    pub url: Option<String>,
    pub env_encrypted: String,
}

/// One user request to run one agent against one repository for one
/// instruction. See spec.md §3 for the full invariant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: String,
    pub prompt: String,
    pub repo_url: String,
    pub selected_agent: AgentKind,
    pub selected_model: Option<String>,
    pub sandbox_provider: SandboxProviderKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub branch_name: Option<String>,
    pub existing_branch_name: Option<String>,
    pub logs: Vec<LogEntry>,
    pub sandbox_url: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub keep_alive: bool,
    pub max_duration: String,
    pub mcp_server_ids: Vec<String>,
    pub install_dependencies: bool,
    pub current_sub_agent: Option<String>,
    pub sub_agent_activity: Option<serde_json::Value>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    /// `progress` is clamped to the 0–100 invariant from spec.md §8 property 1.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// `max_duration` as a `Duration`, used to bound sandbox creation and
    /// agent execution (spec.md §4.2 stages 5 and 9).
    pub fn max_duration_parsed(&self) -> Duration {
        parse_duration(&self.max_duration).unwrap_or(DEFAULT_MAX_DURATION)
    }
}
