//! Layered TOML + environment configuration (SPEC_FULL.md §2 item 11),
//! modeled on `forge_config::ForgeConfig`/`ForgeToml`: a `serde`-derived
//! file format with per-field defaults, an environment-variable override
//! on top for the values operators most often need to change per
//! deployment without editing a file, and a `load_or_default` entry point
//! that tolerates a missing config file entirely.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_server_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "taskforge.db".to_string()
}

fn default_daily_quota() -> u32 {
    20
}

fn default_admin_quota() -> u32 {
    100
}

fn default_sandbox_create_timeout_secs() -> u64 {
    120
}

fn default_branch_gateway_url() -> Option<String> {
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_server_port(), db_path: default_db_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    #[serde(default = "default_admin_quota")]
    pub admin_daily_quota: u32,
    #[serde(default)]
    pub admin_email_domains: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_quota: default_daily_quota(),
            admin_daily_quota: default_admin_quota(),
            admin_email_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_create_timeout_secs")]
    pub create_timeout_secs: u64,
    #[serde(default)]
    pub default_docker_image: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { create_timeout_secs: default_sandbox_create_timeout_secs(), default_docker_image: None }
    }
}

/// Shared fallback API keys, keyed by the agent's `as_str()` name
/// (`claude`, `codex`, ...) — used when a user has no key of their own on
/// file (spec.md §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefaultsConfig {
    #[serde(flatten)]
    pub keys: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchNamerConfig {
    #[serde(default = "default_branch_gateway_url")]
    pub gateway_url: Option<String>,
}

impl Default for BranchNamerConfig {
    fn default() -> Self {
        Self { gateway_url: default_branch_gateway_url() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent_defaults: AgentDefaultsConfig,
    #[serde(default)]
    pub branch_namer: BranchNamerConfig,
}

impl AppConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse taskforge.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, else fall back to defaults. Either way,
    /// environment variables layer on top via `apply_env_overrides`.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() { Self::load(path)? } else { Self::default() };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the file — the same precedence
    /// `ForgeToml::claude_cmd`/`skip_permissions` use for their one-off
    /// overrides, generalized here to every operator-tunable field.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("TASKFORGE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("TASKFORGE_DB_PATH") {
            self.server.db_path = path;
        }
        if let Ok(quota) = std::env::var("TASKFORGE_DAILY_QUOTA") {
            if let Ok(quota) = quota.parse() {
                self.rate_limit.daily_quota = quota;
            }
        }
        if let Ok(domains) = std::env::var("TASKFORGE_ADMIN_EMAIL_DOMAINS") {
            self.rate_limit.admin_email_domains = domains.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(url) = std::env::var("TASKFORGE_BRANCH_GATEWAY_URL") {
            self.branch_namer.gateway_url = Some(url);
        }
        for (agent, env_var) in [
            ("claude", "CLAUDE_API_KEY"),
            ("codex", "CODEX_API_KEY"),
            ("cursor", "CURSOR_API_KEY"),
            ("gemini", "GEMINI_API_KEY"),
            ("opencode", "OPENCODE_API_KEY"),
        ] {
            if let Ok(value) = std::env::var(env_var) {
                self.agent_defaults.keys.insert(agent.to_string(), value);
            }
        }
    }
}
