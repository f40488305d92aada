//! Branch-Name Synthesizer — asks an external text-generation gateway for
//! a descriptive branch name. It writes nothing on timeout or failure;
//! the Executor's own stage-4 fallback (`timestamp_fallback`) produces
//! the timestamp-derived name in that case (spec.md §4.6).
//!
//! The HTTP call shape (`reqwest::Client::new()`, `.post(url).json(...).send()`,
//! `error_for_status()`) follows `factory::github::request_device_code`.
//! The bounded wait follows `factory::pipeline`'s `tokio::time::timeout`
//! around the agent's stdout stream.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_SLUG_WORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
    Feature,
    Fix,
    Chore,
    Docs,
}

impl BranchType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Fix => "fix",
            Self::Chore => "chore",
            Self::Docs => "docs",
        }
    }

    /// Cheap keyword heuristic used as the offline fallback and as a sanity
    /// check on whatever the gateway proposes.
    fn infer(prompt: &str) -> Self {
        let lower = prompt.to_ascii_lowercase();
        if ["fix", "bug", "broken", "error", "crash"].iter().any(|kw| lower.contains(kw)) {
            Self::Fix
        } else if ["doc", "readme", "comment"].iter().any(|kw| lower.contains(kw)) {
            Self::Docs
        } else if ["refactor", "cleanup", "chore", "rename", "upgrade", "bump"].iter().any(|kw| lower.contains(kw)) {
            Self::Chore
        } else {
            Self::Feature
        }
    }
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    prompt: &'a str,
    repo_name: &'a str,
    agent: &'a str,
}

#[derive(Deserialize)]
struct GatewayResponse {
    branch_type: Option<String>,
    slug: Option<String>,
}

#[derive(Clone)]
pub struct BranchNamer {
    client: reqwest::Client,
    gateway_url: Option<String>,
}

impl BranchNamer {
    pub fn new(gateway_url: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), gateway_url }
    }

    /// Ask the gateway for a name. `random_suffix` is provided by the
    /// caller since this module must not call `rand`/`Uuid` random
    /// generators that would make it untestable — callers pass a fresh
    /// 6-character suffix per synthesis.
    ///
    /// Returns `None` on timeout, transport error, non-2xx response, an
    /// unparsable body, an empty slug, or when no gateway is configured at
    /// all (spec.md §4.6: "on failure or timeout: writes nothing; the
    /// Executor's stage-4 fallback will take over"). The caller must not
    /// write anything to the Task row when this returns `None`.
    pub async fn synthesize(&self, prompt: &str, repo_name: &str, agent: &str, random_suffix: &str) -> Option<String> {
        let url = self.gateway_url.as_ref()?;
        let request = GatewayRequest { prompt, repo_name, agent };
        let call = self.client.post(url).json(&request).send();
        let resp = tokio::time::timeout(SYNTHESIS_TIMEOUT, call).await.ok()?.ok()?;
        let resp = resp.error_for_status().ok()?;
        let parsed = resp.json::<GatewayResponse>().await.ok()?;
        let slug = parsed.slug.filter(|s| !s.trim().is_empty())?;
        let branch_type = parsed.branch_type.as_deref().and_then(parse_branch_type).unwrap_or_else(|| BranchType::infer(prompt));
        Some(format!("{}/{}-{}", branch_type.as_str(), slugify(&slug), random_suffix))
    }

    /// Synchronous, infallible fallback used by the Executor's stage-4
    /// branch name decision when `Task.branchName` is still null — either
    /// the synthesizer hasn't finished or it gave up. Spec.md §4.2 stage 4
    /// and §6 mandate this exact shape, distinct from the gateway-derived
    /// `<type>/<slug>-<suffix>` shape above.
    pub fn timestamp_fallback(random_suffix: &str) -> String {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
        format!("agent/{timestamp}-{random_suffix}")
    }
}

fn parse_branch_type(s: &str) -> Option<BranchType> {
    match s {
        "feature" => Some(BranchType::Feature),
        "fix" => Some(BranchType::Fix),
        "chore" => Some(BranchType::Chore),
        "docs" => Some(BranchType::Docs),
        _ => None,
    }
}

/// Kebab-case the prompt's first handful of alphanumeric words, bounded in
/// length so branch names stay readable in a git client.
fn slugify(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .take(MAX_SLUG_WORDS)
        .collect();
    if words.is_empty() {
        "task".to_string()
    } else {
        words.join("-")
    }
}
