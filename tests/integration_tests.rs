//! End-to-end pipeline tests exercising the Executor against a
//! `FakeSandboxProvider`, covering the seven literal scenarios and the
//! universal invariants described alongside the Task Store/Executor
//! design. These run the real `Admission` + `Executor` + `LogSink` +
//! `CredentialStore` stack against an in-memory SQLite database, swapping
//! out only the network/process boundary (the sandbox provider).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::sync::{mpsc, oneshot};

use taskforge::admission::{Admission, CreateTaskRequest};
use taskforge::branch_namer::BranchNamer;
use taskforge::credentials::CredentialStore;
use taskforge::errors::ProviderError;
use taskforge::events::EventBus;
use taskforge::executor::Executor;
use taskforge::logsink::LogSink;
use taskforge::ratelimit::RateLimiter;
use taskforge::sandbox::{AgentInvocation, ExecutionStream, SandboxHandle, SandboxProvider, SandboxRegistry, ShellOutput};
use taskforge::store::{DbHandle, TaskDb};
use taskforge::task::{AgentKind, LogEntryType, SandboxProviderKind, TaskStatus};

const MASTER_KEY_ENV: &str = "TASKFORGE_MASTER_KEY";

fn set_master_key() {
    unsafe {
        std::env::set_var(MASTER_KEY_ENV, B64.encode([3u8; 32]));
    }
}

/// Records every `run_shell` invocation and streams a scripted agent
/// transcript, so each scenario below only needs to configure the knobs
/// it cares about.
struct FakeSandboxProvider {
    shell_calls: Mutex<Vec<Vec<String>>>,
    destroy_called: AtomicBool,
    install_delay: Duration,
    git_dirty: bool,
    checkout_fails: bool,
    agent_lines: Vec<String>,
    agent_exit_code: AtomicI32,
}

impl FakeSandboxProvider {
    fn new(agent_lines: Vec<String>, agent_exit_code: i32) -> Self {
        Self {
            shell_calls: Mutex::new(Vec::new()),
            destroy_called: AtomicBool::new(false),
            install_delay: Duration::from_millis(0),
            git_dirty: true,
            checkout_fails: false,
            agent_lines,
            agent_exit_code: AtomicI32::new(agent_exit_code),
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.shell_calls.lock().unwrap().clone()
    }

    fn destroyed(&self) -> bool {
        self.destroy_called.load(Ordering::SeqCst)
    }

    fn pushed(&self) -> bool {
        self.calls().iter().any(|c| c.first().map(String::as_str) == Some("git") && c.get(1).map(String::as_str) == Some("push"))
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Docker
    }

    async fn create(&self, task_id: &String, _repo_url: &str, _timeout: Duration) -> Result<SandboxHandle, ProviderError> {
        Ok(SandboxHandle {
            task_id: task_id.clone(),
            provider: SandboxProviderKind::Docker,
            domain: None,
            native_id: "fake-container".into(),
            created_at: chrono::Utc::now(),
        })
    }

    async fn run_shell(&self, _handle: &SandboxHandle, cmd: Vec<String>) -> Result<ShellOutput, ProviderError> {
        self.shell_calls.lock().unwrap().push(cmd.clone());

        if cmd.first().map(String::as_str) == Some("sh") {
            if !self.install_delay.is_zero() {
                tokio::time::sleep(self.install_delay).await;
            }
            return Ok(ShellOutput { stdout: String::new(), exit_code: 0 });
        }
        if cmd.get(1).map(String::as_str) == Some("checkout") && self.checkout_fails {
            return Ok(ShellOutput { stdout: "error: pathspec unknown".into(), exit_code: 1 });
        }
        if cmd.get(1).map(String::as_str) == Some("status") {
            let stdout = if self.git_dirty { " M README.md".into() } else { String::new() };
            return Ok(ShellOutput { stdout, exit_code: 0 });
        }
        Ok(ShellOutput { stdout: String::new(), exit_code: 0 })
    }

    async fn execute_agent(&self, _handle: &SandboxHandle, _invocation: AgentInvocation) -> Result<ExecutionStream, ProviderError> {
        let (tx, rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let lines = self.agent_lines.clone();
        let exit_code = self.agent_exit_code.load(Ordering::SeqCst);
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            drop(tx);
            let _ = exit_tx.send(Ok(exit_code));
        });
        Ok(ExecutionStream { lines: rx, exit: exit_rx })
    }

    async fn destroy(&self, _handle: &SandboxHandle) -> Result<(), ProviderError> {
        self.destroy_called.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self, _handle: &SandboxHandle) -> bool {
        !self.destroyed()
    }
}

struct Harness {
    db: DbHandle,
    admission: Admission,
    executor: Arc<Executor>,
    provider: Arc<FakeSandboxProvider>,
    log_sink: LogSink,
}

fn build_harness(provider: FakeSandboxProvider) -> Harness {
    set_master_key();
    let db = DbHandle::new(TaskDb::new_in_memory().unwrap());
    let credentials = CredentialStore::new(db.clone()).unwrap();
    let log_sink = LogSink::new(db.clone());
    let rate_limiter = RateLimiter::new(db.clone(), vec!["admin.example.com".into()]);
    let branch_namer = BranchNamer::new(None);
    let (events, _receiver) = EventBus::new();
    let registry = Arc::new(SandboxRegistry::new());

    let provider = Arc::new(provider);
    let mut providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>> = HashMap::new();
    providers.insert(SandboxProviderKind::Docker, provider.clone() as Arc<dyn SandboxProvider>);

    let admission = Admission::new(db.clone(), rate_limiter, events, branch_namer.clone(), registry.clone(), providers.clone());

    let mut agent_env_defaults = HashMap::new();
    agent_env_defaults.insert("claude".to_string(), "default-claude-key".to_string());

    let executor = Arc::new(Executor::new(
        db.clone(),
        credentials,
        log_sink.clone(),
        registry,
        providers,
        branch_namer,
        agent_env_defaults,
        Duration::from_secs(30),
    ));

    Harness { db, admission, executor, provider, log_sink }
}

fn sample_request() -> CreateTaskRequest {
    CreateTaskRequest {
        user_id: "u1".into(),
        email: "u1@example.com".into(),
        prompt: "Add a README section titled 'Installation'".into(),
        repo_url: "https://host/acme/widgets".into(),
        selected_agent: AgentKind::Claude,
        selected_model: None,
        sandbox_provider: SandboxProviderKind::Docker,
        existing_branch_name: None,
        keep_alive: false,
        max_duration: "30m".into(),
        mcp_server_ids: vec![],
        install_dependencies: true,
    }
}

async fn reload_status(db: &DbHandle, id: &str) -> TaskStatus {
    let id = id.to_string();
    db.call(move |conn| conn.get_task_status(&id)).await.unwrap().unwrap()
}

// S1 -- happy path, new branch.
#[tokio::test]
async fn s1_happy_path_pushes_new_branch() {
    let harness = build_harness(FakeSandboxProvider::new(vec!["thinking...".into(), "done".into()], 0));
    let task = harness.admission.create_task(sample_request()).await.unwrap();

    harness.executor.run(&task.id).await.unwrap();

    let status = reload_status(&harness.db, &task.id).await;
    assert_eq!(status, TaskStatus::Completed);

    let reloaded = harness
        .db
        .call({
            let id = task.id.clone();
            move |conn| conn.get_task(&id)
        })
        .await
        .unwrap()
        .unwrap();
    let branch = reloaded.branch_name.expect("branch name must be set once status left pending");
    assert!(looks_like_synthesized_branch(&branch), "unexpected branch name shape: {branch}");

    let calls = harness.provider.calls();
    assert!(calls.iter().any(|c| c.first().map(String::as_str) == Some("git") && c.get(1).map(String::as_str) == Some("push")));
    let logs = harness.log_sink.read_all(&task.id).await.unwrap();
    assert!(logs.iter().any(|l| matches!(l.entry_type, LogEntryType::Success)));
    assert!(harness.provider.destroyed());
}

/// spec.md §8 S1: `feature/.+-[A-Za-z0-9]{6}` or the timestamp fallback
/// `agent/\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-[A-Za-z0-9]{6}`.
fn looks_like_synthesized_branch(branch: &str) -> bool {
    fn is_six_char_suffix(s: &str) -> bool {
        s.len() == 6 && s.chars().all(|c| c.is_ascii_alphanumeric())
    }

    if let Some(rest) = branch.strip_prefix("feature/") {
        return match rest.rsplit_once('-') {
            Some((slug, suffix)) => !slug.is_empty() && is_six_char_suffix(suffix),
            None => false,
        };
    }
    if let Some(rest) = branch.strip_prefix("agent/") {
        let Some((timestamp, suffix)) = rest.rsplit_once('-') else { return false };
        if !is_six_char_suffix(suffix) {
            return false;
        }
        let Some((date, time)) = timestamp.split_once('T') else { return false };
        let date_ok = date.len() == 10 && date.splitn(3, '-').count() == 3;
        let time_ok = time.len() == 8 && time.splitn(3, '-').count() == 3;
        return date_ok && time_ok;
    }
    false
}

// S2 -- cancellation mid-install.
#[tokio::test]
async fn s2_cancellation_mid_install_stops_without_push() {
    let mut provider = FakeSandboxProvider::new(vec!["should not run".into()], 0);
    provider.install_delay = Duration::from_millis(150);
    let harness = build_harness(provider);
    let task = harness.admission.create_task(sample_request()).await.unwrap();

    let db = harness.db.clone();
    let id = task.id.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        db.call(move |conn| conn.set_status(&id, TaskStatus::Stopped)).await.unwrap();
    });

    harness.executor.run(&task.id).await.unwrap();
    canceller.await.unwrap();

    let status = reload_status(&harness.db, &task.id).await;
    assert_eq!(status, TaskStatus::Stopped);

    let reloaded = harness
        .db
        .call({
            let id = task.id.clone();
            move |conn| conn.get_task(&id)
        })
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.progress < 100);

    let logs = harness.log_sink.read_all(&task.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.to_lowercase().contains("cancelled")));
    assert!(!harness.provider.pushed());
    assert!(harness.provider.destroyed());
}

// S3 -- rate limit.
#[tokio::test]
async fn s3_rate_limit_rejects_without_inserting_task() {
    let harness = build_harness(FakeSandboxProvider::new(vec![], 0));
    let oldest = chrono::Utc::now() - chrono::Duration::hours(10);
    {
        let guard = harness.db.lock_sync();
        for i in 0..20 {
            let created_at = if i == 0 { oldest } else { chrono::Utc::now() };
            guard.insert_task(&make_filled_task(&format!("t{i}"), "u2", created_at)).unwrap();
        }
    }

    let mut request = sample_request();
    request.user_id = "u2".into();
    request.email = "u2@example.com".into();
    let result = harness.admission.create_task(request).await;

    match result {
        Err(taskforge::errors::AdmissionError::RateLimitExceeded { reset_at }) => {
            let expected = oldest + chrono::Duration::hours(24);
            let delta = (reset_at - expected).num_seconds().abs();
            assert!(delta <= 1, "resetAt should equal oldest-creation + 24h +/- 1s, delta was {delta}s");
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    let count = harness.db.call(|conn| conn.count_tasks_for_user("u2")).await.unwrap();
    assert_eq!(count, 20, "no additional task row should have been inserted");
}

fn make_filled_task(id: &str, user_id: &str, created_at: chrono::DateTime<chrono::Utc>) -> taskforge::task::Task {
    taskforge::task::Task {
        id: id.into(),
        user_id: user_id.into(),
        prompt: "do it".into(),
        repo_url: "https://example.com/a/b".into(),
        selected_agent: AgentKind::Claude,
        selected_model: None,
        sandbox_provider: SandboxProviderKind::Docker,
        status: TaskStatus::Completed,
        progress: 100,
        branch_name: None,
        existing_branch_name: None,
        logs: vec![],
        sandbox_url: None,
        pr_number: None,
        pr_url: None,
        keep_alive: false,
        max_duration: "30m".into(),
        mcp_server_ids: vec![],
        install_dependencies: true,
        current_sub_agent: None,
        sub_agent_activity: None,
        last_heartbeat: None,
        created_at,
        updated_at: created_at,
        deleted_at: None,
    }
}

// S4 -- agent non-zero exit.
#[tokio::test]
async fn s4_agent_non_zero_exit_marks_error_with_ordered_transcript() {
    let harness = build_harness(FakeSandboxProvider::new(vec!["hello".into(), "world".into()], 2));
    let task = harness.admission.create_task(sample_request()).await.unwrap();

    harness.executor.run(&task.id).await.unwrap();

    let status = reload_status(&harness.db, &task.id).await;
    assert_eq!(status, TaskStatus::Error);

    let logs = harness.log_sink.read_all(&task.id).await.unwrap();
    let agent_lines: Vec<_> = logs.iter().filter(|l| l.message == "hello" || l.message == "world").collect();
    assert_eq!(agent_lines.len(), 2);
    assert_eq!(agent_lines[0].message, "hello");
    assert_eq!(agent_lines[1].message, "world");

    let hello_index = logs.iter().position(|l| l.message == "hello").unwrap();
    let world_index = logs.iter().position(|l| l.message == "world").unwrap();
    let error_index = logs.iter().position(|l| matches!(l.entry_type, LogEntryType::Error)).unwrap();
    assert!(hello_index < world_index && world_index < error_index);

    assert!(!harness.provider.pushed());
    assert!(harness.provider.destroyed());
}

// S5 -- credential leak prevention.
#[tokio::test]
async fn s5_host_token_is_redacted_from_transcript() {
    const TOKEN: &str = "ghp_AAAA1111";
    let harness = build_harness(FakeSandboxProvider::new(vec![format!("running: echo {TOKEN}")], 0));

    let credentials = CredentialStore::new(harness.db.clone()).unwrap();
    credentials.put_user_api_key("u1", "host_token", TOKEN).await.unwrap();

    let task = harness.admission.create_task(sample_request()).await.unwrap();
    harness.executor.run(&task.id).await.unwrap();

    let logs = harness.log_sink.read_all(&task.id).await.unwrap();
    assert!(logs.iter().all(|l| !l.message.contains(TOKEN)));
    assert!(logs.iter().any(|l| l.message.contains("[REDACTED]")));
}

// S6 -- no-change commit.
#[tokio::test]
async fn s6_no_changes_skips_push() {
    let mut provider = FakeSandboxProvider::new(vec!["looked around, nothing to change".into()], 0);
    provider.git_dirty = false;
    let harness = build_harness(provider);

    let mut request = sample_request();
    request.prompt = "please review the code but make no edits".into();
    let task = harness.admission.create_task(request).await.unwrap();

    harness.executor.run(&task.id).await.unwrap();

    let status = reload_status(&harness.db, &task.id).await;
    assert_eq!(status, TaskStatus::Completed);
    assert!(!harness.provider.pushed());

    let logs = harness.log_sink.read_all(&task.id).await.unwrap();
    assert!(logs.iter().any(|l| matches!(l.entry_type, LogEntryType::Success) && l.message.contains("no changes")));

    let reloaded = harness
        .db
        .call({
            let id = task.id.clone();
            move |conn| conn.get_task(&id)
        })
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.pr_number.is_none());
    assert!(reloaded.pr_url.is_none());
}

// S7 -- existing branch continuation.
#[tokio::test]
async fn s7_follow_up_continues_on_existing_branch() {
    const BRANCH: &str = "feature/login-A1B2C3";
    let harness = build_harness(FakeSandboxProvider::new(vec!["adding logging".into()], 0));

    let mut first = make_filled_task("t1", "u1", chrono::Utc::now());
    first.branch_name = Some(BRANCH.to_string());
    first.existing_branch_name = Some(BRANCH.to_string());
    first.status = TaskStatus::Completed;
    harness
        .db
        .call({
            let t = first.clone();
            move |conn| conn.insert_task(&t)
        })
        .await
        .unwrap();

    harness.admission.append_follow_up(&first.id, "u1", "also add logging").await.unwrap();
    assert_eq!(reload_status(&harness.db, &first.id).await, TaskStatus::Pending);

    harness.executor.run(&first.id).await.unwrap();

    let reloaded = harness
        .db
        .call({
            let id = first.id.clone();
            move |conn| conn.get_task(&id)
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.branch_name.as_deref(), Some(BRANCH));
    assert_eq!(reloaded.status, TaskStatus::Completed);

    let calls = harness.provider.calls();
    let checkout_index = calls
        .iter()
        .position(|c| c.get(1).map(String::as_str) == Some("checkout") && c.get(2).map(String::as_str) == Some(BRANCH));
    let pull_index = calls.iter().position(|c| c.get(1).map(String::as_str) == Some("pull"));
    assert!(checkout_index.is_some() && pull_index.is_some());
    assert!(checkout_index.unwrap() < pull_index.unwrap());

    let push_call = calls.iter().find(|c| c.get(1).map(String::as_str) == Some("push")).expect("push call expected");
    assert_eq!(push_call.last().map(String::as_str), Some(BRANCH));

    let messages = harness
        .db
        .call({
            let id = first.id.clone();
            move |conn| conn.list_task_messages(&id)
        })
        .await
        .unwrap();
    assert!(messages.iter().any(|m| m.content == "also add logging" && matches!(m.role, taskforge::task::MessageRole::User)));
}

// Branch checkout failure is still a pipeline-fatal error, with cleanup attempted.
#[tokio::test]
async fn branch_checkout_failure_is_fatal_with_cleanup() {
    let mut provider = FakeSandboxProvider::new(vec![], 0);
    provider.checkout_fails = true;
    let harness = build_harness(provider);
    let task = harness.admission.create_task(sample_request()).await.unwrap();

    harness.executor.run(&task.id).await.unwrap();

    assert_eq!(reload_status(&harness.db, &task.id).await, TaskStatus::Error);
    assert!(harness.provider.destroyed());
}

// A missing credential is a pipeline-fatal error with no sandbox created.
#[tokio::test]
async fn missing_credential_fails_before_sandbox_create() {
    let harness = build_harness(FakeSandboxProvider::new(vec![], 0));
    let mut request = sample_request();
    request.selected_agent = AgentKind::Gemini; // no default key configured for gemini
    let task = harness.admission.create_task(request).await.unwrap();

    harness.executor.run(&task.id).await.unwrap();

    assert_eq!(reload_status(&harness.db, &task.id).await, TaskStatus::Error);
    assert!(harness.provider.calls().is_empty(), "no shell command should run without a sandbox");
    assert!(!harness.provider.destroyed());
}

// Invariant: terminal status is always one of {completed, error, stopped}, progress in [0,100].
#[tokio::test]
async fn terminal_status_and_progress_are_always_bounded() {
    for (lines, exit_code) in [(vec!["ok".to_string()], 0), (vec![], 1)] {
        let harness = build_harness(FakeSandboxProvider::new(lines, exit_code));
        let task = harness.admission.create_task(sample_request()).await.unwrap();
        harness.executor.run(&task.id).await.unwrap();
        let reloaded = harness
            .db
            .call({
                let id = task.id.clone();
                move |conn| conn.get_task(&id)
            })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reloaded.status, TaskStatus::Completed | TaskStatus::Error | TaskStatus::Stopped));
        assert!(reloaded.progress <= 100);
    }
}

// Invariant: the event bus's in-flight dedup keeps at most one concurrent Executor run per task.
#[tokio::test]
async fn event_bus_rejects_duplicate_in_flight_emission() {
    let (bus, receiver) = EventBus::new();
    assert!(bus.emit("t1".to_string()));
    assert!(!bus.emit("t1".to_string()), "a second emit while in flight must be rejected");
    receiver.mark_done(&"t1".to_string());
    assert!(bus.emit("t1".to_string()), "re-emission after completion must succeed");
}
