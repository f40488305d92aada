//! Process bootstrap: load config, open the database, wire every
//! component built in the other modules into one `Executor` + `Admission`
//! pair, and serve the HTTP surface. Grounded in
//! `factory::server::start_server`'s shape (bind, `axum::serve` with
//! graceful shutdown, println of the bound address) generalized from one
//! hardcoded Docker sandbox to the full provider map plus a background
//! worker pool and an orphan-sandbox sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;

use crate::admission::Admission;
use crate::api::{AppState, api_router};
use crate::branch_namer::BranchNamer;
use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::events::EventBus;
use crate::executor::Executor;
use crate::logsink::LogSink;
use crate::ratelimit::RateLimiter;
use crate::sandbox::daytona::DaytonaSandboxProvider;
use crate::sandbox::docker::DockerSandboxProvider;
use crate::sandbox::e2b::E2bSandboxProvider;
use crate::sandbox::vercel::VercelSandboxProvider;
use crate::sandbox::{SandboxProvider, SandboxRegistry};
use crate::store::{DbHandle, TaskDb};
use crate::task::{SandboxProviderKind, TaskStatus};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Install the `tracing_subscriber` pipeline: JSON to stdout in
/// production, human-readable in a terminal, both gated by `RUST_LOG`.
/// Mirrors the teacher's own dependency choice (`tracing-subscriber` with
/// `env-filter`/`json`/`fmt` features) — there is no bespoke logger here.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("TASKFORGE_LOG_JSON").as_deref() == Ok("1") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn build_providers(config: &AppConfig) -> HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>> {
    let mut providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>> = HashMap::new();

    let docker_image = config.sandbox.default_docker_image.as_deref().unwrap_or("taskforge-runner:latest");
    if let Some(docker) = DockerSandboxProvider::connect(docker_image).await {
        tracing::info!("docker sandbox provider enabled");
        providers.insert(SandboxProviderKind::Docker, Arc::new(docker));
    } else {
        tracing::warn!("docker is not reachable; the docker sandbox provider is disabled");
    }

    if let Ok(token) = std::env::var("VERCEL_TOKEN") {
        let team_id = std::env::var("VERCEL_TEAM_ID").ok();
        providers.insert(SandboxProviderKind::Vercel, Arc::new(VercelSandboxProvider::new(token, team_id)));
    }
    if let Ok(key) = std::env::var("E2B_API_KEY") {
        providers.insert(SandboxProviderKind::E2b, Arc::new(E2bSandboxProvider::new(key)));
    }
    if let Ok(key) = std::env::var("DAYTONA_API_KEY") {
        providers.insert(SandboxProviderKind::Daytona, Arc::new(DaytonaSandboxProvider::new(key)));
    }

    providers
}

/// Periodically reconcile the Task Store against the Sandbox Registry,
/// destroying any sandbox whose task has been `processing` longer than
/// that task's own `maxDuration` without the Executor cleaning it up
/// itself (e.g. the process crashed mid-task). spec.md §4.5. Each task
/// carries its own ceiling, so the sweep pulls every still-`processing`
/// task from the store and checks it against `max_duration_parsed`
/// rather than a single fleet-wide cutoff.
async fn run_orphan_sweep(db: DbHandle, registry: Arc<SandboxRegistry>, providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>>) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;

        let tasks = match db.call(|conn| conn.stale_processing_tasks(chrono::Duration::zero())).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "failed to query stale processing tasks");
                continue;
            }
        };

        let now = chrono::Utc::now();
        for task in tasks {
            let max_age = match chrono::Duration::from_std(task.max_duration_parsed()) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if now - task.updated_at < max_age {
                continue;
            }

            tracing::warn!(task_id = %task.id, "task exceeded its max duration; sweeping orphaned sandbox");
            if let Some(handle) = registry.get(&task.id) {
                if let Some(provider) = providers.get(&handle.provider) {
                    if let Err(e) = provider.destroy(&handle).await {
                        tracing::error!(task_id = %task.id, error = %e, "failed to destroy orphaned sandbox");
                    }
                }
                registry.unregister(&task.id);
            }

            let id = task.id.clone();
            if let Err(e) = db.call(move |conn| conn.set_status(&id, TaskStatus::Error)).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to mark orphaned task as errored");
            }
        }
    }
}

fn open_db(config: &AppConfig) -> Result<DbHandle> {
    if let Some(parent) = std::path::Path::new(&config.server.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }
    }
    let task_db = TaskDb::open(std::path::Path::new(&config.server.db_path)).context("failed to open task database")?;
    Ok(DbHandle::new(task_db))
}

struct Components {
    db: DbHandle,
    admission: Admission,
    log_sink: LogSink,
    executor: Arc<Executor>,
    receiver: Arc<crate::events::EventReceiver>,
    registry: Arc<SandboxRegistry>,
    providers: HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>>,
}

async fn build_components(config: &AppConfig) -> Result<Components> {
    let db = open_db(config)?;

    let credentials = CredentialStore::new(db.clone()).context("failed to initialize credential store")?;
    let log_sink = LogSink::new(db.clone());
    let rate_limiter = RateLimiter::new(db.clone(), config.rate_limit.admin_email_domains.clone());
    let branch_namer = BranchNamer::new(config.branch_namer.gateway_url.clone());
    let registry = Arc::new(SandboxRegistry::new());
    let providers = build_providers(config).await;

    let (events, receiver) = EventBus::new();
    let admission = Admission::new(db.clone(), rate_limiter, events, branch_namer.clone(), registry.clone(), providers.clone());

    let executor = Arc::new(Executor::new(
        db.clone(),
        credentials,
        log_sink.clone(),
        registry.clone(),
        providers.clone(),
        branch_namer,
        config.agent_defaults.keys.clone(),
        Duration::from_secs(config.sandbox.create_timeout_secs),
    ));

    Ok(Components { db, admission, log_sink, executor, receiver: Arc::new(receiver), registry, providers })
}

/// `taskforge serve`: the HTTP admission surface plus an in-process
/// worker pool and orphan sweep — the all-in-one deployment shape.
pub async fn run(config_path: &std::path::Path) -> Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    let components = build_components(&config).await?;

    let sweep_db = components.db.clone();
    tokio::spawn(components.executor.clone().drive(components.receiver));
    tokio::spawn(run_orphan_sweep(sweep_db, components.registry, components.providers));

    let state = Arc::new(AppState { admission: components.admission, db: components.db, log_sink: components.log_sink });
    let app = api_router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "taskforge listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

/// `taskforge worker`: the Executor pool and orphan sweep with no HTTP
/// surface, for deployments that scale execution capacity independently
/// of the admission API (both processes share the same SQLite file and
/// poll it, so no new coordination layer is needed between them).
pub async fn run_worker(config_path: &std::path::Path) -> Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    let components = build_components(&config).await?;
    tracing::info!("taskforge worker started");

    let sweep_db = components.db.clone();
    tokio::select! {
        _ = components.executor.drive(components.receiver) => {}
        _ = run_orphan_sweep(sweep_db, components.registry, components.providers) => {}
        _ = shutdown_signal() => {}
    }
    tracing::info!("worker shut down gracefully");
    Ok(())
}

/// `taskforge migrate`: open the database, running migrations, and exit.
pub fn run_migrate(config_path: &std::path::Path) -> Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    open_db(&config)?;
    tracing::info!(db_path = %config.server.db_path, "migrations applied");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
