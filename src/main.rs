use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taskforge")]
#[command(version, about = "Multi-tenant task orchestration engine")]
struct Cli {
    /// Path to the config file (taskforge.toml). Defaults are used for
    /// anything missing from it, and environment variables layer on top.
    #[arg(long, global = true, default_value = "taskforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP admission surface plus an in-process worker pool.
    Serve,
    /// Run only the Executor worker pool, no HTTP surface.
    Worker,
    /// Open the database, applying any pending schema migrations, and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    taskforge::server::init_tracing();

    match cli.command {
        Commands::Serve => taskforge::server::run(&cli.config).await,
        Commands::Worker => taskforge::server::run_worker(&cli.config).await,
        Commands::Migrate => taskforge::server::run_migrate(&cli.config),
    }
}
