use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;

use feedvault::config::Config;
use feedvault::export::{ExportJobs, JobEvent, JobOutcome};
use feedvault::storage::{AccountIdentity, Database, DatabaseError};

/// Get the config directory path (~/.config/feedvault/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedvault"))
}

#[derive(Parser, Debug)]
#[command(name = "feedvault", about = "Local archive of account article feeds")]
struct Args {
    /// Config file (default: ~/.config/feedvault/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Archive database file, overrides the config file
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Delete every row of every table
    #[arg(long)]
    wipe: bool,

    /// Import an account list (JSON array of {account_id, nickname, avatar})
    #[arg(long, value_name = "FILE")]
    import_accounts: Option<PathBuf>,

    /// Print row counts per table
    #[arg(long)]
    stats: bool,

    /// Run an export job in this format and wait for it to finish
    #[arg(long, value_name = "FORMAT", requires_all = ["user", "link"])]
    export: Option<String>,

    /// Owner of the export job
    #[arg(long)]
    user: Option<String>,

    /// Article link to export (repeatable)
    #[arg(long)]
    link: Vec<String>,

    /// Account whose metadata is attached to the export
    #[arg(long)]
    account: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .db
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("archive.db"));
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open_with(db_path_str, &config.database_options()).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: the archive database is locked by another process.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let result = run(&args, &config, &config_dir, &db).await;
    db.close().await;
    result
}

async fn run(args: &Args, config: &Config, config_dir: &std::path::Path, db: &Database) -> Result<()> {
    if args.wipe {
        let report = db.wipe_all().await.context("Failed to wipe archive")?;
        for (table, rows) in &report.tables {
            println!("{table}: {rows} rows deleted");
        }
    }

    if let Some(file) = &args.import_accounts {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read account list {}", file.display()))?;
        let identities: Vec<AccountIdentity> =
            serde_json::from_str(&content).context("Account list is not a JSON array of accounts")?;
        let imported = db
            .import_identities(&identities)
            .await
            .context("Failed to import account list")?;
        println!("Imported {imported} accounts");
    }

    if let Some(format) = &args.export {
        let user = args.user.as_deref().unwrap_or_default();
        let export_dir = config
            .export_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("exports"));

        let (event_tx, mut event_rx) = mpsc::channel::<JobEvent>(8);
        let jobs = ExportJobs::new(db.clone(), export_dir, event_tx);
        let job_id = jobs
            .create_job(user, format, &args.link, args.account.as_deref())
            .await
            .context("Failed to create export job")?;
        println!("Export job {job_id} started");

        let event = tokio::select! {
            event = event_rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                jobs.cancel_all();
                event_rx.recv().await
            }
        };
        match event.map(|e| e.outcome) {
            Some(JobOutcome::Completed { path, digest }) => {
                println!("Wrote {} (sha256 {digest})", path.display());
            }
            Some(JobOutcome::Failed(error)) => anyhow::bail!("Export job {job_id} failed: {error}"),
            Some(JobOutcome::Cancelled) => println!("Export job {job_id} cancelled"),
            None => anyhow::bail!("Export job {job_id} ended without reporting"),
        }
    }

    if args.stats {
        let stats = db.store_stats().await.context("Failed to read store statistics")?;
        for (table, rows) in &stats.tables {
            println!("{table:<16} {rows}");
        }
    }

    Ok(())
}
