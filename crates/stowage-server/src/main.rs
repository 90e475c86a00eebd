//! stowage daemon
//!
//! Loads the stored mounts, keeps failed ones reconnecting and runs sync
//! jobs until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run the daemon
//! stowaged --config stowage.toml
//!
//! # Run every stored sync job once at startup
//! stowaged --run-sync
//!
//! # Manage mounts and jobs
//! stowaged mount add /photos local --addition '{"root":"/srv/photos"}'
//! stowaged mount list
//! stowaged job add nightly /photos /backup/photos --mode copy_and_delete
//! stowaged job list
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stowage_kernel::{Kernel, KernelConfig, StorageRecord, SyncJob, SyncMode};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(about = "Storage federation daemon")]
struct Args {
    /// TOML config file; defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long)]
    database: Option<PathBuf>,

    /// Run every stored sync job once after loading mounts
    #[arg(long)]
    run_sync: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage stored mounts
    Mount {
        #[command(subcommand)]
        action: MountAction,
    },
    /// Manage stored sync jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand, Debug)]
enum MountAction {
    /// Store a mount and try to bring it online
    Add {
        mount_path: String,
        driver: String,
        /// Driver settings, JSON
        #[arg(long, default_value = "{}")]
        addition: String,
        #[arg(long, default_value_t = 0)]
        order: i32,
    },
    List,
    Remove { id: u64 },
}

#[derive(Subcommand, Debug)]
enum JobAction {
    Add {
        name: String,
        src: String,
        dst: String,
        #[arg(long, default_value_t = SyncMode::Copy)]
        mode: SyncMode,
        /// Trust cached listings while walking
        #[arg(long)]
        lazy_cache: bool,
    },
    List,
    Remove { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    if let Some(database) = args.database {
        config.database.path = database;
    }

    let kernel = Kernel::open(config).context("opening kernel")?;
    let result = match args.command {
        Some(Command::Mount { action }) => cmd_mount(&kernel, action).await,
        Some(Command::Job { action }) => cmd_job(&kernel, action),
        None => serve(&kernel, args.run_sync).await,
    };
    kernel.shutdown().await;
    result
}

async fn serve(kernel: &Kernel, run_sync: bool) -> anyhow::Result<()> {
    let failed = kernel.load_storages().await?;
    for (mount_path, e) in &failed {
        tracing::warn!(mount_path = %mount_path, error = %e, "mount failed to load");
    }

    if run_sync {
        let (jobs, total) = kernel.syncer().list_jobs(1, usize::MAX)?;
        tracing::info!(total, "running stored sync jobs");
        for job in jobs {
            match kernel.syncer().run_job(&job.id).await {
                Ok(id) => tracing::info!(task_id = %id, name = %job.task_name, "sync job started"),
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "sync job not started"),
            }
        }
    }

    tracing::info!("stowaged running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    Ok(())
}

async fn cmd_mount(kernel: &Kernel, action: MountAction) -> anyhow::Result<()> {
    let registry = kernel.registry();
    match action {
        MountAction::Add {
            mount_path,
            driver,
            addition,
            order,
        } => {
            let record = StorageRecord::new(mount_path, driver)
                .with_addition(addition)
                .with_order(order);
            let created = registry.create_storage(record).await?;
            match created.init_error {
                None => println!("{}", created.id),
                Some(e) => println!("{} (init failed: {})", created.id, e),
            }
        }
        MountAction::List => {
            kernel.load_storages().await?;
            for record in registry.list_mounts() {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id, record.mount_path, record.driver, record.status
                );
            }
        }
        MountAction::Remove { id } => registry.delete_storage(id).await?,
    }
    Ok(())
}

fn cmd_job(kernel: &Kernel, action: JobAction) -> anyhow::Result<()> {
    let syncer = kernel.syncer();
    match action {
        JobAction::Add {
            name,
            src,
            dst,
            mode,
            lazy_cache,
        } => {
            let job = syncer.create_job(SyncJob {
                id: String::new(),
                task_name: name,
                src_path: src,
                dst_path: dst,
                mode,
                lazy_cache,
            })?;
            println!("{}", job.id);
        }
        JobAction::List => {
            let (jobs, _) = syncer.list_jobs(1, usize::MAX)?;
            for job in jobs {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        JobAction::Remove { id } => syncer.delete_job(&id)?,
    }
    Ok(())
}
