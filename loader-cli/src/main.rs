//! # memsql-loader CLI
//!
//! A thin command-line front end over `loader-core`'s job/task APIs,
//! grounded in `memsql_loader/cli/load.py`, `memsql_loader/cli/cancel_job.py`,
//! `memsql_loader/cli/ps.py`, and `memsql_loader/cli/server.py`/`stop_server.py`.
//! Reproduces the operations those commands perform against the embedded
//! store, not their full flag surface (`SPEC_FULL.md` §4.J/§4.K).
mod submit;

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use loader_core::config;
use loader_core::job_store::JobStore;
use loader_core::models::TaskState;
use loader_core::queue::{ExtraPredicate, TaskQueue};
use loader_core::store::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memsql-loader", about = "Load files into a MemSQL/SingleStore database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a load job from a JSON spec file.
    Load { spec_path: PathBuf },
    /// Cancel a job's queued and running tasks.
    CancelJob {
        job_id: String,
        /// Treat `job_id` as a prefix matching any number of jobs, rather
        /// than requiring it to resolve to exactly one.
        #[arg(short = 'm', long)]
        multiple: bool,
    },
    /// Print a job's task-state summary.
    Status { job_id: String },
    /// List all known jobs.
    Jobs,
    /// Manage the worker-pool server.
    #[command(subcommand)]
    Server(ServerCommands),
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Start the worker-pool server (refuses if one is already running).
    Start {
        #[arg(short = 'n', long)]
        num_workers: Option<usize>,
        #[arg(long)]
        idle_timeout_secs: Option<u64>,
    },
    /// Stop the currently-running server.
    Stop,
    /// Report whether a server is running.
    Status,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loader_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)?;

    match cli.command {
        Commands::Load { spec_path } => run_load(&data_dir, &spec_path),
        Commands::CancelJob { job_id, multiple } => run_cancel_job(&data_dir, &job_id, multiple),
        Commands::Status { job_id } => run_status(&data_dir, &job_id),
        Commands::Jobs => run_jobs(&data_dir),
        Commands::Server(cmd) => run_server_command(&data_dir, cmd),
    }
}

fn open_store(data_dir: &std::path::Path) -> anyhow::Result<Arc<Store>> {
    Ok(Arc::new(Store::open(config::store_path(data_dir))?))
}

fn run_load(data_dir: &std::path::Path, spec_path: &std::path::Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let jobs = JobStore::new(store.clone());
    let queue = TaskQueue::new(store, config::TASK_LEASE_TTL);

    match submit::submit_job(&jobs, &queue, spec_path)? {
        Some(job_id) => {
            println!("Successfully queued job with id: {job_id}");
            if !loader_core::pid::is_running(data_dir)? {
                println!("No currently running servers; starting one is your responsibility (run `memsql-loader server start`).");
            }
        }
        None => println!("Spec matched no files; no job was created."),
    }
    Ok(())
}

fn run_cancel_job(data_dir: &std::path::Path, job_id: &str, multiple: bool) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let jobs = JobStore::new(store.clone());
    let queue = TaskQueue::new(store, config::TASK_LEASE_TTL);

    let cancelled = if multiple {
        queue.bulk_finish("cancelled", Some(&ExtraPredicate::JobIdPrefix(job_id.to_string())))?
    } else {
        let job = jobs.get(job_id)?;
        queue.bulk_finish("cancelled", Some(&ExtraPredicate::JobId(job.id)))?
    };

    println!("Cancelled {cancelled} task(s)");
    Ok(())
}

fn run_status(data_dir: &std::path::Path, job_id: &str) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let jobs = JobStore::new(store.clone());
    let queue = TaskQueue::new(store, config::TASK_LEASE_TTL);

    let job = jobs.get(job_id)?;
    println!("Job {}", job.id);
    println!("  created: {}", job.created.to_rfc3339());
    println!("  target: {}.{}", job.spec.target.database, job.spec.target.table);

    for state in [TaskState::Queued, TaskState::Running, TaskState::Success, TaskState::Error, TaskState::Cancelled] {
        let count = queue.get_tasks_in_state(&[state], Some(&ExtraPredicate::JobId(job.id.clone())))?.len();
        println!("  {}: {}", state.as_str(), count);
    }
    Ok(())
}

fn run_jobs(data_dir: &std::path::Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let jobs = JobStore::new(store);

    for job in jobs.all()? {
        println!("{}  {}  {}.{}", job.id, job.created.to_rfc3339(), job.spec.target.database, job.spec.target.table);
    }
    Ok(())
}

fn run_server_command(data_dir: &std::path::Path, cmd: ServerCommands) -> anyhow::Result<()> {
    match cmd {
        ServerCommands::Start { num_workers, idle_timeout_secs } => {
            if loader_core::pid::is_running(data_dir)? {
                println!("A server is already running");
                std::process::exit(1);
            }

            let mut command = Command::new(sibling_binary("loader-server")?);
            if let Some(n) = num_workers {
                command.env("MEMSQL_LOADER_NUM_WORKERS", n.to_string());
            }
            if let Some(secs) = idle_timeout_secs {
                command.env("MEMSQL_LOADER_IDLE_TIMEOUT_SECS", secs.to_string());
            }
            // Replaces this process image; daemonizing is left to the
            // caller (a supervisor, or trailing `&`), matching the
            // operational model assumed in SPEC_FULL.md §4.K.
            let err = command.exec();
            Err(anyhow::anyhow!("failed to exec loader-server: {err}"))
        }
        ServerCommands::Stop => {
            match loader_core::pid::read_pid(data_dir)? {
                Some(pid) if loader_core::pid::is_running(data_dir)? => {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGQUIT);
                    }
                    println!("Stopped server with PID {pid}");
                }
                _ => println!("No currently running servers"),
            }
            Ok(())
        }
        ServerCommands::Status => {
            if loader_core::pid::is_running(data_dir)? {
                let pid = loader_core::pid::read_pid(data_dir)?.unwrap();
                println!("running (PID {pid})");
            } else {
                println!("not running");
            }
            Ok(())
        }
    }
}

fn sibling_binary(name: &str) -> anyhow::Result<PathBuf> {
    let mut path = std::env::current_exe()?;
    path.pop();
    path.push(name);
    Ok(path)
}
