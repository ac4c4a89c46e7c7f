use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genrun::model::{RunEvent, WorkflowRunStatus};
use genrun::storage::{default_state_path, FileStore, PersistenceAdapter};
use genrun::{
    ClientConfig, HttpTransport, RegistryConfig, RegistrySync, RegistryView, RunTracker,
    TrackOptions, TransportAdapter,
};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const DEFAULT_PERSIST_KEY: &str = "genrun.active_run";

/// Results go to stdout; progress and notices go to stderr.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Terminal writes happen on a blocking thread; the channel closes it.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let mut results = std::io::LineWriter::new(std::io::stdout().lock());
        let mut notices = std::io::LineWriter::new(std::io::stderr().lock());

        while let Some(line) = rx.blocking_recv() {
            let written = match line {
                OutputLine::Stdout(msg) => writeln!(results, "{msg}"),
                OutputLine::Stderr(msg) => writeln!(notices, "{msg}"),
            };
            // Closed pipe, e.g. `genrun watch | head`.
            if written.is_err() {
                break;
            }
        }

        let _ = results.flush();
        let _ = notices.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "genrun",
    version,
    about = "Submit, follow and list long-running generation runs"
)]
pub struct Cli {
    /// Base URL of the generation API
    #[arg(long, env = "GENRUN_BASE_URL", default_value = "http://localhost:3000/api")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[arg(long, env = "GENRUN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Per-request timeout
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// File holding the persisted run id (defaults to the user data dir)
    #[arg(long)]
    pub state_file: Option<std::path::PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Submit a job and follow it to completion
    Submit {
        /// Submission endpoint, relative to the base URL
        #[arg(long)]
        endpoint: String,
        /// Job input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        #[command(flatten)]
        polling: PollingArgs,
        /// Do not persist the run id for later resume
        #[arg(long)]
        no_persist: bool,
    },
    /// Resume following a run, by default the one left by an interrupted submit
    Resume {
        run_id: Option<String>,
        #[command(flatten)]
        polling: PollingArgs,
    },
    /// Ask the server to cancel a run
    Cancel { run_id: String },
    /// Live view of a user's generations
    Watch {
        #[arg(long)]
        user: String,
        /// Comma-separated workflow types; empty means all
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long)]
        include_completed: bool,
        #[arg(long, default_value_t = genrun::registry::DEFAULT_LIMIT)]
        limit: usize,
        /// Bulk refresh interval
        #[arg(long)]
        refresh: Option<humantime::Duration>,
    },
}

#[derive(Debug, clap::Args, Clone)]
pub struct PollingArgs {
    #[arg(long, default_value = "2s")]
    pub poll_interval: humantime::Duration,
    #[arg(long, default_value_t = genrun::tracker::DEFAULT_MAX_POLLING_ATTEMPTS)]
    pub max_attempts: u32,
    /// Storage key for the persisted run id
    #[arg(long, default_value = DEFAULT_PERSIST_KEY)]
    pub persist_key: String,
}

impl PollingArgs {
    fn options(&self, persist: bool) -> TrackOptions<Value> {
        let opts = TrackOptions::default()
            .polling_interval(Duration::from(self.poll_interval))
            .max_polling_attempts(self.max_attempts);
        if persist {
            opts.persist_as(self.persist_key.clone())
        } else {
            opts
        }
    }
}

/// Build a `ClientConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: args.base_url.clone(),
        request_timeout: Duration::from(args.request_timeout),
        bearer_token: args.token.clone(),
        ..ClientConfig::default()
    }
}

fn open_store(args: &Cli) -> Result<Arc<FileStore>> {
    let path = match args.state_file.clone() {
        Some(p) => p,
        None => default_state_path().context("failed to resolve state file location")?,
    };
    Ok(Arc::new(FileStore::new(path)))
}

/// Drop the persisted run id if it names `run_id`. Returns whether it did.
fn forget_cancelled(store: &dyn PersistenceAdapter, key: &str, run_id: &str) -> bool {
    if RunTracker::<Value>::persisted_run_id(store, key).as_deref() != Some(run_id) {
        return false;
    }
    match store.remove(key) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, run_id, error = %e, "failed to clear persisted run id");
            false
        }
    }
}

/// Run the selected command; returns the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    let cfg = build_config(&args);
    let transport: Arc<dyn TransportAdapter> =
        Arc::new(HttpTransport::new(&cfg).context("failed to build HTTP client")?);

    match args.command.clone() {
        Command::Submit {
            endpoint,
            input,
            polling,
            no_persist,
        } => {
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let store = open_store(&args)?;
            let tracker = RunTracker::new(transport, store);
            tracker
                .submit(endpoint, input, polling.options(!no_persist))
                .await
                .context("failed to submit")?;
            follow(&args, &tracker).await
        }
        Command::Resume { run_id, polling } => {
            let store = open_store(&args)?;
            let run_id = match run_id {
                Some(id) => id,
                None => RunTracker::<Value>::persisted_run_id(store.as_ref(), &polling.persist_key)
                    .with_context(|| format!("no persisted run in {}", store.path().display()))?,
            };
            let tracker = RunTracker::new(transport, store);
            tracker.resume(run_id, polling.options(true)).await;
            follow(&args, &tracker).await
        }
        Command::Cancel { run_id } => {
            transport
                .cancel_run(&run_id)
                .await
                .with_context(|| format!("failed to cancel {run_id}"))?;
            let store = open_store(&args)?;
            forget_cancelled(store.as_ref(), DEFAULT_PERSIST_KEY, &run_id);
            eprintln!("Cancelled {run_id}");
            Ok(0)
        }
        Command::Watch {
            user,
            types,
            include_completed,
            limit,
            refresh,
        } => {
            let config = RegistryConfig {
                workflow_types: types.into_iter().filter(|t| !t.is_empty()).collect(),
                include_completed,
                limit,
                refresh_interval: refresh.map(Duration::from),
                ..RegistryConfig::default()
            };
            let registry = RegistrySync::acquire(transport, Some(user), config);
            watch(&args, registry).await
        }
    }
}

/// Follow a tracker to its terminal state, printing progress.
async fn follow(args: &Cli, tracker: &RunTracker<Value>) -> Result<i32> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let json = args.json;

    let printer = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            while let Some(ev) = evt_rx.recv().await {
                match ev {
                    RunEvent::Progress(snap) => {
                        if !json {
                            let _ = out_tx.send(OutputLine::Stderr(
                                crate::text_summary::progress_line(&snap),
                            ));
                        }
                    }
                    RunEvent::Info(msg) => {
                        let _ = out_tx.send(OutputLine::Stderr(msg));
                    }
                    RunEvent::Finished(snap) => {
                        if json {
                            if let Ok(s) = serde_json::to_string_pretty(&snap) {
                                let _ = out_tx.send(OutputLine::Stdout(s));
                            }
                        } else {
                            for line in crate::text_summary::finished_lines(&snap) {
                                let _ = out_tx.send(OutputLine::Stdout(line));
                            }
                        }
                    }
                }
            }
        }
    });

    let result = crate::orchestrator::drive_run(tracker, evt_tx).await;
    let _ = printer.await;
    drop(out_tx);
    let _ = out_handle.await;

    let snap = result?;
    Ok(match snap.status {
        Some(WorkflowRunStatus::Completed) => 0,
        Some(WorkflowRunStatus::Cancelled) => 130,
        _ => 1,
    })
}

async fn watch(args: &Cli, registry: RegistrySync) -> Result<i32> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (view_tx, mut view_rx) = mpsc::unbounded_channel::<RegistryView>();
    let json = args.json;

    let printer = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            while let Some(view) = view_rx.recv().await {
                let now = time::OffsetDateTime::now_utc();
                if json {
                    let body = serde_json::json!({
                        "generations": view.generations_with_status(now),
                        "stats": view.stats_by_type(),
                    });
                    let _ = out_tx.send(OutputLine::Stdout(body.to_string()));
                } else {
                    let _ = out_tx.send(OutputLine::Stdout(String::new()));
                    for line in crate::text_summary::registry_lines(&view, now) {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                }
            }
        }
    });

    crate::orchestrator::watch_registry(registry, view_tx).await?;
    let _ = printer.await;
    drop(out_tx);
    let _ = out_handle.await;
    Ok(0)
}
