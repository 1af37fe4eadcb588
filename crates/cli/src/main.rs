//! Courier entry point: CLI parsing, telemetry, and the watcher-driven
//! reconciliation loop.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    courier_config::{ConfigWatcher, StatusSink, validate_document},
    courier_discord::DiscordConnector,
    courier_supervisor::{AccountSupervisor, SupervisorOptions},
};

#[derive(Parser)]
#[command(name = "courier", about = "Courier — chat-session → webhook relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom data directory (overrides default ~/.courier/).
    #[arg(long, global = true, env = "COURIER_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay daemon (default when no subcommand is provided).
    Run,
    /// Show per-account status from the status sink.
    Status,
    /// Validate the desired-state document and report problems.
    Validate,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(courier_config::data_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(data_dir).await,
        Commands::Status => status(&data_dir),
        Commands::Validate => validate(&data_dir),
    }
}

/// Watcher-driven main loop: every reload trigger re-reads the document
/// and hands it to the supervisor. Triggers are handled serially, so two
/// reconciliation passes never overlap.
async fn run(data_dir: PathBuf) -> Result<()> {
    let document_path = courier_config::document_path(&data_dir);
    let signal_path = courier_config::signal_path(&data_dir);
    let status = Arc::new(StatusSink::new(courier_config::status_path(&data_dir)));

    let mut supervisor = AccountSupervisor::new(
        Arc::new(DiscordConnector::new()),
        Arc::clone(&status),
        courier_config::mappings_dir(&data_dir),
        None,
        SupervisorOptions::default(),
    );

    info!(data_dir = %data_dir.display(), "courier starting");

    match courier_config::load_document_with_retry(&document_path).await {
        Ok(doc) => {
            report_problems(&doc);
            supervisor.reconcile(&doc.accounts).await;
        },
        Err(e) => warn!(error = %e, "initial document load failed, waiting for changes"),
    }

    let (watcher, mut reloads) = ConfigWatcher::start(document_path.clone(), signal_path)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            },
            event = reloads.recv() => {
                let Some(event) = event else { break };
                info!(?event, "desired state changed, reconciling");
                match courier_config::load_document_with_retry(&document_path).await {
                    Ok(doc) => {
                        report_problems(&doc);
                        supervisor.reconcile(&doc.accounts).await;
                    },
                    // Abandoned until the next trigger.
                    Err(e) => warn!(error = %e, "reconciliation pass abandoned"),
                }
            },
        }
    }

    supervisor.shutdown().await;
    drop(watcher);
    info!("courier stopped");
    Ok(())
}

fn report_problems(doc: &courier_config::DesiredStateDoc) {
    for problem in validate_document(doc) {
        warn!(%problem, "desired-state document problem");
    }
}

fn status(data_dir: &std::path::Path) -> Result<()> {
    let entries = courier_config::status::load(&courier_config::status_path(data_dir))?;
    if entries.is_empty() {
        println!("no accounts");
        return Ok(());
    }
    let mut ids: Vec<&String> = entries.keys().collect();
    ids.sort();
    for id in ids {
        let entry = &entries[id];
        if entry.message.is_empty() {
            println!("{id}: {}", entry.state);
        } else {
            println!("{id}: {} — {}", entry.state, entry.message);
        }
    }
    Ok(())
}

fn validate(data_dir: &std::path::Path) -> Result<()> {
    let document_path = courier_config::document_path(data_dir);
    let doc = courier_config::load_document(&document_path)?;
    let problems = validate_document(&doc);
    if problems.is_empty() {
        println!(
            "{} ok ({} accounts)",
            document_path.display(),
            doc.accounts.len()
        );
        return Ok(());
    }
    for problem in &problems {
        println!("problem: {problem}");
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}
