//! CLI entry point for the transfer manager.

use std::collections::{HashMap, HashSet};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, info, warn};
use transfer_core::{
    Engine, EngineConfig, Subscription, Transfer, TransferEvent, TransferFilter, TransferId,
    TransferStatus,
};

mod cli;

use cli::{Cli, Command, GetArgs, IdArg, ListArgs, RunArgs};

/// How often `run` re-checks whether the engine has gone idle.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let mut config = EngineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path.clone_from(db);
    }

    match cli.command {
        Command::Get(args) => get(config, args, cli.quiet).await,
        Command::Run(args) => run(config, args, cli.quiet).await,
        Command::List(args) => list(config, &args).await,
        Command::Pause(IdArg { id }) => {
            one_shot(config, |engine| async move {
                engine.pause(&TransferId::from(id.as_str())).await?;
                println!("Paused {id}");
                anyhow::Ok(())
            })
            .await
        }
        Command::Resume(IdArg { id }) => {
            one_shot(config, |engine| async move {
                engine.resume(&TransferId::from(id.as_str())).await?;
                println!("Queued {id}; start it with `transfer-manager run`");
                anyhow::Ok(())
            })
            .await
        }
        Command::Cancel(IdArg { id }) => {
            one_shot(config, |engine| async move {
                engine.cancel(&TransferId::from(id.as_str())).await?;
                println!("Cancelled {id}");
                anyhow::Ok(())
            })
            .await
        }
        Command::Retry(IdArg { id }) => {
            one_shot(config, |engine| async move {
                engine.retry_now(&TransferId::from(id.as_str())).await?;
                println!("Queued {id} for retry; start it with `transfer-manager run`");
                anyhow::Ok(())
            })
            .await
        }
        Command::Remove(IdArg { id }) => {
            one_shot(config, |engine| async move {
                engine.remove(&TransferId::from(id.as_str())).await?;
                println!("Removed {id}");
                anyhow::Ok(())
            })
            .await
        }
        Command::Clear => {
            one_shot(config, |engine| async move {
                let removed = engine.remove_all().await?;
                println!("Removed {removed} transfer(s)");
                anyhow::Ok(())
            })
            .await
        }
    }
}

/// Opens the engine, runs `command` against it, then closes it.
async fn one_shot<F, Fut>(config: EngineConfig, command: F) -> Result<ExitCode>
where
    F: FnOnce(Engine) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let engine = Engine::open(config).await?;
    let result = command(engine.clone()).await;
    engine.close().await;
    result.map(|()| ExitCode::SUCCESS)
}

async fn get(mut config: EngineConfig, args: GetArgs, quiet: bool) -> Result<ExitCode> {
    if args.name.is_some() && args.urls.len() > 1 {
        bail!("--name can only be used with a single URL");
    }
    if let Some(dir) = args.output_dir {
        config.destination_dir = dir;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent = usize::from(concurrency);
    }

    let engine = Engine::open(config).await?;
    let events = engine.subscribe();
    engine.start().await;

    let mut pending = HashSet::new();
    let mut rejected = 0usize;
    for url in &args.urls {
        match engine.submit(url, args.name.as_deref()).await {
            Ok(id) => {
                debug!(%id, %url, "submitted");
                pending.insert(id);
            }
            Err(e) => {
                warn!(%url, error = %e, "rejected");
                eprintln!("Skipping {url}: {e}");
                rejected += 1;
            }
        }
    }

    let mut display = Display::new(quiet);
    for id in &pending {
        if let Ok(transfer) = engine.get(id).await {
            display.track(&transfer);
        }
    }

    let summary = drive(&engine, events, &mut display, Some(pending)).await?;
    engine.close().await;
    Ok(summary.exit_code(rejected))
}

async fn run(mut config: EngineConfig, args: RunArgs, quiet: bool) -> Result<ExitCode> {
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent = usize::from(concurrency);
    }

    let engine = Engine::open(config).await?;
    let queued = engine.list(&TransferFilter::active()).await?;
    if queued.is_empty() {
        println!("Nothing to do: no queued transfers");
        engine.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    let events = engine.subscribe();
    let mut display = Display::new(quiet);
    for transfer in &queued {
        display.track(transfer);
    }
    info!(queued = queued.len(), "processing persisted transfers");
    engine.start().await;

    let summary = drive(&engine, events, &mut display, None).await?;
    engine.close().await;
    Ok(summary.exit_code(0))
}

async fn list(config: EngineConfig, args: &ListArgs) -> Result<ExitCode> {
    let filter = TransferFilter {
        statuses: args.status.clone(),
        ..TransferFilter::all()
    };
    one_shot(config, |engine| async move {
        let transfers = engine.list(&filter).await?;
        if transfers.is_empty() {
            println!("No transfers");
            return anyhow::Ok(());
        }
        println!(
            "{:<36}  {:<9}  {:>6}  {:>10}  NAME",
            "ID", "STATUS", "DONE", "SIZE"
        );
        for transfer in &transfers {
            println!("{}", format_row(transfer));
        }
        anyhow::Ok(())
    })
    .await
}

fn format_row(transfer: &Transfer) -> String {
    let percent = transfer
        .progress_percent()
        .map_or_else(|| "-".to_string(), |p| format!("{p:.0}%"));
    let size = transfer
        .total_size
        .map_or_else(|| "?".to_string(), |s| HumanBytes(s).to_string());
    let mut row = format!(
        "{:<36}  {:<9}  {:>6}  {:>10}  {}",
        transfer.id.as_str(),
        transfer.status.as_str(),
        percent,
        size,
        transfer.file_name
    );
    if let Some(error) = &transfer.last_error
        && transfer.status == TransferStatus::Failed
    {
        row.push_str(&format!("  ({error})"));
    }
    row
}

/// Counts of how tracked transfers ended.
#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    failed: usize,
    cancelled: usize,
    interrupted: bool,
}

impl Summary {
    fn exit_code(&self, rejected: usize) -> ExitCode {
        if self.interrupted {
            ExitCode::from(130)
        } else if self.failed + rejected == 0 {
            ExitCode::SUCCESS
        } else if self.completed > 0 {
            ExitCode::from(2)
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Renders events until the tracked transfers are done, the engine is idle,
/// or Ctrl-C is pressed.
async fn drive(
    engine: &Engine,
    mut events: Subscription,
    display: &mut Display,
    mut pending: Option<HashSet<TransferId>>,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut idle_check = tokio::time::interval(IDLE_POLL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if let Some(pending) = &pending
            && pending.is_empty()
        {
            break;
        }

        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                eprintln!("Interrupted; saving progress...");
                engine.shutdown().await;
                summary.interrupted = true;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(finished) = display.apply(&event) {
                    match finished {
                        TransferStatus::Completed => summary.completed += 1,
                        TransferStatus::Cancelled => summary.cancelled += 1,
                        TransferStatus::Failed => summary.failed += 1,
                        _ => {}
                    }
                    if let Some(pending) = pending.as_mut() {
                        pending.remove(event.id());
                    }
                }
            }
            _ = idle_check.tick(), if pending.is_none() => {
                if engine.is_idle().await {
                    break;
                }
            }
        }
    }

    display.finish();
    info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Transfers finished"
    );
    Ok(summary)
}

/// One progress bar per tracked transfer.
struct Display {
    multi: MultiProgress,
    bars: HashMap<TransferId, ProgressBar>,
    style: ProgressStyle,
}

impl Display {
    fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let style = ProgressStyle::with_template(
            "{prefix:.bold} [{bar:30}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi,
            bars: HashMap::new(),
            style,
        }
    }

    fn track(&mut self, transfer: &Transfer) {
        let bar = self
            .multi
            .add(ProgressBar::new(transfer.total_size.unwrap_or(0)));
        bar.set_style(self.style.clone());
        bar.set_prefix(transfer.file_name.clone());
        bar.set_position(transfer.completed_bytes());
        bar.set_message(transfer.status.as_str());
        self.bars.insert(transfer.id.clone(), bar);
    }

    /// Updates the bars; returns the final status when a tracked transfer ends.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply(&mut self, event: &TransferEvent) -> Option<TransferStatus> {
        let bar = self.bars.get(event.id())?;
        match event {
            TransferEvent::Progress {
                completed_bytes,
                total_size,
                speed,
                ..
            } => {
                if let Some(total) = total_size {
                    bar.set_length(*total);
                }
                bar.set_position(*completed_bytes);
                bar.set_message(format!("{}/s", HumanBytes(speed.max(0.0) as u64)));
                None
            }
            TransferEvent::StatusChanged {
                to, error, retry_in, ..
            } => match (to, retry_in) {
                (TransferStatus::Completed, _) => {
                    bar.finish_with_message("done");
                    Some(*to)
                }
                (TransferStatus::Cancelled, _) => {
                    bar.abandon_with_message("cancelled");
                    Some(*to)
                }
                (TransferStatus::Failed, Some(delay)) => {
                    bar.set_message(format!("retrying in {}s", delay.as_secs().max(1)));
                    None
                }
                (TransferStatus::Failed, None) => {
                    bar.abandon_with_message(format!(
                        "failed: {}",
                        error.as_deref().unwrap_or("unknown error")
                    ));
                    Some(*to)
                }
                (TransferStatus::Paused, _) => {
                    bar.abandon_with_message("paused");
                    Some(*to)
                }
                (status, _) => {
                    bar.set_message(status.as_str());
                    None
                }
            },
            TransferEvent::Removed { .. } => {
                bar.abandon_with_message("removed");
                Some(TransferStatus::Cancelled)
            }
            TransferEvent::Created(_) => None,
        }
    }

    fn finish(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}
