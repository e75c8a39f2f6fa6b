use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use vms::batch::BatchResult;
use vms::cli::{Action, Cli, OutputFormat};
use vms::config::{self, Config};
use vms::connection::ConnectionManager;
use vms::dispatcher::{Dispatcher, NoopObserver, resolve_and_dispatch};
use vms::error::VmsError;
use vms::hypervisor::libvirt::LibvirtConnector;
use vms::logging;
use vms::operation::{OperationKind, OperationRequest};
use vms::progress::{BatchProgress, OutputMode};
use vms::render;
use vms::selector;

type Libvirt = Dispatcher<LibvirtConnector>;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = OutputMode::resolve(cli.verbose, cli.quiet, std::io::stderr().is_terminal());
    let log_file = logging::init(mode);

    let config = config::load_config(cli.config.as_deref())?
        .with_overrides(cli.connect.clone(), cli.workers)?;

    if let Some(path) = cli.log_file.clone().or_else(|| config.log_file())
        && let Err(e) = log_file.attach(&path)
    {
        eprintln!("warning: cannot write log file {}: {e}", path.display());
    }

    let connection = Arc::new(ConnectionManager::new(
        LibvirtConnector,
        config.connect.clone(),
        config.reconnect_attempts,
    ));
    let dispatcher = Dispatcher::new(connection.clone(), config.workers);

    let result = run(&cli, &config, &dispatcher, mode).await;
    connection.release().await;

    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cli: &Cli, config: &Config, dispatcher: &Libvirt, mode: OutputMode) -> Result<i32, VmsError> {
    let json = cli.format == OutputFormat::Json;

    match cli.action(&config.snapshot_description) {
        Action::ListDomains(patterns) => {
            let domains = dispatcher.list_domains().await?;
            let selected = selector::resolve_patterns(patterns, &domains)?;
            let times = dispatcher.guest_times(&selected).await?;
            if json {
                println!("{}", render::domains_json(&selected, &times));
            } else {
                print!("{}", render::domains_table(&selected, &times));
            }
            Ok(0)
        }
        Action::ListAddresses(patterns) => {
            let domains = dispatcher.list_domains().await?;
            let selected = selector::resolve_patterns(patterns, &domains)?;
            let interfaces = dispatcher.list_addresses(&selected).await?;
            if json {
                println!("{}", render::addresses_json(&interfaces));
            } else if interfaces.is_empty() {
                println!("No addresses");
            } else {
                print!("{}", render::addresses_table(&interfaces));
            }
            Ok(0)
        }
        Action::ListSnapshots(patterns) => {
            let domains = dispatcher.list_domains().await?;
            let selected = selector::resolve_patterns(patterns, &domains)?;
            let snapshots = dispatcher.list_snapshots(&selected).await?;
            if json {
                println!("{}", render::snapshots_json(&snapshots));
            } else if snapshots.is_empty() {
                println!("No snapshots");
            } else {
                print!("{}", render::snapshots_table(&snapshots));
            }
            Ok(0)
        }
        Action::Batch(kind, patterns) => {
            let cancel = CancellationToken::new();
            let interrupt = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupted, waiting for in-flight operations");
                        cancel.cancel();
                    }
                }
            });

            let result = run_batch(config, dispatcher, patterns, kind, &cancel, mode, json).await;
            interrupt.abort();
            result
        }
    }
}

async fn run_batch(
    config: &Config,
    dispatcher: &Libvirt,
    patterns: &[String],
    kind: OperationKind,
    cancel: &CancellationToken,
    mode: OutputMode,
    json: bool,
) -> Result<i32, VmsError> {
    let observer_mode = if json { OutputMode::Quiet } else { mode };
    let progress = BatchProgress::new(kind.progress_message(), observer_mode);
    let batch = resolve_and_dispatch(dispatcher, patterns, kind, cancel, &progress).await;
    progress.finish();
    let batch = batch?;

    if batch.is_empty() {
        if json {
            println!("{}", render::batch_json(&batch));
        } else if mode != OutputMode::Quiet {
            println!("No domains matched");
        }
        return Ok(batch.exit_status());
    }

    if matches!(batch.operation(), OperationKind::SnapshotRevert { .. })
        && config.sync_time_after_revert
        && !cancel.is_cancelled()
    {
        sync_time_after_revert(dispatcher, &batch, cancel, mode).await;
    }

    if json {
        println!("{}", render::batch_json(&batch));
    } else if mode == OutputMode::Quiet {
        for line in render::batch_failures(&batch) {
            eprintln!("{line}");
        }
    } else {
        println!("{}", render::batch_summary(&batch));
    }
    Ok(batch.exit_status())
}

/// Best effort: reverted guests come back with the clock of the snapshot.
/// Failures are reported but never fail the revert.
async fn sync_time_after_revert(
    dispatcher: &Libvirt,
    reverted: &BatchResult,
    cancel: &CancellationToken,
    mode: OutputMode,
) {
    let names: Vec<&str> = reverted
        .outcomes()
        .iter()
        .filter(|o| o.outcome.is_success())
        .map(|o| o.vm.as_str())
        .collect();
    if names.is_empty() {
        return;
    }

    // Revert changes the power state, so decide from a fresh listing.
    let domains = match dispatcher.list_domains().await {
        Ok(domains) => domains,
        Err(e) => {
            tracing::warn!("skipping time sync after revert: {e}");
            return;
        }
    };
    let vms = domains
        .into_iter()
        .filter(|d| names.contains(&d.name.as_str()))
        .collect();

    let synced = dispatcher
        .dispatch(OperationRequest::new(OperationKind::SyncTime, vms), cancel, &NoopObserver)
        .await;
    for o in synced.outcomes().iter().filter(|o| !o.outcome.is_success()) {
        tracing::warn!(vm = %o.vm, "time sync after revert failed: {}", o.outcome.detail());
        if mode != OutputMode::Quiet {
            eprintln!("warning: {}: time sync failed: {}", o.vm, o.outcome.detail());
        }
    }
}
