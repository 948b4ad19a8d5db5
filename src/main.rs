mod cli;
mod console;

use anyhow::{bail, Context};
use clap::Parser;
use cli::{Cli, Command, ConfigAction};
use colored::*;
use console::ConsoleSink;
use halcon_license_updater::scheduler::ScheduledJob;
use halcon_license_updater::types::{format_size, InstallReport};
use halcon_license_updater::{
    http_client, CheckSummary, ConfigStore, EventSink, InstallMode, LogSink, Orchestrator, Trigger,
    UpdateScheduler,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut store = ConfigStore::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    if store.detect_halcon_root() {
        store.save()?;
    }
    info!(
        "Settings loaded: {} relay(s), relay mode {}",
        store.settings().relays.len(),
        if store.settings().use_proxy { "on" } else { "off" }
    );

    if let Command::Config { action } = cli.command {
        return run_config(&mut store, action);
    }

    let console = Arc::new(ConsoleSink::new());
    let sink: Arc<dyn EventSink> = match cli.command {
        Command::Serve { .. } => Arc::new(LogSink),
        _ => console.clone(),
    };
    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(
        Orchestrator::new(store.shared(), sink, http_client()?, cancel.clone())
            .with_config(store.clone()),
    );

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping...");
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Command::Check { yes } => {
            let summary = orchestrator.run_check(Trigger::Manual).await?;
            console.finish_all();
            print_summary(&summary);
            if summary.downloaded > 0
                && (yes || confirm("Install the downloaded license files now?").await?)
            {
                let report = orchestrator.install_now(InstallMode::Interactive).await?;
                print_install(&report);
            }
            exit_status(&summary)
        }
        Command::Download => {
            let summary = orchestrator.run_check(Trigger::Manual).await?;
            console.finish_all();
            print_summary(&summary);
            exit_status(&summary)
        }
        Command::Install => {
            let report = orchestrator.install_now(InstallMode::Interactive).await?;
            print_install(&report);
            Ok(())
        }
        Command::Serve {
            interval,
            force,
            now,
        } => {
            if !store.settings().auto_update_enabled && !force {
                bail!("Automatic updates are disabled in the settings; pass --force to run anyway");
            }
            let interval = interval.unwrap_or_else(|| store.settings().interval());
            let scheduler = UpdateScheduler::new(Arc::clone(&orchestrator), interval);
            scheduler.enable();
            if now {
                orchestrator.run_scheduled().await;
            }
            cancel.cancelled().await;
            scheduler.disable();
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    };

    orchestrator.shutdown();
    result
}

fn run_config(store: &mut ConfigStore, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", store.path().display().to_string().bold());
            println!("{}", serde_json::to_string_pretty(store.settings())?);
        }
        ConfigAction::Set { key, value } => {
            let value = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value));
            store.update(&key, value)?;
            println!("{} {}", "Updated".green(), key);
        }
        ConfigAction::Relays => {
            let settings = store.settings();
            if !settings.use_proxy || settings.relays.is_empty() {
                println!("Relay mode off: direct connection only");
            }
            for (i, relay) in settings.relays.iter().enumerate() {
                println!(
                    "{}. {}",
                    i + 1,
                    halcon_license_updater::relay::relay_label(relay)
                );
            }
        }
    }
    Ok(())
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{} [y/N] ", question).as_bytes())
        .await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_summary(summary: &CheckSummary) {
    println!("\n{}", "Update Summary:".bold());
    println!("Folder: {} ({})", summary.folder_key, summary.trigger);
    if summary.listing_failed {
        println!("{}", "Listing failed; try again later".red());
        return;
    }
    println!("Found: {} file(s)", summary.found);
    println!("Downloaded: {}", summary.downloaded.to_string().green());
    println!("Failed: {}", summary.failed.to_string().red());
    println!("Total data transferred: {}", format_size(summary.total_bytes));
    println!("Total duration: {:.2?}", summary.total_duration);

    for outcome in &summary.outcomes {
        if outcome.succeeded() {
            println!(
                "✓ {} ({} in {:.2?})",
                outcome.file_name.green(),
                format_size(outcome.bytes_written),
                outcome.duration
            );
        } else {
            println!(
                "✗ {} - Error: {}",
                outcome.file_name.red(),
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    if let Some(report) = &summary.install {
        print_install(report);
    }
}

fn print_install(report: &InstallReport) {
    if report.is_empty() {
        println!("{}", "Nothing installed".yellow());
        return;
    }
    println!(
        "\n{} {} file(s) into {}",
        "Installed".green().bold(),
        report.installed(),
        report.license_dir.display()
    );
    for record in &report.records {
        if let Some(backup) = &record.backup_file {
            println!("  backup: {}", backup.display());
        }
    }
    for (source, err) in &report.failures {
        println!("✗ {} - {}", source.display().to_string().red(), err);
    }
}

fn exit_status(summary: &CheckSummary) -> anyhow::Result<()> {
    if summary.failed > 0 {
        error!("{} download(s) failed", summary.failed);
        bail!("Some downloads failed");
    }
    if summary.listing_failed {
        bail!("Could not fetch the license listing");
    }
    Ok(())
}
