use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daywall_core::{Notifier, RunTrigger, UiEvent};
use daywall_sync::{
    drive_ui_events, next_trigger, report_outcome, DaywallConfig, PipelineJob, PipelineRunner,
    Scheduler, SystemWallpaperApplier, TracingNotifier,
};
use daywall_web::{AppState, NotificationFeed};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "daywall")]
#[command(about = "Changes the desktop wallpaper once a day")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule daily updates and serve the control panel (default).
    Run,
    /// Update the wallpaper now and exit.
    Once,
    /// Show paths, the last update day and the next slot.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(
                    "daywall_cli=info,daywall_sync=info,daywall_adapters=info,daywall_storage=info,daywall_web=info",
                )),
        )
        .init();

    let cli = Cli::parse();
    let config = DaywallConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Once => {
            config.ensure_dirs()?;
            let runner = PipelineRunner::new(config, Arc::new(SystemWallpaperApplier))?;
            let result = runner.run_once(RunTrigger::Forced).await;
            report_outcome(&TracingNotifier, RunTrigger::Forced, &result);
            result?;
        }
        Commands::Status => {
            let marker = config.marker_store();
            let last = marker
                .read()
                .await
                .map(|d| d.to_string())
                .unwrap_or_else(|| "never".into());
            let now = chrono::Local::now();
            println!("data dir:      {}", config.app_dir.display());
            println!("scratch dir:   {}", config.scratch_dir.display());
            println!("wallpaper:     {}", config.wallpaper_path().display());
            println!("last update:   {last}");
            println!("updated today: {}", marker.was_updated_today().await);
            println!("next slot:     {}", next_trigger(&now, config.trigger_at));
        }
    }

    Ok(())
}

async fn run(config: DaywallConfig) -> Result<()> {
    config.ensure_dirs()?;
    // Nothing is spawned until the port is ours.
    let listener = bind_control_panel(config.ui_port).await?;
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let feed = Arc::new(NotificationFeed::new());
    let notifier: Arc<dyn Notifier> = feed.clone();

    let job: Arc<dyn PipelineJob> = Arc::new(PipelineRunner::new(
        config.clone(),
        Arc::new(SystemWallpaperApplier),
    )?);

    let scheduler = Scheduler::new(
        Arc::clone(&job),
        config.marker_store(),
        Arc::clone(&notifier),
        config.trigger_at,
    )
    .spawn(cancel.clone());

    let bridge = tokio::spawn(drive_ui_events(
        events_rx,
        Arc::clone(&job),
        Arc::clone(&notifier),
        cancel.clone(),
    ));

    let ctrl_c_tx = events_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = ctrl_c_tx.send(UiEvent::ExitRequested);
        }
    });

    let state = AppState::new(events_tx, feed, config.trigger_at.format("%H:%M").to_string());
    if let Err(err) = daywall_web::serve(listener, state, cancel.clone()).await {
        warn!(error = %format!("{err:#}"), "control panel stopped");
        cancel.cancel();
    }

    let _ = bridge.await;
    scheduler.await.context("scheduler task failed")?;
    info!("daywall stopped");
    Ok(())
}

async fn bind_control_panel(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding control panel on port {port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_control_panel_port_is_an_error() {
        let taken = bind_control_panel(0).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_control_panel(port).await.unwrap_err();
        assert!(format!("{err:#}").contains(&format!("port {port}")));
    }
}
