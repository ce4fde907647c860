use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use showclock::{
    config::Config,
    duration::format_clock,
    engine::Notification,
    host::Host,
    metadata::process_rundown,
    restore::RestoreService,
    rundown::RundownFile,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser)]
enum Command {
    /// Print the processed rundown metadata.
    Inspect { rundown: PathBuf },
    /// Run the timer in the terminal until Ctrl-C.
    Run {
        rundown: PathBuf,
        /// Follow the schedule instead of waiting for commands.
        #[clap(long)]
        roll: bool,
        /// Load and start this event.
        #[clap(long)]
        event: Option<String>,
    },
    /// Remove the restore file.
    Clean,
}

fn read_project(path: &Path) -> Result<RundownFile> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run(config: Config, project: RundownFile, roll: bool, event: Option<String>) -> Result<()> {
    let host = Host::start(&config, project)?;
    let mut notifications = {
        let mut engine = host.engine.lock().await;
        if !host.resumed {
            if roll {
                engine.roll();
            } else if let Some(id) = &event {
                if !(engine.load_event(id) && engine.start()) {
                    warn!(event_id = %id, "could not start event");
                }
            }
        }
        engine.subscribe()
    };

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(Notification::Runtime { patch }) => {
                    let Some(timer) = patch.timer else { continue };
                    let current = timer.current.map_or_else(|| "--:--:--".to_owned(), format_clock);
                    println!("{:>6} {current}", timer.playback.as_str());
                }
                Ok(Notification::TimerFinished { event_id }) => {
                    info!(?event_id, "finished");
                }
                Ok(Notification::Rundown { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "fell behind on notifications"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::load()?;
    match args.cmd {
        Command::Inspect { rundown } => {
            let project = read_project(&rundown)?;
            let processed = process_rundown(&project.rundown, &project.custom_fields, &mut |warning| {
                warn!("{warning}");
            });
            println!("{}", serde_json::to_string_pretty(&processed.metadata)?);
        }
        Command::Run { rundown, roll, event } => {
            let project = read_project(&rundown)?;
            run(config, project, roll, event).await?;
        }
        Command::Clean => {
            RestoreService::new(&config.restore_file).clear()?;
            info!(path = %config.restore_file.display(), "restore file removed");
        }
    }
    Ok(())
}
