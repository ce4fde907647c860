//! Process-level wiring shared by the binaries.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    clock::{ClockSource, SystemClock},
    clock_sync::{SntpSource, SyncedClock},
    config::Config,
    engine::{Engine, EngineSettings, SharedEngine},
    error::ConfigError,
    restore::{RestoreService, RestoreWriter},
    rundown::RundownFile,
    task::{TaskHandle, spawn_clock_sync, spawn_ticker},
};

pub struct Host {
    pub engine: SharedEngine,
    /// Whether a restore point was picked up.
    pub resumed: bool,
    tasks: Vec<TaskHandle>,
}

impl Host {
    /// Builds the clock and engine, resumes from the restore file and starts
    /// the background jobs. Must be called inside a tokio runtime.
    pub fn start(config: &Config, project: RundownFile) -> Result<Self, ConfigError> {
        let tz = config.time_zone()?;
        let mut tasks = Vec::new();

        let clock: Arc<dyn ClockSource> = match &config.clock.ntp_server {
            Some(server) => {
                let synced = Arc::new(SyncedClock::new(tz, config.clock.clone()));
                let source = SntpSource::new(server, Duration::from_millis(config.clock.timeout_ms));
                tasks.push(spawn_clock_sync(synced.clone(), source));
                info!(server, "clock sync enabled");
                synced
            }
            None => Arc::new(SystemClock::new(tz)),
        };

        let settings = EngineSettings {
            offset_mode: config.offset_mode,
            notify_interval: config.notify_interval(),
        };
        let mut engine = Engine::new(clock, project.rundown, project.custom_fields, settings)
            .with_restore(RestoreWriter::spawn(RestoreService::new(&config.restore_file)));
        let resumed = engine.resume_from_service(&RestoreService::new(&config.restore_file));

        let engine = engine.into_shared();
        tasks.push(spawn_ticker(engine.clone(), config.tick_interval()));

        Ok(Self {
            engine,
            resumed,
            tasks,
        })
    }

    /// Stops the background jobs, then the engine. Clears the restore point.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
        self.engine.lock().await.shutdown().await;
    }
}
