//! Background jobs owned through explicit handles.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    clock_sync::{SyncedClock, TimeSource},
    engine::SharedEngine,
};

/// A spawned job that stops when asked, or is aborted when dropped.
pub struct TaskHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawns `job`, handing it a receiver that flips to `true` on shutdown.
    pub fn spawn<F, Fut>(name: &'static str, job: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(job(rx));
        debug!(task = name, "task started");
        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals the job and waits for it to return.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(task = self.name, error = %err, "task ended abnormally");
            }
        }
        debug!(task = self.name, "task stopped");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Ticks the engine every `period`. Late ticks are skipped, not bunched.
pub fn spawn_ticker(engine: SharedEngine, period: Duration) -> TaskHandle {
    TaskHandle::spawn("ticker", move |mut shutdown| async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    engine.lock().await.tick();
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Polls `source` and slews `clock` toward each measurement.
pub fn spawn_clock_sync<S: TimeSource>(clock: Arc<SyncedClock>, source: S) -> TaskHandle {
    TaskHandle::spawn("clock-sync", move |mut shutdown| async move {
        let mut slew = tokio::time::interval(clock.settings().slew_interval());
        slew.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let measurement = tokio::select! {
                measurement = source.measure() => measurement,
                _ = shutdown.changed() => return,
            };
            clock.apply_measurement(measurement);

            let next_poll = Instant::now() + clock.poll_interval();
            loop {
                tokio::select! {
                    _ = slew.tick() => {
                        clock.slew();
                    }
                    _ = tokio::time::sleep_until(next_poll) => break,
                    _ = shutdown.changed() => return,
                }
            }
        }
    })
}
