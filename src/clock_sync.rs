//! Drift-corrected clock.
//!
//! A [`TimeSource`] measures how far the local clock is from a reference. The
//! [`SyncedClock`] keeps two offsets: the latest *measured* one and the
//! *active* one it actually applies. The active offset slews toward the
//! measured one in bounded steps so the visible clock never jumps.

use std::{
    future::Future,
    sync::{
        Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use jiff::{Timestamp, tz::TimeZone};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::{
    clock::{ClockSource, shift, truncate_to_millis},
    error::ClockError,
};

/// Seconds between the NTP era start (1900) and the unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;
const NTP_PACKET_LEN: usize = 48;

pub trait TimeSource: Send + Sync + 'static {
    /// Offset of the reference clock relative to the local clock, in ms.
    /// Positive when the local clock is behind.
    fn measure(&self) -> impl Future<Output = Result<i64, ClockError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub ntp_server: Option<String>,
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
    /// Largest change applied to the active offset per slew cycle.
    pub max_slew_ms: i64,
    /// Drift beyond which polling speeds up.
    pub large_drift_ms: i64,
    pub slew_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ntp_server: None,
            min_poll_secs: 16,
            max_poll_secs: 1024,
            max_slew_ms: 5,
            large_drift_ms: 100,
            slew_interval_ms: 1000,
            timeout_ms: 2000,
        }
    }
}

impl SyncSettings {
    pub fn min_poll(&self) -> Duration {
        Duration::from_secs(self.min_poll_secs.max(1))
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs.max(self.min_poll_secs).max(1))
    }

    pub fn slew_interval(&self) -> Duration {
        Duration::from_millis(self.slew_interval_ms.max(1))
    }
}

#[derive(Debug)]
struct SyncState {
    measured: Option<i64>,
    poll_interval: Duration,
}

#[derive(Debug)]
pub struct SyncedClock {
    tz: TimeZone,
    settings: SyncSettings,
    active: AtomicI64,
    state: Mutex<SyncState>,
}

impl SyncedClock {
    pub fn new(tz: TimeZone, settings: SyncSettings) -> Self {
        let poll_interval = settings.min_poll();
        Self {
            tz,
            settings,
            active: AtomicI64::new(0),
            state: Mutex::new(SyncState {
                measured: None,
                poll_interval,
            }),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn active_offset(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn measured_offset(&self) -> Option<i64> {
        self.state().measured
    }

    pub fn poll_interval(&self) -> Duration {
        self.state().poll_interval
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the outcome of one poll.
    ///
    /// A failed poll keeps the last known offset and leaves the interval
    /// alone.
    pub fn apply_measurement(&self, measurement: Result<i64, ClockError>) {
        let measured = match measurement {
            Ok(measured) => measured,
            Err(err) => {
                warn!(error = %err, "clock sync failed, keeping last offset");
                return;
            }
        };

        let drift = (measured - self.active_offset()).abs();
        let mut state = self.state();
        state.measured = Some(measured);
        state.poll_interval = if drift > self.settings.large_drift_ms {
            (state.poll_interval / 2).max(self.settings.min_poll())
        } else {
            (state.poll_interval * 2).min(self.settings.max_poll())
        };
        debug!(
            measured,
            drift,
            poll_secs = state.poll_interval.as_secs(),
            "clock offset measured"
        );
    }

    /// Moves the active offset one bounded step toward the measured offset
    /// and returns the new active offset.
    pub fn slew(&self) -> i64 {
        let Some(target) = self.measured_offset() else {
            return self.active_offset();
        };
        let active = self.active_offset();
        let step = (target - active).clamp(-self.settings.max_slew_ms, self.settings.max_slew_ms);
        let next = active + step;
        self.active.store(next, Ordering::Release);
        next
    }
}

impl ClockSource for SyncedClock {
    fn now(&self) -> Timestamp {
        shift(truncate_to_millis(Timestamp::now()), self.active_offset())
    }

    fn time_zone(&self) -> &TimeZone {
        &self.tz
    }
}

/// Minimal SNTPv4 client.
#[derive(Debug, Clone)]
pub struct SntpSource {
    server: String,
    timeout: Duration,
}

impl SntpSource {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

impl TimeSource for SntpSource {
    async fn measure(&self) -> Result<i64, ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.server).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        // LI = 0, version 4, mode 3 (client)
        request[0] = 0x23;

        let sent = Timestamp::now();
        let exchange = async {
            socket.send(&request).await?;
            let mut reply = [0u8; NTP_PACKET_LEN];
            let len = socket.recv(&mut reply).await?;
            Ok::<_, std::io::Error>((reply, len))
        };
        let (reply, len) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClockError::Timeout(self.timeout.as_millis() as u64))??;
        let received = Timestamp::now();

        parse_offset(&reply[..len], sent, received)
    }
}

fn ntp_to_unix_millis(bytes: &[u8]) -> i64 {
    let seconds = i64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    let fraction = i64::from(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
    (seconds - NTP_UNIX_OFFSET) * 1000 + ((fraction * 1000) >> 32)
}

/// Clock offset from an SNTP reply and the local send/receive instants.
pub fn parse_offset(reply: &[u8], sent: Timestamp, received: Timestamp) -> Result<i64, ClockError> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(ClockError::InvalidReply("short packet"));
    }
    if reply[0] & 0x07 != 4 {
        return Err(ClockError::InvalidReply("not a server reply"));
    }
    if reply[1] == 0 {
        return Err(ClockError::InvalidReply("kiss-of-death"));
    }

    let server_received = ntp_to_unix_millis(&reply[32..40]);
    let server_sent = ntp_to_unix_millis(&reply[40..48]);
    let t1 = sent.as_millisecond();
    let t4 = received.as_millisecond();
    Ok(((server_received - t1) + (server_sent - t4)) / 2)
}
