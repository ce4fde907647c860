use std::{path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use jiff::tz::TimeZone;
use serde::{Deserialize, Serialize};

use crate::{clock_sync::SyncSettings, error::ConfigError, runtime::OffsetMode};

pub const CONFIG_FILE: &str = "showclock.toml";
pub const ENV_PREFIX: &str = "SHOWCLOCK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub restore_file: PathBuf,
    /// IANA name or POSIX TZ string; the system zone when unset.
    pub time_zone: Option<String>,
    pub offset_mode: OffsetMode,
    pub tick_interval_ms: u64,
    pub notify_interval_ms: u64,
    pub clock: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4001".to_owned(),
            restore_file: PathBuf::from("showclock.restore.json"),
            time_zone: None,
            offset_mode: OffsetMode::Absolute,
            tick_interval_ms: 32,
            notify_interval_ms: 1000,
            clock: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(|err| ConfigError::Figment(Box::new(err)))
    }

    pub fn time_zone(&self) -> Result<TimeZone, ConfigError> {
        let Some(name) = self.time_zone.as_deref() else {
            return Ok(TimeZone::system());
        };
        TimeZone::get(name)
            .or_else(|_| TimeZone::posix(name))
            .map_err(|source| ConfigError::TimeZone {
                name: name.to_owned(),
                source,
            })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }
}
