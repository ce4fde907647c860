pub mod api;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod host;
pub mod metadata;
pub mod restore;
pub mod rundown;
pub mod runtime;
pub mod task;
pub mod timer;
