//! fleetroll-core: configuration shared by the fleetroll crates.
//!
//! `fleetroll.toml` is parsed into [`FleetConfig`]. Durations are written as
//! short strings (`"5s"`, `"500ms"`, `"10m"`) and resolved through
//! [`parse_duration`].

pub mod config;

pub use config::{
    parse_duration, CommandConfig, ConfigError, DispatchConfig, ExecutorConfig, FleetConfig,
    LockConfig, NotifyConfig, PollConfig, StoreConfig,
};
