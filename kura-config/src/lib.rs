//! Shared configuration for Kura processes.
//!
//! Loads [`KuraSettings`] from files, inline JSON or the environment and
//! installs the `tracing` subscriber. The `kura-queuectl` binary builds on
//! both to inspect and repair the persisted command queue.

pub mod settings;
pub mod telemetry;

pub use settings::{EnvSources, KuraSettings, SettingsFormat, SettingsSource};
pub use telemetry::{DEFAULT_DIRECTIVES, init_tracing};
