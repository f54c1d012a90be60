//! Startup configuration: CLI parsing plus the layered defaults/file/env/
//! override resolution described in spec §6.
//!
//! Built as a clap-derived CLI struct layered over a `config`-crate builder
//! with typed getters and fallbacks — a startup bootstrap concern, distinct
//! from runtime configuration *management* (pushing config to subscribed
//! clients), which this crate does not attempt.

mod cli;
mod settings;

pub use cli::Cli;
pub use settings::{AclSettings, AuthSettings, KonsulConfig, RateLimitSettings, WatchSettings};
