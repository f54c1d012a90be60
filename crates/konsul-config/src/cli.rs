//! Convenience CLI surface layered on top of file/env configuration: a
//! `clap::Parser` carrying a handful of named flags plus a free-form
//! `--set key=value` escape hatch for anything the named flags don't cover.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "konsul", about = "Single-node service discovery and configuration")]
pub struct Cli {
    /// Path to a TOML configuration file. Defaults to `./konsul.toml` if present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override `listen_addr` ("host:port").
    #[arg(long)]
    pub listen: Option<String>,

    /// Override the DNS listener port.
    #[arg(long)]
    pub dns_port: Option<u16>,

    /// Override the persistence data directory.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Override `persistence_enabled`.
    #[arg(long)]
    pub persistence: Option<bool>,

    /// Override `acl.enabled`.
    #[arg(long)]
    pub acl_enabled: Option<bool>,

    /// Arbitrary dotted-key overrides, e.g. `--set rate_limit.burst=50`.
    /// Applied after every other layer, so it always wins.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

impl Cli {
    /// Splits each `--set key=value` into a `(key, value)` pair. Entries
    /// without an `=` are rejected rather than silently ignored.
    pub fn parsed_overrides(&self) -> Result<Vec<(String, String)>, String> {
        self.overrides
            .iter()
            .map(|raw| {
                raw.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| format!("malformed --set override (want key=value): '{raw}'"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_overrides() {
        let cli = Cli {
            overrides: vec!["rate_limit.burst=50".to_string(), "dns_port=8601".to_string()],
            ..Default::default()
        };
        let parsed = cli.parsed_overrides().unwrap();
        assert_eq!(
            parsed,
            vec![
                ("rate_limit.burst".to_string(), "50".to_string()),
                ("dns_port".to_string(), "8601".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_override_without_equals() {
        let cli = Cli {
            overrides: vec!["not-a-kv-pair".to_string()],
            ..Default::default()
        };
        assert!(cli.parsed_overrides().is_err());
    }
}
