//! Layered configuration (spec §6): defaults → TOML file → `KONSUL_*` env
//! vars → CLI convenience flags → `--set key=value` overrides, each layer
//! strictly overriding the one before it.
//!
//! Built from `config::Config::builder()` with `set_default`, `add_source`,
//! and `set_override` layered in priority order, then a typed-getter struct
//! assembled from `get_*` calls with `unwrap_or` fallbacks.

use config::{Config, Environment, File};
use konsul_common::ConError;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_sec: f64,
    pub burst: f64,
    pub by_ip: bool,
    pub by_apikey: bool,
    pub cleanup_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WatchSettings {
    pub enabled: bool,
    pub buffer_size: usize,
    pub max_per_client: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    pub enabled: bool,
    pub token_ttl_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AclSettings {
    pub enabled: bool,
    pub policy_dir: String,
}

/// Fully resolved configuration, ready to hand to `konsul-core`/`konsul-server`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KonsulConfig {
    pub listen_addr: String,
    pub dns_port: u16,
    pub dns_domain: String,
    pub service_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub persistence_enabled: bool,
    pub data_dir: String,
    pub sync_writes: bool,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub public_paths: Vec<String>,
    pub acl: AclSettings,
    pub watch: WatchSettings,
}

impl Default for KonsulConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            dns_port: 8600,
            dns_domain: "consul".to_string(),
            service_ttl_secs: 30,
            cleanup_interval_secs: 60,
            persistence_enabled: false,
            data_dir: "./data".to_string(),
            sync_writes: true,
            auth: AuthSettings {
                enabled: false,
                token_ttl_secs: 3600,
            },
            rate_limit: RateLimitSettings {
                enabled: true,
                requests_per_sec: 100.0,
                burst: 20.0,
                by_ip: true,
                by_apikey: false,
                cleanup_interval_secs: 300,
            },
            public_paths: vec!["/health".to_string()],
            acl: AclSettings {
                enabled: false,
                policy_dir: "./policies".to_string(),
            },
            watch: WatchSettings {
                enabled: true,
                buffer_size: 100,
                max_per_client: 100,
            },
        }
    }
}

impl KonsulConfig {
    /// Builds the layered `config::Config` and resolves it into a typed
    /// `KonsulConfig`. `cli.config` picks the file layer; absent that, a
    /// `konsul.toml` in the working directory is used if present (and
    /// silently skipped otherwise, per `config::File::required(false)`).
    pub fn load(cli: &Cli) -> Result<Self, ConError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("listen_addr", defaults.listen_addr.clone())
            .and_then(|b| b.set_default("dns_port", defaults.dns_port as i64))
            .and_then(|b| b.set_default("dns_domain", defaults.dns_domain.clone()))
            .and_then(|b| b.set_default("service_ttl_secs", defaults.service_ttl_secs as i64))
            .and_then(|b| {
                b.set_default(
                    "cleanup_interval_secs",
                    defaults.cleanup_interval_secs as i64,
                )
            })
            .and_then(|b| b.set_default("persistence_enabled", defaults.persistence_enabled))
            .and_then(|b| b.set_default("data_dir", defaults.data_dir.clone()))
            .and_then(|b| b.set_default("sync_writes", defaults.sync_writes))
            .and_then(|b| b.set_default("auth.enabled", defaults.auth.enabled))
            .and_then(|b| b.set_default("auth.token_ttl_secs", defaults.auth.token_ttl_secs as i64))
            .and_then(|b| b.set_default("rate_limit.enabled", defaults.rate_limit.enabled))
            .and_then(|b| {
                b.set_default(
                    "rate_limit.requests_per_sec",
                    defaults.rate_limit.requests_per_sec,
                )
            })
            .and_then(|b| b.set_default("rate_limit.burst", defaults.rate_limit.burst))
            .and_then(|b| b.set_default("rate_limit.by_ip", defaults.rate_limit.by_ip))
            .and_then(|b| b.set_default("rate_limit.by_apikey", defaults.rate_limit.by_apikey))
            .and_then(|b| {
                b.set_default(
                    "rate_limit.cleanup_interval_secs",
                    defaults.rate_limit.cleanup_interval_secs as i64,
                )
            })
            .and_then(|b| b.set_default("public_paths", defaults.public_paths.clone()))
            .and_then(|b| b.set_default("acl.enabled", defaults.acl.enabled))
            .and_then(|b| b.set_default("acl.policy_dir", defaults.acl.policy_dir.clone()))
            .and_then(|b| b.set_default("watch.enabled", defaults.watch.enabled))
            .and_then(|b| b.set_default("watch.buffer_size", defaults.watch.buffer_size as i64))
            .and_then(|b| {
                b.set_default("watch.max_per_client", defaults.watch.max_per_client as i64)
            })
            .map_err(|e| ConError::internal(format!("seeding config defaults: {e}")))?;

        builder = match &cli.config {
            Some(path) => builder.add_source(File::from(path.as_path())),
            None => builder.add_source(File::with_name("konsul").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("KONSUL")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(listen) = &cli.listen {
            builder = builder
                .set_override("listen_addr", listen.clone())
                .map_err(|e| ConError::invalid_argument(format!("--listen: {e}")))?;
        }
        if let Some(dns_port) = cli.dns_port {
            builder = builder
                .set_override("dns_port", dns_port as i64)
                .map_err(|e| ConError::invalid_argument(format!("--dns-port: {e}")))?;
        }
        if let Some(data_dir) = &cli.data_dir {
            builder = builder
                .set_override("data_dir", data_dir.clone())
                .map_err(|e| ConError::invalid_argument(format!("--data-dir: {e}")))?;
        }
        if let Some(persistence) = cli.persistence {
            builder = builder
                .set_override("persistence_enabled", persistence)
                .map_err(|e| ConError::invalid_argument(format!("--persistence: {e}")))?;
        }
        if let Some(acl_enabled) = cli.acl_enabled {
            builder = builder
                .set_override("acl.enabled", acl_enabled)
                .map_err(|e| ConError::invalid_argument(format!("--acl-enabled: {e}")))?;
        }

        let overrides = cli
            .parsed_overrides()
            .map_err(ConError::invalid_argument)?;
        for (key, value) in overrides {
            builder = builder
                .set_override(key.as_str(), value)
                .map_err(|e| ConError::invalid_argument(format!("--set {key}: {e}")))?;
        }

        let raw = builder
            .build()
            .map_err(|e| ConError::internal(format!("building configuration: {e}")))?;

        Self::from_raw(&raw)
    }

    fn from_raw(raw: &Config) -> Result<Self, ConError> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: raw
                .get_string("listen_addr")
                .unwrap_or(defaults.listen_addr),
            dns_port: raw
                .get_int("dns_port")
                .map(|v| v as u16)
                .unwrap_or(defaults.dns_port),
            dns_domain: raw
                .get_string("dns_domain")
                .unwrap_or(defaults.dns_domain),
            service_ttl_secs: raw
                .get_int("service_ttl_secs")
                .map(|v| v as u64)
                .unwrap_or(defaults.service_ttl_secs),
            cleanup_interval_secs: raw
                .get_int("cleanup_interval_secs")
                .map(|v| v as u64)
                .unwrap_or(defaults.cleanup_interval_secs),
            persistence_enabled: raw
                .get_bool("persistence_enabled")
                .unwrap_or(defaults.persistence_enabled),
            data_dir: raw.get_string("data_dir").unwrap_or(defaults.data_dir),
            sync_writes: raw
                .get_bool("sync_writes")
                .unwrap_or(defaults.sync_writes),
            auth: AuthSettings {
                enabled: raw
                    .get_bool("auth.enabled")
                    .unwrap_or(defaults.auth.enabled),
                token_ttl_secs: raw
                    .get_int("auth.token_ttl_secs")
                    .map(|v| v as u64)
                    .unwrap_or(defaults.auth.token_ttl_secs),
            },
            rate_limit: RateLimitSettings {
                enabled: raw
                    .get_bool("rate_limit.enabled")
                    .unwrap_or(defaults.rate_limit.enabled),
                requests_per_sec: raw
                    .get_float("rate_limit.requests_per_sec")
                    .unwrap_or(defaults.rate_limit.requests_per_sec),
                burst: raw
                    .get_float("rate_limit.burst")
                    .unwrap_or(defaults.rate_limit.burst),
                by_ip: raw
                    .get_bool("rate_limit.by_ip")
                    .unwrap_or(defaults.rate_limit.by_ip),
                by_apikey: raw
                    .get_bool("rate_limit.by_apikey")
                    .unwrap_or(defaults.rate_limit.by_apikey),
                cleanup_interval_secs: raw
                    .get_int("rate_limit.cleanup_interval_secs")
                    .map(|v| v as u64)
                    .unwrap_or(defaults.rate_limit.cleanup_interval_secs),
            },
            public_paths: raw
                .get_array("public_paths")
                .map(|values| {
                    values
                        .into_iter()
                        .filter_map(|v| v.into_string().ok())
                        .collect()
                })
                .unwrap_or(defaults.public_paths),
            acl: AclSettings {
                enabled: raw.get_bool("acl.enabled").unwrap_or(defaults.acl.enabled),
                policy_dir: raw
                    .get_string("acl.policy_dir")
                    .unwrap_or(defaults.acl.policy_dir),
            },
            watch: WatchSettings {
                enabled: raw
                    .get_bool("watch.enabled")
                    .unwrap_or(defaults.watch.enabled),
                buffer_size: raw
                    .get_int("watch.buffer_size")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.watch.buffer_size),
                max_per_client: raw
                    .get_int("watch.max_per_client")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.watch.max_per_client),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = KonsulConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8888");
        assert_eq!(cfg.dns_port, 8600);
        assert_eq!(cfg.dns_domain, "consul");
        assert_eq!(cfg.service_ttl_secs, 30);
        assert_eq!(cfg.cleanup_interval_secs, 60);
        assert!(!cfg.persistence_enabled);
        assert_eq!(cfg.data_dir, "./data");
        assert!(cfg.sync_writes);
        assert_eq!(cfg.rate_limit.requests_per_sec, 100.0);
        assert_eq!(cfg.rate_limit.burst, 20.0);
        assert!(cfg.rate_limit.by_ip);
        assert!(!cfg.rate_limit.by_apikey);
        assert!(!cfg.acl.enabled);
        assert!(cfg.watch.enabled);
        assert_eq!(cfg.watch.buffer_size, 100);
        assert_eq!(cfg.watch.max_per_client, 100);
    }

    #[test]
    fn load_with_no_file_or_env_returns_defaults() {
        let cli = Cli::default();
        let cfg = KonsulConfig::load(&cli).unwrap();
        assert_eq!(cfg, KonsulConfig::default());
    }

    #[test]
    fn cli_listen_flag_overrides_default() {
        let cli = Cli {
            listen: Some("127.0.0.1:9999".to_string()),
            ..Default::default()
        };
        let cfg = KonsulConfig::load(&cli).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9999");
    }

    #[test]
    fn dotted_set_override_reaches_nested_field() {
        let cli = Cli {
            overrides: vec!["rate_limit.burst=50".to_string()],
            ..Default::default()
        };
        let cfg = KonsulConfig::load(&cli).unwrap();
        assert_eq!(cfg.rate_limit.burst, 50.0);
    }

    #[test]
    fn cli_override_wins_over_dotted_set_when_both_touch_same_key() {
        // `--data-dir` and `--set data_dir=...` both exist; the named flag
        // is applied first but `--set` is layered last, so it wins.
        let cli = Cli {
            data_dir: Some("/from-flag".to_string()),
            overrides: vec!["data_dir=/from-set".to_string()],
            ..Default::default()
        };
        let cfg = KonsulConfig::load(&cli).unwrap();
        assert_eq!(cfg.data_dir, "/from-set");
    }

    #[test]
    fn malformed_set_override_is_rejected() {
        let cli = Cli {
            overrides: vec!["not-a-pair".to_string()],
            ..Default::default()
        };
        assert!(KonsulConfig::load(&cli).is_err());
    }

}
