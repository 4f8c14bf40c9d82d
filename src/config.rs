#![forbid(unsafe_code)]

//! Runtime configuration for the backend: listen address, the Piped
//! mirror list, upstream timeouts, circuit cooldown, discovery cadence
//! and response-cache TTLs. Values resolve CLI override first, then the
//! process environment, then the `.env` file, then the built-in default.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Known-good public mirrors (official + community), tried in order
/// whenever discovery has nothing better to offer.
pub const FALLBACK_INSTANCES: &[&str] = &[
    "https://api.piped.private.coffee",
    "https://pipedapi.kavin.rocks",
    "https://pipedapi.tokhmi.xyz",
    "https://pipedapi.moomoo.me",
    "https://pipedapi.rivo.lol",
];

/// Public registry returning a JSON array of instances with `api_url`.
pub const DEFAULT_REGISTRY_URL: &str = "https://piped-instances.kavin.rocks/";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CIRCUIT_RETRY_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 600;

const DEFAULT_TRENDING_TTL_SECS: u64 = 300;
const DEFAULT_SEARCH_TTL_SECS: u64 = 300;
const DEFAULT_CHANNEL_TTL_SECS: u64 = 600;
const DEFAULT_VIDEO_TTL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Ranked mirror base URLs used until the first discovery pass lands.
    pub instances: Vec<String>,
    /// Per-attempt upstream timeout during fan-out.
    pub request_timeout: Duration,
    /// How long the circuit stays open after a pool-wide failure.
    pub circuit_retry: Duration,
    pub registry_url: String,
    /// `None` disables periodic re-discovery entirely.
    pub discovery_interval: Option<Duration>,
    pub cache: CacheTtls,
}

/// TTLs for the in-memory response caches, one per endpoint family.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub trending: Duration,
    pub search: Duration,
    pub channel: Duration,
    pub video: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub instances: Option<Vec<String>>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config() -> Result<BackendConfig> {
    resolve_config(RuntimeOverrides::default())
}

pub fn resolve_config(overrides: RuntimeOverrides) -> Result<BackendConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<BackendConfig> {
    build_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<BackendConfig> {
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("MIRRORTUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = overrides
        .port
        .or_else(|| {
            lookup_value("MIRRORTUBE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    let instances = overrides
        .instances
        .filter(|list| !list.is_empty())
        .or_else(|| {
            lookup_value("PIPED_INSTANCES", file_vars, &env_lookup)
                .map(|raw| split_instance_list(&raw))
                .filter(|list| !list.is_empty())
        })
        .unwrap_or_else(default_instances);

    let request_timeout = Duration::from_millis(lookup_u64(
        "PIPED_TIMEOUT_MS",
        file_vars,
        &env_lookup,
        DEFAULT_REQUEST_TIMEOUT_MS,
    ));
    let circuit_retry = Duration::from_millis(lookup_u64(
        "PIPED_CIRCUIT_RETRY_MS",
        file_vars,
        &env_lookup,
        DEFAULT_CIRCUIT_RETRY_MS,
    ));

    let registry_url = lookup_value("PIPED_REGISTRY_URL", file_vars, &env_lookup)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());

    let discovery_secs = lookup_u64(
        "PIPED_DISCOVERY_INTERVAL_SECS",
        file_vars,
        &env_lookup,
        DEFAULT_DISCOVERY_INTERVAL_SECS,
    );
    let discovery_interval = if discovery_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(discovery_secs))
    };

    let cache = CacheTtls {
        trending: Duration::from_secs(lookup_u64(
            "CACHE_TRENDING_TTL",
            file_vars,
            &env_lookup,
            DEFAULT_TRENDING_TTL_SECS,
        )),
        search: Duration::from_secs(lookup_u64(
            "CACHE_SEARCH_TTL",
            file_vars,
            &env_lookup,
            DEFAULT_SEARCH_TTL_SECS,
        )),
        channel: Duration::from_secs(lookup_u64(
            "CACHE_CHANNEL_TTL",
            file_vars,
            &env_lookup,
            DEFAULT_CHANNEL_TTL_SECS,
        )),
        video: Duration::from_secs(lookup_u64(
            "CACHE_VIDEO_TTL",
            file_vars,
            &env_lookup,
            DEFAULT_VIDEO_TTL_SECS,
        )),
    };

    Ok(BackendConfig {
        host,
        port,
        instances,
        request_timeout,
        circuit_retry,
        registry_url,
        discovery_interval,
        cache,
    })
}

pub fn default_instances() -> Vec<String> {
    FALLBACK_INSTANCES.iter().map(|s| s.to_string()).collect()
}

/// Splits a comma-separated mirror list, dropping blanks. Trailing-slash
/// normalization happens later in the pool so every entry path joins the
/// same way regardless of where it came from.
pub fn split_instance_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

fn lookup_u64(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
    default: u64,
) -> u64 {
    lookup_value(key, file_vars, env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> BackendConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn resolve_config_reads_port() {
        let config = config_from("MIRRORTUBE_PORT=\"4242\"\n");
        assert_eq!(config.port, 4242);
    }

    #[test]
    fn resolve_config_defaults() {
        let config = config_from("");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.instances, default_instances());
        assert_eq!(config.request_timeout, Duration::from_millis(10_000));
        assert_eq!(config.circuit_retry, Duration::from_millis(300_000));
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
        assert_eq!(config.discovery_interval, Some(Duration::from_secs(600)));
        assert_eq!(config.cache.trending, Duration::from_secs(300));
        assert_eq!(config.cache.channel, Duration::from_secs(600));
    }

    #[test]
    fn resolve_config_reads_host() {
        let config = config_from("MIRRORTUBE_HOST=\"0.0.0.0\"\n");
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn resolve_config_parses_instance_list() {
        let config = config_from(
            "PIPED_INSTANCES=\"https://a.example, https://b.example ,, https://c.example\"\n",
        );
        assert_eq!(
            config.instances,
            vec!["https://a.example", "https://b.example", "https://c.example"]
        );
    }

    #[test]
    fn resolve_config_blank_instances_fall_back() {
        let config = config_from("PIPED_INSTANCES=\" , ,\"\n");
        assert_eq!(config.instances, default_instances());
    }

    #[test]
    fn resolve_config_reads_timeouts() {
        let config = config_from(
            "PIPED_TIMEOUT_MS=\"2500\"\nPIPED_CIRCUIT_RETRY_MS=\"60000\"\nPIPED_DISCOVERY_INTERVAL_SECS=\"120\"\n",
        );
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.circuit_retry, Duration::from_millis(60_000));
        assert_eq!(config.discovery_interval, Some(Duration::from_secs(120)));
    }

    #[test]
    fn resolve_config_zero_interval_disables_discovery() {
        let config = config_from("PIPED_DISCOVERY_INTERVAL_SECS=\"0\"\n");
        assert_eq!(config.discovery_interval, None);
    }

    #[test]
    fn build_config_prefers_env_over_file() {
        let vars = read_env_file(make_config("MIRRORTUBE_PORT=\"5000\"\n").path()).unwrap();
        let config = build_config(&vars, |key| {
            if key == "MIRRORTUBE_PORT" {
                Some("6000".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(config.port, 6000);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export PIPED_REGISTRY_URL="https://registry.example/"
            MIRRORTUBE_HOST='0.0.0.0'
            MIRRORTUBE_PORT =  "9090"
            PIPED_TIMEOUT_MS=1234
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(
            vars.get("PIPED_REGISTRY_URL").unwrap(),
            "https://registry.example/"
        );
        assert_eq!(vars.get("MIRRORTUBE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("MIRRORTUBE_PORT").unwrap(), "9090");
        assert_eq!(vars.get("PIPED_TIMEOUT_MS").unwrap(), "1234");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn build_config_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("MIRRORTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("MIRRORTUBE_PORT".to_string(), "7000".to_string());
        vars.insert(
            "PIPED_INSTANCES".to_string(),
            "https://file.example".to_string(),
        );

        let overrides = RuntimeOverrides {
            host: Some("override-host".into()),
            port: None,
            instances: Some(vec!["https://cli.example".into()]),
            env_path: None,
        };

        let config = build_config_with_overrides(
            &vars,
            |key| {
                if key == "MIRRORTUBE_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(config.host, "override-host");
        assert_eq!(config.port, 8000);
        assert_eq!(config.instances, vec!["https://cli.example"]);
    }

    #[test]
    fn build_config_ignores_blank_host_override() {
        let config = build_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn build_config_invalid_numbers_default() {
        let vars = read_env_file(
            make_config("MIRRORTUBE_PORT=\"nope\"\nPIPED_TIMEOUT_MS=\"-5\"\n").path(),
        )
        .unwrap();
        let config = build_config(&vars, |_| None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(
            config.request_timeout,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn split_instance_list_trims_and_drops_blanks() {
        assert_eq!(
            split_instance_list(" https://a.example ,https://b.example,"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(split_instance_list("").is_empty());
    }
}
