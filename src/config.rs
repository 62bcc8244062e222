use crate::endpoint::{SourceEndpoint, SourceRole};
use crate::validate::ValidationPolicy;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/purple-aqi/config.json";
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8010";
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PROXY_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SENSOR_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("duplicate {} priority {priority}", .role.as_str())]
    DuplicatePriority { role: SourceRole, priority: u32 },
    #[error("{} {host}: timeout must be greater than zero", .role.as_str())]
    ZeroTimeout { role: SourceRole, host: String },
    #[error("{} {host}: startup timeout is shorter than the request timeout", .role.as_str())]
    StartupShorterThanRequest { role: SourceRole, host: String },
    #[error("{} priority {priority}: host is empty", .role.as_str())]
    EmptyHost { role: SourceRole, priority: u32 },
    #[error("no enabled proxy or sensor is configured")]
    NoEnabledSource,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub poll_secs: u64,
    pub freshness_base_secs: u64,
    pub sanity_abs_floor: f64,
    pub sanity_rel_fraction: f64,
    /// `None` disables the HTTP query surface.
    pub http_bind: Option<String>,
    pub publish_window_secs: u64,
    pub feed_url: Option<String>,
    pub feed_token: Option<String>,
    pub feed_batch_size: usize,
    pub feed_flush_ms: u64,
    pub feed_queue: usize,
    pub otlp_endpoint: Option<String>,
    pub sources: Vec<SourceEndpoint>,
    /// Problems found while loading, kept until logging is up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SetupConfigOverrides {
    poll_secs: Option<u64>,
    freshness_base_secs: Option<u64>,
    sanity_abs_floor: Option<f64>,
    sanity_rel_fraction: Option<f64>,
    http_bind: Option<String>,
    publish_window_secs: Option<u64>,
    feed_url: Option<String>,
    feed_token: Option<String>,
    feed_batch_size: Option<usize>,
    feed_flush_ms: Option<u64>,
    feed_queue: Option<usize>,
    proxies: Vec<SetupSource>,
    sensors: Vec<SetupSource>,
}

#[derive(Debug, Clone, Deserialize)]
struct SetupSource {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    startup_timeout_secs: Option<u64>,
    #[serde(default)]
    enable: Option<bool>,
}

/// A setup file that cannot be used is reported in `warnings` and ignored.
fn load_setup_config_overrides(
    path: &Path,
    warnings: &mut Vec<String>,
) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warnings.push(format!(
                "failed to read setup config {}: {err}; using env defaults",
                path.display()
            ));
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warnings.push(format!(
                "failed to parse setup config {}: {err}; using env defaults",
                path.display()
            ));
            None
        }
    }
}

/// Environment view with the trimming and parsing rules shared by every key.
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Raw value, present even when empty.
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|value| value.trim().to_string())
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.raw(key).filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.optional(key) {
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.optional(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                }),
            },
            None => Ok(None),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| std::env::var(key).ok();
        let setup_path = Env { lookup: &lookup }
            .optional("PURPLE_SETUP_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH));
        let mut warnings = Vec::new();
        let overrides = load_setup_config_overrides(&setup_path, &mut warnings);
        let mut config = Self::from_lookup(lookup, overrides.as_ref())
            .context("invalid purple-aqi configuration")?;
        config.warnings = warnings;
        Ok(config)
    }

    /// Loads from the given environment lookup and a setup file path.
    pub fn from_lookup_and_file<F>(lookup: F, setup_path: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let overrides = load_setup_config_overrides(setup_path, &mut warnings);
        let mut config = Self::from_lookup(lookup, overrides.as_ref())?;
        config.warnings = warnings;
        Ok(config)
    }

    fn from_lookup<F>(lookup: F, overrides: Option<&SetupConfigOverrides>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let file = overrides.cloned().unwrap_or_default();

        let poll_secs = env
            .parse("PURPLE_POLL_SECS")?
            .or(file.poll_secs.filter(|v| *v != 0))
            .unwrap_or(15);
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PURPLE_POLL_SECS".to_string(),
                value: "0".to_string(),
            });
        }
        let freshness_base_secs = env
            .parse("PURPLE_FRESHNESS_BASE_SECS")?
            .or(file.freshness_base_secs)
            .unwrap_or(120);
        let sanity_abs_floor = env
            .parse::<f64>("PURPLE_SANITY_ABS_FLOOR")?
            .or(file.sanity_abs_floor)
            .unwrap_or(5.0);
        let sanity_rel_fraction = env
            .parse::<f64>("PURPLE_SANITY_REL_FRACTION")?
            .or(file.sanity_rel_fraction)
            .unwrap_or(0.7);
        for (key, value) in [
            ("PURPLE_SANITY_ABS_FLOOR", sanity_abs_floor),
            ("PURPLE_SANITY_REL_FRACTION", sanity_rel_fraction),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let http_bind = match env.raw("PURPLE_HTTP_BIND") {
            Some(value) => Some(value),
            None => file.http_bind.map(|v| v.trim().to_string()),
        }
        .or_else(|| Some(DEFAULT_HTTP_BIND.to_string()))
        .filter(|value| !value.is_empty());

        let publish_window_secs = env
            .parse("PURPLE_PUBLISH_WINDOW_SECS")?
            .or(file.publish_window_secs)
            .unwrap_or(120);

        let feed_url = env.optional("PURPLE_FEED_URL").or(file
            .feed_url
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()));
        let feed_token = env.optional("PURPLE_FEED_TOKEN").or(file
            .feed_token
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()));
        let feed_batch_size: usize = env
            .parse("PURPLE_FEED_BATCH_SIZE")?
            .or(file.feed_batch_size.filter(|v| *v != 0))
            .unwrap_or(50);
        let feed_flush_ms = env
            .parse("PURPLE_FEED_FLUSH_MS")?
            .or(file.feed_flush_ms.filter(|v| *v != 0))
            .unwrap_or(5000);
        let feed_queue = env
            .parse("PURPLE_FEED_QUEUE")?
            .or(file.feed_queue.filter(|v| *v != 0))
            .unwrap_or_else(|| feed_batch_size.saturating_mul(4));

        let otlp_endpoint = env.optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut sources = env_sources(&env, SourceRole::Proxy)?;
        sources.extend(env_sources(&env, SourceRole::Sensor)?);
        if sources.is_empty() {
            sources = file_sources(&file.proxies, SourceRole::Proxy);
            sources.extend(file_sources(&file.sensors, SourceRole::Sensor));
        }
        validate_sources(&sources)?;

        Ok(Self {
            poll_secs,
            freshness_base_secs,
            sanity_abs_floor,
            sanity_rel_fraction,
            http_bind,
            publish_window_secs,
            feed_url,
            feed_token,
            feed_batch_size,
            feed_flush_ms,
            feed_queue,
            otlp_endpoint,
            sources,
            warnings: Vec::new(),
        })
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn publish_window(&self) -> Duration {
        Duration::from_secs(self.publish_window_secs)
    }

    pub fn feed_flush_interval(&self) -> Duration {
        Duration::from_millis(self.feed_flush_ms)
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            poll_interval: self.poll_interval(),
            freshness_base: Duration::from_secs(self.freshness_base_secs),
            sanity_abs_floor: self.sanity_abs_floor,
            sanity_rel_fraction: self.sanity_rel_fraction,
        }
    }
}

fn env_prefix(role: SourceRole) -> &'static str {
    match role {
        SourceRole::Proxy => "PURPLE_PROXY",
        SourceRole::Sensor => "PURPLE_SENSOR",
    }
}

fn default_timeout_secs(role: SourceRole) -> u64 {
    match role {
        SourceRole::Proxy => DEFAULT_PROXY_TIMEOUT_SECS,
        SourceRole::Sensor => DEFAULT_SENSOR_TIMEOUT_SECS,
    }
}

/// `PURPLE_PROXY1_HOST`, `PURPLE_PROXY2_HOST`, ... until the first gap.
fn env_sources<F>(env: &Env<F>, role: SourceRole) -> Result<Vec<SourceEndpoint>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = env_prefix(role);
    let mut sources = Vec::new();
    for n in 1u32.. {
        let Some(host) = env.raw(&format!("{prefix}{n}_HOST")) else {
            break;
        };
        let port = env
            .parse(&format!("{prefix}{n}_PORT"))?
            .unwrap_or(role.default_port());
        let timeout_secs = env
            .parse(&format!("{prefix}{n}_TIMEOUT_SECS"))?
            .unwrap_or(default_timeout_secs(role));
        let startup_timeout = match role {
            SourceRole::Proxy => Some(Duration::from_secs(
                env.parse(&format!("{prefix}{n}_STARTUP_TIMEOUT_SECS"))?
                    .unwrap_or(DEFAULT_PROXY_STARTUP_TIMEOUT_SECS),
            )),
            SourceRole::Sensor => None,
        };
        let enabled = env.flag(&format!("{prefix}{n}_ENABLE"))?.unwrap_or(true);
        sources.push(SourceEndpoint {
            role,
            priority: n,
            host,
            port,
            request_timeout: Duration::from_secs(timeout_secs),
            startup_timeout,
            enabled,
        });
    }
    Ok(sources)
}

fn file_sources(entries: &[SetupSource], role: SourceRole) -> Vec<SourceEndpoint> {
    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| SourceEndpoint {
            role,
            priority: entry.priority.unwrap_or(idx as u32 + 1),
            host: entry.host.trim().to_string(),
            port: entry.port.unwrap_or(role.default_port()),
            request_timeout: Duration::from_secs(
                entry.timeout_secs.unwrap_or(default_timeout_secs(role)),
            ),
            startup_timeout: match role {
                SourceRole::Proxy => Some(Duration::from_secs(
                    entry
                        .startup_timeout_secs
                        .unwrap_or(DEFAULT_PROXY_STARTUP_TIMEOUT_SECS),
                )),
                SourceRole::Sensor => None,
            },
            enabled: entry.enable.unwrap_or(true),
        })
        .collect()
}

fn validate_sources(sources: &[SourceEndpoint]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for source in sources {
        if !seen.insert((source.role, source.priority)) {
            return Err(ConfigError::DuplicatePriority {
                role: source.role,
                priority: source.priority,
            });
        }
        if source.host.is_empty() {
            return Err(ConfigError::EmptyHost {
                role: source.role,
                priority: source.priority,
            });
        }
        let zero_startup = source.startup_timeout.is_some_and(|t| t.is_zero());
        if source.request_timeout.is_zero() || zero_startup {
            return Err(ConfigError::ZeroTimeout {
                role: source.role,
                host: source.host.clone(),
            });
        }
        if source
            .startup_timeout
            .is_some_and(|startup| startup < source.request_timeout)
        {
            return Err(ConfigError::StartupShorterThanRequest {
                role: source.role,
                host: source.host.clone(),
            });
        }
    }
    if !sources.iter().any(|source| source.enabled) {
        return Err(ConfigError::NoEnabledSource);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        Config::from_lookup(lookup(vars), None)
    }

    #[test]
    fn defaults_apply_to_a_single_sensor() {
        let config = load(&[("PURPLE_SENSOR1_HOST", "purple-air.local")]).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.publish_window(), Duration::from_secs(120));
        assert_eq!(config.http_bind.as_deref(), Some("127.0.0.1:8010"));
        assert_eq!(config.feed_queue, 200);
        assert!(config.feed_url.is_none());

        let policy = config.validation_policy();
        assert_eq!(policy.max_age(), Duration::from_secs(120));
        assert_eq!(policy.sanity_abs_floor, 5.0);

        let sensor = &config.sources[0];
        assert_eq!(sensor.role, SourceRole::Sensor);
        assert_eq!(sensor.priority, 1);
        assert_eq!(sensor.port, 80);
        assert_eq!(sensor.request_timeout, Duration::from_secs(15));
        assert_eq!(sensor.startup_timeout, None);
    }

    #[test]
    fn enumerates_until_the_first_gap() {
        let config = load(&[
            ("PURPLE_PROXY1_HOST", "proxy-a"),
            ("PURPLE_PROXY2_HOST", "proxy-b"),
            ("PURPLE_PROXY2_PORT", "8001"),
            ("PURPLE_PROXY2_ENABLE", "false"),
            ("PURPLE_PROXY4_HOST", "ignored"),
            ("PURPLE_SENSOR1_HOST", "sensor-a"),
        ])
        .unwrap();

        let hosts: Vec<(&str, u32, bool)> = config
            .sources
            .iter()
            .map(|s| (s.host.as_str(), s.priority, s.enabled))
            .collect();
        assert_eq!(
            hosts,
            vec![
                ("proxy-a", 1, true),
                ("proxy-b", 2, false),
                ("sensor-a", 1, true)
            ]
        );
        assert_eq!(config.sources[1].port, 8001);
        assert_eq!(config.sources[0].request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.sources[0].startup_timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn empty_http_bind_disables_the_server() {
        let config = load(&[
            ("PURPLE_SENSOR1_HOST", "sensor-a"),
            ("PURPLE_HTTP_BIND", ""),
        ])
        .unwrap();
        assert_eq!(config.http_bind, None);
    }

    #[test]
    fn rejects_bad_values() {
        let err = load(&[
            ("PURPLE_SENSOR1_HOST", "sensor-a"),
            ("PURPLE_POLL_SECS", "soon"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PURPLE_POLL_SECS".to_string(),
                value: "soon".to_string()
            }
        );

        let err = load(&[
            ("PURPLE_PROXY1_HOST", "proxy-a"),
            ("PURPLE_PROXY1_TIMEOUT_SECS", "10"),
            ("PURPLE_PROXY1_STARTUP_TIMEOUT_SECS", "5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::StartupShorterThanRequest { .. }));

        let err = load(&[
            ("PURPLE_SENSOR1_HOST", "sensor-a"),
            ("PURPLE_SENSOR1_TIMEOUT_SECS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout { .. }));

        let err = load(&[("PURPLE_SENSOR1_HOST", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyHost { .. }));
    }

    #[test]
    fn requires_an_enabled_source() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::NoEnabledSource);
        let err = load(&[
            ("PURPLE_SENSOR1_HOST", "sensor-a"),
            ("PURPLE_SENSOR1_ENABLE", "0"),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::NoEnabledSource);
    }

    fn setup_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn setup_file_supplies_sources_and_unset_scalars() {
        let file = setup_file(
            r#"{
                "poll_secs": 60,
                "feed_url": "http://core.local/ingest",
                "proxies": [{"host": "proxy-a", "timeout_secs": 3}],
                "sensors": [
                    {"host": "sensor-a"},
                    {"host": "sensor-b", "port": 8080, "enable": false}
                ]
            }"#,
        );
        let config = Config::from_lookup_and_file(
            lookup(&[("PURPLE_POLL_SECS", "30")]),
            file.path(),
        )
        .unwrap();

        assert_eq!(config.poll_secs, 30);
        assert_eq!(config.feed_url.as_deref(), Some("http://core.local/ingest"));
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].request_timeout, Duration::from_secs(3));
        assert_eq!(config.sources[2].priority, 2);
        assert_eq!(config.sources[2].port, 8080);
        assert!(!config.sources[2].enabled);
    }

    #[test]
    fn env_sources_take_precedence_over_file_sources() {
        let file = setup_file(r#"{"sensors": [{"host": "from-file"}]}"#);
        let config = Config::from_lookup_and_file(
            lookup(&[("PURPLE_SENSOR1_HOST", "from-env")]),
            file.path(),
        )
        .unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].host, "from-env");
    }

    #[test]
    fn duplicate_file_priorities_are_rejected() {
        let file = setup_file(
            r#"{"sensors": [{"host": "a", "priority": 1}, {"host": "b", "priority": 1}]}"#,
        );
        let err = Config::from_lookup_and_file(lookup(&[]), file.path()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicatePriority {
                role: SourceRole::Sensor,
                priority: 1
            }
        );
    }

    #[test]
    fn unreadable_setup_file_falls_back_to_env() {
        let file = setup_file("{not json");
        let config = Config::from_lookup_and_file(
            lookup(&[("PURPLE_SENSOR1_HOST", "sensor-a")]),
            file.path(),
        )
        .unwrap();
        assert_eq!(config.sources[0].host, "sensor-a");
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("failed to parse setup config"));
    }

    #[test]
    fn missing_setup_file_is_not_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_lookup_and_file(
            lookup(&[("PURPLE_SENSOR1_HOST", "sensor-a")]),
            &dir.path().join("absent.json"),
        )
        .unwrap();
        assert!(config.warnings.is_empty());
    }
}
