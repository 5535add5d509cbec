//! Configuration loading and parsing.
//!
//! Configuration comes from a YAML file merged with `LIMES_*` environment
//! overrides via figment. Duration fields accept both bare numbers (seconds)
//! and strings with units ("30s", "5m", "2h").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};

use crate::cluster::behavior::ResourceBehaviorRule;
use crate::error::Result;
use crate::plugins::static_data::{StaticCapacityValues, StaticDomainConfig};
use crate::plugins::{RateInfo, ResourceInfo};

/// Top-level application configuration.
#[derive(Deserialize)]
pub struct Config {
    /// Log level for this application's own targets; defaults to "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Graceful shutdown timeout for the service manager.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Clusters by cluster id. Exactly one is selected per process via the
    /// CLI; a single config file can describe several.
    pub clusters: BTreeMap<String, ClusterConfig>,
}

#[derive(Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub request_log_except_status_codes: Vec<u16>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: default_api_listen_address(),
            policy_path: None,
            cors_allowed_origins: Vec::new(),
            request_log_except_status_codes: Vec::new(),
        }
    }
}

/// Tuning for the collector's worker loops.
#[derive(Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_metrics_listen_address")]
    pub metrics_listen_address: String,
    #[serde(
        default = "default_discover_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub discover_interval: Duration,
    #[serde(
        default = "default_scrape_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub scrape_interval: Duration,
    #[serde(
        default = "default_scrape_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub rate_scrape_interval: Duration,
    #[serde(
        default = "default_capacity_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub capacity_interval: Duration,
    #[serde(
        default = "default_consistency_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub consistency_interval: Duration,
    /// Minimum sleep between claim attempts when no row is due.
    #[serde(
        default = "default_poll_floor",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_floor: Duration,
    /// Wall-clock bound on a single backend call.
    #[serde(
        default = "default_scrape_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub scrape_timeout: Duration,
    /// How long a claimed row stays invisible to other workers. A worker that
    /// dies mid-scrape loses its claim after this elapses.
    #[serde(
        default = "default_claim_lease",
        deserialize_with = "deserialize_duration"
    )]
    pub claim_lease: Duration,
    /// Multiplier applied to the scrape interval per consecutive error.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(
        default = "default_max_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub max_backoff: Duration,
    /// Base delay before a failed quota sync is retried.
    #[serde(
        default = "default_sync_retry_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sync_retry_interval: Duration,
    /// Re-run `scrape` after a successful `set_quota` instead of trusting
    /// the call.
    #[serde(default)]
    pub rescrape_after_push: bool,
    #[serde(
        default = "default_mail_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub mail_interval: Duration,
    #[serde(
        default = "default_commitment_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub commitment_interval: Duration,
    /// How far ahead of expiry a commitment owner is notified.
    #[serde(
        default = "default_expiration_notice_period",
        deserialize_with = "deserialize_duration"
    )]
    pub expiration_notice_period: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            metrics_listen_address: default_metrics_listen_address(),
            discover_interval: default_discover_interval(),
            scrape_interval: default_scrape_interval(),
            rate_scrape_interval: default_scrape_interval(),
            capacity_interval: default_capacity_interval(),
            consistency_interval: default_consistency_interval(),
            poll_floor: default_poll_floor(),
            scrape_timeout: default_scrape_timeout(),
            claim_lease: default_claim_lease(),
            backoff_factor: default_backoff_factor(),
            max_backoff: default_max_backoff(),
            sync_retry_interval: default_sync_retry_interval(),
            rescrape_after_push: false,
            mail_interval: default_mail_interval(),
            commitment_interval: default_commitment_interval(),
            expiration_notice_period: default_expiration_notice_period(),
        }
    }
}

/// Configuration for one cluster.
#[derive(Deserialize)]
pub struct ClusterConfig {
    /// Credentials for the identity backend; consumed by drivers, opaque to
    /// the core.
    #[serde(default)]
    pub auth: serde_json::Value,
    pub discovery: DiscoveryConfig,
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorConfig>,
    /// Service type -> resource names for which subresource scraping is on.
    #[serde(default)]
    pub subresources: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub subcapacities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub resource_behavior: Vec<ResourceBehaviorRule>,
    /// Accepted for operator-config compatibility; not interpreted.
    #[serde(default)]
    pub quota_distribution_configs: Vec<serde_json::Value>,
    #[serde(default)]
    pub bursting: BurstingConfig,
    /// Paths to quota constraint files.
    #[serde(default)]
    pub constraints: Vec<PathBuf>,
    /// Accepted for operator-config compatibility; audit publishing is not
    /// part of this process.
    #[serde(default)]
    pub cadf: serde_json::Value,
}

#[derive(Deserialize)]
pub struct DiscoveryConfig {
    pub method: String,
    #[serde(default, rename = "static")]
    pub static_domains: Vec<StaticDomainConfig>,
}

#[derive(Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default = "default_service_driver")]
    pub driver: String,
    #[serde(default)]
    pub generic: Option<GenericDriverConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
    #[serde(default)]
    pub rates: Vec<RateInfo>,
}

#[derive(Clone, Deserialize)]
pub struct GenericDriverConfig {
    pub base_url: String,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

#[derive(Deserialize)]
pub struct CapacitorConfig {
    pub id: String,
    #[serde(default = "default_capacitor_driver")]
    pub driver: String,
    #[serde(default, rename = "static")]
    pub static_values: StaticCapacityValues,
}

#[derive(Clone, Copy, Default, Deserialize)]
pub struct BurstingConfig {
    /// Extra share of quota grantable at the backend, e.g. 0.2 for +20%.
    /// Zero disables bursting for the cluster.
    #[serde(default)]
    pub max_multiplier: f64,
}

impl Config {
    /// Load and validate configuration from a YAML file plus `LIMES_*`
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("LIMES_").map(map_env_key).split("."))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; violations are fatal.
    fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("no clusters configured");
        }
        for (id, cluster) in &self.clusters {
            if cluster.services.is_empty() {
                bail!("cluster {id:?} declares no services");
            }
            if cluster.bursting.max_multiplier < 0.0 {
                bail!(
                    "cluster {id:?} has negative bursting.max_multiplier: {}",
                    cluster.bursting.max_multiplier
                );
            }
            let mut seen = std::collections::HashSet::new();
            for service in &cluster.services {
                if !seen.insert(service.service_type.as_str()) {
                    bail!(
                        "cluster {id:?} declares service type {:?} twice",
                        service.service_type
                    );
                }
            }
        }
        Ok(())
    }

    pub fn cluster(&self, id: &str) -> Result<&ClusterConfig> {
        self.clusters
            .get(id)
            .with_context(|| format!("no such cluster in config: {id:?}"))
    }
}

/// Map flat environment keys to their nested config paths.
fn map_env_key(key: &figment::value::UncasedStr) -> figment::value::Uncased<'_> {
    let mapped = match key.as_str().to_ascii_uppercase().as_str() {
        "API_LISTEN_ADDRESS" => "api.listen_address",
        "API_POLICY_PATH" => "api.policy_path",
        "API_CORS_ALLOWED_ORIGINS" => "api.cors_allowed_origins",
        "API_REQUEST_LOG_EXCEPT_STATUS_CODES" => "api.request_log_except_status_codes",
        "DATABASE_URL" => "database.url",
        "LOG_LEVEL" => "log_level",
        _ => return key.as_str().to_ascii_lowercase().into(),
    };
    mapped.into()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_max_connections() -> u32 {
    10
}

fn default_api_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_listen_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_discover_interval() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_capacity_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_consistency_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_poll_floor() -> Duration {
    Duration::from_secs(10)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_claim_lease() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_sync_retry_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_mail_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_commitment_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_expiration_notice_period() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_service_driver() -> String {
    "generic".to_string()
}

fn default_capacitor_driver() -> String {
    "static".to_string()
}

/// Duration parser accepting seconds by default plus ms/m/h/d suffixes.
///
/// Multiple terms are summed ("1h 30m"); fractions, exponents and infinity
/// are rejected.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Accepts both numeric values (seconds) and strings with units.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration {value:?}: {e}. Examples: '5' (5 seconds), '30s', '5m', '2h'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
database:
  url: postgres://localhost/limes
clusters:
  west:
    discovery:
      method: static
      static:
        - uuid: d1
          name: first
          projects:
            - uuid: p1
              name: one
    services:
      - type: compute
        generic:
          base_url: http://backend:9090
        resources:
          - name: cores
"#
    }

    fn load_str(yaml: &str) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(anyhow::Error::from)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let config = load_str(minimal_yaml()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.collector.discover_interval, Duration::from_secs(180));
        assert_eq!(
            config.collector.scrape_interval,
            Duration::from_secs(30 * 60)
        );
        assert!(!config.collector.rescrape_after_push);

        let cluster = config.cluster("west").unwrap();
        assert_eq!(cluster.services.len(), 1);
        assert_eq!(cluster.discovery.static_domains.len(), 1);
        assert_eq!(cluster.bursting.max_multiplier, 0.0);
    }

    #[test]
    fn test_duration_accepts_units_and_numbers() {
        let yaml = format!(
            "collector:\n  scrape_interval: 90s\n  capacity_interval: 120\n  discover_interval: 1h 30m\n{}",
            minimal_yaml()
        );
        let config = load_str(&yaml).unwrap();
        assert_eq!(config.collector.scrape_interval, Duration::from_secs(90));
        assert_eq!(config.collector.capacity_interval, Duration::from_secs(120));
        assert_eq!(
            config.collector.discover_interval,
            Duration::from_secs(90 * 60)
        );
    }

    #[test]
    fn test_negative_burst_multiplier_is_fatal() {
        let yaml = minimal_yaml().replace(
            "    services:",
            "    bursting:\n      max_multiplier: -0.5\n    services:",
        );
        assert!(load_str(&yaml).is_err());
    }

    #[test]
    fn test_unknown_cluster_is_an_error() {
        let config = load_str(minimal_yaml()).unwrap();
        assert!(config.cluster("east").is_err());
    }

    #[test]
    fn test_duplicate_service_type_is_fatal() {
        let yaml = minimal_yaml().to_string()
            + r#"
      - type: compute
        generic:
          base_url: http://other:9090
"#;
        assert!(load_str(&yaml).is_err());
    }
}
