use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::strategy::{LoadBalanceStrategy, RoutingGranularity};

/// Load balancing configuration: global defaults plus per-microservice overrides.
///
/// Every section falls back to its defaults, so an empty document is a valid
/// configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LoadBalanceConfig {
    /// Selection strategy, defaults to RoundRobin
    pub strategy: LoadBalanceStrategy,

    /// Whether rules are cached per service or per operation
    pub granularity: RoutingGranularity,

    pub sticky: StickyConfig,
    pub weighted: WeightedConfig,
    pub isolation: IsolationConfig,
    pub retry: RetryConfig,
    pub stats: StatsConfig,
    pub filter: FilterConfig,

    /// Data center of the local process, used by the zone aware filter
    pub data_center: Option<DataCenter>,

    /// A map of microservice name -> overrides
    pub services: HashMap<String, ServiceOverride>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServiceOverride {
    pub strategy: Option<LoadBalanceStrategy>,
    pub sticky: Option<StickyConfig>,
    pub isolation: Option<IsolationConfig>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StickyConfig {
    pub session_timeout_ms: u64,
    /// continuous failures on the sticky server before switching
    pub failure_threshold: u32,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            failure_threshold: 5,
        }
    }
}

impl StickyConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WeightedConfig {
    /// weights are rebuilt once every this many calls
    pub recompute_interval: u64,
    /// below this average latency all servers are considered equal
    pub min_gap_ms: u64,
}

impl Default for WeightedConfig {
    fn default() -> Self {
        Self {
            recompute_interval: 1000,
            min_gap_ms: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IsolationConfig {
    /// isolate servers from their own call statistics
    pub enabled: bool,
    /// no decision is taken before a server served this many requests in the window
    pub enable_request_threshold: u64,
    /// 0 disables the check
    pub continuous_failure_threshold: u32,
    /// 0 disables the check
    pub error_threshold_percentage: u32,
    /// how long an isolated server waits before it gets a trial call
    pub single_test_time_ms: u64,
    /// an isolated server is never recovered sooner than this
    pub min_isolation_time_ms: u64,
    /// bounds applied to every isolation wait, including external signals
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_request_threshold: 5,
            continuous_failure_threshold: 5,
            error_threshold_percentage: 0,
            single_test_time_ms: 60_000,
            min_isolation_time_ms: 3_000,
            min_wait_ms: 0,
            max_wait_ms: 3_600_000,
        }
    }
}

impl IsolationConfig {
    pub fn clamp_wait(&self, wait: Duration) -> Duration {
        let min = Duration::from_millis(self.min_wait_ms);
        let max = Duration::from_millis(self.max_wait_ms.max(self.min_wait_ms));
        wait.clamp(min, max)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// retries allowed on the server that just failed
    pub on_same: u32,
    /// retries allowed on a different server
    pub on_next: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// rolling window of the per server request counters
    pub window_ms: u64,
    /// stats of a server nobody asked about for this long are dropped
    pub idle_expiry_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            idle_expiry_ms: 30 * 60_000,
        }
    }
}

impl StatsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_millis(self.idle_expiry_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// drop instances that are not UP
    pub status_enabled: bool,
    /// honour the isolation registry
    pub isolation_enabled: bool,
    pub zone_aware_enabled: bool,
    /// percentage of instances the zone aware filter must keep
    pub zone_aware_ratio: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            status_enabled: true,
            isolation_enabled: true,
            zone_aware_enabled: true,
            zone_aware_ratio: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct DataCenter {
    pub name: String,
    pub region: String,
    pub zone: String,
}

impl DataCenter {
    pub fn new(name: impl Into<String>, region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            zone: zone.into(),
        }
    }
}

impl LoadBalanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_file<E>(path: &str) -> Result<Self, E>
    where
        E: From<std::io::Error> + From<toml::de::Error>,
    {
        let mut file = File::open(path).await?;
        let mut content: String = String::new();
        file.read_to_string(&mut content).await?;
        LoadBalanceConfig::from_content(&content)
    }

    pub fn from_content<E>(content: &str) -> Result<Self, E>
    where
        E: From<toml::de::Error>,
    {
        debug!("load balance config content:\n{}", content);
        let config: LoadBalanceConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_json<E>(&self) -> Result<String, E>
    where
        E: From<serde_json::Error>,
    {
        serde_json::to_string(self).map_err(|e| e.into())
    }

    fn service(&self, microservice: &str) -> Option<&ServiceOverride> {
        self.services.get(microservice)
    }

    pub fn strategy_for(&self, microservice: &str) -> LoadBalanceStrategy {
        self.service(microservice)
            .and_then(|s| s.strategy.clone())
            .unwrap_or_else(|| self.strategy.clone())
    }

    pub fn sticky_for(&self, microservice: &str) -> StickyConfig {
        self.service(microservice)
            .and_then(|s| s.sticky.clone())
            .unwrap_or_else(|| self.sticky.clone())
    }

    pub fn isolation_for(&self, microservice: &str) -> IsolationConfig {
        self.service(microservice)
            .and_then(|s| s.isolation.clone())
            .unwrap_or_else(|| self.isolation.clone())
    }

    pub fn retry_for(&self, microservice: &str) -> RetryConfig {
        self.service(microservice)
            .and_then(|s| s.retry.clone())
            .unwrap_or_else(|| self.retry.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ConfigError;

    const CONFIG: &str = r#"
strategy = "WeightedResponse"
granularity = "Operation"

[sticky]
session_timeout_ms = 1000

[isolation]
continuous_failure_threshold = 3
error_threshold_percentage = 50

[retry]
enabled = true
on_next = 2

[data_center]
name = "dc"
region = "eu"
zone = "eu-1"

[services.orders]
strategy = "SessionStickiness"

[services.orders.retry]
enabled = true
on_same = 1
on_next = 1

[services.billing]
strategy = "MyRule"
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: LoadBalanceConfig = LoadBalanceConfig::from_content::<ConfigError>("").unwrap();
        assert_eq!(config, LoadBalanceConfig::default());
        assert_eq!(config.strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.stats.window(), Duration::from_secs(60));
        assert_eq!(config.stats.idle_expiry(), Duration::from_secs(30 * 60));
        assert_eq!(config.weighted.recompute_interval, 1000);
        assert!(!config.retry.enabled);
    }

    #[test]
    fn test_parse_sections() {
        let config = LoadBalanceConfig::from_content::<ConfigError>(CONFIG).unwrap();
        assert_eq!(config.strategy, LoadBalanceStrategy::WeightedResponse);
        assert_eq!(config.granularity, RoutingGranularity::Operation);
        assert_eq!(config.sticky.session_timeout(), Duration::from_secs(1));
        // untouched keys keep their defaults
        assert_eq!(config.sticky.failure_threshold, 5);
        assert_eq!(config.isolation.continuous_failure_threshold, 3);
        assert_eq!(config.isolation.enable_request_threshold, 5);
        assert_eq!(config.data_center, Some(DataCenter::new("dc", "eu", "eu-1")));
    }

    #[test]
    fn test_service_overrides() {
        let config = LoadBalanceConfig::from_content::<ConfigError>(CONFIG).unwrap();
        assert_eq!(config.strategy_for("orders"), LoadBalanceStrategy::SessionStickiness);
        assert_eq!(config.strategy_for("unknown"), LoadBalanceStrategy::WeightedResponse);
        assert_eq!(
            config.strategy_for("billing"),
            LoadBalanceStrategy::Custom("MyRule".to_string())
        );

        let retry = config.retry_for("orders");
        assert_eq!((retry.on_same, retry.on_next), (1, 1));
        let retry = config.retry_for("billing");
        assert_eq!((retry.on_same, retry.on_next), (0, 2));
    }

    #[test]
    fn test_clamp_wait() {
        let isolation = IsolationConfig {
            min_wait_ms: 100,
            max_wait_ms: 1000,
            ..Default::default()
        };
        assert_eq!(isolation.clamp_wait(Duration::from_millis(1)), Duration::from_millis(100));
        assert_eq!(isolation.clamp_wait(Duration::from_secs(60)), Duration::from_millis(1000));
        assert_eq!(isolation.clamp_wait(Duration::from_millis(500)), Duration::from_millis(500));
    }

    #[test]
    fn test_to_json() {
        let config = LoadBalanceConfig::from_content::<ConfigError>(CONFIG).unwrap();
        let json = config.to_json::<ConfigError>().unwrap();
        assert!(json.contains("\"strategy\":\"WeightedResponse\""));
        assert!(json.contains("\"MyRule\""));
    }

    #[test]
    fn test_invalid_toml() {
        let err = LoadBalanceConfig::from_content::<ConfigError>("strategy = [").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let path = std::env::temp_dir().join(format!("mesh-core-lb-{}.toml", std::process::id()));
        std::fs::write(&path, CONFIG).unwrap();
        let config = LoadBalanceConfig::from_file::<ConfigError>(path.to_str().unwrap())
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.strategy, LoadBalanceStrategy::WeightedResponse);

        let missing = LoadBalanceConfig::from_file::<ConfigError>("/definitely/not/here.toml").await;
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
