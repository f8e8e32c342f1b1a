use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Top-level configuration for the ShareGuard detection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Platform-wide identification
    pub platform: PlatformConfig,
    /// Ingest server (C5) settings
    pub ingest: IngestConfig,
    /// User tracker (C2) settings
    pub tracker: TrackerConfig,
    /// Classifier (C3) thresholds
    pub classifier: ClassifierConfig,
    /// Panel roster fetcher (C4) settings
    pub panel: PanelConfig,
    /// Query API (C6) settings
    pub query_api: QueryApiConfig,
    /// Optional sink (C7) toggles
    pub sinks: SinksConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics/monitoring configuration
    pub metrics: MetricsConfig,
}

/// Platform-wide identification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Deployment environment (development, staging, production)
    pub environment: String,
    /// Unique deployment identifier
    pub deployment_id: String,
}

/// Ingest server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Address collectors connect to
    pub listen_addr: String,
    /// Maximum bytes per record before REJECT_OVERSIZE and connection close
    pub max_line_bytes: usize,
    /// Idle read timeout in seconds before a collector connection is closed
    pub idle_timeout_seconds: u64,
}

/// User tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How long an IP observation is retained after last_seen
    pub retention_seconds: u64,
    /// Size of the bounded recent-requests ring per user
    pub recent_requests_capacity: usize,
    /// Canonicalize IPv4 to /24 and IPv6 to /64 before counting
    pub subnet_grouping: bool,
    /// Emails that never leave the clean stage regardless of limit
    pub whitelist_emails: HashSet<String>,
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Tick period driving the staged state machine
    pub tick_seconds: u64,
    /// Sliding window used to count concurrent distinct IPs
    pub concurrent_window_seconds: u64,
    /// Window over which triggers accumulate
    pub trigger_period_seconds: u64,
    /// Triggers required within the trigger period to become a violator
    pub trigger_count: u32,
    /// Continuous violator duration required for banlist promotion
    pub banlist_threshold_seconds: u64,
    /// Consecutive sub-limit ticks required before trigger_times/violator_since
    /// are cleared. 1 (default) clears immediately on the first sub-limit
    /// tick; higher values add hysteresis against oscillating traffic.
    pub clear_hysteresis_ticks: u32,
}

/// Panel roster fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Base URL of the external control panel
    pub url: Option<String>,
    /// Bearer token used to authenticate against the panel
    #[serde(skip_serializing)]
    pub token: Option<Secret<String>>,
    /// Poll interval between full roster refreshes
    pub poll_interval_seconds: u64,
    /// Page size used while paginating the roster
    pub page_size: u32,
    /// Per-request timeout
    pub timeout_seconds: u64,
}

/// Query API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryApiConfig {
    /// Address the read-only HTTP query surface binds to
    pub listen_addr: String,
    /// Shared bearer token required by every endpoint
    #[serde(skip_serializing)]
    pub api_token: Option<Secret<String>>,
    /// Per-request deadline
    pub request_timeout_seconds: u64,
    /// Enable permissive CORS (operator dashboards, Terminal UI)
    pub cors_enabled: bool,
}

/// Optional sink toggles; presence of a section enables that sink
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinksConfig {
    pub persist: Option<PersistConfig>,
    pub notify: Option<NotifyConfig>,
    pub enrich: Option<EnrichConfig>,
}

/// File-backed banlist persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Path to the append-only JSON-lines banlist store
    pub path: String,
}

/// NATS-backed notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// NATS server URL
    pub nats_url: String,
    /// Subject domain events are published to
    pub subject: String,
    /// Bounded local queue depth before the oldest message is dropped
    pub queue_capacity: usize,
}

/// ISP enrichment cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Maximum number of cached IP -> ISP lookups
    pub cache_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

/// Metrics/monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Address the Prometheus exporter binds to
    pub listen_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig {
                environment: "development".to_string(),
                deployment_id: "shareguard-dev".to_string(),
            },
            ingest: IngestConfig {
                listen_addr: "0.0.0.0:9999".to_string(),
                max_line_bytes: 16 * 1024,
                idle_timeout_seconds: 300,
            },
            tracker: TrackerConfig {
                retention_seconds: 3600,
                recent_requests_capacity: 200,
                subnet_grouping: false,
                whitelist_emails: HashSet::new(),
            },
            classifier: ClassifierConfig {
                tick_seconds: 1,
                concurrent_window_seconds: 2,
                trigger_period_seconds: 30,
                trigger_count: 5,
                banlist_threshold_seconds: 300,
                clear_hysteresis_ticks: 1,
            },
            panel: PanelConfig {
                url: None,
                token: None,
                poll_interval_seconds: 60,
                page_size: 200,
                timeout_seconds: 15,
            },
            query_api: QueryApiConfig {
                listen_addr: "0.0.0.0:8080".to_string(),
                api_token: None,
                request_timeout_seconds: 5,
                cors_enabled: true,
            },
            sinks: SinksConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9100".to_string(),
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file, then apply the
    /// documented `SHAREGUARD_*`/named environment variable overrides.
    pub fn from_sources(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        // Seed the builder with the struct defaults so an operator running
        // with no file and no `SHAREGUARD_` env vars still gets a complete
        // tree; a file or env source layered on top only needs to override
        // what it actually sets. A genuinely malformed file or env value is
        // still a hard error, via `?` below, matching the teacher's
        // `MitigationConfig::from_file`.
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = config_path {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }

        builder =
            builder.add_source(config::Environment::with_prefix("SHAREGUARD").separator("__"));

        let settings = builder.build()?;
        let mut cfg: EngineConfig = settings.try_deserialize()?;

        cfg.apply_named_env_overrides();
        Ok(cfg)
    }

    /// Apply the specific named environment variables operators use to
    /// configure this engine, which take precedence over both the file
    /// and the `SHAREGUARD_` prefixed variables.
    fn apply_named_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PANEL_URL") {
            self.panel.url = Some(url);
        }
        if let Ok(token) = std::env::var("PANEL_TOKEN") {
            self.panel.token = Some(Secret::new(token));
        }
        if let Ok(token) = std::env::var("API_TOKEN") {
            self.query_api.api_token = Some(Secret::new(token));
        }
        if let Ok(v) = std::env::var("CONCURRENT_WINDOW") {
            match v.parse() {
                Ok(n) => self.classifier.concurrent_window_seconds = n,
                Err(e) => warn!(error = %e, "Invalid CONCURRENT_WINDOW, keeping previous value"),
            }
        }
        if let Ok(v) = std::env::var("TRIGGER_PERIOD") {
            match v.parse() {
                Ok(n) => self.classifier.trigger_period_seconds = n,
                Err(e) => warn!(error = %e, "Invalid TRIGGER_PERIOD, keeping previous value"),
            }
        }
        if let Ok(v) = std::env::var("TRIGGER_COUNT") {
            match v.parse() {
                Ok(n) => self.classifier.trigger_count = n,
                Err(e) => warn!(error = %e, "Invalid TRIGGER_COUNT, keeping previous value"),
            }
        }
        if let Ok(v) = std::env::var("BANLIST_THRESHOLD_SECONDS") {
            match v.parse() {
                Ok(n) => self.classifier.banlist_threshold_seconds = n,
                Err(e) => {
                    warn!(error = %e, "Invalid BANLIST_THRESHOLD_SECONDS, keeping previous value")
                }
            }
        }
        if let Ok(v) = std::env::var("SUBNET_GROUPING") {
            self.tracker.subnet_grouping =
                matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("WHITELIST_EMAILS") {
            self.tracker.whitelist_emails = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("RETENTION_SECONDS") {
            match v.parse() {
                Ok(n) => self.tracker.retention_seconds = n,
                Err(e) => warn!(error = %e, "Invalid RETENTION_SECONDS, keeping previous value"),
            }
        }
        if let Ok(v) = std::env::var("INGEST_BIND") {
            self.ingest.listen_addr = v;
        }
        if let Ok(v) = std::env::var("HTTP_BIND") {
            self.query_api.listen_addr = v;
        }
    }

    /// Validate configuration, returning a human-readable error for any
    /// problem that should abort startup with a non-zero exit code.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.panel.url.is_none() {
            return Err("PANEL_URL must be set".to_string());
        }
        if self.panel.token.is_none() {
            return Err("PANEL_TOKEN must be set".to_string());
        }
        if self.query_api.api_token.is_none() {
            return Err("API_TOKEN must be set".to_string());
        }
        self.ingest
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid ingest listen address: {}", e))?;
        self.query_api
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid query API listen address: {}", e))?;
        if self.classifier.trigger_count == 0 {
            return Err("TRIGGER_COUNT must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn ingest_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.ingest.listen_addr.parse()
    }

    pub fn query_api_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.query_api.listen_addr.parse()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.idle_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.query_api.request_timeout_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.tracker.retention_seconds)
    }

    pub fn concurrent_window(&self) -> Duration {
        Duration::from_secs(self.classifier.concurrent_window_seconds)
    }

    pub fn trigger_period(&self) -> Duration {
        Duration::from_secs(self.classifier.trigger_period_seconds)
    }

    pub fn banlist_threshold(&self) -> Duration {
        Duration::from_secs(self.classifier.banlist_threshold_seconds)
    }

    pub fn log_effective_config(&self) {
        info!(
            environment = %self.platform.environment,
            ingest_addr = %self.ingest.listen_addr,
            query_api_addr = %self.query_api.listen_addr,
            concurrent_window = self.classifier.concurrent_window_seconds,
            trigger_period = self.classifier.trigger_period_seconds,
            trigger_count = self.classifier.trigger_count,
            banlist_threshold = self.classifier.banlist_threshold_seconds,
            subnet_grouping = self.tracker.subnet_grouping,
            persist_enabled = self.sinks.persist.is_some(),
            notify_enabled = self.sinks.notify.is_some(),
            enrich_enabled = self.sinks.enrich.is_some(),
            "Effective ShareGuard configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_secrets() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_passes_once_required_secrets_present() {
        let mut cfg = EngineConfig::default();
        cfg.panel.url = Some("https://panel.example.com".to_string());
        cfg.panel.token = Some(Secret::new("panel-token".to_string()));
        cfg.query_api.api_token = Some(Secret::new("api-token".to_string()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_trigger_count_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.panel.url = Some("https://panel.example.com".to_string());
        cfg.panel.token = Some(Secret::new("panel-token".to_string()));
        cfg.query_api.api_token = Some(Secret::new("api-token".to_string()));
        cfg.classifier.trigger_count = 0;
        assert!(cfg.validate().is_err());
    }
}
