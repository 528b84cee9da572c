use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    redis::RedisConfig,
    utils::RouteName,
};

/// Admission policy for one route: at most `max_requests` per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window_ms: u64) -> Result<Self> {
        let policy = Self {
            max_requests,
            window_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_requests must be positive".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::InvalidConfig(
                "window_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Key for the client digest. Required.
    #[serde(default)]
    pub salt: Option<String>,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub limiter: LimiterSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// YAML file with per-route policies
    #[serde(default)]
    pub routes_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Full URL, takes precedence over host and port
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Failed connects are not retried for this long
    #[serde(default = "default_reconnect_cooldown_ms")]
    pub reconnect_cooldown_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            url: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            reconnect_cooldown_ms: default_reconnect_cooldown_ms(),
        }
    }
}

impl RedisSettings {
    pub fn to_redis_config(&self) -> RedisConfig {
        let mut config = match &self.url {
            Some(url) => RedisConfig {
                url: url.clone(),
                ..Default::default()
            },
            None => RedisConfig::from_host_port(&self.host, self.port),
        };
        config.connection_timeout = Duration::from_millis(self.connection_timeout_ms);
        config.command_timeout = Duration::from_millis(self.command_timeout_ms);
        config.reconnect_cooldown = Duration::from_millis(self.reconnect_cooldown_ms);
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Extra attempts after a failed store call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on one store interaction, retries included
    #[serde(default = "default_store_deadline_ms")]
    pub store_deadline_ms: u64,

    /// Run the stale-key sweeper at this interval when set
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            store_deadline_ms: default_store_deadline_ms(),
            sweep_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_store_deadline_ms() -> u64 {
    1_500
}

fn default_reconnect_cooldown_ms() -> u64 {
    1_000
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Environment variables and the settings keys they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("RATELIMIT_SALT", "salt"),
    ("REDIS_HOST", "redis.host"),
    ("REDIS_PORT", "redis.port"),
    ("REDIS_URL", "redis.url"),
    ("RATELIMIT_KEY_PREFIX", "limiter.key_prefix"),
    ("RATELIMIT_SWEEP_INTERVAL_SECS", "limiter.sweep_interval_secs"),
    ("ROUTES_CONFIG_PATH", "routes_path"),
];

impl Settings {
    /// Load settings from an optional file and the process environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load settings with a custom environment lookup
    pub fn load_with<F>(path: Option<&str>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        for (var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, env(*var))?;
        }
        let http_addr = env("HTTP_PORT").map(|port| format!("0.0.0.0:{}", port));
        builder = builder.set_override_option("server.http_addr", http_addr)?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !self.salt.as_deref().is_some_and(|salt| !salt.is_empty()) {
            return Err(RateLimitError::Config(
                "RATELIMIT_SALT must be set to a non-empty secret".to_string(),
            ));
        }
        if self.limiter.sweep_interval_secs == Some(0) {
            return Err(RateLimitError::Config(
                "limiter.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.limiter.store_deadline_ms == 0 {
            return Err(RateLimitError::Config(
                "limiter.store_deadline_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The validated salt
    pub fn salt(&self) -> &str {
        self.salt.as_deref().unwrap_or_default()
    }
}

/// Per-route policy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    #[serde(default)]
    pub default: Option<RateLimitPolicy>,
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub name: RouteName,
    #[serde(flatten)]
    pub policy: RateLimitPolicy,
}

/// Validated route policies for fast lookups
#[derive(Debug, Clone, Default)]
pub struct CompiledRoutes {
    default: Option<RateLimitPolicy>,
    policies: HashMap<RouteName, RateLimitPolicy>,
}

impl CompiledRoutes {
    pub fn compile(config: RoutesConfig) -> Result<Self> {
        if let Some(default) = &config.default {
            default.validate()?;
        }

        let mut policies = HashMap::new();
        for entry in config.routes {
            entry.policy.validate().map_err(|e| {
                RateLimitError::InvalidConfig(format!("route {}: {}", entry.name, e))
            })?;
            if policies.insert(entry.name.clone(), entry.policy).is_some() {
                return Err(RateLimitError::Config(format!(
                    "route {} is configured twice",
                    entry.name
                )));
            }
        }

        Ok(Self {
            default: config.default,
            policies,
        })
    }

    /// Policy for a route, falling back to the default policy
    pub fn find_policy(&self, route: &RouteName) -> Option<RateLimitPolicy> {
        self.policies.get(route).copied().or(self.default)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&RouteName, &RateLimitPolicy)> {
        self.policies.iter()
    }

    /// Longest window across all policies
    pub fn max_window_ms(&self) -> Option<u64> {
        self.policies
            .values()
            .chain(self.default.iter())
            .map(|p| p.window_ms)
            .max()
    }
}

/// Load route policies from a YAML string
pub fn load_routes_from_yaml(yaml: &str) -> Result<RoutesConfig> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load route policies from a YAML file
pub fn load_routes_from_file(path: &str) -> Result<RoutesConfig> {
    let content = std::fs::read_to_string(path)?;
    load_routes_from_yaml(&content)
}
