//! Service Configuration Module
//!
//! Every tunable is read from an `HTMLSHOT_*` environment variable with a
//! development default. Only the signing secret is mandatory.

use std::path::PathBuf;
use std::time::Duration;

use htmlshot_core::ConfigError;
use htmlshot_render::{FontResolverConfig, DEFAULT_FONT_ENDPOINT};
use secrecy::{ExposeSecret, SecretString};

use crate::constants::*;

// ============================================================================
// ENV HELPERS
// ============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base of minted URLs, without a trailing slash.
    pub public_base_url: String,
    /// Empty means allow all origins.
    pub cors_origins: Vec<String>,
    pub mint_timeout: Duration,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub secret: SecretString,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub attempt_timeout: Duration,
    pub max_concurrent_renders: usize,
    pub max_width: u32,
    pub max_height: u32,
}

/// Web font resolution settings.
pub type FontConfig = FontResolverConfig;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    pub memory_ttl: Option<Duration>,
    pub disk_dir: PathBuf,
    pub disk_ttl: Option<Duration>,
    pub memory_sweep_interval: Duration,
    pub disk_sweep_interval: Duration,
}

/// Backoff for the snapshot feed.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            max_ms: DEFAULT_RECONNECT_MAX_MS,
            multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            jitter_ms: DEFAULT_RECONNECT_JITTER_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub path: PathBuf,
    pub map_size_mb: usize,
    /// `ws://` URL of the origin's snapshot feed. No feed means the replica
    /// stays not-ready and every bearer request is refused.
    pub feed_url: Option<String>,
    pub feed_token: Option<SecretString>,
    pub reconnect: ReconnectConfig,
}

/// Where quota verdicts come from on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSource {
    Replica,
    Origin,
}

impl QuotaSource {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replica" => Ok(QuotaSource::Replica),
            "origin" => Ok(QuotaSource::Origin),
            other => Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_QUOTA_SOURCE".to_string(),
                value: other.to_string(),
                reason: "expected 'replica' or 'origin'".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Base URL of the template, quota and usage endpoints.
    pub base_url: String,
    pub service_token: Option<SecretString>,
    pub timeout: Duration,
    pub quota_source: QuotaSource,
}

// ============================================================================
// SERVICE CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub environment: String,
    pub server: ServerConfig,
    pub signing: SigningConfig,
    pub render: RenderConfig,
    pub fonts: FontConfig,
    pub cache: CacheConfig,
    pub replica: ReplicaConfig,
    pub origin: OriginConfig,
}

impl ServiceConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    /// `MissingRequired` when `HTMLSHOT_SIGNING_SECRET` is unset, and
    /// `InvalidValue` for values that are present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment =
            env_string("HTMLSHOT_ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let port = match env_string("HTMLSHOT_PORT").or_else(|| env_string("PORT")) {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                field: "HTMLSHOT_PORT".to_string(),
                value: raw.clone(),
                reason: "not a valid port".to_string(),
            })?,
            None => 3000,
        };

        let server = ServerConfig {
            host: env_string("HTMLSHOT_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            public_base_url: env_string("HTMLSHOT_PUBLIC_URL")
                .unwrap_or_else(|| DEV_PUBLIC_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            cors_origins: env_list("HTMLSHOT_CORS_ORIGINS"),
            mint_timeout: Duration::from_secs(env_parse(
                "HTMLSHOT_MINT_TIMEOUT_SECS",
                DEFAULT_MINT_TIMEOUT_SECS,
            )),
            max_in_flight: env_parse("HTMLSHOT_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT),
        };

        let secret = env_string("HTMLSHOT_SIGNING_SECRET").ok_or_else(|| {
            ConfigError::MissingRequired {
                field: "HTMLSHOT_SIGNING_SECRET".to_string(),
            }
        })?;
        let signing = SigningConfig {
            secret: SecretString::new(secret.into()),
            default_ttl: Duration::from_secs(env_parse(
                "HTMLSHOT_URL_TTL_SECS",
                DEFAULT_URL_TTL_SECS,
            )),
            max_ttl: Duration::from_secs(env_parse("HTMLSHOT_MAX_URL_TTL_SECS", MAX_URL_TTL_SECS)),
        };

        let render = RenderConfig {
            command: env_string("HTMLSHOT_COMPOSITOR_COMMAND")
                .unwrap_or_else(|| DEFAULT_COMPOSITOR_COMMAND.to_string()),
            args: env_string("HTMLSHOT_COMPOSITOR_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            attempt_timeout: Duration::from_millis(env_parse(
                "HTMLSHOT_RENDER_TIMEOUT_MS",
                DEFAULT_RENDER_TIMEOUT_MS,
            )),
            max_concurrent_renders: env_parse(
                "HTMLSHOT_MAX_CONCURRENT_RENDERS",
                DEFAULT_MAX_CONCURRENT_RENDERS,
            ),
            max_width: env_parse("HTMLSHOT_MAX_WIDTH", DEFAULT_MAX_DIMENSION),
            max_height: env_parse("HTMLSHOT_MAX_HEIGHT", DEFAULT_MAX_DIMENSION),
        };

        let font_defaults = FontResolverConfig::default();
        let fonts = FontConfig {
            endpoint: env_string("HTMLSHOT_FONT_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_FONT_ENDPOINT.to_string()),
            max_families: env_parse("HTMLSHOT_FONT_MAX_FAMILIES", font_defaults.max_families),
            subset_cap: env_parse("HTMLSHOT_FONT_SUBSET_CAP", font_defaults.subset_cap),
            request_timeout: Duration::from_secs(env_parse(
                "HTMLSHOT_FONT_TIMEOUT_SECS",
                font_defaults.request_timeout.as_secs(),
            )),
            user_agent: font_defaults.user_agent,
        };

        let cache = CacheConfig {
            memory_capacity: env_parse(
                "HTMLSHOT_MEMORY_CACHE_CAPACITY",
                DEFAULT_MEMORY_CACHE_CAPACITY,
            ),
            memory_ttl: non_zero_secs(env_parse(
                "HTMLSHOT_MEMORY_CACHE_TTL_SECS",
                DEFAULT_MEMORY_CACHE_TTL_SECS,
            )),
            disk_dir: PathBuf::from(
                env_string("HTMLSHOT_DISK_CACHE_DIR")
                    .unwrap_or_else(|| DEFAULT_DISK_CACHE_DIR.to_string()),
            ),
            disk_ttl: non_zero_secs(env_parse(
                "HTMLSHOT_DISK_CACHE_TTL_SECS",
                DEFAULT_DISK_CACHE_TTL_SECS,
            )),
            memory_sweep_interval: Duration::from_secs(env_parse(
                "HTMLSHOT_MEMORY_SWEEP_SECS",
                DEFAULT_MEMORY_SWEEP_SECS,
            )),
            disk_sweep_interval: Duration::from_secs(env_parse(
                "HTMLSHOT_DISK_SWEEP_SECS",
                DEFAULT_DISK_SWEEP_SECS,
            )),
        };

        let replica = ReplicaConfig {
            path: PathBuf::from(
                env_string("HTMLSHOT_REPLICA_PATH")
                    .unwrap_or_else(|| DEFAULT_REPLICA_PATH.to_string()),
            ),
            map_size_mb: env_parse("HTMLSHOT_REPLICA_MAP_SIZE_MB", DEFAULT_REPLICA_MAP_SIZE_MB),
            feed_url: env_string("HTMLSHOT_SNAPSHOT_FEED_URL"),
            feed_token: env_string("HTMLSHOT_SNAPSHOT_FEED_TOKEN")
                .map(|t| SecretString::new(t.into())),
            reconnect: ReconnectConfig {
                initial_ms: env_parse(
                    "HTMLSHOT_FEED_RECONNECT_INITIAL_MS",
                    DEFAULT_RECONNECT_INITIAL_MS,
                ),
                max_ms: env_parse("HTMLSHOT_FEED_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
                multiplier: env_parse(
                    "HTMLSHOT_FEED_RECONNECT_MULTIPLIER",
                    DEFAULT_RECONNECT_MULTIPLIER,
                ),
                jitter_ms: env_parse(
                    "HTMLSHOT_FEED_RECONNECT_JITTER_MS",
                    DEFAULT_RECONNECT_JITTER_MS,
                ),
            },
        };

        let quota_source = match env_string("HTMLSHOT_QUOTA_SOURCE") {
            Some(raw) => QuotaSource::parse(&raw)?,
            None => QuotaSource::Replica,
        };
        let origin = OriginConfig {
            base_url: env_string("HTMLSHOT_ORIGIN_URL")
                .unwrap_or_else(|| "http://localhost:4000".to_string())
                .trim_end_matches('/')
                .to_string(),
            service_token: env_string("HTMLSHOT_ORIGIN_TOKEN")
                .map(|t| SecretString::new(t.into())),
            timeout: Duration::from_secs(env_parse(
                "HTMLSHOT_ORIGIN_TIMEOUT_SECS",
                DEFAULT_ORIGIN_TIMEOUT_SECS,
            )),
            quota_source,
        };

        Ok(Self {
            environment,
            server,
            signing,
            render,
            fonts,
            cache,
            replica,
            origin,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Reject combinations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret_len = self.signing.secret.expose_secret().len();
        if !self.is_development() && secret_len < MIN_SIGNING_SECRET_LENGTH {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_SIGNING_SECRET".to_string(),
                value: format!("<{} bytes>", secret_len),
                reason: format!(
                    "must be at least {} bytes outside development",
                    MIN_SIGNING_SECRET_LENGTH
                ),
            });
        }

        if self.signing.default_ttl.is_zero() || self.signing.default_ttl > self.signing.max_ttl {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_URL_TTL_SECS".to_string(),
                value: self.signing.default_ttl.as_secs().to_string(),
                reason: format!(
                    "must be positive and at most HTMLSHOT_MAX_URL_TTL_SECS ({})",
                    self.signing.max_ttl.as_secs()
                ),
            });
        }

        if self.render.max_concurrent_renders == 0 {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_MAX_CONCURRENT_RENDERS".to_string(),
                value: "0".to_string(),
                reason: "at least one render slot is required".to_string(),
            });
        }

        if self.render.max_width == 0 || self.render.max_height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_MAX_WIDTH".to_string(),
                value: format!("{}x{}", self.render.max_width, self.render.max_height),
                reason: "maximum dimensions must be positive".to_string(),
            });
        }

        let reconnect = &self.replica.reconnect;
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_FEED_RECONNECT_MULTIPLIER".to_string(),
                value: reconnect.multiplier.to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        if reconnect.initial_ms == 0 || reconnect.initial_ms > reconnect.max_ms {
            return Err(ConfigError::InvalidValue {
                field: "HTMLSHOT_FEED_RECONNECT_INITIAL_MS".to_string(),
                value: reconnect.initial_ms.to_string(),
                reason: "must be positive and at most the maximum backoff".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    const GOOD_SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_missing_secret_is_fatal() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", None);
        let err = ServiceConfig::from_env().expect_err("secret is required");
        assert!(matches!(err, ConfigError::MissingRequired { ref field } if field == "HTMLSHOT_SIGNING_SECRET"));
    }

    #[test]
    fn test_defaults() -> Result<(), ConfigError> {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some(GOOD_SECRET));
        let _env = EnvVarGuard::set("HTMLSHOT_ENVIRONMENT", None);
        let _port = EnvVarGuard::set("HTMLSHOT_PORT", None);
        let _plain_port = EnvVarGuard::set("PORT", None);
        let _disk_ttl = EnvVarGuard::set("HTMLSHOT_DISK_CACHE_TTL_SECS", None);
        let _quota = EnvVarGuard::set("HTMLSHOT_QUOTA_SOURCE", None);

        let config = ServiceConfig::from_env()?;
        config.validate()?;
        assert!(config.is_development());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.signing.default_ttl, Duration::from_secs(DEFAULT_URL_TTL_SECS));
        assert_eq!(config.cache.disk_ttl, None);
        assert_eq!(config.origin.quota_source, QuotaSource::Replica);
        Ok(())
    }

    #[test]
    fn test_public_url_trailing_slash_trimmed() -> Result<(), ConfigError> {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some(GOOD_SECRET));
        let _url = EnvVarGuard::set("HTMLSHOT_PUBLIC_URL", Some("https://img.example.com/"));
        let config = ServiceConfig::from_env()?;
        assert_eq!(config.server.public_base_url, "https://img.example.com");
        Ok(())
    }

    #[test]
    fn test_invalid_port_rejected() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some(GOOD_SECRET));
        let _port = EnvVarGuard::set("HTMLSHOT_PORT", Some("eighty"));
        let err = ServiceConfig::from_env().expect_err("port must parse");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_short_secret_rejected_outside_development() -> Result<(), ConfigError> {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some("short"));
        let _env = EnvVarGuard::set("HTMLSHOT_ENVIRONMENT", Some("production"));
        let config = ServiceConfig::from_env()?;
        assert!(config.validate().is_err());

        let _dev = EnvVarGuard::set("HTMLSHOT_ENVIRONMENT", Some("development"));
        let config = ServiceConfig::from_env()?;
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_unknown_quota_source_rejected() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some(GOOD_SECRET));
        let _quota = EnvVarGuard::set("HTMLSHOT_QUOTA_SOURCE", Some("sometimes"));
        assert!(ServiceConfig::from_env().is_err());
    }

    #[test]
    fn test_default_ttl_above_max_rejected() -> Result<(), ConfigError> {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _secret = EnvVarGuard::set("HTMLSHOT_SIGNING_SECRET", Some(GOOD_SECRET));
        let _ttl = EnvVarGuard::set("HTMLSHOT_URL_TTL_SECS", Some("100"));
        let _max = EnvVarGuard::set("HTMLSHOT_MAX_URL_TTL_SECS", Some("10"));
        let config = ServiceConfig::from_env()?;
        assert!(config.validate().is_err());
        Ok(())
    }
}
