//! Consumer Configuration Settings
//!
//! Configuration types for the stream consumer, loaded from environment
//! variables (optionally seeded from a `.env` file by the binary).

use std::time::Duration;

use crate::domain::auth::Credentials;
use crate::domain::message::DomainKind;
use crate::domain::subscription::SubscriptionRequest;

/// Default OAuth2 token endpoint (v2 client credentials).
pub const DEFAULT_TOKEN_URL: &str = "https://api.refinitiv.com/auth/oauth2/v2/token";

/// Default streaming endpoint.
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:14002/WebSocket";

/// Items to request and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// Service publishing the items.
    pub service_name: String,
    /// Item names.
    pub item_names: Vec<String>,
    /// Field view (empty = all fields).
    pub view_fields: Vec<i16>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            service_name: "ELEKTRON_DD".to_string(),
            item_names: vec!["EUR=".to_string()],
            view_fields: vec![22, 25, 15, 875, 1010],
        }
    }
}

impl SubscriptionSettings {
    /// One market price request per configured item.
    #[must_use]
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.item_names
            .iter()
            .map(|item| SubscriptionRequest {
                service_name: self.service_name.clone(),
                item_name: item.clone(),
                domain: DomainKind::MarketPrice,
                view: (!self.view_fields.is_empty()).then(|| self.view_fields.clone()),
            })
            .collect()
    }
}

/// Login stream settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSettings {
    /// User name sent in the login request.
    pub username: String,
    /// Application id sent in the login request.
    pub application_id: String,
    /// How long `open` waits for the login response.
    pub login_timeout: Duration,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            username: "user".to_string(),
            application_id: "256".to_string(),
            login_timeout: Duration::from_secs(10),
        }
    }
}

/// Backoff settings for a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Jitter fraction.
    pub jitter_factor: f64,
    /// Retries before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

/// Token renewal settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalSettings {
    /// Fraction of the token lifetime after which renewal starts.
    pub renewal_ratio: f64,
    /// Renewal always starts at least this long before expiry.
    pub min_margin: Duration,
    /// Backoff for failed renewals.
    pub retry: RetrySettings,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            renewal_ratio: 0.8,
            min_margin: Duration::from_secs(5),
            retry: RetrySettings {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
                ..RetrySettings::default()
            },
        }
    }
}

/// Complete consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// OAuth2 client credentials.
    pub credentials: Credentials,
    /// Streaming endpoint.
    pub stream_url: String,
    /// Items to subscribe.
    pub subscription: SubscriptionSettings,
    /// Login stream settings.
    pub login: LoginSettings,
    /// Transport reconnect backoff.
    pub reconnect: RetrySettings,
    /// Token renewal timing.
    pub renewal: RenewalSettings,
    /// Prometheus exporter port (0 = disabled).
    pub metrics_port: u16,
    /// How long the binary runs before closing the session.
    pub run_duration: Duration,
}

impl ConsumerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `CLIENT_ID` or `CLIENT_SECRET` is missing or
    /// empty, if `VIEW_FIELDS` contains a non-numeric id, or if a ratio,
    /// multiplier or jitter setting is not a finite number in range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource(lookup);

        let client_id = env.required("CLIENT_ID")?;
        let client_secret = env.required("CLIENT_SECRET")?;
        let token_url = env.string("TOKEN_URL", DEFAULT_TOKEN_URL);

        let mut credentials = Credentials::new(client_id, client_secret, token_url);
        if let Some(scope) = env.optional("TOKEN_SCOPE") {
            credentials = credentials.with_scope(scope);
        }

        let sub_defaults = SubscriptionSettings::default();
        let subscription = SubscriptionSettings {
            service_name: env.string("SERVICENAME", &sub_defaults.service_name),
            item_names: env
                .optional("ITEM_NAMES")
                .map_or(sub_defaults.item_names, |v| split_list(&v)),
            view_fields: match env.optional("VIEW_FIELDS") {
                Some(v) => parse_field_ids(&v)?,
                None => sub_defaults.view_fields,
            },
        };

        let login_defaults = LoginSettings::default();
        let login = LoginSettings {
            username: env.string("CONSUMER_USERNAME", &login_defaults.username),
            application_id: env.string("CONSUMER_APP_ID", &login_defaults.application_id),
            login_timeout: env.duration_secs(
                "CONSUMER_LOGIN_TIMEOUT_SECS",
                login_defaults.login_timeout,
            ),
        };

        let retry_defaults = RetrySettings::default();
        let reconnect = RetrySettings {
            initial_delay: env.duration_millis(
                "CONSUMER_RECONNECT_DELAY_INITIAL_MS",
                retry_defaults.initial_delay,
            ),
            max_delay: env.duration_secs(
                "CONSUMER_RECONNECT_DELAY_MAX_SECS",
                retry_defaults.max_delay,
            ),
            multiplier: env.float(
                "CONSUMER_RECONNECT_DELAY_MULTIPLIER",
                retry_defaults.multiplier,
                |m| m >= 1.0,
            )?,
            jitter_factor: env.float(
                "CONSUMER_RECONNECT_JITTER",
                retry_defaults.jitter_factor,
                |j| (0.0..1.0).contains(&j),
            )?,
            max_attempts: env.parse(
                "CONSUMER_MAX_RECONNECT_ATTEMPTS",
                retry_defaults.max_attempts,
            ),
        };

        let renewal_defaults = RenewalSettings::default();
        let renewal = RenewalSettings {
            renewal_ratio: env
                .float(
                    "CONSUMER_TOKEN_RENEWAL_RATIO",
                    renewal_defaults.renewal_ratio,
                    |r| r > 0.0,
                )?
                .clamp(0.1, 0.95),
            min_margin: env.duration_secs(
                "CONSUMER_TOKEN_RENEWAL_MARGIN_SECS",
                renewal_defaults.min_margin,
            ),
            retry: RetrySettings {
                max_attempts: env.parse(
                    "CONSUMER_MAX_RENEWAL_ATTEMPTS",
                    renewal_defaults.retry.max_attempts,
                ),
                ..renewal_defaults.retry
            },
        };

        Ok(Self {
            credentials,
            stream_url: env.string("STREAM_URL", DEFAULT_STREAM_URL),
            subscription,
            login,
            reconnect,
            renewal,
            metrics_port: env.parse("CONSUMER_METRICS_PORT", 0),
            run_duration: env.duration_secs("RUN_DURATION_SECS", Duration::from_secs(900)),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

// =============================================================================
// Parsing helpers
// =============================================================================

struct EnvSource<F>(F);

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.to_string())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.optional(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Finite float accepted by `valid`; anything else is an error.
    fn float<V>(&self, key: &str, default: f64, valid: V) -> Result<f64, ConfigError>
    where
        V: Fn(f64) -> bool,
    {
        let Some(raw) = self.optional(key) else {
            return Ok(default);
        };
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && valid(value) => Ok(value),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.optional(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.optional(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_field_ids(value: &str) -> Result<Vec<i16>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|id| {
            id.parse().map_err(|_| ConfigError::InvalidValue {
                key: "VIEW_FIELDS".to_string(),
                value: id,
            })
        })
        .collect()
}
