use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::{Validate, ValidationError};

use crate::simulation::MeterGeneratorConfig;
use crate::utils::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub broker: BrokerConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub producer: ProducerConfig,
    #[validate(nested)]
    pub consumer: ConsumerConfig,
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Which broker backend carries the meter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BrokerKind {
    /// Process-local durable queue
    Memory,
    /// RabbitMQ or any AMQP 0.9.1 broker (requires the `amqp` feature)
    Amqp,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    #[validate(length(min = 1, max = 255))]
    pub queue: String,
    pub heartbeat_seconds: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            host: "localhost".into(),
            port: 5672,
            user: "user".into(),
            password: "password".into(),
            vhost: "/".into(),
            queue: "meter_queue".into(),
            heartbeat_seconds: 600,
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for this broker; the vhost is percent-encoded.
    pub fn amqp_uri(&self) -> String {
        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            self.user, self.password, self.host, self.port, vhost, self.heartbeat_seconds
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, delay_ms: 2000 }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_meter_bounds"))]
pub struct ProducerConfig {
    #[validate(range(min = 1))]
    pub interval_ms: u64,
    #[validate(range(min = 0.0, max = 20.0))]
    pub meter_min_kw: f64,
    #[validate(range(min = 0.0, max = 20.0))]
    pub meter_max_kw: f64,
    #[validate(range(min = 1))]
    pub error_backoff_ms: u64,
    pub seed: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            meter_min_kw: 0.5,
            meter_max_kw: 10.0,
            error_backoff_ms: 1000,
            seed: None,
        }
    }
}

impl ProducerConfig {
    pub fn meter(&self) -> MeterGeneratorConfig {
        MeterGeneratorConfig {
            min_kw: self.meter_min_kw,
            max_kw: self.meter_max_kw,
            random_seed: self.seed,
        }
    }
}

fn validate_meter_bounds(cfg: &ProducerConfig) -> Result<(), ValidationError> {
    if cfg.meter_min_kw > cfg.meter_max_kw {
        return Err(ValidationError::new("meter_min_kw_exceeds_max"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerConfig {
    #[validate(range(min = 1))]
    pub poll_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { poll_timeout_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub join_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { join_timeout_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[validate(range(min = 1))]
    pub max_results_returned: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/results.csv"),
            max_results_returned: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "pv-simulator.log".into(),
            file_enabled: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("PVSIM__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("failed to load configuration")?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}
