//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::dispatch::RunMode;
use crate::error::ConfigError;

/// Dispatch loop timing and normalization policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Hard bound on one task-source fetch.
    pub fetch_timeout: Duration,
    /// Sleep between polls when the queue is empty (and after each batch).
    pub idle_interval: Duration,
    /// Sleep after the task source failed or timed out.
    pub source_backoff: Duration,
    /// Minimum spacing between two transmissions.
    pub inter_message_delay: Duration,
    /// Prefix applied to destinations without a leading `+`.
    pub default_country_code: String,
    /// Default run mode for `start` requests that don't name one.
    pub mode: RunMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            idle_interval: Duration::from_secs(10),
            source_backoff: Duration::from_secs(10),
            inter_message_delay: Duration::from_millis(1200),
            default_country_code: "+91".to_string(),
            mode: RunMode::Continuous,
        }
    }
}

/// Outcome bookkeeping policy.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Balance credited per confirmed message.
    pub reward: Decimal,
    /// Raw result code that counts as a confirmed delivery.
    pub ok_result_code: i32,
    /// Failure streak at which the observer is told to escalate.
    pub escalation_threshold: u32,
    /// Number of recently applied job ids remembered in-process.
    pub dedupe_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            reward: dec!(0.16),
            ok_result_code: -1,
            escalation_threshold: 2,
            dedupe_capacity: 4096,
        }
    }
}

/// Which transmission backend the binary wires up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBackend {
    /// In-process channel that reports every part as delivered. For dry runs.
    Loopback,
    /// HTTP SMS gateway, one base URL per channel slot.
    Gateway { urls: Vec<String>, token: Option<String> },
}

/// Process-wide relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Per-installation identifier. Generated and persisted when unset.
    pub device_id: Option<String>,
    pub channel: ChannelBackend,
    pub log_dir: Option<PathBuf>,
    /// Start dispatching on this slot at boot if a session is present.
    pub autostart_slot: Option<usize>,
    /// Bearer token the delivery webhook requires. The webhook is disabled
    /// when unset.
    pub webhook_token: Option<String>,
    pub dispatch: DispatchConfig,
    pub delivery: DeliveryConfig,
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/sms-relay.db"));

        let http_port: u16 = parse_env("RELAY_HTTP_PORT")?.unwrap_or(8080);

        let device_id = std::env::var("RELAY_DEVICE_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let channel = match std::env::var("RELAY_CHANNEL")
            .unwrap_or_else(|_| "loopback".to_string())
            .as_str()
        {
            "loopback" => ChannelBackend::Loopback,
            "gateway" => {
                let urls: Vec<String> = std::env::var("RELAY_GATEWAY_URLS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if urls.is_empty() {
                    return Err(ConfigError::MissingRequired {
                        key: "RELAY_GATEWAY_URLS".to_string(),
                        hint: "Set one gateway URL per channel slot, comma-separated".to_string(),
                    });
                }
                ChannelBackend::Gateway {
                    urls,
                    token: std::env::var("RELAY_GATEWAY_TOKEN").ok(),
                }
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_CHANNEL".to_string(),
                    message: format!("expected 'loopback' or 'gateway', got '{other}'"),
                });
            }
        };

        let webhook_token = std::env::var("RELAY_WEBHOOK_TOKEN")
            .or_else(|_| std::env::var("RELAY_GATEWAY_TOKEN"))
            .ok()
            .filter(|s| !s.trim().is_empty());

        let log_dir = std::env::var("RELAY_LOG_DIR").ok().map(PathBuf::from);
        let autostart_slot = parse_env("RELAY_AUTOSTART_SLOT")?;

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            fetch_timeout: parse_env("RELAY_FETCH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            idle_interval: parse_env("RELAY_IDLE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_interval),
            source_backoff: parse_env("RELAY_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.source_backoff),
            inter_message_delay: parse_env("RELAY_SEND_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_message_delay),
            default_country_code: std::env::var("RELAY_COUNTRY_CODE")
                .unwrap_or(defaults.default_country_code),
            mode: parse_env("RELAY_RUN_MODE")?.unwrap_or(defaults.mode),
        };
        if !dispatch.default_country_code.starts_with('+') {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_COUNTRY_CODE".to_string(),
                message: "country code must start with '+'".to_string(),
            });
        }

        let defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            reward: parse_env("RELAY_REWARD")?.unwrap_or(defaults.reward),
            ok_result_code: parse_env("RELAY_OK_CODE")?.unwrap_or(defaults.ok_result_code),
            escalation_threshold: parse_env("RELAY_ESCALATE_AFTER")?
                .unwrap_or(defaults.escalation_threshold),
            dedupe_capacity: defaults.dedupe_capacity,
        };

        Ok(Self {
            db_path,
            http_port,
            device_id,
            channel,
            log_dir,
            autostart_slot,
            webhook_token,
            dispatch,
            delivery,
        })
    }
}

/// Read and parse an optional environment variable.
fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}
