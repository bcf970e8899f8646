use eyre::{eyre, Result, WrapErr};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::{DispatchConfig, MintLookupConfig};
use crate::reader::ReaderConfig;
use crate::retry::RetryConfig;
use crate::rpc::parse_rpc_urls;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub relay: RelayConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Chain A: where locks are observed
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Identifier used in dedup keys, e.g. "chainA" or "11155111"
    pub chain_id: String,
    /// RPC URLs in fallback order
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    /// Asset locked by the gateway
    pub asset_id: String,
    pub required_confirmations: u64,
    /// Block tag reported as finalized: latest, safe or finalized
    pub finality_tag: String,
    /// First height scanned when no checkpoint exists
    pub start_block: u64,
    pub max_block_range: u64,
}

/// Chain B: where mints are submitted
#[derive(Clone)]
pub struct DestinationConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    pub private_key: String,
    pub required_confirmations: u64,
    pub supported_assets: Vec<String>,
    /// First block searched when looking up an earlier mint
    pub lookup_from_block: u64,
    /// Widest eth_getLogs window the destination node accepts
    pub max_block_range: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_urls", &self.rpc_urls)
            .field("contract_address", &self.contract_address)
            .field("private_key", &"<redacted>")
            .field("required_confirmations", &self.required_confirmations)
            .field("supported_assets", &self.supported_assets)
            .field("lookup_from_block", &self.lookup_from_block)
            .field("max_block_range", &self.max_block_range)
            .finish()
    }
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub dispatch_workers: usize,
    pub dispatch_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_block_range() -> u64 {
    2000
}

fn default_api_port() -> u16 {
    9092
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build the configuration from a variable lookup
    pub fn from_vars<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = DatabaseConfig {
            url: required(&get, "DATABASE_URL")?,
        };

        let source_rpc_urls = parse_rpc_urls(&required(&get, "SOURCE_RPC_URL")?);
        if source_rpc_urls.is_empty() {
            return Err(eyre!("SOURCE_RPC_URL cannot be empty"));
        }

        let source = SourceConfig {
            chain_id: required(&get, "SOURCE_CHAIN_ID")?,
            rpc_urls: source_rpc_urls,
            contract_address: required(&get, "SOURCE_CONTRACT_ADDRESS")?,
            asset_id: required(&get, "SOURCE_ASSET_ID")?,
            required_confirmations: required_parsed(&get, "SOURCE_REQUIRED_CONFIRMATIONS")?,
            finality_tag: get("SOURCE_FINALITY_TAG").unwrap_or_else(|| "latest".to_string()),
            start_block: optional_parsed(&get, "SOURCE_START_BLOCK", 0)?,
            max_block_range: optional_parsed(
                &get,
                "SOURCE_MAX_BLOCK_RANGE",
                default_max_block_range(),
            )?,
        };

        let dest_rpc_urls = parse_rpc_urls(&required(&get, "DEST_RPC_URL")?);
        if dest_rpc_urls.is_empty() {
            return Err(eyre!("DEST_RPC_URL cannot be empty"));
        }

        let destination = DestinationConfig {
            chain_id: required_parsed(&get, "DEST_CHAIN_ID")?,
            rpc_urls: dest_rpc_urls,
            contract_address: required(&get, "DEST_CONTRACT_ADDRESS")?,
            private_key: required(&get, "DEST_PRIVATE_KEY")?,
            required_confirmations: required_parsed(&get, "DEST_REQUIRED_CONFIRMATIONS")?,
            supported_assets: required(&get, "DEST_SUPPORTED_ASSETS")?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            lookup_from_block: optional_parsed(&get, "DEST_LOOKUP_FROM_BLOCK", 0)?,
            max_block_range: optional_parsed(
                &get,
                "DEST_MAX_BLOCK_RANGE",
                default_max_block_range(),
            )?,
        };

        let relay = RelayConfig {
            max_attempts: optional_parsed(&get, "MAX_ATTEMPTS", default_max_attempts())?,
            retry_base_delay_ms: optional_parsed(&get, "RETRY_BASE_DELAY_MS", 2000)?,
            retry_max_delay_ms: optional_parsed(&get, "RETRY_MAX_DELAY_MS", 60_000)?,
            reconnect_base_delay_ms: optional_parsed(&get, "RECONNECT_BASE_DELAY_MS", 1000)?,
            reconnect_max_delay_ms: optional_parsed(&get, "RECONNECT_MAX_DELAY_MS", 30_000)?,
            confirmation_timeout_secs: optional_parsed(&get, "CONFIRMATION_TIMEOUT_SECS", 600)?,
            poll_interval_ms: optional_parsed(&get, "POLL_INTERVAL_MS", default_poll_interval())?,
            dispatch_workers: optional_parsed(&get, "DISPATCH_WORKERS", 4)?,
            dispatch_queue_capacity: optional_parsed(&get, "DISPATCH_QUEUE_CAPACITY", 256)?,
        };

        let api = ApiConfig {
            bind_address: get("API_BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: optional_parsed(&get, "API_PORT", default_api_port())?,
        };

        let config = Config {
            database,
            source,
            destination,
            relay,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for (name, address) in [
            ("source.contract_address", &self.source.contract_address),
            ("destination.contract_address", &self.destination.contract_address),
        ] {
            if address.len() != 42 || !address.starts_with("0x") {
                return Err(eyre!(
                    "{} must be a valid hex address (42 chars with 0x prefix)",
                    name
                ));
            }
        }

        if self.destination.private_key.len() != 66 || !self.destination.private_key.starts_with("0x") {
            return Err(eyre!(
                "destination.private_key must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if self.source.required_confirmations == 0 {
            return Err(eyre!("SOURCE_REQUIRED_CONFIRMATIONS must be positive"));
        }
        if self.destination.required_confirmations == 0 {
            return Err(eyre!("DEST_REQUIRED_CONFIRMATIONS must be positive"));
        }
        if self.destination.supported_assets.is_empty() {
            return Err(eyre!("DEST_SUPPORTED_ASSETS must list at least one asset"));
        }
        if self.source.max_block_range == 0 {
            return Err(eyre!("SOURCE_MAX_BLOCK_RANGE must be positive"));
        }
        if self.destination.max_block_range == 0 {
            return Err(eyre!("DEST_MAX_BLOCK_RANGE must be positive"));
        }
        if !matches!(
            self.source.finality_tag.as_str(),
            "latest" | "safe" | "finalized"
        ) {
            return Err(eyre!(
                "SOURCE_FINALITY_TAG must be one of latest, safe, finalized"
            ));
        }

        let relay = &self.relay;
        if relay.max_attempts == 0 {
            return Err(eyre!("MAX_ATTEMPTS must be positive"));
        }
        if relay.poll_interval_ms == 0 {
            return Err(eyre!("POLL_INTERVAL_MS must be positive"));
        }
        if relay.dispatch_workers == 0 {
            return Err(eyre!("DISPATCH_WORKERS must be positive"));
        }
        if relay.dispatch_queue_capacity == 0 {
            return Err(eyre!("DISPATCH_QUEUE_CAPACITY must be positive"));
        }
        if relay.retry_base_delay_ms > relay.retry_max_delay_ms {
            return Err(eyre!(
                "RETRY_BASE_DELAY_MS cannot exceed RETRY_MAX_DELAY_MS"
            ));
        }
        if relay.reconnect_base_delay_ms > relay.reconnect_max_delay_ms {
            return Err(eyre!(
                "RECONNECT_BASE_DELAY_MS cannot exceed RECONNECT_MAX_DELAY_MS"
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay.poll_interval_ms)
    }

    /// Dispatch retry schedule
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.relay.max_attempts,
            initial_backoff: Duration::from_millis(self.relay.retry_base_delay_ms),
            max_backoff: Duration::from_millis(self.relay.retry_max_delay_ms),
            backoff_multiplier: 2.0,
        }
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            max_block_range: self.source.max_block_range,
            scan_lag: self.source.required_confirmations,
            poll_interval: self.poll_interval(),
            reconnect: RetryConfig::reconnect(
                Duration::from_millis(self.relay.reconnect_base_delay_ms),
                Duration::from_millis(self.relay.reconnect_max_delay_ms),
            ),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            retry: self.retry_config(),
            destination_confirmations: self.destination.required_confirmations,
            confirmation_timeout: Duration::from_secs(self.relay.confirmation_timeout_secs),
            poll_interval: self.poll_interval(),
            supported_assets: self
                .destination
                .supported_assets
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
        }
    }

    pub fn mint_lookup_config(&self) -> MintLookupConfig {
        MintLookupConfig {
            from_block: self.destination.lookup_from_block,
            max_block_range: self.destination.max_block_range,
            settle_depth: self.destination.required_confirmations,
        }
    }
}

fn required<F>(get: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| eyre!("{} environment variable is required", name))
}

fn required_parsed<F, T>(get: &F, name: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    required(get, name)?
        .parse()
        .map_err(|e: T::Err| eyre!("{} is invalid: {}", name, e))
}

fn optional_parsed<F, T>(get: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| eyre!("{} is invalid: {}", name, e)),
        None => Ok(default),
    }
}
