//! Application configuration, loaded once at startup from the environment
//! (with an optional `.env` file) and from CLI flags for local ergonomics.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "sentinel", about = "Sentinel trading-state backend")]
pub struct Cli {
    /// HTTP port to bind. Overrides PORT.
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to the SQLite database file. Overrides DB_PATH.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Root directory for the JSON file mirror. Overrides STORAGE_DIR.
    #[arg(long)]
    pub storage_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub storage_dir: String,

    pub openai_api_key: Option<String>,

    pub binance_testnet_base_url: String,
    pub binance_mainnet_base_url: String,
    pub binance_api_key: Option<String>,
    pub binance_api_secret: Option<String>,

    pub kline_cache_ttl: Duration,
    pub kline_cache_max_entries: usize,
    pub exchange_info_cache_ttl: Duration,
    pub exchange_info_min_refresh_interval: Duration,
    pub strategy_refresh_interval: Duration,

    pub ghost_purge_threshold_testnet: f64,
    pub ghost_purge_threshold_mainnet: f64,

    pub price_fetch_timeout: Duration,
    pub kline_fetch_timeout: Duration,
    pub account_fetch_timeout: Duration,
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = cli
            .port
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(8080);

        let db_path = cli
            .db_path
            .clone()
            .or_else(|| std::env::var("DB_PATH").ok())
            .or_else(|| std::env::var("DATABASE_PATH").ok())
            .unwrap_or_else(|| "./sentinel.db".to_string());

        let storage_dir = cli
            .storage_dir
            .clone()
            .or_else(|| std::env::var("STORAGE_DIR").ok())
            .unwrap_or_else(|| "./storage".to_string());

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty());

        let binance_testnet_base_url = std::env::var("BINANCE_TESTNET_BASE_URL")
            .unwrap_or_else(|_| "https://testnet.binance.vision".to_string());
        let binance_mainnet_base_url = std::env::var("BINANCE_MAINNET_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let binance_api_key = std::env::var("BINANCE_API_KEY").ok().filter(|s| !s.is_empty());
        let binance_api_secret = std::env::var("BINANCE_API_SECRET").ok().filter(|s| !s.is_empty());

        let strategy_refresh_interval_secs: u64 = std::env::var("STRATEGY_REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            port,
            db_path,
            storage_dir,
            openai_api_key,
            binance_testnet_base_url,
            binance_mainnet_base_url,
            binance_api_key,
            binance_api_secret,
            kline_cache_ttl: Duration::from_secs(120),
            kline_cache_max_entries: 1000,
            exchange_info_cache_ttl: Duration::from_secs(30 * 60),
            exchange_info_min_refresh_interval: Duration::from_secs(60),
            strategy_refresh_interval: Duration::from_secs(strategy_refresh_interval_secs),
            ghost_purge_threshold_testnet: 0.01,
            ghost_purge_threshold_mainnet: 0.05,
            price_fetch_timeout: Duration::from_secs(10),
            kline_fetch_timeout: Duration::from_secs(20),
            account_fetch_timeout: Duration::from_secs(10),
        })
    }
}
