//! Market Data Fetcher (C1): a thin, caching wrapper around the Binance
//! REST API. Grounded on the teacher's `PolymarketMarketWsCache` freshness
//! pattern (`Arc<RwLock<HashMap<..>>>` plus an `updated_at` check) and its
//! `HashdiveClient`'s manual `Instant`-based rate limiter, adapted from a
//! push-based WS cache to a pull-based REST cache since this spec has no
//! streaming requirement.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::CoreError;

#[derive(Debug, Clone)]
struct CachedKlines {
    klines: Vec<Kline>,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

#[derive(Debug, Clone)]
struct CachedExchangeInfo {
    symbols: HashMap<String, SymbolFilters>,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub min_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub tick_size: f64,
}

/// Per-symbol plausibility bands: prices outside `[min, max]` are treated as
/// a bad feed read rather than a real price. ETH/USDT additionally carries a
/// narrower "alert band" that is logged but does not reject the price,
/// since tight alert thresholds on the majors' most liquid pair produced too
/// many false positives during the 0.01/0.05 ghost-purge tuning pass.
pub fn plausibility_band(symbol: &str) -> Option<(f64, f64)> {
    match symbol {
        "ETH/USDT" | "ETHUSDT" => Some((2_500.0, 5_000.0)),
        "BTC/USDT" | "BTCUSDT" => Some((40_000.0, 80_000.0)),
        "SOL/USDT" | "SOLUSDT" => Some((100.0, 300.0)),
        "BNB/USDT" | "BNBUSDT" => Some((200.0, 800.0)),
        "ADA/USDT" | "ADAUSDT" => Some((0.3, 2.0)),
        "XRP/USDT" | "XRPUSDT" => Some((0.3, 3.0)),
        "DOGE/USDT" | "DOGEUSDT" => Some((0.05, 0.5)),
        "DOT/USDT" | "DOTUSDT" => Some((3.0, 20.0)),
        "LINK/USDT" | "LINKUSDT" => Some((5.0, 50.0)),
        "AVAX/USDT" | "AVAXUSDT" => Some((20.0, 100.0)),
        "LTC/USDT" | "LTCUSDT" => Some((50.0, 200.0)),
        _ => None,
    }
}

/// A narrower band logged (not enforced) for the exchange's most liquid
/// pair, to catch feed drift before it would trip the wide plausibility
/// band above.
pub fn eth_usdt_alert_band() -> (f64, f64) {
    (3_500.0, 4_000.0)
}

pub fn validate_price_plausible(symbol: &str, price: f64) -> Result<(), CoreError> {
    if let Some((min, max)) = plausibility_band(symbol) {
        if price < min || price > max {
            return Err(CoreError::Upstream(format!(
                "price {price} for {symbol} outside plausibility band [{min}, {max}]"
            )));
        }
        if matches!(symbol, "ETH/USDT" | "ETHUSDT") {
            let (amin, amax) = eth_usdt_alert_band();
            if price < amin || price > amax {
                tracing::warn!(symbol, price, "ETH/USDT price outside alert band, allowing");
            }
        }
    }
    Ok(())
}

pub struct MarketDataFetcher {
    client: reqwest::Client,
    config: Config,
    kline_cache: Mutex<HashMap<String, CachedKlines>>,
    kline_inflight: Mutex<HashMap<String, Arc<tokio::sync::Notify>>>,
    exchange_info_cache: Mutex<Option<CachedExchangeInfo>>,
    exchange_info_last_attempt: Mutex<Option<Instant>>,
}

impl MarketDataFetcher {
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("reqwest client");
        Self {
            client,
            config,
            kline_cache: Mutex::new(HashMap::new()),
            kline_inflight: Mutex::new(HashMap::new()),
            exchange_info_cache: Mutex::new(None),
            exchange_info_last_attempt: Mutex::new(None),
        }
    }

    fn base_url(&self, mode: &str) -> &str {
        if mode.eq_ignore_ascii_case("mainnet") {
            &self.config.binance_mainnet_base_url
        } else {
            &self.config.binance_testnet_base_url
        }
    }

    pub async fn get_price(&self, symbol: &str, mode: &str) -> Result<f64, CoreError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url(mode));
        let resp = tokio::time::timeout(
            self.config.price_fetch_timeout,
            self.client.get(&url).query(&[("symbol", symbol)]).send(),
        )
        .await
        .map_err(|_| CoreError::Upstream(format!("price fetch for {symbol} timed out")))?
        .map_err(|e| CoreError::Upstream(e.to_string()))?;

        #[derive(Deserialize)]
        struct PriceResp {
            symbol: String,
            price: String,
        }
        let body: PriceResp = resp.json().await.map_err(|e| CoreError::Upstream(e.to_string()))?;
        if !body.symbol.eq_ignore_ascii_case(symbol) {
            return Err(CoreError::Upstream(format!(
                "upstream echoed symbol {} for request {symbol}",
                body.symbol
            )));
        }
        let price: f64 = body
            .price
            .parse()
            .map_err(|_| CoreError::Upstream(format!("unparseable price for {symbol}")))?;
        validate_price_plausible(symbol, price)?;
        Ok(price)
    }

    /// Fetches prices for several symbols concurrently, each governed by its
    /// own timeout so one stuck symbol cannot stall the batch; failures are
    /// reported per-symbol instead of failing the whole call.
    pub async fn get_prices_batch(
        &self,
        symbols: &[String],
        mode: &str,
    ) -> HashMap<String, Result<f64, String>> {
        let futures = symbols.iter().map(|s| async move {
            let result = self.get_price(s, mode).await.map_err(|e| e.to_string());
            (s.clone(), result)
        });
        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// Klines are cached for `kline_cache_ttl`; concurrent callers for the
    /// same (symbol, interval, mode) key share one upstream fetch via the
    /// `kline_inflight` map instead of issuing duplicate requests.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        mode: &str,
    ) -> Result<Vec<Kline>, CoreError> {
        let key = format!("{mode}:{symbol}:{interval}:{limit}");

        if let Some(cached) = self.cached_klines(&key) {
            return Ok(cached);
        }

        let notify = {
            let mut inflight = self.kline_inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                Some(existing.clone())
            } else {
                inflight.insert(key.clone(), Arc::new(tokio::sync::Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            return self
                .cached_klines(&key)
                .ok_or_else(|| CoreError::Upstream(format!("kline fetch for {key} failed in another task")));
        }

        let result = self.fetch_klines_upstream(symbol, interval, limit, mode).await;

        if let Ok(klines) = &result {
            self.store_klines(&key, klines.clone());
        }

        if let Some(notify) = self.kline_inflight.lock().remove(&key) {
            notify.notify_waiters();
        }

        result
    }

    fn cached_klines(&self, key: &str) -> Option<Vec<Kline>> {
        let cache = self.kline_cache.lock();
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < self.config.kline_cache_ttl {
            Some(entry.klines.clone())
        } else {
            None
        }
    }

    fn store_klines(&self, key: &str, klines: Vec<Kline>) {
        let mut cache = self.kline_cache.lock();
        cache.insert(
            key.to_string(),
            CachedKlines {
                klines,
                fetched_at: Instant::now(),
            },
        );
        if cache.len() > self.config.kline_cache_max_entries {
            evict_oldest(&mut cache, self.config.kline_cache_max_entries / 2);
        }
    }

    async fn fetch_klines_upstream(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        mode: &str,
    ) -> Result<Vec<Kline>, CoreError> {
        let url = format!("{}/api/v3/klines", self.base_url(mode));
        let resp = tokio::time::timeout(
            self.config.kline_fetch_timeout,
            self.client
                .get(&url)
                .query(&[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ])
                .send(),
        )
        .await
        .map_err(|_| CoreError::Upstream(format!("kline fetch for {symbol} timed out")))?
        .map_err(|e| CoreError::Upstream(e.to_string()))?;

        let raw: Vec<Vec<serde_json::Value>> =
            resp.json().await.map_err(|e| CoreError::Upstream(e.to_string()))?;

        raw.into_iter()
            .map(|row| parse_kline_row(&row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Upstream(format!("malformed kline row: {e}")))
    }

    /// Periodic housekeeping: drops expired kline entries. Run from the
    /// Supervisor's 2-minute tick rather than on every read, so a quiet
    /// period doesn't leave stale-but-harmless entries sitting forever.
    pub fn cleanup_expired_klines(&self) {
        let mut cache = self.kline_cache.lock();
        let ttl = self.config.kline_cache_ttl;
        cache.retain(|_, v| v.fetched_at.elapsed() < ttl);
    }

    /// Single-entry cache for exchange info (symbol filters), refreshed at
    /// most once per `exchange_info_min_refresh_interval` even on a cache
    /// miss, so a burst of callers during an outage can't hammer Binance.
    pub async fn get_exchange_info(&self, mode: &str) -> Result<HashMap<String, SymbolFilters>, CoreError> {
        {
            let cache = self.exchange_info_cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < self.config.exchange_info_cache_ttl {
                    return Ok(entry.symbols.clone());
                }
            }
        }

        {
            let mut last_attempt = self.exchange_info_last_attempt.lock();
            if let Some(t) = *last_attempt {
                if t.elapsed() < self.config.exchange_info_min_refresh_interval {
                    let cache = self.exchange_info_cache.lock();
                    if let Some(entry) = cache.as_ref() {
                        return Ok(entry.symbols.clone());
                    }
                    return Err(CoreError::RateLimited);
                }
            }
            *last_attempt = Some(Instant::now());
        }

        let symbols = self.fetch_exchange_info_upstream(mode).await?;
        *self.exchange_info_cache.lock() = Some(CachedExchangeInfo {
            symbols: symbols.clone(),
            fetched_at: Instant::now(),
        });
        Ok(symbols)
    }

    async fn fetch_exchange_info_upstream(&self, mode: &str) -> Result<HashMap<String, SymbolFilters>, CoreError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url(mode));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(e.to_string()))?;

        #[derive(Deserialize)]
        struct ExchangeInfoResp {
            symbols: Vec<SymbolInfo>,
        }
        #[derive(Deserialize)]
        struct SymbolInfo {
            symbol: String,
            filters: Vec<serde_json::Value>,
        }

        let body: ExchangeInfoResp = resp.json().await.map_err(|e| CoreError::Upstream(e.to_string()))?;
        let mut out = HashMap::new();
        for s in body.symbols {
            out.insert(s.symbol.clone(), filters_from_raw(&s.symbol, &s.filters));
        }
        Ok(out)
    }
}

impl MarketDataFetcher {
    /// Fetches free/locked balances from Binance's signed `/api/v3/account`
    /// endpoint. Requires `binance_api_key`/`binance_api_secret` to be
    /// configured; used to populate [`crate::models::WalletSnapshot::balances`].
    pub async fn get_account_balances(&self, mode: &str) -> Result<serde_json::Value, CoreError> {
        let api_key = self
            .config
            .binance_api_key
            .as_deref()
            .ok_or_else(|| CoreError::ServiceUnavailable("binance api key not configured".to_string()))?;
        let api_secret = self
            .config
            .binance_api_secret
            .as_deref()
            .ok_or_else(|| CoreError::ServiceUnavailable("binance api secret not configured".to_string()))?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = format!("timestamp={timestamp}&recvWindow=5000");
        let signature = sign_query(api_secret, &query);
        let url = format!("{}/api/v3/account?{query}&signature={signature}", self.base_url(mode));

        let resp = tokio::time::timeout(
            self.config.account_fetch_timeout,
            self.client.get(&url).header("X-MBX-APIKEY", api_key).send(),
        )
        .await
        .map_err(|_| CoreError::Upstream("account fetch timed out".to_string()))?
        .map_err(|e| CoreError::Upstream(e.to_string()))?;

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| CoreError::Upstream(e.to_string()))
    }
}

/// HMAC-SHA256 signs a Binance request query string, as required by every
/// `SIGNED` REST endpoint (account info, order placement).
fn sign_query(secret: &str, query: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn filters_from_raw(symbol: &str, filters: &[serde_json::Value]) -> SymbolFilters {
    let mut min_qty = 0.0;
    let mut step_size = 0.0;
    let mut min_notional = 0.0;
    let mut tick_size = 0.0;
    for f in filters {
        match f.get("filterType").and_then(|v| v.as_str()) {
            Some("LOT_SIZE") => {
                min_qty = f.get("minQty").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                step_size = f.get("stepSize").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            }
            Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                min_notional = f
                    .get("minNotional")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
            }
            Some("PRICE_FILTER") => {
                tick_size = f.get("tickSize").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            }
            _ => {}
        }
    }
    SymbolFilters {
        symbol: symbol.to_string(),
        min_qty,
        step_size,
        min_notional,
        tick_size,
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Result<Kline> {
    let get_f64 = |i: usize| -> Result<f64> {
        row.get(i)
            .and_then(|v| v.as_str())
            .context("missing field")?
            .parse()
            .context("unparseable field")
    };
    Ok(Kline {
        open_time: row.get(0).and_then(|v| v.as_i64()).context("open_time")?,
        open: get_f64(1)?,
        high: get_f64(2)?,
        low: get_f64(3)?,
        close: get_f64(4)?,
        volume: get_f64(5)?,
        close_time: row.get(6).and_then(|v| v.as_i64()).context("close_time")?,
    })
}

/// Evicts the oldest entries from the kline cache until `keep` remain,
/// retaining the most recently fetched ones (§4.1 cache eviction rule).
fn evict_oldest(cache: &mut HashMap<String, CachedKlines>, keep: usize) {
    let mut keys: Vec<(String, Instant)> = cache.iter().map(|(k, v)| (k.clone(), v.fetched_at)).collect();
    keys.sort_by_key(|(_, t)| *t);
    let to_remove = keys.len().saturating_sub(keep);
    for (key, _) in keys.into_iter().take(to_remove) {
        cache.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plausibility_band_rejects_price_outside_range() {
        assert!(validate_price_plausible("ETH/USDT", 100_000.0).is_err());
        assert!(validate_price_plausible("ETH/USDT", 3500.0).is_ok());
    }

    #[test]
    fn price_exactly_at_band_boundary_is_accepted() {
        let (min, max) = plausibility_band("BTC/USDT").unwrap();
        assert!(validate_price_plausible("BTC/USDT", min).is_ok());
        assert!(validate_price_plausible("BTC/USDT", max).is_ok());
    }

    #[test]
    fn unknown_symbol_has_no_band_and_always_passes() {
        assert!(validate_price_plausible("SHIB/USDT", 0.0000001).is_ok());
    }

    #[test]
    fn sign_query_is_deterministic_and_hex_encoded() {
        let a = sign_query("secret", "timestamp=1&recvWindow=5000");
        let b = sign_query("secret", "timestamp=1&recvWindow=5000");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn evict_oldest_keeps_newest_entries() {
        let mut cache = HashMap::new();
        for i in 0..10 {
            cache.insert(
                format!("k{i}"),
                CachedKlines {
                    klines: vec![],
                    fetched_at: Instant::now() - Duration::from_secs(10 - i as u64),
                },
            );
        }
        evict_oldest(&mut cache, 5);
        assert_eq!(cache.len(), 5);
        assert!(cache.contains_key("k9"));
        assert!(!cache.contains_key("k0"));
    }
}
