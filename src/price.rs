// ===============================
// src/price.rs (provider fallback chain)
// ===============================
//
// Harga pasar via chain-of-responsibility: daftar source berurutan, tiap
// source timeout-bounded, sukses pertama menang. Gagal semua -> None
// (policy akan hold, reason "no_price"). Tanpa retry — satu data point
// yang gagal didegradasi, bukan diulang.
//
// Chain per jenis symbol:
// - crypto (ada di CRYPTO_MAP): Binance spot ticker -> CoinGecko
// - lainnya                   : AlphaVantage GLOBAL_QUOTE (perlu API key)
//
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Duration;
use tracing::warn;

use crate::metrics::PROVIDER_FAILS;

const COINGECKO_SIMPLE: &str = "https://api.coingecko.com/api/v3/simple/price";
const ALPHA_BASE: &str = "https://www.alphavantage.co/query";

struct CryptoIds {
    binance: &'static str,
    coingecko: &'static str,
}

// Mapping ticker domain -> id per provider (tambah di sini kalau perlu)
static CRYPTO_MAP: Lazy<HashMap<&'static str, CryptoIds>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("BTCUSD", CryptoIds { binance: "BTCUSDT", coingecko: "bitcoin" });
    m.insert("ETHUSD", CryptoIds { binance: "ETHUSDT", coingecko: "ethereum" });
    m.insert("LTCUSD", CryptoIds { binance: "LTCUSDT", coingecko: "litecoin" });
    m
});

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no usable price in response: {0}")]
    Missing(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PriceSource {
    Binance,
    CoinGecko,
    AlphaVantage,
}

impl PriceSource {
    fn name(&self) -> &'static str {
        match self {
            PriceSource::Binance => "binance",
            PriceSource::CoinGecko => "coingecko",
            PriceSource::AlphaVantage => "alphavantage",
        }
    }
}

#[derive(Clone)]
pub struct PriceClient {
    http: reqwest::Client,
    binance_rest_url: String,
    alphavantage_key: Option<String>,
}

impl PriceClient {
    pub fn new(binance_rest_url: String, alphavantage_key: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), binance_rest_url, alphavantage_key }
    }

    /// Urutan source untuk symbol ini (chain-of-responsibility).
    fn chain_for(&self, symbol: &str) -> Vec<PriceSource> {
        if CRYPTO_MAP.contains_key(symbol) {
            vec![PriceSource::Binance, PriceSource::CoinGecko]
        } else if self.alphavantage_key.is_some() {
            vec![PriceSource::AlphaVantage]
        } else {
            Vec::new()
        }
    }

    /// Harga terakhir best-effort. None kalau seluruh chain gagal.
    pub async fn latest_price(&self, symbol: &str) -> Option<f64> {
        let symbol = symbol.to_ascii_uppercase();
        let chain = self.chain_for(&symbol);
        if chain.is_empty() {
            warn!(%symbol, "no price source configured for symbol");
        }
        for source in chain {
            match self.fetch_from(source, &symbol).await {
                Ok(price) if price > 0.0 => return Some(price),
                Ok(price) => {
                    warn!(%symbol, source = source.name(), price, "provider returned non-positive price");
                    PROVIDER_FAILS.with_label_values(&[source.name()]).inc();
                }
                Err(e) => {
                    warn!(%symbol, source = source.name(), %e, "price fetch failed, trying next");
                    PROVIDER_FAILS.with_label_values(&[source.name()]).inc();
                }
            }
        }
        None
    }

    async fn fetch_from(&self, source: PriceSource, symbol: &str) -> Result<f64, ProviderError> {
        match source {
            PriceSource::Binance => self.binance_ticker(symbol).await,
            PriceSource::CoinGecko => self.coingecko_price(symbol).await,
            PriceSource::AlphaVantage => self.alphavantage_quote(symbol).await,
        }
    }

    async fn binance_ticker(&self, symbol: &str) -> Result<f64, ProviderError> {
        let mapped = CRYPTO_MAP
            .get(symbol)
            .map(|ids| ids.binance)
            .ok_or_else(|| ProviderError::Missing(format!("no binance mapping for {symbol}")))?;
        let url = format!("{}/api/v3/ticker/price", self.binance_rest_url.trim_end_matches('/'));
        let v: Value = self
            .http
            .get(url)
            .query(&[("symbol", mapped)])
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_binance_price(&v).ok_or_else(|| ProviderError::Missing(v.to_string()))
    }

    async fn coingecko_price(&self, symbol: &str) -> Result<f64, ProviderError> {
        let id = CRYPTO_MAP
            .get(symbol)
            .map(|ids| ids.coingecko)
            .ok_or_else(|| ProviderError::Missing(format!("no coingecko mapping for {symbol}")))?;
        let v: Value = self
            .http
            .get(COINGECKO_SIMPLE)
            .query(&[("ids", id), ("vs_currencies", "usd")])
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_coingecko_price(&v, id).ok_or_else(|| ProviderError::Missing(v.to_string()))
    }

    async fn alphavantage_quote(&self, symbol: &str) -> Result<f64, ProviderError> {
        let key = self
            .alphavantage_key
            .as_deref()
            .ok_or_else(|| ProviderError::Missing("ALPHAVANTAGE_KEY not set".to_string()))?;
        let v: Value = self
            .http
            .get(ALPHA_BASE)
            .query(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol), ("apikey", key)])
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_alphavantage_quote(&v).ok_or_else(|| ProviderError::Missing(v.to_string()))
    }
}

// ---- parsers (pure, dipisah agar bisa diuji tanpa network) ----

fn as_price(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn parse_binance_price(v: &Value) -> Option<f64> {
    as_price(v.get("price")?)
}

pub(crate) fn parse_coingecko_price(v: &Value, id: &str) -> Option<f64> {
    as_price(v.get(id)?.get("usd")?)
}

pub(crate) fn parse_alphavantage_quote(v: &Value) -> Option<f64> {
    let quote = v.get("Global Quote")?;
    // AlphaVantage kadang menulis key dengan kapitalisasi berbeda
    let price = quote.get("05. price").or_else(|| quote.get("05. Price"))?;
    as_price(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_prefers_binance_for_crypto() {
        let c = PriceClient::new("https://api.binance.com".into(), None);
        assert_eq!(c.chain_for("BTCUSD"), vec![PriceSource::Binance, PriceSource::CoinGecko]);
    }

    #[test]
    fn chain_for_equity_requires_alphavantage_key() {
        let without = PriceClient::new("https://api.binance.com".into(), None);
        assert!(without.chain_for("AAPL").is_empty());
        let with = PriceClient::new("https://api.binance.com".into(), Some("k".into()));
        assert_eq!(with.chain_for("AAPL"), vec![PriceSource::AlphaVantage]);
    }

    #[test]
    fn parses_binance_ticker() {
        let v = json!({"symbol": "BTCUSDT", "price": "65000.12"});
        assert_eq!(parse_binance_price(&v), Some(65000.12));
        assert_eq!(parse_binance_price(&json!({"code": -1121})), None);
    }

    #[test]
    fn parses_coingecko_simple() {
        let v = json!({"bitcoin": {"usd": 64321.5}});
        assert_eq!(parse_coingecko_price(&v, "bitcoin"), Some(64321.5));
        assert_eq!(parse_coingecko_price(&v, "ethereum"), None);
    }

    #[test]
    fn parses_alphavantage_global_quote() {
        let v = json!({"Global Quote": {"01. symbol": "AAPL", "05. price": "123.45"}});
        assert_eq!(parse_alphavantage_quote(&v), Some(123.45));
        // rate-limit note -> tidak ada harga
        let note = json!({"Note": "Thank you for using Alpha Vantage!"});
        assert_eq!(parse_alphavantage_quote(&note), None);
    }
}
