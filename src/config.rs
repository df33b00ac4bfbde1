// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : senti_bot_rust — sentiment-driven virtual trading agent in Rust
Module  : <module_name>.rs
Version : 0.3.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Periodic decision loop: fetches headlines, scores sentiment,
          resolves a market price via a provider fallback chain, decides
          buy/sell/hold, settles fills against a virtual SQLite ledger
          (cash, weighted-average cost, realized PnL), notifies Telegram,
          and exposes Prometheus metrics.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use dotenvy::dotenv;
use std::env;

/// Mode eksekusi order (mock lokal atau Gemini REST)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Mock,
    GeminiSandbox,
    GeminiLive,
}

impl ExecMode {
    pub fn from_env(key: &str, default_mode: ExecMode) -> ExecMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"           => ExecMode::Mock,
            "gemini_sandbox" => ExecMode::GeminiSandbox,
            "gemini_live"    => ExecMode::GeminiLive,
            _ => default_mode,
        }
    }

    // Endpoint default per mode
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            ExecMode::Mock          => "https://api.sandbox.gemini.com", // tidak dipakai saat mock
            ExecMode::GeminiSandbox => "https://api.sandbox.gemini.com",
            ExecMode::GeminiLive    => "https://api.gemini.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Mock          => "mock",
            ExecMode::GeminiSandbox => "gemini_sandbox",
            ExecMode::GeminiLive    => "gemini_live",
        }
    }
}

// ===== Settlement =====
/// Transactional (default): satu transaksi SQLite per settlement, gagal di
/// tengah -> revert penuh. BestEffort: mode kompat lama, tiap step koneksi
/// sendiri, gagal satu step tidak me-rollback step sebelumnya.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementMode {
    Transactional,
    BestEffort,
}

impl SettlementMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactional" | "tx"          => Some(SettlementMode::Transactional),
            "best_effort" | "besteffort"    => Some(SettlementMode::BestEffort),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: SettlementMode) -> SettlementMode {
        env::var(key).ok().and_then(|s| Self::parse_one(&s)).unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementMode::Transactional => "transactional",
            SettlementMode::BestEffort    => "best_effort",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // symbols
    pub symbols: Vec<String>, // tickers yang diproses tiap cycle

    // ledger
    pub db_path: String,
    pub starting_cash: f64,
    pub settlement_mode: SettlementMode,

    // loop / metrics / files
    pub cycle_minutes: u64,
    pub metrics_port: u16,
    pub record_file: Option<String>,

    // execution
    pub exec_mode: ExecMode,
    pub gemini_rest_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_api_secret: Option<String>,

    // providers
    pub alphavantage_key: Option<String>,
    pub binance_rest_url: String,
    pub news_max_results: usize,

    // notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar SYMBOLS, DB_PATH, dll ter-load)
    let _ = dotenv();

    // ===== Symbols =====
    // SYMBOLS=BTCUSD,ETHUSD — default mengikuti perilaku referensi
    let symbols: Vec<String> = env::var("SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSD".to_string(), "ETHUSD".to_string()]);

    // ===== Ledger =====
    let db_path = env::var("DB_PATH").unwrap_or_else(|_| "data/trades.db".to_string());
    let starting_cash = env::var("STARTING_CASH")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000.0);
    let settlement_mode = SettlementMode::from_env("SETTLEMENT_MODE", SettlementMode::Transactional);

    // ===== Loop / metrics / files =====
    let cycle_minutes = env::var("CYCLE_MINUTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(15);
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);
    let record_file = env::var("RECORD_FILE").ok();

    // ===== Execution =====
    let exec_mode = ExecMode::from_env("EXEC_MODE", ExecMode::Mock);
    let gemini_rest_url = env::var("GEMINI_REST_URL")
        .unwrap_or_else(|_| exec_mode.default_rest_url().to_string());
    let gemini_api_key = env::var("GEMINI_API_KEY").ok().filter(|s| !s.is_empty());
    let gemini_api_secret = env::var("GEMINI_API_SECRET").ok().filter(|s| !s.is_empty());

    // ===== Providers =====
    let alphavantage_key = env::var("ALPHAVANTAGE_KEY").ok().filter(|s| !s.is_empty());
    let binance_rest_url =
        env::var("BINANCE_REST_URL").unwrap_or_else(|_| "https://api.binance.com".to_string());
    let news_max_results = env::var("NEWS_MAX_RESULTS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    // ===== Notifications =====
    let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty());
    let telegram_chat_id = env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty());

    Args {
        symbols,
        db_path,
        starting_cash,
        settlement_mode,
        cycle_minutes,
        metrics_port,
        record_file,
        exec_mode,
        gemini_rest_url,
        gemini_api_key,
        gemini_api_secret,
        alphavantage_key,
        binance_rest_url,
        news_max_results,
        telegram_bot_token,
        telegram_chat_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_mode_parse() {
        assert_eq!(SettlementMode::parse_one("transactional"), Some(SettlementMode::Transactional));
        assert_eq!(SettlementMode::parse_one("BEST_EFFORT"), Some(SettlementMode::BestEffort));
        assert_eq!(SettlementMode::parse_one("tx"), Some(SettlementMode::Transactional));
        assert_eq!(SettlementMode::parse_one("yolo"), None);
    }
}
