// ===============================
// src/broker.rs (execution provider)
// ===============================
//
// Dua mode eksekusi:
// - Mock          : fill sintetis lokal (latency kecil, harga plausible) —
//                   default untuk pengembangan tanpa kredensial.
// - Gemini REST   : /v1/order/new dengan payload base64 + HMAC-SHA384
//                   (sandbox maupun live, tergantung EXEC_MODE).
//
// Settlement memakai filled_qty/avg_price dari respons, fallback ke nilai
// request kalau respons tidak memuatnya (lihat resolve_fill_price).
//
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{json, Value};
use sha2::Sha384;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::config::ExecMode;
use crate::domain::{FillReport, Side};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("gemini api key/secret not configured")]
    MissingCredentials,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("order rejected: {0}")]
    Rejected(String),
}

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn sign_payload(secret: &str, payload_b64: &str) -> Result<String, BrokerError> {
    let mut mac = Hmac::<Sha384>::new_from_slice(secret.as_bytes())
        .map_err(|_| BrokerError::MissingCredentials)?;
    mac.update(payload_b64.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct Broker {
    http: reqwest::Client,
    mode: ExecMode,
    rest_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl Broker {
    pub fn new(
        mode: ExecMode,
        rest_url: String,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Self {
        Self { http: reqwest::Client::new(), mode, rest_url, api_key, api_secret }
    }

    /// Submit order dan kembalikan fill report. qty dalam unit aset.
    pub async fn submit_fill(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
    ) -> Result<FillReport, BrokerError> {
        match self.mode {
            ExecMode::Mock => Ok(self.mock_fill(symbol, side, qty, limit_price).await),
            ExecMode::GeminiSandbox | ExecMode::GeminiLive => {
                self.gemini_order(symbol, side, qty, limit_price).await
            }
        }
    }

    async fn mock_fill(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
    ) -> FillReport {
        // latency kecil biar mirip broker beneran
        let jitter = rand::thread_rng().gen_range(30..=80);
        sleep(Duration::from_millis(jitter)).await;

        let now_ms = timestamp_ms();
        // harga mock plausible dan non-nol
        let price = limit_price.unwrap_or(((100.0 + (now_ms % 1000) as f64 / 100.0) * 100.0).round() / 100.0);
        let raw = json!({
            "order_id": format!("mock-{now_ms}"),
            "client_order_id": format!("mock_client_{now_ms}"),
            "symbol": symbol,
            "amount": format!("{qty}"),
            "side": side.as_str(),
            "type": if limit_price.is_some() { "exchange limit" } else { "exchange market" },
            "status": "filled",
            "price": format!("{price}"),
            "avg_execution_price": price,
            "filled_size": format!("{qty}"),
            "timestamp": now_ms,
        });
        parse_fill_response(raw)
    }

    async fn gemini_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
    ) -> Result<FillReport, BrokerError> {
        let (api_key, api_secret) = match (&self.api_key, &self.api_secret) {
            (Some(k), Some(s)) => (k.as_str(), s.as_str()),
            _ => return Err(BrokerError::MissingCredentials),
        };

        let mut payload = json!({
            "request": "/v1/order/new",
            "nonce": timestamp_ms().to_string(),
            "symbol": symbol,
            "amount": format!("{qty}"),
            "side": side.as_str(),
            "type": if limit_price.is_some() { "exchange limit" } else { "exchange market" },
        });
        if let Some(px) = limit_price {
            payload["price"] = Value::String(format!("{px}"));
        }

        let payload_b64 = BASE64.encode(payload.to_string().as_bytes());
        let signature = sign_payload(api_secret, &payload_b64)?;

        let url = format!("{}/v1/order/new", self.rest_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-GEMINI-APIKEY", api_key)
            .header("X-GEMINI-PAYLOAD", &payload_b64)
            .header("X-GEMINI-SIGNATURE", &signature)
            .timeout(Duration::from_secs(20))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!("{status}: {body}")));
        }
        let raw: Value = resp.json().await?;
        info!(%symbol, side = side.as_str(), "gemini order accepted");
        Ok(parse_fill_response(raw))
    }
}

/// Respons mentah -> FillReport; semua field diekstrak best-effort karena
/// bentuk respons broker bisa beda-beda antar mode/versi.
pub(crate) fn parse_fill_response(raw: Value) -> FillReport {
    FillReport {
        exec_id: extract_exec_id(&raw),
        filled_qty: extract_filled_qty(&raw),
        avg_price: extract_price(&raw),
        status: raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        raw,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn extract_exec_id(resp: &Value) -> Option<String> {
    let keys = ["order_id", "id", "client_order_id", "exec_id"];
    for k in keys {
        if let Some(v) = resp.get(k) {
            match v {
                Value::String(s) if !s.is_empty() => return Some(s.clone()),
                Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    // struktur nested: cari satu level ke dalam
    if let Some(obj) = resp.as_object() {
        for v in obj.values() {
            if v.is_object() {
                for k in ["order_id", "id"] {
                    if let Some(Value::String(s)) = v.get(k) {
                        if !s.is_empty() {
                            return Some(s.clone());
                        }
                    }
                }
            }
        }
    }
    None
}

fn extract_price(resp: &Value) -> Option<f64> {
    let keys = ["avg_execution_price", "avg_price", "price", "filled_avg_price", "execution_price"];
    for k in keys {
        if let Some(p) = resp.get(k).and_then(as_f64) {
            return Some(p);
        }
    }
    if let Some(obj) = resp.as_object() {
        for v in obj.values() {
            if v.is_object() {
                for k in ["avg_execution_price", "price"] {
                    if let Some(p) = v.get(k).and_then(as_f64) {
                        return Some(p);
                    }
                }
            }
        }
    }
    None
}

fn extract_filled_qty(resp: &Value) -> Option<f64> {
    resp.get("filled_size")
        .and_then(as_f64)
        .or_else(|| resp.get("amount").and_then(as_f64))
}

/// Resolusi harga fill: broker -> limit -> harga pasar cycle -> 1.0.
/// Flag kedua = true saat jatuh ke fallback degenerate 1.0 (harus dicatat
/// sebagai warning oleh pemanggil — ini menutupi masalah data harga).
pub fn resolve_fill_price(
    report_price: Option<f64>,
    limit_price: Option<f64>,
    market_price: Option<f64>,
) -> (f64, bool) {
    for candidate in [report_price, limit_price, market_price] {
        if let Some(p) = candidate {
            if p.is_finite() && p > 0.0 {
                return (p, false);
            }
        }
    }
    (1.0, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mock_style_response() {
        let raw = json!({
            "order_id": "mock-123",
            "symbol": "BTCUSD",
            "amount": "2.5",
            "status": "filled",
            "price": "101.25",
            "avg_execution_price": 101.25,
            "filled_size": "2.5",
        });
        let report = parse_fill_response(raw);
        assert_eq!(report.exec_id.as_deref(), Some("mock-123"));
        assert_eq!(report.filled_qty, Some(2.5));
        assert_eq!(report.avg_price, Some(101.25));
        assert_eq!(report.status, "filled");
    }

    #[test]
    fn exec_id_falls_back_to_nested_objects() {
        let raw = json!({"result": {"order_id": "abc-9"}});
        assert_eq!(extract_exec_id(&raw).as_deref(), Some("abc-9"));
        assert_eq!(extract_exec_id(&json!({"ok": true})), None);
    }

    #[test]
    fn price_extraction_handles_numeric_strings() {
        assert_eq!(extract_price(&json!({"price": "99.5"})), Some(99.5));
        assert_eq!(extract_price(&json!({"avg_execution_price": 12.0})), Some(12.0));
        assert_eq!(extract_price(&json!({"note": "n/a"})), None);
    }

    #[test]
    fn fill_price_resolution_chain() {
        assert_eq!(resolve_fill_price(Some(5.0), Some(3.0), Some(2.0)), (5.0, false));
        assert_eq!(resolve_fill_price(None, Some(3.0), Some(2.0)), (3.0, false));
        // nol dianggap tidak usable, lanjut ke kandidat berikutnya
        assert_eq!(resolve_fill_price(Some(0.0), None, Some(2.0)), (2.0, false));
        assert_eq!(resolve_fill_price(None, None, None), (1.0, true));
        assert_eq!(resolve_fill_price(Some(0.0), Some(-1.0), None), (1.0, true));
    }

    #[tokio::test]
    async fn mock_fill_has_positive_price_and_exec_id() {
        let broker = Broker::new(ExecMode::Mock, "https://unused".into(), None, None);
        let report = broker.submit_fill("BTCUSD", Side::Buy, 1.5, None).await.unwrap();
        assert_eq!(report.status, "filled");
        assert!(report.avg_price.unwrap() > 0.0);
        assert_eq!(report.filled_qty, Some(1.5));
        assert!(report.exec_id.unwrap().starts_with("mock-"));
    }

    #[tokio::test]
    async fn gemini_without_credentials_errors() {
        let broker = Broker::new(ExecMode::GeminiSandbox, "https://unused".into(), None, None);
        let err = broker.submit_fill("BTCUSD", Side::Buy, 1.0, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingCredentials));
    }
}
