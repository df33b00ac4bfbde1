// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action { Buy, Sell, Hold }
impl Action {
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "buy", Action::Sell => "sell", Action::Hold => "hold" }
    }
}

/// Output dari decision policy (pure, tanpa side effect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision { pub action: Action, pub qty: f64, pub reason: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Headline { pub title: String, pub body: String, pub url: Option<String> }

/// Fill yang sudah terkonfirmasi broker — input tunggal settlement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub exec_id: Option<String>,
    /// Raw broker response (JSON), truncated; masuk kolom notes di trade row.
    pub notes: String,
}

/// Respons broker mentah + field yang sudah diekstrak best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillReport {
    pub exec_id: Option<String>,
    pub filled_qty: Option<f64>,
    pub avg_price: Option<f64>,
    pub status: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    /// None iff qty == 0 (invariant dijaga oleh ledger upsert).
    pub avg_price: Option<f64>,
    pub realized_pnl: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub timestamp: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub pnl: Option<f64>,
    pub exec_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind { Info, Warning, Error, Execution }
impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Warning => "warning",
            EventKind::Error => "error",
            EventKind::Execution => "execution",
        }
    }
    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "info" => Some(EventKind::Info),
            "warning" => Some(EventKind::Warning),
            "error" => Some(EventKind::Error),
            "execution" => Some(EventKind::Execution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub timestamp: String,
    pub kind: EventKind,
    pub source: Option<String>,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus { Filled, CappedToCash, CappedToHoldings, InsufficientCash, NoPosition }
impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Filled => "filled",
            SettlementStatus::CappedToCash => "capped_to_cash",
            SettlementStatus::CappedToHoldings => "capped_to_holdings",
            SettlementStatus::InsufficientCash => "insufficient_cash",
            SettlementStatus::NoPosition => "no_position",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub status: SettlementStatus,
    pub applied_qty: f64,
    /// Hanya terisi untuk sell.
    pub realized_pnl: Option<f64>,
    pub new_cash: f64,
    pub position: Option<Position>,
}

/// Snapshot derived (tidak disimpan): posisi per symbol + total realized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub cash: f64,
    pub total_realized: f64,
    pub positions: Vec<Position>,
}

/// Event untuk JSONL recorder (mirror observability, bukan source of truth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEvent {
    Decision { symbol: String, decision: Decision },
    Fill { fill: Fill, outcome: SettlementOutcome },
    Note(String),
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---- Numeric policy ----
// Kuantitas on-ledger: 8 desimal. round8 untuk sizing dari policy,
// floor8 untuk capping agar tak pernah melebihi cash yang ada.

pub fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}

pub fn floor8(x: f64) -> f64 {
    (x * 1e8).floor() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round8_and_floor8() {
        assert_eq!(round8(0.123456789), 0.12345679);
        assert_eq!(floor8(0.123456789), 0.12345678);
        // floor tidak boleh membulatkan ke atas
        assert!(floor8(4.999999999) <= 4.999999999);
        assert_eq!(round8(1.0), 1.0);
        assert_eq!(floor8(5.0), 5.0);
    }

    #[test]
    fn side_roundtrip() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("short"), None);
        assert_eq!(Side::Buy.as_str(), "buy");
    }

    #[test]
    fn event_kind_roundtrip() {
        for k in [EventKind::Info, EventKind::Warning, EventKind::Error, EventKind::Execution] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
    }
}
