// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Core agent metrics --------
pub static CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cycles_total", "completed decision cycles").unwrap());

pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decisions_total", "policy decisions by action"),
        &["action"],
    )
    .unwrap()
});

pub static SETTLEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("settlements_total", "settlements by status"),
        &["status"],
    )
    .unwrap()
});

pub static PROVIDER_FAILS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "provider_failures_total",
            "external provider call failures (labels: provider)",
        ),
        &["provider"],
    )
    .unwrap()
});

pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notifications_total", "telegram notifications by outcome"),
        &["outcome"],
    )
    .unwrap()
});

// Account & PnL (USD, float)
pub static ACCOUNT_CASH: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("account_cash_usd", "virtual cash balance (USD)").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized_usd", "total realized PnL (USD)").unwrap());

pub static PNL_UNREALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("pnl_unrealized_usd", "unrealized PnL per symbol (USD)"),
        &["symbol"],
    )
    .unwrap()
});

// ---- Config visibility (symbols / exec mode / settlement mode) ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub static CONFIG_EXEC_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_exec_mode", "exec mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_SETTLEMENT_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_settlement_mode", "settlement mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(DECISIONS.clone())),
        REGISTRY.register(Box::new(SETTLEMENTS.clone())),
        REGISTRY.register(Box::new(PROVIDER_FAILS.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
        REGISTRY.register(Box::new(ACCOUNT_CASH.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_EXEC_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SETTLEMENT_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("metrics bind {addr} failed: {e}");
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {e}"),
            }
        }
    });
}
