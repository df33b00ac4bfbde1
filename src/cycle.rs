// ===============================
// src/cycle.rs (orchestrator)
// ===============================
//
// State machine per symbol per cycle:
//   FETCH_SIGNAL -> FETCH_PRICE -> DECIDE -> (EXECUTE | SKIP) -> NOTIFY -> DONE
//
// Error di symbol mana pun dicatat sebagai error event + notifikasi,
// lalu lanjut ke symbol berikutnya — satu symbol gagal tidak membatalkan
// batch. Symbols diproses sekuensial (rate limit provider, sengaja tanpa
// fan-out paralel).
//
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::broker::{resolve_fill_price, Broker, BrokerError};
use crate::domain::{Action, AuditEvent, EventKind, Fill, Side};
use crate::ledger::{Ledger, LedgerError, CURRENCY};
use crate::metrics::{
    ACCOUNT_CASH, CYCLES, DECISIONS, PNL_REALIZED, PNL_UNREALIZED, SETTLEMENTS,
};
use crate::news::NewsClient;
use crate::notifier::Notifier;
use crate::policy;
use crate::price::PriceClient;
use crate::sentiment;
use crate::settlement::SettlementEngine;

const NOTES_MAX_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub struct CycleContext {
    pub symbols: Vec<String>,
    pub ledger: Ledger,
    pub engine: SettlementEngine,
    pub news: NewsClient,
    pub price: PriceClient,
    pub broker: Broker,
    pub notifier: Notifier,
    /// Channel ke recorder JSONL (opsional, lihat recorder.rs)
    pub rec_tx: Option<mpsc::Sender<AuditEvent>>,
}

impl CycleContext {
    fn record(&self, ev: AuditEvent) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(ev);
        }
    }
}

/// Satu cycle penuh untuk semua symbol.
pub async fn run_cycle(ctx: &CycleContext) {
    for symbol in &ctx.symbols {
        info!(%symbol, "starting cycle");
        if let Err(e) = run_symbol(ctx, symbol).await {
            error!(%symbol, %e, "cycle failed for symbol");
            ctx.ledger.log_event(
                EventKind::Error,
                "cycle",
                &format!("cycle failed for {symbol}: {e}"),
            );
            ctx.record(AuditEvent::Note(format!("cycle failed for {symbol}: {e}")));
            if ctx.notifier.enabled() {
                ctx.notifier.notify_error(&format!("[{symbol}] {e}")).await;
            }
        }
    }
    CYCLES.inc();
}

async fn run_symbol(ctx: &CycleContext, symbol: &str) -> Result<(), CycleError> {
    // FETCH_SIGNAL — provider sudah degrade sendiri ke list kosong
    let headlines = ctx.news.fetch_headlines(symbol).await;
    let scores: Vec<f64> = headlines
        .iter()
        .map(|h| sentiment::score_text(&format!("{} {}", h.title, h.body)))
        .collect();
    let agg = sentiment::aggregate(&scores);
    info!(%symbol, agg = %format!("{agg:.3}"), news_count = scores.len(), "sentiment");

    // FETCH_PRICE — None kalau seluruh chain gagal
    let last_price = ctx.price.latest_price(symbol).await;
    match last_price {
        Some(p) => info!(%symbol, price = p, "last price"),
        None => warn!(%symbol, "no price available"),
    }

    // DECIDE
    let cash = ctx.ledger.get_cash(CURRENCY)?;
    let held_qty = ctx.ledger.get_position(symbol)?.map(|p| p.qty).unwrap_or(0.0);
    let decision = policy::decide(agg, last_price.unwrap_or(0.0), cash, held_qty);
    DECISIONS.with_label_values(&[decision.action.as_str()]).inc();
    info!(
        %symbol,
        action = decision.action.as_str(),
        qty = decision.qty,
        reason = %decision.reason,
        "decision"
    );
    ctx.record(AuditEvent::Decision { symbol: symbol.to_string(), decision: decision.clone() });

    // EXECUTE | SKIP
    let side = match decision.action {
        Action::Buy => Side::Buy,
        Action::Sell => Side::Sell,
        Action::Hold => return Ok(()),
    };
    if decision.qty <= 0.0 {
        return Ok(());
    }

    let report = ctx.broker.submit_fill(symbol, side, decision.qty, None).await?;
    info!(%symbol, exec_status = %report.status, exec_id = ?report.exec_id, "broker fill");
    let (fill_price, degenerate) = resolve_fill_price(report.avg_price, None, last_price);
    if degenerate {
        // menutupi masalah harga hulu — selalu tercatat sebagai warning
        warn!(%symbol, "no usable fill price from any source, substituting 1.0");
        ctx.ledger.log_event(
            EventKind::Warning,
            "cycle",
            &format!("no usable fill price for {symbol}; substituting 1.0"),
        );
    }
    let qty = report.filled_qty.unwrap_or(decision.qty);
    let fill = Fill {
        symbol: symbol.to_string(),
        side,
        qty,
        price: fill_price,
        exec_id: report.exec_id.clone(),
        notes: truncate_notes(&report.raw.to_string(), NOTES_MAX_CHARS),
    };
    let outcome = ctx.engine.settle(&fill)?;
    SETTLEMENTS.with_label_values(&[outcome.status.as_str()]).inc();
    ACCOUNT_CASH.set(outcome.new_cash);
    if let Ok(snapshot) = ctx.ledger.equity_snapshot() {
        PNL_REALIZED.set(snapshot.total_realized);
    }
    if let Some(p) = last_price {
        if let Ok(u) = ctx.ledger.unrealized_pnl(symbol, p) {
            PNL_UNREALIZED.with_label_values(&[symbol]).set(u);
        }
    }
    info!(
        %symbol,
        status = outcome.status.as_str(),
        applied = outcome.applied_qty,
        cash = outcome.new_cash,
        "settled"
    );

    // NOTIFY — fire and forget
    if ctx.notifier.enabled() {
        ctx.notifier
            .notify_trade(symbol, side, outcome.applied_qty, fill.price, outcome.realized_pnl)
            .await;
    }
    ctx.record(AuditEvent::Fill { fill, outcome });
    Ok(())
}

/// Loop kontinu: satu cycle, lalu tidur per irisan 60 detik sambil cek
/// kanal cancellation — shutdown latency terikat <= 60s.
pub async fn run_loop(ctx: &CycleContext, cycle_minutes: u64, mut shutdown: watch::Receiver<bool>) {
    loop {
        run_cycle(ctx).await;
        for _ in 0..cycle_minutes {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping loop");
                return;
            }
            tokio::select! {
                _ = sleep(Duration::from_secs(60)) => {}
                res = shutdown.changed() => {
                    // sender hilang = proses sedang turun, perlakukan sama
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
        if *shutdown.borrow() {
            info!("shutdown requested, stopping loop");
            return;
        }
    }
}

/// Potong notes broker ke batas kolom (aman terhadap char boundary).
pub(crate) fn truncate_notes(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_notes_respects_char_boundaries() {
        assert_eq!(truncate_notes("abcdef", 4), "abcd");
        assert_eq!(truncate_notes("abc", 10), "abc");
        // multibyte tidak boleh bikin panic
        assert_eq!(truncate_notes("héllo", 2), "hé");
    }
}
