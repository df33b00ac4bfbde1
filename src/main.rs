// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/senti_bot_rust

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(symbol|exec_mode|settlement_mode)'

# aktivitas decision & settlement per cycle
curl -s localhost:9898/metrics | grep '^decisions_total'
curl -s localhost:9898/metrics | grep '^settlements_total'

*/
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
mod domain;
mod config;
mod metrics;
mod recorder;
mod ledger;
mod settlement;
mod policy;
mod sentiment;
mod news;           // headline provider (DuckDuckGo instant answer)
mod price;          // price fallback chain (Binance -> CoinGecko / AlphaVantage)
mod broker;         // execution provider (mock / Gemini REST)
mod notifier;       // Telegram sink
mod cycle;          // orchestrator

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::cycle::CycleContext;
use crate::ledger::{Ledger, CURRENCY};
use crate::settlement::SettlementEngine;

#[derive(Parser)]
#[command(name = "senti_bot_rust", version, about = "Sentiment-driven virtual trading agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Jalankan satu cycle lalu keluar (exit 0 sukses, 1 kalau setup gagal)
    Cycle,
    /// Loop kontinu dengan graceful shutdown (default)
    Run,
    /// Proyeksi read-only: cash, posisi, trade & event terakhir
    Report {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    // ---- Load config ----
    let args = config::load();

    // ---- Ledger (satu-satunya kegagalan fatal proses) ----
    let ledger = match Ledger::open(&args.db_path, args.starting_cash) {
        Ok(l) => l,
        Err(e) => {
            error!(?e, db_path = %args.db_path, "ledger init failed");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Report { limit } => {
            report(&ledger, &args, limit).await;
        }
        Command::Cycle => {
            let ctx = build_context(&args, ledger);
            cycle::run_cycle(&ctx).await;
            info!("single cycle done");
        }
        Command::Run => {
            let ctx = build_context(&args, ledger);

            // ---- Graceful shutdown: kanal cancellation, bukan flag global ----
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_signal().await;
                info!("received shutdown signal, stopping after current cycle...");
                let _ = shutdown_tx.send(true);
            });

            info!("agent started (cycle every {} minutes)", args.cycle_minutes);
            cycle::run_loop(&ctx, args.cycle_minutes, shutdown_rx).await;
            info!("agent stopped");
        }
    }
}

fn build_context(args: &config::Args, ledger: Ledger) -> CycleContext {
    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        symbols = ?args.symbols,
        exec_mode = %args.exec_mode.as_str(),
        settlement_mode = %args.settlement_mode.as_str(),
        db_path = %args.db_path,
        cycle_minutes = args.cycle_minutes,
        "startup config"
    );
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
    metrics::CONFIG_EXEC_MODE
        .with_label_values(&[args.exec_mode.as_str()])
        .set(1);
    metrics::CONFIG_SETTLEMENT_MODE
        .with_label_values(&[args.settlement_mode.as_str()])
        .set(1);
    metrics::ACCOUNT_CASH.set(ledger.get_cash(CURRENCY).unwrap_or(0.0));

    // ---- Recorder (optional) ----
    let rec_tx = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<domain::AuditEvent>(1024);
            tokio::spawn(recorder::run(rx, path));
            Some(tx)
        }
        None => None,
    };

    // ---- Wiring ----
    let engine = SettlementEngine::new(ledger.clone(), args.settlement_mode);
    CycleContext {
        symbols: args.symbols.clone(),
        ledger,
        engine,
        news: news::NewsClient::new(args.news_max_results),
        price: price::PriceClient::new(
            args.binance_rest_url.clone(),
            args.alphavantage_key.clone(),
        ),
        broker: broker::Broker::new(
            args.exec_mode.clone(),
            args.gemini_rest_url.clone(),
            args.gemini_api_key.clone(),
            args.gemini_api_secret.clone(),
        ),
        notifier: notifier::Notifier::new(
            args.telegram_bot_token.clone(),
            args.telegram_chat_id.clone(),
        ),
        rec_tx,
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(t) => t,
            Err(e) => {
                error!(?e, "failed to install SIGTERM handler, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Dashboard mini di terminal — proyeksi read-only atas state ledger.
async fn report(ledger: &Ledger, args: &config::Args, limit: usize) {
    let snapshot = match ledger.equity_snapshot() {
        Ok(s) => s,
        Err(e) => {
            error!(?e, "failed to read ledger");
            std::process::exit(1);
        }
    };
    let price_client = price::PriceClient::new(
        args.binance_rest_url.clone(),
        args.alphavantage_key.clone(),
    );

    println!("== Account ==");
    println!("cash: {:.2} USD", snapshot.cash);
    println!("total realized pnl: {:.2} USD", snapshot.total_realized);

    println!("\n== Positions ==");
    if snapshot.positions.is_empty() {
        println!("(none)");
    }
    for pos in &snapshot.positions {
        let market = price_client.latest_price(&pos.symbol).await;
        let unrealized = match (market, pos.avg_price) {
            (Some(px), Some(avg)) => Some((px - avg) * pos.qty),
            _ => None,
        };
        let avg_text = pos
            .avg_price
            .map(|a| format!("{a:.2}"))
            .unwrap_or_else(|| "-".to_string());
        let unreal_text = unrealized
            .map(|u| format!("{u:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{:<10} qty={:.8} avg={} realized={:.2} unrealized={}",
            pos.symbol, pos.qty, avg_text, pos.realized_pnl, unreal_text
        );
    }

    println!("\n== Last trades ==");
    match ledger.fetch_trades(limit) {
        Ok(trades) => {
            if trades.is_empty() {
                println!("(none)");
            }
            for t in trades {
                let pnl_text = t.pnl.map(|p| format!("{p:.2}")).unwrap_or_else(|| "-".to_string());
                println!(
                    "#{:<5} {} {:<10} {:<4} qty={:.8} px={:.2} pnl={}",
                    t.id, t.timestamp, t.symbol, t.side.as_str(), t.qty, t.price, pnl_text
                );
            }
        }
        Err(e) => error!(?e, "failed to fetch trades"),
    }

    println!("\n== Last events ==");
    match ledger.fetch_events(limit) {
        Ok(events) => {
            if events.is_empty() {
                println!("(none)");
            }
            for ev in events {
                println!(
                    "{} [{:<9}] {}: {}",
                    ev.timestamp,
                    ev.kind.as_str(),
                    ev.source.unwrap_or_else(|| "-".to_string()),
                    ev.payload.unwrap_or_default()
                );
            }
        }
        Err(e) => error!(?e, "failed to fetch events"),
    }
}
