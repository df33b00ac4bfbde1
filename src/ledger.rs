// ===============================
// src/ledger.rs (cash / positions / trades / events)
// ===============================
//
// Ledger SQLite: satu koneksi pendek per operasi (asumsi single writer
// process, tanpa lock in-process). Mode WAL diaktifkan best-effort saat
// connect. Skema dibuat idempoten lewat init_schema().
//
// Dua lapis API:
// - q::*   : query helpers yang menerima &Connection — dipakai per-op
//            maupun di dalam transaksi settlement.
// - Ledger : wrapper path DB; tiap method buka koneksi sendiri.
//
use ahash::AHashMap as HashMap;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use tracing::error;

use crate::domain::{now_iso, EquitySnapshot, EventKind, EventRecord, Position, Side, TradeRecord};

pub const CURRENCY: &str = "USD";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger storage dir error: {0}")]
    Storage(#[from] std::io::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    price REAL NOT NULL,
    pnl REAL,
    exec_id TEXT,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT,
    payload TEXT
);

CREATE TABLE IF NOT EXISTS portfolio (
    symbol TEXT PRIMARY KEY,
    qty REAL NOT NULL,
    avg_price REAL,
    realized_pnl REAL DEFAULT 0.0,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS account (
    currency TEXT PRIMARY KEY,
    cash REAL NOT NULL,
    updated_at TEXT
);
";

/// Query helpers di atas &Connection. Settlement transaksional memanggil
/// fungsi-fungsi ini lewat Ledger::with_tx agar satu settlement = satu commit.
pub(crate) mod q {
    use super::*;
    use rusqlite::{params, OptionalExtension};

    fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    }

    pub fn insert_trade(
        conn: &Connection,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        pnl: Option<f64>,
        exec_id: Option<&str>,
        notes: Option<&str>,
    ) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO trades (timestamp, symbol, side, qty, price, pnl, exec_id, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![now_iso(), symbol, side.as_str(), qty, price, pnl, exec_id, notes],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_trade_pnl(conn: &Connection, trade_id: i64, pnl: f64) -> rusqlite::Result<()> {
        conn.execute("UPDATE trades SET pnl = ?1 WHERE id = ?2", params![pnl, trade_id])?;
        Ok(())
    }

    /// Back-fill qty setelah capping (two-phase write dari settlement).
    pub fn update_trade_qty(conn: &Connection, trade_id: i64, qty: f64) -> rusqlite::Result<()> {
        conn.execute("UPDATE trades SET qty = ?1 WHERE id = ?2", params![qty, trade_id])?;
        Ok(())
    }

    pub fn insert_event(
        conn: &Connection,
        kind: EventKind,
        source: &str,
        payload: &str,
    ) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO events (timestamp, kind, source, payload) VALUES (?1, ?2, ?3, ?4)",
            params![now_iso(), kind.as_str(), source, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch_trades(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<TradeRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, symbol, side, qty, price, pnl, exec_id, notes
             FROM trades ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let side_s: String = row.get(3)?;
            let side = Side::parse(&side_s)
                .ok_or_else(|| bad_column(3, format!("unknown side: {side_s}")))?;
            Ok(TradeRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                symbol: row.get(2)?,
                side,
                qty: row.get(4)?,
                price: row.get(5)?,
                pnl: row.get(6)?,
                exec_id: row.get(7)?,
                notes: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn fetch_events(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<EventRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, kind, source, payload FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let kind_s: String = row.get(2)?;
            let kind = EventKind::parse(&kind_s)
                .ok_or_else(|| bad_column(2, format!("unknown event kind: {kind_s}")))?;
            Ok(EventRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                kind,
                source: row.get(3)?,
                payload: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    pub fn get_position(conn: &Connection, symbol: &str) -> rusqlite::Result<Option<Position>> {
        conn.query_row(
            "SELECT symbol, qty, avg_price, realized_pnl, updated_at
             FROM portfolio WHERE symbol = ?1",
            params![symbol],
            |row| {
                Ok(Position {
                    symbol: row.get(0)?,
                    qty: row.get(1)?,
                    avg_price: row.get(2)?,
                    realized_pnl: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    updated_at: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            },
        )
        .optional()
    }

    /// Insert/update posisi. qty boleh nol (clear); avg_price dipaksa NULL
    /// saat qty nol (invariant §data model). realized_pnl_delta diakumulasi.
    pub fn upsert_position(
        conn: &Connection,
        symbol: &str,
        qty: f64,
        avg_price: Option<f64>,
        realized_pnl_delta: f64,
    ) -> rusqlite::Result<()> {
        let now = now_iso();
        let new_avg = if qty != 0.0 { avg_price } else { None };
        let prev_realized: Option<f64> = conn
            .query_row(
                "SELECT realized_pnl FROM portfolio WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?
            .map(|v| v.unwrap_or(0.0));
        match prev_realized {
            Some(prev) => {
                conn.execute(
                    "UPDATE portfolio SET qty = ?1, avg_price = ?2, realized_pnl = ?3, updated_at = ?4
                     WHERE symbol = ?5",
                    params![qty, new_avg, prev + realized_pnl_delta, now, symbol],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO portfolio (symbol, qty, avg_price, realized_pnl, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![symbol, qty, new_avg, realized_pnl_delta, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_portfolio(conn: &Connection) -> rusqlite::Result<HashMap<String, Position>> {
        let mut stmt = conn.prepare(
            "SELECT symbol, qty, avg_price, realized_pnl, updated_at FROM portfolio",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Position {
                symbol: row.get(0)?,
                qty: row.get(1)?,
                avg_price: row.get(2)?,
                realized_pnl: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                updated_at: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        let mut out = HashMap::new();
        for pos in rows {
            let pos = pos?;
            out.insert(pos.symbol.clone(), pos);
        }
        Ok(out)
    }

    pub fn get_cash(conn: &Connection, currency: &str) -> rusqlite::Result<Option<f64>> {
        conn.query_row(
            "SELECT cash FROM account WHERE currency = ?1",
            params![currency],
            |row| row.get(0),
        )
        .optional()
    }

    /// Tambah delta ke cash (negatif = debit). Buat row kalau belum ada.
    /// Mengembalikan saldo baru.
    pub fn update_cash(conn: &Connection, delta: f64, currency: &str) -> rusqlite::Result<f64> {
        let now = now_iso();
        match get_cash(conn, currency)? {
            Some(cash) => {
                let new = cash + delta;
                conn.execute(
                    "UPDATE account SET cash = ?1, updated_at = ?2 WHERE currency = ?3",
                    params![new, now, currency],
                )?;
                Ok(new)
            }
            None => {
                conn.execute(
                    "INSERT INTO account (currency, cash, updated_at) VALUES (?1, ?2, ?3)",
                    params![currency, delta, now],
                )?;
                Ok(delta)
            }
        }
    }

    pub fn set_cash(conn: &Connection, amount: f64, currency: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO account (currency, cash, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(currency) DO UPDATE SET cash = excluded.cash, updated_at = excluded.updated_at",
            params![currency, amount, now_iso()],
        )?;
        Ok(())
    }

    pub fn ensure_account(
        conn: &Connection,
        currency: &str,
        initial_cash: f64,
    ) -> rusqlite::Result<()> {
        if get_cash(conn, currency)?.is_none() {
            conn.execute(
                "INSERT INTO account (currency, cash, updated_at) VALUES (?1, ?2, ?3)",
                params![currency, initial_cash, now_iso()],
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Ledger {
    path: String,
}

impl Ledger {
    /// Buka (atau buat) ledger di path, siapkan skema + seed akun USD.
    pub fn open(path: &str, starting_cash: f64) -> Result<Self, LedgerError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let ledger = Self { path: path.to_string() };
        let conn = ledger.conn()?;
        conn.execute_batch(SCHEMA)?;
        q::ensure_account(&conn, CURRENCY, starting_cash)?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.path)?;
        // WAL best-effort, sama seperti referensi
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        Ok(conn)
    }

    /// Satu transaksi: commit kalau closure sukses, rollback kalau error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn insert_trade(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        pnl: Option<f64>,
        exec_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<i64, LedgerError> {
        Ok(q::insert_trade(&self.conn()?, symbol, side, qty, price, pnl, exec_id, notes)?)
    }

    pub fn update_trade_pnl(&self, trade_id: i64, pnl: f64) -> Result<(), LedgerError> {
        Ok(q::update_trade_pnl(&self.conn()?, trade_id, pnl)?)
    }

    pub fn update_trade_qty(&self, trade_id: i64, qty: f64) -> Result<(), LedgerError> {
        Ok(q::update_trade_qty(&self.conn()?, trade_id, qty)?)
    }

    pub fn insert_event(
        &self,
        kind: EventKind,
        source: &str,
        payload: &str,
    ) -> Result<i64, LedgerError> {
        Ok(q::insert_event(&self.conn()?, kind, source, payload)?)
    }

    /// Observability sink: gagal menulis event tidak boleh menggagalkan
    /// operasi pemanggil — cukup tercatat di log.
    pub fn log_event(&self, kind: EventKind, source: &str, payload: &str) {
        if let Err(e) = self.insert_event(kind, source, payload) {
            error!(?e, source, "failed to insert event");
        }
    }

    pub fn fetch_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, LedgerError> {
        Ok(q::fetch_trades(&self.conn()?, limit)?)
    }

    pub fn fetch_events(&self, limit: usize) -> Result<Vec<EventRecord>, LedgerError> {
        Ok(q::fetch_events(&self.conn()?, limit)?)
    }

    pub fn get_position(&self, symbol: &str) -> Result<Option<Position>, LedgerError> {
        Ok(q::get_position(&self.conn()?, symbol)?)
    }

    pub fn upsert_position(
        &self,
        symbol: &str,
        qty: f64,
        avg_price: Option<f64>,
        realized_pnl_delta: f64,
    ) -> Result<(), LedgerError> {
        Ok(q::upsert_position(&self.conn()?, symbol, qty, avg_price, realized_pnl_delta)?)
    }

    pub fn get_portfolio(&self) -> Result<HashMap<String, Position>, LedgerError> {
        Ok(q::get_portfolio(&self.conn()?)?)
    }

    /// Saldo cash; 0.0 kalau row belum ada (seeding terjadi saat open()).
    pub fn get_cash(&self, currency: &str) -> Result<f64, LedgerError> {
        Ok(q::get_cash(&self.conn()?, currency)?.unwrap_or(0.0))
    }

    pub fn update_cash(&self, delta: f64, currency: &str) -> Result<f64, LedgerError> {
        Ok(q::update_cash(&self.conn()?, delta, currency)?)
    }

    pub fn set_cash(&self, amount: f64, currency: &str) -> Result<(), LedgerError> {
        Ok(q::set_cash(&self.conn()?, amount, currency)?)
    }

    /// Paper PnL posisi terbuka pada harga pasar saat ini.
    pub fn unrealized_pnl(&self, symbol: &str, market_price: f64) -> Result<f64, LedgerError> {
        let pos = self.get_position(symbol)?;
        Ok(match pos {
            Some(p) if p.qty != 0.0 => match p.avg_price {
                Some(avg) => (market_price - avg) * p.qty,
                None => 0.0,
            },
            _ => 0.0,
        })
    }

    pub fn equity_snapshot(&self) -> Result<EquitySnapshot, LedgerError> {
        let cash = self.get_cash(CURRENCY)?;
        let portfolio = self.get_portfolio()?;
        let mut positions: Vec<Position> = portfolio.into_values().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let total_realized = positions.iter().map(|p| p.realized_pnl).sum();
        Ok(EquitySnapshot { cash, total_realized, positions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.db");
        let ledger = Ledger::open(path.to_str().unwrap(), 10_000.0).unwrap();
        (dir, ledger)
    }

    #[test]
    fn open_seeds_usd_account_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.db");
        let ledger = Ledger::open(path.to_str().unwrap(), 10_000.0).unwrap();
        assert_eq!(ledger.get_cash(CURRENCY).unwrap(), 10_000.0);

        ledger.update_cash(-2_500.0, CURRENCY).unwrap();
        // re-open tidak boleh re-seed
        let ledger2 = Ledger::open(path.to_str().unwrap(), 10_000.0).unwrap();
        assert_eq!(ledger2.get_cash(CURRENCY).unwrap(), 7_500.0);
    }

    #[test]
    fn upsert_position_nulls_avg_when_flat() {
        let (_dir, ledger) = open_temp();
        ledger.upsert_position("BTCUSD", 2.0, Some(100.0), 0.0).unwrap();
        let pos = ledger.get_position("BTCUSD").unwrap().unwrap();
        assert_eq!(pos.qty, 2.0);
        assert_eq!(pos.avg_price, Some(100.0));

        ledger.upsert_position("BTCUSD", 0.0, Some(100.0), 12.5).unwrap();
        let pos = ledger.get_position("BTCUSD").unwrap().unwrap();
        assert_eq!(pos.qty, 0.0);
        assert_eq!(pos.avg_price, None); // invariant: avg NULL iff qty nol
        assert_eq!(pos.realized_pnl, 12.5);
    }

    #[test]
    fn realized_pnl_accumulates_across_upserts() {
        let (_dir, ledger) = open_temp();
        ledger.upsert_position("ETHUSD", 4.0, Some(10.0), 0.0).unwrap();
        ledger.upsert_position("ETHUSD", 2.0, Some(10.0), 5.0).unwrap();
        ledger.upsert_position("ETHUSD", 0.0, None, -1.5).unwrap();
        let pos = ledger.get_position("ETHUSD").unwrap().unwrap();
        assert!((pos.realized_pnl - 3.5).abs() < 1e-9);
    }

    #[test]
    fn trade_backfill_updates_row() {
        let (_dir, ledger) = open_temp();
        let id = ledger
            .insert_trade("BTCUSD", Side::Buy, 10.0, 5.0, None, Some("x-1"), Some("{}"))
            .unwrap();
        ledger.update_trade_qty(id, 4.0).unwrap();
        ledger.update_trade_pnl(id, 0.0).unwrap();
        let trades = ledger.fetch_trades(10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].qty, 4.0);
        assert_eq!(trades[0].pnl, Some(0.0));
        assert_eq!(trades[0].exec_id.as_deref(), Some("x-1"));
    }

    #[test]
    fn portfolio_read_is_idempotent() {
        let (_dir, ledger) = open_temp();
        ledger.upsert_position("BTCUSD", 1.5, Some(99.0), 0.0).unwrap();
        ledger.upsert_position("ETHUSD", 3.0, Some(12.0), 2.0).unwrap();
        let a = ledger.get_portfolio().unwrap();
        let b = ledger.get_portfolio().unwrap();
        assert_eq!(a.len(), b.len());
        for (sym, pa) in &a {
            let pb = &b[sym];
            assert_eq!(pa.qty, pb.qty);
            assert_eq!(pa.avg_price, pb.avg_price);
            assert_eq!(pa.realized_pnl, pb.realized_pnl);
        }
    }

    #[test]
    fn unrealized_pnl_handles_flat_and_open() {
        let (_dir, ledger) = open_temp();
        assert_eq!(ledger.unrealized_pnl("BTCUSD", 100.0).unwrap(), 0.0);
        ledger.upsert_position("BTCUSD", 2.0, Some(90.0), 0.0).unwrap();
        assert!((ledger.unrealized_pnl("BTCUSD", 100.0).unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let (_dir, ledger) = open_temp();
        let res: Result<(), LedgerError> = ledger.with_tx(|conn| {
            q::insert_event(conn, EventKind::Info, "test", "will be rolled back")?;
            q::update_cash(conn, -100.0, CURRENCY)?;
            Err(LedgerError::Sqlite(rusqlite::Error::InvalidQuery))
        });
        assert!(res.is_err());
        assert_eq!(ledger.get_cash(CURRENCY).unwrap(), 10_000.0);
        assert!(ledger.fetch_events(10).unwrap().is_empty());
    }
}
