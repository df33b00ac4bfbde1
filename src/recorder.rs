// ===============================
// src/recorder.rs
// ===============================
//
// JSONL audit mirror yang ringan & tahan banting:
// - Tulis setiap AuditEvent (decision/fill/note) ke file .jsonl (append).
// - Bufer dengan BufWriter agar hemat syscall.
// - Flush periodik tiap 1s dan/atau tiap 100 event.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file dan lanjut.
//
// Mirror observability saja — source of truth tetap tabel trades/events
// di ledger. ENV: set `RECORD_FILE=/path/to/audit.jsonl` agar aktif.
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::AuditEvent;

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<AuditEvent>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Some(w) => w,
        None => return,
    };

    // Flush periodik (tiap 1 detik) + flush berbasis jumlah event
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 100;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        // Serialize event
                        let line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        // Tulis + newline
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write_all failed, attempting reopen");
                            writer = match open_writer(&path).await {
                                Some(w) => w,
                                None => return,
                            };
                            // coba lagi sekali setelah reopen
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write_all failed again after reopen, drop event");
                                continue;
                            }
                        }
                        if let Err(e) = writer.write_all(b"\n").await {
                            error!(?e, "recorder: write newline failed, attempting reopen");
                            writer = match open_writer(&path).await {
                                Some(w) => w,
                                None => return,
                            };
                            let _ = writer.write_all(b"\n").await;
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        // Channel closed: flush dan keluar
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                // Flush periodik
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Decision};
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.to_str().unwrap().to_string()));

        tx.send(AuditEvent::Note("cycle start".to_string())).await.unwrap();
        tx.send(AuditEvent::Decision {
            symbol: "BTCUSD".to_string(),
            decision: Decision { action: Action::Hold, qty: 0.0, reason: "no_signal".into() },
        })
        .await
        .unwrap();
        drop(tx); // recorder flush + exit saat channel ditutup
        task.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
