// ===============================
// src/notifier.rs (Telegram sink)
// ===============================
//
// Notifikasi fire-and-forget via Telegram Bot API. Gagal kirim hanya
// dicatat di log — tidak pernah dipropagasi ke cycle.
//
use tokio::time::Duration;
use tracing::warn;

use crate::domain::Side;
use crate::metrics::NOTIFICATIONS;

const TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), bot_token, chat_id }
    }

    pub fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    /// Kirim satu pesan Markdown. true kalau terkirim.
    pub async fn send(&self, text: &str) -> bool {
        let (token, chat_id) = match (&self.bot_token, &self.chat_id) {
            (Some(t), Some(c)) => (t, c),
            _ => return false,
        };
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let form = [("chat_id", chat_id.as_str()), ("text", text), ("parse_mode", "Markdown")];
        let sent = match self
            .http
            .post(url)
            .form(&form)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) => match resp.error_for_status() {
                Ok(_) => true,
                Err(e) => {
                    warn!(?e, "telegram rejected message");
                    false
                }
            },
            Err(e) => {
                warn!(?e, "failed to send telegram message");
                false
            }
        };
        NOTIFICATIONS
            .with_label_values(&[if sent { "sent" } else { "failed" }])
            .inc();
        sent
    }

    pub async fn notify_trade(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        pnl: Option<f64>,
    ) {
        let emoji = match side {
            Side::Buy => "\u{1F4C8}",
            Side::Sell => "\u{1F4C9}",
        };
        let pnl_text = match pnl {
            Some(p) => format!("\n\u{1F4B0} *PnL:* {p:.2} USD"),
            None => String::new(),
        };
        let message = format!(
            "{emoji} *Trade Executed!*\n\
             • *Symbol:* {symbol}\n\
             • *Side:* {}\n\
             • *Quantity:* {qty}\n\
             • *Price:* {price:.2} USD{pnl_text}",
            side.as_str().to_uppercase(),
        );
        self.send(&message).await;
    }

    pub async fn notify_error(&self, error_message: &str) {
        let message = format!("\u{26A0} *Error Alert*\n```\n{error_message}\n```");
        self.send(&message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_credentials() {
        assert!(!Notifier::new(None, None).enabled());
        assert!(!Notifier::new(Some("t".into()), None).enabled());
        assert!(Notifier::new(Some("t".into()), Some("c".into())).enabled());
    }

    #[tokio::test]
    async fn send_without_credentials_is_noop() {
        let n = Notifier::new(None, None);
        assert!(!n.send("hello").await);
    }
}
