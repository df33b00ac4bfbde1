// ===============================
// src/news.rs (headline provider)
// ===============================
//
// Fetcher headline best-effort via DuckDuckGo instant-answer API (JSON,
// tanpa API key). Kontrak provider: gagal apa pun -> Vec kosong + warning,
// supaya cycle tetap aman (sentimen netral -> hold).
//
use serde_json::Value;
use tokio::time::Duration;
use tracing::warn;

use crate::domain::Headline;
use crate::metrics::PROVIDER_FAILS;

const DDG_BASE: &str = "https://api.duckduckgo.com/";
const TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct NewsClient {
    http: reqwest::Client,
    max_results: usize,
}

impl NewsClient {
    pub fn new(max_results: usize) -> Self {
        Self { http: reqwest::Client::new(), max_results }
    }

    /// Ambil headline untuk satu symbol. Tidak pernah error keluar.
    pub async fn fetch_headlines(&self, query: &str) -> Vec<Headline> {
        let q = format!("{query} finance news");
        let resp = self
            .http
            .get(DDG_BASE)
            .query(&[("q", q.as_str()), ("format", "json"), ("t", "senti_bot_rust")])
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .send()
            .await;

        let body: Value = match resp {
            Ok(r) => match r.error_for_status() {
                Ok(r) => match r.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(?e, %query, "news response is not json");
                        PROVIDER_FAILS.with_label_values(&["duckduckgo"]).inc();
                        return Vec::new();
                    }
                },
                Err(e) => {
                    warn!(?e, %query, "news request rejected");
                    PROVIDER_FAILS.with_label_values(&["duckduckgo"]).inc();
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!(?e, %query, "news request failed");
                PROVIDER_FAILS.with_label_values(&["duckduckgo"]).inc();
                return Vec::new();
            }
        };

        parse_related_topics(&body, self.max_results)
    }
}

/// Ekstrak headline dari payload instant-answer. RelatedTopics berisi
/// campuran topic langsung {Text, FirstURL} dan grup {Name, Topics: [...]}.
pub(crate) fn parse_related_topics(body: &Value, max_results: usize) -> Vec<Headline> {
    let mut out = Vec::new();

    // Abstract (kalau ada) dihitung sebagai headline pertama
    if let Some(abs) = body.get("AbstractText").and_then(Value::as_str) {
        if !abs.is_empty() {
            let title = body
                .get("Heading")
                .and_then(Value::as_str)
                .unwrap_or(abs)
                .to_string();
            out.push(Headline {
                title,
                body: abs.to_string(),
                url: body.get("AbstractURL").and_then(Value::as_str).map(String::from),
            });
        }
    }

    let related = body.get("RelatedTopics").and_then(Value::as_array);
    if let Some(items) = related {
        for item in items {
            if out.len() >= max_results {
                break;
            }
            if let Some(topics) = item.get("Topics").and_then(Value::as_array) {
                // grup bernama: ambil isinya
                for sub in topics {
                    if out.len() >= max_results {
                        break;
                    }
                    if let Some(h) = topic_to_headline(sub) {
                        out.push(h);
                    }
                }
            } else if let Some(h) = topic_to_headline(item) {
                out.push(h);
            }
        }
    }

    out.truncate(max_results);
    out
}

fn topic_to_headline(item: &Value) -> Option<Headline> {
    let title = item
        .get("Text")
        .and_then(Value::as_str)
        .or_else(|| item.get("Name").and_then(Value::as_str))?;
    if title.is_empty() {
        return None;
    }
    Some(Headline {
        title: title.to_string(),
        body: String::new(),
        url: item.get("FirstURL").and_then(Value::as_str).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_and_grouped_topics() {
        let body = json!({
            "AbstractText": "",
            "RelatedTopics": [
                {"Text": "Bitcoin rallies past resistance", "FirstURL": "https://x/1"},
                {"Name": "Markets", "Topics": [
                    {"Text": "ETH slumps on outflows", "FirstURL": "https://x/2"},
                    {"Text": "Dollar steady", "FirstURL": "https://x/3"}
                ]},
                {"Text": "Fed holds rates"}
            ]
        });
        let got = parse_related_topics(&body, 10);
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].title, "Bitcoin rallies past resistance");
        assert_eq!(got[1].title, "ETH slumps on outflows");
        assert_eq!(got[3].url, None);
    }

    #[test]
    fn respects_max_results() {
        let body = json!({
            "RelatedTopics": [
                {"Text": "a"}, {"Text": "b"}, {"Text": "c"}, {"Text": "d"}
            ]
        });
        assert_eq!(parse_related_topics(&body, 2).len(), 2);
    }

    #[test]
    fn abstract_becomes_first_headline() {
        let body = json!({
            "Heading": "Bitcoin",
            "AbstractText": "Bitcoin is a decentralized digital currency.",
            "AbstractURL": "https://x/btc",
            "RelatedTopics": [{"Text": "More news"}]
        });
        let got = parse_related_topics(&body, 5);
        assert_eq!(got[0].title, "Bitcoin");
        assert!(!got[0].body.is_empty());
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn malformed_payload_yields_empty() {
        assert!(parse_related_topics(&json!({"foo": 1}), 5).is_empty());
        assert!(parse_related_topics(&json!(null), 5).is_empty());
    }
}
