// ===============================
// src/sentiment.rs (lexicon scorer)
// ===============================
//
// Scorer sentimen ringan berbasis lexicon (kata positif/negatif bernuansa
// finansial + negasi sederhana). Output per snippet di [-1, 1], dinormalisasi
// gaya VADER: sum / sqrt(sum^2 + alpha).
//
// Kontrak provider: skor gagal/non-finite tidak menggagalkan batch —
// aggregate() melewatinya dan list kosong berarti netral (0.0).
//
use ahash::AHashSet as HashSet;
use once_cell::sync::Lazy;

const NORMALIZATION_ALPHA: f64 = 15.0;
/// Negasi berlaku untuk maksimal 2 token sebelum kata sentimen.
const NEGATION_WINDOW: usize = 2;

static POSITIVE: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "gain", "gains", "rally", "rallies", "surge", "surges", "soar", "soars", "jump",
        "jumps", "rise", "rises", "rising", "record", "strong", "bullish", "beat", "beats",
        "upgrade", "upgraded", "profit", "profits", "growth", "optimism", "optimistic",
        "boom", "breakout", "recovery", "rebound", "rebounds", "win", "wins", "positive",
        "higher", "outperform", "outperforms", "good", "great", "best", "success",
        "successful", "opportunity", "adoption", "approval", "approved",
    ]
    .into_iter()
    .collect()
});

static NEGATIVE: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "loss", "losses", "fall", "falls", "falling", "drop", "drops", "plunge", "plunges",
        "crash", "crashes", "slump", "slumps", "decline", "declines", "weak", "bearish",
        "miss", "misses", "downgrade", "downgraded", "fraud", "lawsuit", "fear", "fears",
        "panic", "selloff", "recession", "bankruptcy", "bankrupt", "default", "negative",
        "lower", "underperform", "underperforms", "bad", "worst", "crisis", "scandal",
        "warning", "risk", "risks", "tumble", "tumbles", "hack", "hacked", "ban", "banned",
    ]
    .into_iter()
    .collect()
});

static NEGATIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "not", "no", "never", "none", "cannot", "cant", "wont", "dont", "doesnt", "isnt",
        "wasnt", "arent", "without", "hardly",
    ]
    .into_iter()
    .collect()
});

/// Skor satu snippet teks ke [-1, 1]. Teks kosong/tanpa kata sentimen -> 0.0.
pub fn score_text(text: &str) -> f64 {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|t| t.replace('\'', "").to_ascii_lowercase()) // isn't -> isnt
        .filter(|t| !t.is_empty())
        .collect();

    let mut sum = 0.0_f64;
    for (i, tok) in tokens.iter().enumerate() {
        let polarity = if POSITIVE.contains(tok.as_str()) {
            1.0
        } else if NEGATIVE.contains(tok.as_str()) {
            -1.0
        } else {
            continue;
        };
        let lo = i.saturating_sub(NEGATION_WINDOW);
        let negated = tokens[lo..i].iter().any(|t| NEGATIONS.contains(t.as_str()));
        sum += if negated { -polarity } else { polarity };
    }

    if sum == 0.0 {
        return 0.0;
    }
    (sum / (sum * sum + NORMALIZATION_ALPHA).sqrt()).clamp(-1.0, 1.0)
}

/// Reduksi batch: mean aritmetika; list kosong = netral 0.0.
/// Skor non-finite (snippet yang "gagal") dilewati, tidak membatalkan batch.
pub fn aggregate(scores: &[f64]) -> f64 {
    let valid: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    if valid.is_empty() {
        return 0.0;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_headline_scores_positive() {
        let s = score_text("Bitcoin surges to record high as ETF approval fuels rally");
        assert!(s > 0.0, "got {s}");
        assert!(s <= 1.0);
    }

    #[test]
    fn negative_headline_scores_negative() {
        let s = score_text("Market crash deepens: losses mount amid fraud lawsuit and panic");
        assert!(s < 0.0, "got {s}");
        assert!(s >= -1.0);
    }

    #[test]
    fn negation_flips_polarity() {
        let plain = score_text("strong growth");
        let negated = score_text("not strong, no growth");
        assert!(plain > 0.0);
        assert!(negated < 0.0, "got {negated}");
    }

    #[test]
    fn neutral_or_empty_text_is_zero() {
        assert_eq!(score_text(""), 0.0);
        assert_eq!(score_text("the committee met on tuesday"), 0.0);
    }

    #[test]
    fn score_is_bounded() {
        let many = "surge rally gain profit boom win beat growth ".repeat(50);
        let s = score_text(&many);
        assert!((-1.0..=1.0).contains(&s));
        assert!(s > 0.9);
    }

    #[test]
    fn aggregate_empty_is_neutral() {
        assert_eq!(aggregate(&[]), 0.0);
    }

    #[test]
    fn aggregate_is_arithmetic_mean() {
        let agg = aggregate(&[0.5, -0.1, 0.2]);
        assert!((agg - 0.2).abs() < 1e-12);
    }

    #[test]
    fn aggregate_skips_failed_scores() {
        let agg = aggregate(&[0.4, f64::NAN, 0.2]);
        assert!((agg - 0.3).abs() < 1e-12);
    }
}
