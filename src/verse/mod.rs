//! Verse classification and aggregate probability math.
//!
//! Markets asking the same question (modulo phrasing noise) must land in the
//! same verse on every keeper, so everything here is deterministic: fixed
//! synonym table, fixed stop-words, sorted tokens, fixed digest.

use crate::models::{Market, VerseId};
use sha2::{Digest, Sha256};

const STOP_WORDS: [&str; 7] = ["the", "will", "be", "at", "in", "on", "by"];

fn synonym(token: &str) -> &str {
    match token {
        "btc" => "bitcoin",
        "eth" => "ethereum",
        "above" => ">",
        "below" => "<",
        "usd" => "$",
        other => other,
    }
}

/// Lowercase, strip punctuation, apply the synonym table. This is the form
/// fed to the near-duplicate check; classification additionally drops
/// stop-words and sorts.
pub fn normalize(question: &str) -> String {
    let cleaned: String = question
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .map(synonym)
        .collect::<Vec<_>>()
        .join(" ")
}

fn canonical_key(question: &str) -> String {
    let normalized = normalize(question);
    let mut tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .collect();
    tokens.sort_unstable();
    tokens.join("_")
}

/// Deterministic market question -> verse id: first 16 bytes of the SHA-256
/// of the canonical token key.
pub fn classify(question: &str) -> VerseId {
    let key = canonical_key(question);
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    VerseId::from_bytes(bytes)
}

/// Near-duplicate check: edit distance of the normalized questions under 5.
pub fn same_verse(q1: &str, q2: &str) -> bool {
    levenshtein(&normalize(q1), &normalize(q2)) < 5
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Volume x liquidity weighted mean of member yes-prices; 0.5 when the total
/// weight is zero.
pub fn aggregate_probability<'a>(markets: impl IntoIterator<Item = &'a Market>) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for market in markets {
        let weight = market.volume * market.liquidity;
        weighted_sum += weight * market.yes_price;
        total_weight += weight;
    }
    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn market(yes_price: f64, volume: f64, liquidity: f64) -> Market {
        Market {
            id: "m".into(),
            question: "q".into(),
            outcomes: vec!["Yes".into(), "No".into()],
            yes_price,
            volume,
            liquidity,
            resolved: false,
            resolution: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn classify_is_deterministic() {
        let q = "Will BTC be above 100000 USD by March?";
        assert_eq!(classify(q), classify(q));
    }

    #[test]
    fn classify_ignores_phrasing_noise() {
        // Stop words, casing, punctuation and synonyms all wash out.
        let a = classify("Will BTC be above 100000 USD?");
        let b = classify("btc above 100000 usd");
        let c = classify("Bitcoin > 100000 $");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn classify_distinguishes_different_questions() {
        assert_ne!(
            classify("Will bitcoin be above 100000 usd"),
            classify("Will ethereum be above 5000 usd")
        );
    }

    #[test]
    fn classify_word_order_is_irrelevant() {
        assert_eq!(
            classify("bitcoin above 100000"),
            classify("above 100000 bitcoin")
        );
    }

    #[test]
    fn same_verse_tolerates_small_edits() {
        assert!(same_verse(
            "Will bitcoin be above 100000?",
            "Will bitcoin be above 100001?"
        ));
        assert!(!same_verse(
            "Will bitcoin be above 100000?",
            "Will the president visit France this year?"
        ));
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
    }

    #[test]
    fn aggregate_is_weighted_mean() {
        let markets = [market(0.2, 10.0, 10.0), market(0.8, 30.0, 10.0)];
        // Weights 100 and 300 -> (0.2*100 + 0.8*300) / 400 = 0.65.
        let p = aggregate_probability(markets.iter());
        assert!((p - 0.65).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_aggregates_to_half() {
        let markets = [market(0.9, 0.0, 100.0), market(0.1, 50.0, 0.0)];
        assert_eq!(aggregate_probability(markets.iter()), 0.5);
    }
}
