//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Returns the current Unix timestamp in whole milliseconds.
///
/// Integer variant for persisted records where fractional precision is noise.
#[must_use]
pub fn now_millis_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Language Tags
// ─────────────────────────────────────────────────────────────────────────────

/// Returns true if the language tag denotes Japanese (`ja`, `ja-JP`, ...).
///
/// Japanese has no word boundaries, so batch scoring switches its primary
/// metric from WER to CER for these tags.
#[must_use]
pub fn is_japanese_lang(lang: &str) -> bool {
    let lower = lang.to_ascii_lowercase();
    lower == "ja" || lower.starts_with("ja-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_past_2020() {
        // 2020-01-01 in ms since epoch
        assert!(now_millis() > 1_577_836_800_000.0);
        assert!(now_millis_u64() > 1_577_836_800_000);
    }

    #[test]
    fn japanese_lang_detection() {
        assert!(is_japanese_lang("ja"));
        assert!(is_japanese_lang("ja-JP"));
        assert!(is_japanese_lang("JA"));
        assert!(!is_japanese_lang("en"));
        assert!(!is_japanese_lang("jam")); // Jamaican Creole, not Japanese
    }
}
