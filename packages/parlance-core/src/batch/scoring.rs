//! Transcript scoring: character and word error rates.
//!
//! Both metrics are Levenshtein distance over the normalized reference,
//! divided by the reference length. The language decides the primary metric:
//! Japanese has no word boundaries, so WER is omitted and CER rules.

use crate::normalize::{normalize, NormalizationConfig};
use crate::utils::is_japanese_lang;

/// Levenshtein distance with the classic two-row DP.
fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, item_a) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, item_b) in b.iter().enumerate() {
            let cost = usize::from(item_a != item_b);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Character error rate of `hypothesis` against `reference`.
///
/// An empty reference scores 0.0 against an empty hypothesis and 1.0
/// against anything else.
pub fn cer(reference: &str, hypothesis: &str) -> f64 {
    let ref_chars: Vec<char> = reference.chars().collect();
    let hyp_chars: Vec<char> = hypothesis.chars().collect();
    if ref_chars.is_empty() {
        return if hyp_chars.is_empty() { 0.0 } else { 1.0 };
    }
    edit_distance(&ref_chars, &hyp_chars) as f64 / ref_chars.len() as f64
}

/// Word error rate of `hypothesis` against `reference` (whitespace tokens).
pub fn wer(reference: &str, hypothesis: &str) -> f64 {
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();
    if ref_words.is_empty() {
        return if hyp_words.is_empty() { 0.0 } else { 1.0 };
    }
    edit_distance(&ref_words, &hyp_words) as f64 / ref_words.len() as f64
}

/// Scores computed for one file result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub cer: Option<f64>,
    pub wer: Option<f64>,
    /// The normalization actually applied (after language policy overrides).
    pub normalization_used: NormalizationConfig,
}

/// Scores a hypothesis against a reference under the language policy.
///
/// Japanese: CER is primary, WER omitted (word boundaries undefined), and
/// `strip_space` is honored. Other languages: WER is primary, CER reported
/// alongside, and `strip_space` is force-disabled so word boundaries survive
/// normalization.
pub fn score(
    lang: &str,
    reference: &str,
    hypothesis: &str,
    requested: NormalizationConfig,
) -> ScoreOutcome {
    let japanese = is_japanese_lang(lang);
    let used = if japanese {
        requested
    } else {
        NormalizationConfig {
            strip_space: false,
            ..requested
        }
    };

    let ref_norm = normalize(reference, &used).text_norm;
    let hyp_norm = normalize(hypothesis, &used).text_norm;

    ScoreOutcome {
        cer: Some(cer(&ref_norm, &hyp_norm)),
        wer: if japanese {
            None
        } else {
            Some(wer(&ref_norm, &hyp_norm))
        },
        normalization_used: used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizePreset;

    #[test]
    fn identical_texts_score_zero() {
        assert_eq!(cer("hello", "hello"), 0.0);
        assert_eq!(wer("hello world", "hello world"), 0.0);
    }

    #[test]
    fn empty_reference_edge_cases() {
        assert_eq!(cer("", ""), 0.0);
        assert_eq!(cer("", "x"), 1.0);
        assert_eq!(wer("", "word"), 1.0);
    }

    #[test]
    fn single_substitution_cer() {
        // "cat" -> "bat": 1 edit over 3 chars
        assert!((cer("cat", "bat") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn wer_counts_word_level_edits() {
        // One substitution over four words.
        assert!((wer("the cat sat down", "the dog sat down") - 0.25).abs() < 1e-9);
    }

    #[test]
    fn insertion_can_push_rate_above_one() {
        assert!(cer("a", "abcd") > 1.0);
    }

    #[test]
    fn japanese_scoring_omits_wer() {
        let outcome = score(
            "ja",
            "こんにちは世界",
            "こんにちは、世界",
            NormalizationConfig {
                preset: NormalizePreset::Wer,
                strip_space: true,
            },
        );
        assert!(outcome.wer.is_none());
        // The wer preset strips the CJK comma, so the texts match.
        assert_eq!(outcome.cer, Some(0.0));
        assert!(outcome.normalization_used.strip_space);
    }

    #[test]
    fn non_japanese_forces_strip_space_off() {
        let outcome = score(
            "en",
            "Hello world",
            "hello world",
            NormalizationConfig {
                preset: NormalizePreset::Wer,
                strip_space: true,
            },
        );
        assert!(!outcome.normalization_used.strip_space);
        assert_eq!(outcome.wer, Some(0.0));
        assert_eq!(outcome.cer, Some(0.0));
    }

    #[test]
    fn scoring_normalizes_both_sides() {
        let outcome = score(
            "en",
            "HELLO, WORLD!",
            "hello world",
            NormalizationConfig {
                preset: NormalizePreset::Wer,
                strip_space: false,
            },
        );
        assert_eq!(outcome.wer, Some(0.0));
    }
}
