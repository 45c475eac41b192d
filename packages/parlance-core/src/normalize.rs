//! Preset-driven transcript normalization.
//!
//! Providers disagree on casing, punctuation, and Unicode forms; scoring and
//! side-by-side comparison need both texts pushed through the same funnel.
//! The base pass unifies smart quotes, applies NFKC, collapses whitespace,
//! and trims. Presets layer casing/punctuation policies on top.

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Punctuation stripped by the `wer` and `nopunct` presets.
///
/// Mixed ASCII/CJK set: these are the marks providers insert inconsistently.
const STRIP_PUNCTUATION: [char; 8] = ['、', '。', '.', ',', '!', '?', '！', '？'];

/// Named normalization preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizePreset {
    /// Lowercase, punctuation stripped, whitespace collapsed. For WER scoring.
    Wer,
    /// Base pass only: case and punctuation preserved. For CER scoring.
    Cer,
    /// Lowercase, punctuation stripped, spaces kept.
    Nopunct,
}

/// Full normalization configuration for a scoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    pub preset: NormalizePreset,
    /// Remove all whitespace after the preset pass. Used for CER on
    /// languages without word boundaries; force-disabled before WER scoring.
    #[serde(default)]
    pub strip_space: bool,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            preset: NormalizePreset::Wer,
            strip_space: false,
        }
    }
}

/// Result of normalizing one transcript.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedText {
    /// The normalized text.
    pub text_norm: String,
    /// Whether the input contained any strippable punctuation.
    pub punctuation_applied: bool,
    /// Whether the input contained any uppercase letters.
    pub casing_applied: bool,
}

/// Base pass: smart quotes to ASCII, NFKC, whitespace collapse, trim.
fn base_pass(text: &str) -> String {
    let unified: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    let nfkc: String = unified.nfkc().collect();
    collapse_whitespace(&nfkc)
}

/// Collapses runs of whitespace to single spaces and trims the ends.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalizes `text` under the given configuration.
pub fn normalize(text: &str, config: &NormalizationConfig) -> NormalizedText {
    let punctuation_applied = text.chars().any(|c| STRIP_PUNCTUATION.contains(&c));
    let casing_applied = text.chars().any(|c| c.is_uppercase());

    let base = base_pass(text);
    let mut out = match config.preset {
        NormalizePreset::Cer => base,
        NormalizePreset::Wer => {
            let lowered = base.to_lowercase();
            let stripped: String = lowered
                .chars()
                .filter(|c| !STRIP_PUNCTUATION.contains(c))
                .collect();
            collapse_whitespace(&stripped)
        }
        NormalizePreset::Nopunct => {
            let lowered = base.to_lowercase();
            lowered
                .chars()
                .filter(|c| !STRIP_PUNCTUATION.contains(c))
                .collect()
        }
    };

    if config.strip_space {
        out.retain(|c| !c.is_whitespace());
    }

    NormalizedText {
        text_norm: out,
        punctuation_applied,
        casing_applied,
    }
}
