//! Adds natural breathing pauses to chunk text.
//!
//! The TTS engine takes plain text only, so pauses are pure punctuation and
//! spacing constructs it already interprets, never engine control codes.
//! The pass runs when the chunk plan is created, so the stored chunk text is
//! exactly what gets synthesized and the determinism guarantee covers it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreathingIntensity {
    None,
    Light,
    Normal,
    Heavy,
}

impl Default for BreathingIntensity {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for BreathingIntensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Light => write!(f, "light"),
            Self::Normal => write!(f, "normal"),
            Self::Heavy => write!(f, "heavy"),
        }
    }
}

impl From<String> for BreathingIntensity {
    fn from(s: String) -> Self {
        match s.as_str() {
            "none" => Self::None,
            "light" => Self::Light,
            "heavy" => Self::Heavy,
            _ => Self::Normal,
        }
    }
}

impl BreathingIntensity {
    fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Light => 1,
            Self::Normal => 2,
            Self::Heavy => 3,
        }
    }
}

static RE_SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([.!?])(\s+)(\p{Uppercase})").unwrap());
static RE_CONJUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\s,])\s+(and|but|or|so|yet|nor)\s+").unwrap());
static RE_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s+").unwrap());
static RE_PAREN_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\S)\s+\(").unwrap());

/// Insert pause markers between sentences (and, at higher intensities,
/// within them). Deterministic mapping:
///
/// - none: text unchanged
/// - light: comma after each sentence terminator
/// - normal: light, plus a comma before bare coordinating conjunctions
/// - heavy: ellipsis after terminators, normal's clause pauses, plus pauses
///   after colons and before parentheticals
pub fn apply(text: &str, intensity: BreathingIntensity) -> String {
    let level = intensity.level();
    if level == 0 {
        return text.to_string();
    }

    let pause = if level >= 3 { "..." } else { "," };
    let mut out = RE_SENTENCE_END
        .replace_all(text, |caps: &regex::Captures| {
            format!("{}{}{}{}", &caps[1], pause, &caps[2], &caps[3])
        })
        .to_string();

    if level >= 2 {
        out = RE_CONJUNCTION.replace_all(&out, "$1, $2 ").to_string();
    }

    if level >= 3 {
        out = RE_COLON.replace_all(&out, ":... ").to_string();
        out = RE_PAREN_OPEN.replace_all(&out, "$1... (").to_string();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_leaves_text_untouched() {
        let text = "First sentence. Second sentence.";
        assert_eq!(apply(text, BreathingIntensity::None), text);
    }

    #[test]
    fn light_adds_comma_pauses_between_sentences() {
        let out = apply("It works. Try it now.", BreathingIntensity::Light);
        assert_eq!(out, "It works., Try it now.");
    }

    #[test]
    fn normal_pauses_before_conjunctions() {
        let out = apply("Read the docs and run the tests.", BreathingIntensity::Normal);
        assert_eq!(out, "Read the docs, and run the tests.");
    }

    #[test]
    fn normal_skips_conjunctions_already_after_commas() {
        let out = apply("Read, and run.", BreathingIntensity::Normal);
        assert_eq!(out, "Read, and run.");
    }

    #[test]
    fn heavy_uses_ellipses() {
        let out = apply("Stop. Think about it: carefully.", BreathingIntensity::Heavy);
        assert!(out.contains("Stop...."));
        assert!(out.contains(":... carefully"));
    }

    #[test]
    fn breathing_is_deterministic() {
        let text = "One thing. Another thing and a third: done (really).";
        for intensity in [
            BreathingIntensity::None,
            BreathingIntensity::Light,
            BreathingIntensity::Normal,
            BreathingIntensity::Heavy,
        ] {
            assert_eq!(apply(text, intensity), apply(text, intensity));
        }
    }
}
