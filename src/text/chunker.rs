//! Splits cleaned text into ordered TTS-sized chunks.
//!
//! Chunking is deterministic: identical (text, strategy, max_chars) always
//! yield an identical chunk sequence, which is what makes selective chunk
//! regeneration reproducible.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Paragraph,
    Sentence,
    Heading,
    MaxChars,
}

impl Default for ChunkStrategy {
    fn default() -> Self {
        Self::Paragraph
    }
}

impl std::fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paragraph => write!(f, "paragraph"),
            Self::Sentence => write!(f, "sentence"),
            Self::Heading => write!(f, "heading"),
            Self::MaxChars => write!(f, "max_chars"),
        }
    }
}

impl From<String> for ChunkStrategy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sentence" => Self::Sentence,
            "heading" => Self::Heading,
            "max_chars" => Self::MaxChars,
            _ => Self::Paragraph,
        }
    }
}

/// One planned chunk: the unit of synthesis, persistence, and playback
/// navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub index: usize,
    pub text: String,
    pub label: String,
}

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static RE_HEADING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(Section: .+|#{1,6} .+)$").unwrap());

/// Words that end with a period without ending a sentence.
const NON_TERMINAL_WORDS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "st", "no", "vs", "etc", "fig", "sec", "ch", "vol", "e.g",
    "i.e", "al", "approx", "dept",
];

/// Split text into chunks using the given strategy.
///
/// Empty or whitespace-only text produces zero chunks; the caller decides
/// whether that is an error.
pub fn chunk_text(text: &str, strategy: ChunkStrategy, max_chars: usize) -> Vec<PlannedChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);

    let pieces = match strategy {
        ChunkStrategy::Paragraph => chunk_by_paragraph(text, max_chars),
        ChunkStrategy::Sentence => chunk_by_sentence(text, max_chars),
        ChunkStrategy::Heading => chunk_by_heading(text, max_chars),
        ChunkStrategy::MaxChars => chunk_by_max_chars(text, max_chars),
    };

    pieces
        .into_iter()
        .filter(|(text, _)| !text.trim().is_empty())
        .enumerate()
        .map(|(index, (text, label))| PlannedChunk {
            index,
            text: text.trim().to_string(),
            label: label.unwrap_or_else(|| format!("Part {}", index + 1)),
        })
        .collect()
}

/// Split on blank-line boundaries; oversized paragraphs are subdivided on
/// sentence boundaries, then hard-split on words as a last resort.
fn chunk_by_paragraph(text: &str, max_chars: usize) -> Vec<(String, Option<String>)> {
    let mut pieces = Vec::new();
    for paragraph in RE_PARAGRAPH_BREAK.split(text) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.chars().count() <= max_chars {
            pieces.push((paragraph.to_string(), None));
        } else {
            for (piece, hard) in pack_sentences(paragraph, max_chars) {
                let label = hard.then(|| format!("Part {} (hard split)", pieces.len() + 1));
                pieces.push((piece, label));
            }
        }
    }
    pieces
}

/// Split on sentence terminators and pack sentences greedily up to the
/// limit.
fn chunk_by_sentence(text: &str, max_chars: usize) -> Vec<(String, Option<String>)> {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    pack_sentences(&flat, max_chars)
        .into_iter()
        .enumerate()
        .map(|(i, (piece, hard))| {
            let label = hard.then(|| format!("Part {} (hard split)", i + 1));
            (piece, label)
        })
        .collect()
}

/// Partition along top-level heading lines; within a section apply
/// paragraph packing. Labels carry the heading text.
fn chunk_by_heading(text: &str, max_chars: usize) -> Vec<(String, Option<String>)> {
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    let mut cursor = 0;
    let mut current_label: Option<String> = None;

    for m in RE_HEADING_LINE.find_iter(text) {
        let before = &text[cursor..m.start()];
        if !before.trim().is_empty() {
            sections.push((current_label.clone(), before.to_string()));
        }
        current_label = Some(heading_label(m.as_str()));
        cursor = m.start();
    }
    let rest = &text[cursor..];
    if !rest.trim().is_empty() {
        sections.push((current_label, rest.to_string()));
    }

    let mut pieces = Vec::new();
    for (label, section) in sections {
        let section = section.trim();
        if section.chars().count() <= max_chars {
            pieces.push((section.to_string(), label));
        } else {
            let sub = chunk_by_paragraph(section, max_chars);
            let count = sub.len();
            for (i, (piece, sub_label)) in sub.into_iter().enumerate() {
                let label = match (&label, count) {
                    (Some(l), 1) => Some(l.clone()),
                    (Some(l), _) => Some(format!("{} ({})", l, i + 1)),
                    (None, _) => sub_label,
                };
                pieces.push((piece, label));
            }
        }
    }
    pieces
}

/// Ignore structure entirely: pack words greedily up to the limit.
fn chunk_by_max_chars(text: &str, max_chars: usize) -> Vec<(String, Option<String>)> {
    split_words(text, max_chars)
        .into_iter()
        .map(|piece| (piece, None))
        .collect()
}

fn heading_label(line: &str) -> String {
    let line = line.trim();
    let label = if let Some(rest) = line.strip_prefix("Section: ") {
        rest.trim_end_matches('.')
    } else {
        line.trim_start_matches('#').trim()
    };
    label.trim().to_string()
}

/// Greedily pack sentences up to `max_chars`. A single sentence longer than
/// the limit is hard-split on word boundaries, never truncated; such pieces
/// are flagged so they get a warning label.
fn pack_sentences(text: &str, max_chars: usize) -> Vec<(String, bool)> {
    let mut pieces: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if sentence.chars().count() > max_chars {
            if !current.is_empty() {
                pieces.push((std::mem::take(&mut current), false));
            }
            tracing::warn!(
                "Sentence of {} chars exceeds chunk limit {}; hard-splitting",
                sentence.chars().count(),
                max_chars
            );
            for piece in split_words(&sentence, max_chars) {
                pieces.push((piece, true));
            }
            continue;
        }
        if current.is_empty() {
            current = sentence;
        } else if current.chars().count() + 1 + sentence.chars().count() <= max_chars {
            current.push(' ');
            current.push_str(&sentence);
        } else {
            pieces.push((std::mem::take(&mut current), false));
            current = sentence;
        }
    }
    if !current.trim().is_empty() {
        pieces.push((current, false));
    }
    pieces
}

/// Pack whitespace-separated words greedily up to `max_chars` per piece.
fn split_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.chars().count() + 1 + word.chars().count() <= max_chars {
            current.push(' ');
            current.push_str(word);
        } else {
            pieces.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split text on sentence terminators (`.`, `!`, `?`), respecting common
/// abbreviations, single-initial names, and decimal numbers.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '.' || c == '!' || c == '?' {
            // Consume a run of terminators ("?!", "...").
            let mut end = i;
            while end + 1 < chars.len() && matches!(chars[end + 1], '.' | '!' | '?') {
                end += 1;
            }
            let followed_by_space = chars.get(end + 1).map_or(true, |c| c.is_whitespace());
            if followed_by_space && !(c == '.' && is_non_terminal(&chars[start..i])) {
                let sentence: String = chars[start..=end].iter().collect();
                let sentence = sentence.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end + 1;
            }
            i = end + 1;
        } else {
            i += 1;
        }
    }
    let tail: String = chars[start..].iter().collect();
    let tail = tail.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// True when the word immediately before a period means the period is not a
/// sentence end: a known abbreviation or a single-letter initial.
fn is_non_terminal(before: &[char]) -> bool {
    let word: String = before
        .iter()
        .rev()
        .take_while(|c| !c.is_whitespace())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '.');
    if word.chars().count() == 1 && word.chars().all(char::is_alphabetic) {
        return true;
    }
    let lowered = word.to_lowercase();
    NON_TERMINAL_WORDS
        .iter()
        .any(|abbr| lowered == *abbr || lowered.ends_with(&format!(".{abbr}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_strategy_keeps_paragraphs_separate() {
        let chunks = chunk_text("A.\n\nB.\n\nC.", ChunkStrategy::Paragraph, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "A.");
        assert_eq!(chunks[1].text, "B.");
        assert_eq!(chunks[2].text, "C.");
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn long_sentence_hard_splits_without_truncation() {
        let word = "abcde";
        let input = std::iter::repeat(word)
            .take(100)
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(input.len(), 599);

        let chunks = chunk_text(&input, ChunkStrategy::Sentence, 200);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 200);
            assert!(chunk.label.contains("hard split"));
        }
        let rejoined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, input);
    }

    #[test]
    fn sentence_strategy_packs_greedily() {
        let chunks = chunk_text("One. Two. Three. Four.", ChunkStrategy::Sentence, 12);
        // "One. Two." fits in 9, adding " Three." exceeds 12.
        assert_eq!(chunks[0].text, "One. Two.");
        assert_eq!(chunks[1].text, "Three. Four.");
    }

    #[test]
    fn sentence_splitter_respects_abbreviations_and_decimals() {
        let chunks = chunk_text(
            "Dr. Smith measured 3.14 meters. It was correct.",
            ChunkStrategy::Sentence,
            40,
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Dr. Smith measured 3.14 meters.");
        assert_eq!(chunks[1].text, "It was correct.");
    }

    #[test]
    fn heading_strategy_labels_sections() {
        let text = "Section: Intro.\n\nHello there.\n\nSection: Usage.\n\nRun it.";
        let chunks = chunk_text(text, ChunkStrategy::Heading, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].label, "Intro");
        assert!(chunks[0].text.contains("Hello there."));
        assert_eq!(chunks[1].label, "Usage");
    }

    #[test]
    fn heading_strategy_subdivides_long_sections() {
        let body = "Filler paragraph.\n\n".repeat(30);
        let text = format!("Section: Big.\n\n{body}");
        let chunks = chunk_text(&text, ChunkStrategy::Heading, 120);
        assert!(chunks.len() > 1);
        assert!(chunks[0].label.starts_with("Big ("));
    }

    #[test]
    fn max_chars_strategy_ignores_structure() {
        let chunks = chunk_text("alpha beta\n\ngamma delta", ChunkStrategy::MaxChars, 11);
        assert_eq!(chunks[0].text, "alpha beta");
        assert_eq!(chunks[1].text, "gamma delta");
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", ChunkStrategy::Paragraph, 100).is_empty());
        assert!(chunk_text("   \n\n \t", ChunkStrategy::Sentence, 100).is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Section: A.\n\nOne two three. Four five.\n\nSix seven!";
        for strategy in [
            ChunkStrategy::Paragraph,
            ChunkStrategy::Sentence,
            ChunkStrategy::Heading,
            ChunkStrategy::MaxChars,
        ] {
            let a = chunk_text(text, strategy, 30);
            let b = chunk_text(text, strategy, 30);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn oversize_paragraph_subdivides_on_sentences() {
        let text = "Short lead. This sentence is rather long and wordy. Another tail here.";
        let chunks = chunk_text(text, ChunkStrategy::Paragraph, 40);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 40);
        }
    }
}
