//! Turns raw markdown, plain text, or HTML into clean speakable prose.
//!
//! The output is a plain UTF-8 string of paragraphs separated by blank
//! lines. Headings survive as `Section: …` lines so the chunker can anchor
//! on them. Normalization is deterministic: the same input and options
//! always produce byte-identical output, and it never fails — malformed
//! input degrades to best-effort cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeBlockRule {
    /// Remove fenced/indented code entirely.
    Skip,
    /// Keep the code's text verbatim.
    Inline,
    /// Replace each block with a short synthetic phrase.
    Describe,
}

impl Default for CodeBlockRule {
    fn default() -> Self {
        Self::Skip
    }
}

impl From<String> for CodeBlockRule {
    fn from(s: String) -> Self {
        match s.as_str() {
            "inline" => Self::Inline,
            "describe" => Self::Describe,
            _ => Self::Skip,
        }
    }
}

/// Configuration for text cleaning. Persisted as a JSON snapshot on every
/// source so cleaned_text stays a pure function of (raw_text, options).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningOptions {
    pub code_block_rule: CodeBlockRule,
    pub remove_non_text: bool,
    pub speak_urls: bool,
    pub handle_tables: bool,
    pub expand_abbreviations: bool,
    pub preserve_parentheses: bool,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        Self {
            code_block_rule: CodeBlockRule::Skip,
            remove_non_text: false,
            speak_urls: true,
            handle_tables: true,
            expand_abbreviations: true,
            preserve_parentheses: true,
        }
    }
}

impl CleaningOptions {
    /// Build options from the persisted settings rows (`clean_*` keys),
    /// falling back to defaults for anything unset.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let flag = |key: &str, default: bool| {
            settings
                .get(key)
                .map(|v| v == "true")
                .unwrap_or(default)
        };
        Self {
            code_block_rule: settings
                .get("clean_code_block_rule")
                .cloned()
                .map(CodeBlockRule::from)
                .unwrap_or_default(),
            remove_non_text: flag("clean_remove_non_text", false),
            speak_urls: flag("clean_speak_urls", true),
            handle_tables: flag("clean_handle_tables", true),
            expand_abbreviations: flag("clean_expand_abbreviations", true),
            preserve_parentheses: flag("clean_preserve_parentheses", true),
        }
    }
}

/// Abbreviations expanded for clear pronunciation.
static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let entries: &[(&str, &str)] = &[
        ("et al.", "and others"),
        ("approx.", "approximately"),
        ("e.g.", "for example"),
        ("i.e.", "that is"),
        ("etc.", "et cetera"),
        ("dept.", "department"),
        ("k8s", "kubernetes"),
        ("vs.", "versus"),
        ("fig.", "figure"),
        ("sec.", "section"),
        ("ch.", "chapter"),
        ("vol.", "volume"),
        ("no.", "number"),
        ("dr.", "doctor"),
        ("mr.", "mister"),
        ("mrs.", "misses"),
        ("ms.", "miss"),
        ("st.", "saint"),
    ];
    // Longest first so "et al." wins over "al.".
    entries
        .iter()
        .map(|(abbr, expansion)| {
            let pattern = format!(r"(?i)\b{}", regex::escape(abbr));
            (Regex::new(&pattern).unwrap(), *expansion)
        })
        .collect()
});

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?(html|body|div|p|br|span|a|img|h[1-6]|table|ul|ol|li|article)\b[^>]*>").unwrap());
static RE_HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_SCRIPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static RE_STYLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static RE_SVG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<svg[^>]*>.*?</svg>").unwrap());
static RE_BLOCK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(br|hr|/p|/div|/li|/tr|/h[1-6])[^>]*>").unwrap());
static RE_ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]*)\)").unwrap());
static RE_BARE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s\])>]+").unwrap());
static RE_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*{1,3}([^*]+)\*{1,3}").unwrap());
static RE_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{1,3}([^_]+)_{1,3}").unwrap());
static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static RE_LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([-*+]|\d+\.)\s+").unwrap());
static RE_HRULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-*_]{3,}\s*$").unwrap());
static RE_PARENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^()]*\)").unwrap());
static RE_NON_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\-—•*|#_~`\[\]{}<>^&%$@=+]"#).unwrap());
static RE_MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static RE_MULTI_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([.,;:!?])").unwrap());
static RE_TABLE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\|?[\s:|-]+\|?$").unwrap());

/// True when the input is dominated by HTML markup rather than markdown.
pub fn looks_like_html(text: &str) -> bool {
    RE_HTML_TAG.find_iter(text).take(3).count() >= 3
        || text.trim_start().to_ascii_lowercase().starts_with("<!doctype html")
}

/// Extract a document title from HTML, if one exists.
pub fn html_title(text: &str) -> Option<String> {
    RE_TITLE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Normalize raw text for TTS consumption.
pub fn normalize(text: &str, options: &CleaningOptions) -> String {
    let text = if looks_like_html(text) {
        strip_html(text)
    } else {
        text.to_string()
    };

    let text = if options.handle_tables {
        convert_tables(&text)
    } else {
        text
    };

    let mut out: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut fence_buffer: Vec<String> = Vec::new();

    for line in text.lines() {
        let stripped = line.trim();

        // Fenced code blocks.
        if stripped.starts_with("```") || stripped.starts_with("~~~") {
            if in_fence {
                in_fence = false;
                match options.code_block_rule {
                    CodeBlockRule::Skip => {}
                    CodeBlockRule::Describe => out.push("(Code block omitted.)".to_string()),
                    CodeBlockRule::Inline => {
                        let code = fence_buffer.join("\n");
                        if !code.trim().is_empty() {
                            out.push(light_clean(&code));
                        }
                    }
                }
                fence_buffer.clear();
            } else {
                in_fence = true;
            }
            continue;
        }
        if in_fence {
            fence_buffer.push(line.to_string());
            continue;
        }

        // Indented code (a tab or four spaces) outside of lists.
        if !stripped.is_empty() && (line.starts_with("    ") || line.starts_with('\t')) {
            match options.code_block_rule {
                CodeBlockRule::Skip => continue,
                CodeBlockRule::Describe => {
                    if out.last().map(String::as_str) != Some("(Code block omitted.)") {
                        out.push("(Code block omitted.)".to_string());
                    }
                    continue;
                }
                CodeBlockRule::Inline => {
                    out.push(light_clean(stripped));
                    continue;
                }
            }
        }

        if stripped.is_empty() {
            out.push(String::new());
            continue;
        }

        if RE_HRULE.is_match(stripped) {
            continue;
        }
        if RE_TABLE_SEPARATOR.is_match(stripped) && stripped.contains('|') {
            continue;
        }

        // Headings become Section lines so the chunker can anchor on them.
        if let Some(heading) = stripped.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            let cleaned = clean_inline(heading, options);
            if !cleaned.is_empty() {
                out.push(String::new());
                out.push(format!("Section: {}.", cleaned.trim_end_matches('.')));
                out.push(String::new());
            }
            continue;
        }

        // Leftover table rows when table handling is off.
        if stripped.starts_with('|') && stripped.ends_with('|') {
            let cells: Vec<&str> = stripped
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            if !cells.is_empty() {
                out.push(clean_inline(&cells.join(". "), options));
            }
            continue;
        }

        let line = RE_LIST_MARKER.replace(stripped, "");
        let line = line.trim_start_matches("> ").trim_start_matches('>');
        let cleaned = clean_inline(line, options);
        if !cleaned.is_empty() {
            out.push(cleaned);
        }
    }

    // Unterminated fence: fall through with the configured rule.
    if in_fence && options.code_block_rule == CodeBlockRule::Inline {
        let code = fence_buffer.join("\n");
        if !code.trim().is_empty() {
            out.push(light_clean(&code));
        }
    } else if in_fence && options.code_block_rule == CodeBlockRule::Describe {
        out.push("(Code block omitted.)".to_string());
    }

    final_clean(&out.join("\n"))
}

/// Readability-style extraction for HTML input: drop scripts, styles, SVG
/// and comments, turn block boundaries into newlines, strip the rest of the
/// markup, and decode common entities.
pub fn strip_html(text: &str) -> String {
    let text = RE_HTML_COMMENT.replace_all(text, "");
    let text = RE_SCRIPT.replace_all(&text, "");
    let text = RE_STYLE.replace_all(&text, "");
    let text = RE_SVG.replace_all(&text, "");
    let text = RE_BLOCK_TAG.replace_all(&text, "\n");
    let text = RE_ANY_TAG.replace_all(&text, "");
    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn clean_inline(line: &str, options: &CleaningOptions) -> String {
    // Images: alt text by default, nothing in aggressive mode.
    let line = if options.remove_non_text {
        RE_IMAGE.replace_all(line, "")
    } else {
        RE_IMAGE.replace_all(line, "(Image: $1)")
    };

    // Links collapse to their anchor text; optionally speak the target too.
    let line = if options.speak_urls {
        RE_LINK.replace_all(&line, |caps: &regex::Captures| {
            let spoken = speakable_url(&caps[2]);
            if spoken.is_empty() {
                caps[1].to_string()
            } else {
                format!("{}, at {},", &caps[1], spoken)
            }
        })
    } else {
        RE_LINK.replace_all(&line, "$1")
    };

    // Bare URLs.
    let line = if options.speak_urls {
        RE_BARE_URL.replace_all(&line, |caps: &regex::Captures| speakable_url(&caps[0]))
    } else {
        RE_BARE_URL.replace_all(&line, "")
    };

    let line = RE_BOLD.replace_all(&line, "$1");
    let line = RE_UNDERSCORE.replace_all(&line, "$1");

    let line = match options.code_block_rule {
        CodeBlockRule::Inline => RE_INLINE_CODE.replace_all(&line, "$1"),
        _ => RE_INLINE_CODE.replace_all(&line, ""),
    };

    let mut line = line.to_string();

    if !options.preserve_parentheses {
        line = RE_PARENS.replace_all(&line, "").to_string();
    }

    if options.expand_abbreviations {
        line = expand_abbreviations(&line);
    }

    if options.remove_non_text {
        line = RE_NON_TEXT.replace_all(&line, " ").to_string();
        line = RE_MULTI_SPACE.replace_all(&line, " ").trim().to_string();
    } else {
        line = light_clean(&line);
    }

    line
}

/// Drop the scheme, www prefix, and trailing punctuation so a URL reads
/// like a domain path.
fn speakable_url(url: &str) -> String {
    let url = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let url = url.strip_prefix("www.").unwrap_or(url);
    url.trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string()
}

fn expand_abbreviations(text: &str) -> String {
    let mut text = text.to_string();
    for (pattern, expansion) in ABBREVIATIONS.iter() {
        text = pattern
            .replace_all(&text, |caps: &regex::Captures| {
                let matched = &caps[0];
                if matched.chars().next().is_some_and(char::is_uppercase) {
                    let mut chars = expansion.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                } else {
                    expansion.to_string()
                }
            })
            .to_string();
    }
    text
}

/// Remove characters that break TTS flow but keep ordinary punctuation.
fn light_clean(text: &str) -> String {
    let text = text.replace(['^', '|'], " ");
    let text = text.replace('—', "-");
    RE_MULTI_SPACE.replace_all(&text, " ").trim().to_string()
}

/// Convert markdown tables into row-by-row sentences:
/// "Column A: value; Column B: value."
fn convert_tables(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();
        let next = lines.get(i + 1).map(|l| l.trim()).unwrap_or("");
        let is_table_start = line.starts_with('|')
            && line.ends_with('|')
            && RE_TABLE_SEPARATOR.is_match(next)
            && next.contains('|');

        if !is_table_start {
            out.push(lines[i].to_string());
            i += 1;
            continue;
        }

        let headers: Vec<String> = split_row(line);
        i += 2;
        let mut rows = 0;
        while i < lines.len() {
            let row_line = lines[i].trim();
            if !(row_line.starts_with('|') && row_line.ends_with('|')) {
                break;
            }
            let cells = split_row(row_line);
            let sentence: Vec<String> = headers
                .iter()
                .zip(cells.iter())
                .map(|(h, c)| format!("{h}: {c}"))
                .collect();
            if !sentence.is_empty() {
                out.push(format!("{}.", sentence.join("; ")));
            }
            rows += 1;
            i += 1;
        }
        if rows == 0 {
            out.push(format!("Table with columns: {}.", headers.join(", ")));
        }
    }

    out.join("\n")
}

fn split_row(line: &str) -> Vec<String> {
    line.trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Final whitespace normalization, preserving paragraph breaks.
fn final_clean(text: &str) -> String {
    let text = RE_MULTI_NEWLINE.replace_all(text, "\n\n");
    let text = RE_SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> CleaningOptions {
        CleaningOptions::default()
    }

    #[test]
    fn normalization_is_deterministic() {
        let input = "# Title\n\nSome *bold* text with [a link](https://example.com/page).\n\n```rust\nfn main() {}\n```\n\nDone.";
        let a = normalize(input, &defaults());
        let b = normalize(input, &defaults());
        assert_eq!(a, b);
    }

    #[test]
    fn headings_become_section_lines() {
        let out = normalize("# Getting Started\n\nHello.", &defaults());
        assert!(out.starts_with("Section: Getting Started."));
        assert!(out.contains("Hello."));
    }

    #[test]
    fn code_block_rules() {
        let input = "Before.\n\n```\nlet x = 1;\n```\n\nAfter.";

        let skip = normalize(input, &defaults());
        assert!(!skip.contains("let x"));
        assert!(!skip.contains("Code block"));

        let mut opts = defaults();
        opts.code_block_rule = CodeBlockRule::Describe;
        let described = normalize(input, &opts);
        assert!(described.contains("(Code block omitted.)"));

        opts.code_block_rule = CodeBlockRule::Inline;
        let inlined = normalize(input, &opts);
        assert!(inlined.contains("let x = 1;"));
    }

    #[test]
    fn links_collapse_to_anchor_text() {
        let mut opts = defaults();
        opts.speak_urls = false;
        let out = normalize("See [the docs](https://docs.example.com/guide) now.", &opts);
        assert_eq!(out, "See the docs now.");

        opts.speak_urls = true;
        let spoken = normalize("See [the docs](https://docs.example.com/guide) now.", &opts);
        assert!(spoken.contains("the docs"));
        assert!(spoken.contains("docs.example.com/guide"));
        assert!(!spoken.contains("https://"));
    }

    #[test]
    fn tables_become_row_sentences() {
        let input = "| Name | Role |\n| --- | --- |\n| Ada | Engineer |\n";
        let out = normalize(input, &defaults());
        assert!(out.contains("Name: Ada; Role: Engineer."));
    }

    #[test]
    fn tables_can_be_left_raw() {
        let mut opts = defaults();
        opts.handle_tables = false;
        let out = normalize("| Name | Role |\n| --- | --- |\n| Ada | Engineer |\n", &opts);
        assert!(out.contains("Ada. Engineer"));
    }

    #[test]
    fn abbreviations_expand_with_case() {
        let out = normalize("Dr. Smith uses k8s, e.g. daily.", &defaults());
        assert!(out.contains("Doctor Smith"));
        assert!(out.contains("kubernetes"));
        assert!(out.contains("for example"));
    }

    #[test]
    fn parentheses_can_be_dropped() {
        let mut opts = defaults();
        opts.preserve_parentheses = false;
        let out = normalize("Keep this (but not this) intact.", &opts);
        assert_eq!(out, "Keep this intact.");
    }

    #[test]
    fn html_input_is_detected_and_stripped() {
        let input = "<html><head><title>My Article</title>\
            <script>alert(1)</script></head>\
            <body><p>First paragraph.</p><p>Second paragraph.</p></body></html>";
        assert!(looks_like_html(input));
        assert_eq!(html_title(input).as_deref(), Some("My Article"));
        let out = normalize(input, &defaults());
        assert!(out.contains("First paragraph."));
        assert!(out.contains("Second paragraph."));
        assert!(!out.contains("alert"));
        assert!(!out.contains('<'));
    }

    #[test]
    fn images_keep_alt_text_unless_non_text_removed() {
        let out = normalize("Look: ![a diagram](pic.png)", &defaults());
        assert!(out.contains("(Image: a diagram)"));

        let mut opts = defaults();
        opts.remove_non_text = true;
        let stripped = normalize("Look: ![a diagram](pic.png)", &opts);
        assert!(!stripped.contains("diagram"));
    }

    #[test]
    fn malformed_input_never_panics() {
        for input in ["", "```unterminated", "|||", "<p>", "# ", "![]("] {
            let _ = normalize(input, &defaults());
        }
    }
}
