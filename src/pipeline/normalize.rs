//! Deterministic text cleanup.
//!
//! Two consumers:
//!
//! * OCR output from vision models, which arrives with the same quirks the
//!   models show everywhere: fences they were told not to emit, CRLF line
//!   endings, placeholder image links, zero-width characters.
//!   [`clean_ocr_text`] fixes those without touching content.
//! * Comparisons. The fusion engine measures agreement between extractors
//!   and the classifier matches running headers across pages; both compare
//!   [`similarity_key`]s rather than raw strings so whitespace and case
//!   noise do not count as disagreement.
//!
//! ## Rule order
//!
//! Fences are stripped before line endings are normalised (the fence regex
//! expects `\n`), and invisible characters go last so earlier rules see the
//! text the model produced.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean raw OCR output.
///
/// Rules, in order:
/// 1. Strip outer Markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 1
/// 5. Replace hallucinated image links with their alt text
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Trim leading and trailing blank lines
pub fn clean_ocr_text(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_image_links(&s);
    let s = remove_invisible_chars(&s);
    s.trim_matches('\n').to_string()
}

/// Comparison key: invisible characters removed, whitespace collapsed to
/// single spaces, lower-cased.
pub fn similarity_key(input: &str) -> String {
    remove_invisible_chars(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Comparison key with every digit run replaced by `#`, so "Page 3 of 10"
/// and "Page 4 of 10" compare equal.
pub fn furniture_key(input: &str) -> String {
    RE_DIGITS.replace_all(&similarity_key(input), "#").into_owned()
}

static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|text)?\r?\n(.*)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 5: Image links ──────────────────────────────────────────────────
//
// A region's OCR text can never legitimately contain an image link: the
// region *is* the image. Keep the alt text, which is usually a caption.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn remove_image_links(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| caps[1].trim().to_string())
        .to_string()
}

// ── Rule 6: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_markdown_fences("```markdown\nRevenue\n2024\n```"), "Revenue\n2024");
        assert_eq!(strip_markdown_fences("```\nA\n```"), "A");
        assert_eq!(strip_markdown_fences("plain"), "plain");
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_image_links_become_alt_text() {
        assert_eq!(remove_image_links("see ![Revenue by year](chart.png)"), "see Revenue by year");
    }

    #[test]
    fn test_remove_invisible() {
        assert_eq!(remove_invisible_chars("he\u{200B}llo\u{FEFF}"), "hello");
    }

    #[test]
    fn test_clean_ocr_full() {
        let raw = "```\r\nQ1   \r\n\r\n\r\n\r\nQ2\u{200B}\r\n```";
        assert_eq!(clean_ocr_text(raw), "Q1\n\nQ2");
    }

    #[test]
    fn similarity_key_ignores_spacing_and_case() {
        assert_eq!(similarity_key("  Hello\n  WORLD "), "hello world");
    }

    #[test]
    fn furniture_key_masks_numbers() {
        assert_eq!(furniture_key("Page 3 of 10"), furniture_key("page 12 of 10"));
        assert_ne!(furniture_key("Page 3"), furniture_key("Chapter 3"));
    }
}
