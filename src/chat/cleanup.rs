//! HTML → Markdown cleanup for model output
//!
//! Models occasionally emit HTML despite instructions. `<followup>` blocks
//! are stashed before cleaning and re-appended byte-for-byte afterwards.
//! The cleanup also runs incrementally on partial streams: callers trim any
//! trailing incomplete tag first so a half-formed `<stro` is not stripped of
//! its literal content mid-stream, while a mathematical `<` inside prose
//! survives.

use once_cell::sync::Lazy;
use regex::Regex;

static FOLLOWUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<followup>.*?</followup>").expect("valid regex"));
static STRONG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<strong[^>]*>(.*?)</strong>").expect("valid regex"));
static B_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<b[^>]*>(.*?)</b>").expect("valid regex"));
static EM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<em[^>]*>(.*?)</em>").expect("valid regex"));
static I_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<i[^>]*>(.*?)</i>").expect("valid regex"));
static LI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").expect("valid regex"));
static P_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").expect("valid regex"));
static LIST_WRAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(ul|ol)[^>]*>").expect("valid regex"));
static STRIP_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(div|span|br|table|tr|td|th|thead|tbody|blockquote|hr)[\s/]*>")
        .expect("valid regex")
});
static RESIDUAL_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?[a-z][a-z0-9]*[^>]*>").expect("valid regex"));
static TRAILING_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+\n").expect("valid regex"));
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static EMPTY_LIST_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n- \n+(- )").expect("valid regex"));

static HEADING_RES: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    (1..=6)
        .map(|level: usize| {
            let hashes = "#".repeat((level + 1).min(4));
            (
                Regex::new(&format!(r"(?is)<h{level}[^>]*>(.*?)</h{level}>"))
                    .expect("valid regex"),
                format!("\n{} $1\n", hashes),
            )
        })
        .collect()
});

/// Convert HTML in model output to clean Markdown
pub fn clean_llm_output(text: &str) -> String {
    // 0. Preserve <followup> tags, re-appended verbatim at the end
    let followups: Vec<String> = FOLLOWUP_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    let text = FOLLOWUP_RE.replace_all(text, "");

    // 1. Semantic HTML → Markdown (robust to attributes, case, multiline)
    let text = STRONG_RE.replace_all(&text, "**$1**");
    let text = B_RE.replace_all(&text, "**$1**");
    let text = EM_RE.replace_all(&text, "*$1*");
    let text = I_RE.replace_all(&text, "*$1*");
    let mut text = text.into_owned();
    for (re, replacement) in HEADING_RES.iter() {
        text = re.replace_all(&text, replacement.as_str()).into_owned();
    }
    let text = LI_RE.replace_all(&text, "\n- $1");
    let text = P_RE.replace_all(&text, "$1\n\n");

    // 2. Strip remaining non-semantic tags
    let text = LIST_WRAP_RE.replace_all(&text, "\n");
    let text = STRIP_TAG_RE.replace_all(&text, "\n");

    // 3. Any leftover tag, with or without attributes
    let text = RESIDUAL_TAG_RE.replace_all(&text, "");

    // 4. Normalize whitespace
    let text = TRAILING_SPACE_RE.replace_all(&text, "\n");
    let text = BLANK_LINES_RE.replace_all(&text, "\n\n");
    let text = EMPTY_LIST_ITEM_RE.replace_all(&text, "\n- $1");

    // 5. Re-append followups
    let mut result = text.trim().to_string();
    if !followups.is_empty() {
        result.push('\n');
        result.push_str(&followups.join("\n"));
    }
    result
}

/// Drop a trailing incomplete HTML tag from a partial stream (text after the
/// last unmatched `<` that looks like a tag), preserving mathematical `<`.
pub fn trim_incomplete_tag(raw: &str) -> &str {
    let Some(last_lt) = raw.rfind('<') else {
        return raw;
    };
    let tail = &raw[last_lt..];
    if tail.contains('>') {
        return raw;
    }
    let mut chars = tail.chars();
    chars.next(); // '<'
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '/' => &raw[..last_lt],
        // "<" alone at the very end could be the start of a tag
        None => &raw[..last_lt],
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_markdown_is_identity_mod_whitespace() {
        let md = "## Plan\n\n**Squat** every *week*.\n\n- one\n- two";
        assert_eq!(clean_llm_output(md), md);
    }

    #[test]
    fn test_semantic_conversion() {
        let html = "<h2>Plan</h2><p>Do <strong>squats</strong> and <em>rest</em>.</p><ul><li>one</li><li>two</li></ul>";
        let cleaned = clean_llm_output(html);
        assert!(cleaned.contains("### Plan"));
        assert!(cleaned.contains("**squats**"));
        assert!(cleaned.contains("*rest*"));
        assert!(cleaned.contains("- one"));
        assert!(!cleaned.contains('<'));
    }

    #[test]
    fn test_attributes_and_case() {
        let html = r#"<STRONG class="x">bold</STRONG> <B>also</B>"#;
        assert_eq!(clean_llm_output(html), "**bold** **also**");
    }

    #[test]
    fn test_followups_preserved_byte_for_byte() {
        let text = "Answer here.\n<followup>What about deloads?</followup>\n<followup>How much protein?</followup>\n<followup>Which split fits?</followup>";
        let cleaned = clean_llm_output(text);
        assert!(cleaned.contains("<followup>What about deloads?</followup>"));
        assert_eq!(cleaned.matches("<followup>").count(), 3);
    }

    #[test]
    fn test_residual_tags_stripped() {
        let html = r#"<div data-x="1">content</div><custom>inner</custom>"#;
        let cleaned = clean_llm_output(html);
        assert_eq!(cleaned, "content\ninner");
    }

    #[test]
    fn test_heading_level_caps_at_h4() {
        let cleaned = clean_llm_output("<h6>Deep</h6>");
        assert!(cleaned.contains("#### Deep"));
    }

    #[test]
    fn test_trim_incomplete_tag() {
        assert_eq!(trim_incomplete_tag("text <stro"), "text ");
        assert_eq!(trim_incomplete_tag("text </di"), "text ");
        assert_eq!(trim_incomplete_tag("text <"), "text ");
        // A complete tag is left alone
        assert_eq!(trim_incomplete_tag("text <b>bold</b>"), "text <b>bold</b>");
        // Math survives
        assert_eq!(trim_incomplete_tag("reps < 5"), "reps < 5");
        assert_eq!(trim_incomplete_tag("5 < 8 but"), "5 < 8 but");
    }

    #[test]
    fn test_whitespace_normalization() {
        let text = "line one   \n\n\n\n\nline two";
        assert_eq!(clean_llm_output(text), "line one\n\nline two");
    }
}
