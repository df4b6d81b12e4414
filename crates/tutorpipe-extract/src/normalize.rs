//! Deterministic text normalization.
//!
//! Conservative by design: mechanical transforms only, no paraphrasing and no
//! inference. The output is what the LLM (when configured) and the
//! deterministic extractors consume.

use std::sync::LazyLock;

use regex::Regex;

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static BLANKLINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

// Academic token splits: sec3 -> sec 3, p5 -> p 5, jc1 -> jc 1.
static TOKEN_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(sec|s|jc|j|p|k|year)(\d{1,2})\b").unwrap());

// 7.30pm -> 7:30pm
static TIME_DOT_WITH_AMPM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})\.(\d{2})\s*([ap]m)\b").unwrap());

// 2.30-5.30pm -> 2:30-5:30pm (left side only fixed when the right side carries am/pm)
static TIME_RANGE_LEFT_DOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\.(\d{2})(\s*-\s*\d{1,2}\.\d{2}\s*[ap]m)\b").unwrap()
});

/// Fold unicode dash variants (en/em/minus/figure) to ASCII `-`.
pub fn fold_dashes(s: &str) -> String {
    s.replace(['\u{2013}', '\u{2014}', '\u{2212}', '\u{2012}'], "-")
}

/// Canonicalize raw assignment text. Idempotent:
/// `normalize_text(normalize_text(x)) == normalize_text(x)`.
pub fn normalize_text(raw: &str) -> String {
    let s = raw.replace("\r\n", "\n").replace('\r', "\n");
    let s = fold_dashes(&s);

    // Time punctuation first, after the dash fold keeps "-" stable.
    let s = TIME_RANGE_LEFT_DOT_RE.replace_all(&s, "$1:$2$3");
    let s = TIME_DOT_WITH_AMPM_RE.replace_all(&s, "$1:$2$3");

    let s = TOKEN_SPLIT_RE.replace_all(&s, "$1 $2");

    // Whitespace normalization, preserving paragraph structure.
    let s = s.replace('\t', " ");
    let s: String = s
        .split('\n')
        .map(|line| SPACE_RE.replace_all(line, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    BLANKLINES_RE.replace_all(&s, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_dashes_and_time_dots() {
        assert_eq!(normalize_text("2.30–5.30pm"), "2:30-5:30pm");
        assert_eq!(normalize_text("at 7.30pm sharp"), "at 7:30pm sharp");
    }

    #[test]
    fn splits_academic_tokens() {
        assert_eq!(normalize_text("sec3 E Maths"), "sec 3 E Maths");
        assert_eq!(normalize_text("P5 science"), "P 5 science");
        assert_eq!(normalize_text("jc1 GP"), "jc 1 GP");
        // 3+ digit tokens stay intact
        assert_eq!(normalize_text("S123456"), "S123456");
    }

    #[test]
    fn collapses_whitespace_but_keeps_paragraphs() {
        let input = "a   b\t c\n\n\n\n\nnext  para";
        assert_eq!(normalize_text(input), "a b c\n\nnext para");
    }

    #[test]
    fn idempotent() {
        let samples = [
            "Timing:  TUESDAY AT 7PM",
            "2.30-5.30pm  –  sec3\r\nRate: $40/hr\n\n\n\nRemarks: none",
            "",
            "   ",
        ];
        for s in samples {
            let once = normalize_text(s);
            assert_eq!(normalize_text(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("\n\n\n"), "");
    }
}
