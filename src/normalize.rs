// 🔤 Text Normalizer
//
// Canonicalizes free-form text coming out of exchange listings and filings:
//   1. expand company-mark glyphs (㈱ -> (株))
//   2. drop zero-width and control characters
//   3. NFKC fold (ＡＢＣ１２３ -> ABC123, ｶﾀｶﾅ -> カタカナ)
//   4. every space variant -> one ASCII space, ends trimmed
//
// Pure and idempotent: normalize(normalize(x)) == normalize(x).

use unicode_normalization::UnicodeNormalization;

/// Glyphs whose NFKC form loses the parentheses (or is missing entirely).
const SYMBOL_EXPANSIONS: &[(char, &str)] = &[
    ('㊑', "(株)"),
    ('㈱', "(株)"),
    ('㊒', "(有)"),
    ('㈲', "(有)"),
    ('㈳', "(社)"),
    ('㈶', "(財)"),
    ('㍿', "株式会社"),
];

fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
    )
}

/// Normalize one text value. Never fails.
pub fn normalize(text: &str) -> String {
    let mut expanded = String::with_capacity(text.len());
    for c in text.chars() {
        if let Some((_, replacement)) = SYMBOL_EXPANSIONS.iter().find(|(glyph, _)| *glyph == c) {
            expanded.push_str(replacement);
        } else if c.is_whitespace() {
            expanded.push(' ');
        } else if c.is_control() || is_zero_width(c) {
            continue;
        } else {
            expanded.push(c);
        }
    }

    collapse_whitespace(expanded.nfkc())
}

/// Normalize an optional field, mapping blank results to `None`.
pub fn normalize_opt(text: Option<&str>) -> Option<String> {
    text.map(normalize).filter(|s| !s.is_empty())
}

fn collapse_whitespace(chars: impl Iterator<Item = char>) -> String {
    let mut out = String::new();
    let mut pending_space = false;

    for c in chars {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_full_width_alphanumerics_fold() {
        assert_eq!(normalize("ＡＢＣ１２３"), "ABC123");
        assert_eq!(normalize("ﾄﾖﾀ"), "トヨタ");
    }

    #[test]
    fn test_company_marks_expand() {
        assert_eq!(normalize("㈱ＡＢＣ"), "(株)ABC");
        assert_eq!(normalize("㊑トヨタ"), "(株)トヨタ");
        assert_eq!(normalize("㈲山田商店"), "(有)山田商店");
        assert_eq!(normalize("㍿"), "株式会社");
    }

    #[test]
    fn test_space_variants_collapse() {
        assert_eq!(normalize("トヨタ\u{3000}自動車"), "トヨタ 自動車");
        assert_eq!(normalize("Sony\u{00A0}\u{00A0}Group"), "Sony Group");
        assert_eq!(normalize("  line one\n\tline two  "), "line one line two");
    }

    #[test]
    fn test_zero_width_and_controls_stripped() {
        assert_eq!(normalize("任天\u{200B}堂"), "任天堂");
        assert_eq!(normalize("\u{FEFF}ソニー\u{0007}"), "ソニー");
        assert_eq!(normalize("a\u{00AD}b"), "ab");
    }

    #[test]
    fn test_already_normal_text_unchanged() {
        let text = "(株)三菱UFJフィナンシャル・グループ";
        assert_eq!(normalize(text), text);
    }

    #[test]
    fn test_normalize_opt_blank_is_none() {
        assert_eq!(normalize_opt(Some("\u{3000} ")), None);
        assert_eq!(normalize_opt(None), None);
        assert_eq!(normalize_opt(Some("電気機器")), Some("電気機器".to_string()));
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(
            s in "[a-zA-Z0-9ａ-ｚＡ-Ｚ０-９ｱ-ﾝﾞﾟア-ン株式会社㈱㊑㈲㍿・ー（）() \u{3000}\u{00A0}\u{200B}\u{FEFF}\t\n]{0,48}"
        ) {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn prop_normalize_any_string_is_idempotent(s in "\\PC{0,32}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }
    }
}
