//! Unicode inspection: NFKC normalization, confusable skeletons, and
//! ingress flag scanning.

use std::collections::BTreeSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const ZWC: &[char] = &[
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}', '\u{2060}', '\u{180e}',
];

const BIDI: &[char] = &[
    '\u{202a}', '\u{202b}', '\u{202c}', '\u{202d}', '\u{202e}', '\u{2066}', '\u{2067}',
    '\u{2068}', '\u{2069}', '\u{200e}', '\u{200f}',
];

// Cyrillic/Greek letters visually identical to their Latin counterparts.
fn confusable(c: char) -> Option<char> {
    Some(match c {
        '\u{0430}' => 'a',
        '\u{0441}' => 'c',
        '\u{0435}' => 'e',
        '\u{043e}' => 'o',
        '\u{0440}' => 'p',
        '\u{0445}' => 'x',
        '\u{0443}' => 'y',
        '\u{043a}' => 'k',
        '\u{0455}' => 's',
        '\u{0456}' => 'i',
        '\u{0458}' => 'j',
        '\u{0442}' => 't',
        '\u{03b1}' => 'a',
        '\u{03b2}' => 'b',
        '\u{03bf}' => 'o',
        '\u{03c1}' => 'p',
        '\u{03c7}' => 'x',
        '\u{03c5}' => 'y',
        '\u{039f}' => 'O',
        '\u{03a1}' => 'P',
        _ => return None,
    })
}

const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F300, 0x1F5FF),
    (0x1F600, 0x1F64F),
    (0x1F680, 0x1F6FF),
    (0x1F700, 0x1F77F),
    (0x1F900, 0x1F9FF),
    (0x1FA70, 0x1FAFF),
    (0x1F1E6, 0x1F1FF),
    (0x2600, 0x27BF),
];

fn is_emoji(c: char) -> bool {
    let cp = c as u32;
    EMOJI_RANGES.iter().any(|(start, end)| cp >= *start && cp <= *end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Cyrillic,
    Greek,
    Other,
}

fn script(c: char) -> Script {
    let cp = c as u32;
    match cp {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => Script::Latin,
        0x0370..=0x03FF | 0x1F00..=0x1FFF => Script::Greek,
        0x0400..=0x052F => Script::Cyrillic,
        _ => Script::Other,
    }
}

/// NFKC-normalize a sample.
pub fn normalize(sample: &str) -> String {
    sample.nfkc().collect()
}

/// Skeleton: map confusables to their canonical Latin letter and strip
/// combining marks.
pub fn skeleton(sample: &str) -> String {
    sample
        .chars()
        .map(|c| confusable(c).unwrap_or(c))
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Scan for unicode smuggling signals. The flag set is sorted for a
/// stable header value.
pub fn scan_flags(raw: &str, normalized: &str) -> BTreeSet<String> {
    let mut flags = BTreeSet::new();
    if raw.chars().any(|c| ZWC.contains(&c)) {
        flags.insert("zwc".to_string());
    }
    if raw.chars().any(|c| BIDI.contains(&c)) {
        flags.insert("bidi".to_string());
    }
    if raw.chars().any(is_emoji) {
        flags.insert("emoji".to_string());
    }
    if skeleton(raw) != raw || normalized != raw {
        flags.insert("confusables".to_string());
    }
    let mut scripts = BTreeSet::new();
    for c in raw.chars().filter(|c| c.is_alphabetic()) {
        match script(c) {
            Script::Latin => {
                scripts.insert("latin");
            }
            Script::Cyrillic => {
                scripts.insert("cyrillic");
            }
            Script::Greek => {
                scripts.insert("greek");
            }
            Script::Other => {}
        }
    }
    if scripts.len() >= 2 {
        flags.insert("mixed".to_string());
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii_has_no_flags() {
        let raw = "hello world /api/v1";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_zero_width_flagged() {
        let raw = "hel\u{200b}lo";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.contains("zwc"));
    }

    #[test]
    fn test_bidi_flagged() {
        let raw = "abc\u{202e}def";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.contains("bidi"));
    }

    #[test]
    fn test_cyrillic_confusable_flagged_and_mapped() {
        // "раssword" with Cyrillic er and a.
        let raw = "\u{0440}\u{0430}ssword";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.contains("confusables"));
        assert_eq!(skeleton(raw), "password");
    }

    #[test]
    fn test_mixed_scripts_flagged() {
        // Latin "pay" + Cyrillic "pal".
        let raw = "pay\u{043f}\u{0430}\u{043b}";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.contains("mixed"));
    }

    #[test]
    fn test_emoji_flagged() {
        let raw = "launch \u{1F680} now";
        let flags = scan_flags(raw, &normalize(raw));
        assert!(flags.contains("emoji"));
    }

    #[test]
    fn test_flags_are_sorted_for_header() {
        let raw = "\u{0440}ay \u{1F680} \u{200b}";
        let flags = scan_flags(raw, &normalize(raw));
        let csv: Vec<&str> = flags.iter().map(|s| s.as_str()).collect();
        let mut sorted = csv.clone();
        sorted.sort();
        assert_eq!(csv, sorted);
    }

    #[test]
    fn test_skeleton_strips_combining_marks() {
        let raw = "e\u{0301}vil"; // e + combining acute
        assert_eq!(skeleton(raw), "evil");
    }
}
