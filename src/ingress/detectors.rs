//! Tokenizer-aware term scanning.
//!
//! Splits text into tokens, then joins consecutive tokens without a
//! separator and compares the casefolded alphanumeric skeleton against the
//! configured terms. Catches "i g n o r e" and "ig-no-re" style evasions
//! that a plain substring match misses.

use std::collections::HashMap;

fn norm(s: &str) -> String {
    s.chars()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '_'))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Slide over token sequences, joining consecutive tokens and checking for
/// exact normalized term matches. Join length is bounded by the longest
/// term to keep cost linear-ish.
pub fn find_terms_tokenized(text: &str, terms: &[String]) -> HashMap<String, u64> {
    let tokens = tokenize(text);
    if tokens.is_empty() || terms.is_empty() {
        return HashMap::new();
    }

    let mut norm_to_orig: HashMap<String, Vec<&String>> = HashMap::new();
    let mut max_len = 0;
    for term in terms {
        let n = norm(term);
        if n.is_empty() {
            continue;
        }
        max_len = max_len.max(n.len());
        norm_to_orig.entry(n).or_default().push(term);
    }
    if norm_to_orig.is_empty() {
        return HashMap::new();
    }

    let mut hits: HashMap<String, u64> = HashMap::new();
    for i in 0..tokens.len() {
        let mut piece = String::new();
        for token in &tokens[i..] {
            piece.push_str(token);
            if piece.len() > max_len * 2 {
                break;
            }
            let norm_piece = norm(&piece);
            if norm_piece.len() > max_len {
                break;
            }
            if let Some(origs) = norm_to_orig.get(&norm_piece) {
                for orig in origs {
                    *hits.entry((*orig).clone()).or_insert(0) += 1;
                }
            }
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_direct_hit() {
        let hits = find_terms_tokenized("please jailbreak the model", &terms(&["jailbreak"]));
        assert_eq!(hits.get("jailbreak"), Some(&1));
    }

    #[test]
    fn test_split_token_evasion() {
        let hits = find_terms_tokenized("jail break attempt", &terms(&["jailbreak"]));
        assert_eq!(hits.get("jailbreak"), Some(&1));
    }

    #[test]
    fn test_punctuated_evasion() {
        let hits = find_terms_tokenized("j-a-i-l-b-r-e-a-k now", &terms(&["jailbreak"]));
        assert_eq!(hits.get("jailbreak"), Some(&1));
    }

    #[test]
    fn test_case_insensitive() {
        let hits = find_terms_tokenized("JailBreak", &terms(&["jailbreak"]));
        assert_eq!(hits.get("jailbreak"), Some(&1));
    }

    #[test]
    fn test_clean_text_has_no_hits() {
        let hits = find_terms_tokenized("hello there general kenobi", &terms(&["jailbreak"]));
        assert!(hits.is_empty());
    }

    #[test]
    fn test_multiple_terms_counted_separately() {
        let hits = find_terms_tokenized(
            "jailbreak then exfiltrate then jailbreak",
            &terms(&["jailbreak", "exfiltrate"]),
        );
        assert_eq!(hits.get("jailbreak"), Some(&2));
        assert_eq!(hits.get("exfiltrate"), Some(&1));
    }
}
