//! Query/answer language-consistency gate.
//!
//! The final-answer correlation judge first checks that the answer is in
//! the query's language; a Chinese query answered in English (or the
//! reverse) scores 0.0 without spending an LLM call. Detection is by
//! character ratio: CJK vs ASCII letters, with separate thresholds for
//! query and answer. Text with no language-bearing characters at all is
//! treated as consistent.

/// Threshold for calling the query's language.
pub const QUERY_LANGUAGE_THRESHOLD: f64 = 0.6;
/// Threshold for calling the answer's language.
pub const ANSWER_LANGUAGE_THRESHOLD: f64 = 0.7;

/// A detected dominant language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// Dominantly CJK text.
    Chinese,
    /// Dominantly ASCII-letter text.
    English,
}

const fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3000}'..='\u{303F}'
        | '\u{FF00}'..='\u{FFEF}'
    )
}

/// Count language-bearing characters: `(cjk, latin)`.
#[must_use]
pub fn language_profile(text: &str) -> (usize, usize) {
    let mut cjk = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if c.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    (cjk, latin)
}

/// The dominant language of `text`, when one side clears `threshold`.
/// Returns `None` for mixed text or text with no language-bearing
/// characters.
#[must_use]
pub fn dominant_language(text: &str, threshold: f64) -> Option<Language> {
    let (cjk, latin) = language_profile(text);
    let total = cjk + latin;
    if total == 0 {
        return None;
    }
    let cjk_ratio = cjk as f64 / total as f64;
    if cjk_ratio >= threshold {
        Some(Language::Chinese)
    } else if 1.0 - cjk_ratio >= threshold {
        Some(Language::English)
    } else {
        None
    }
}

/// Whether the answer's language is consistent with the query's.
///
/// Only a determinate mismatch counts as inconsistent; indeterminate text
/// (mixed, or no letters at all) passes.
#[must_use]
pub fn language_consistent(query: &str, answer: &str) -> bool {
    let (cjk, latin) = language_profile(answer);
    if cjk + latin == 0 {
        return true;
    }
    match (
        dominant_language(query, QUERY_LANGUAGE_THRESHOLD),
        dominant_language(answer, ANSWER_LANGUAGE_THRESHOLD),
    ) {
        (Some(q), Some(a)) => q == a,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dominant_language() {
        assert_eq!(
            dominant_language("What is the weather tomorrow?", QUERY_LANGUAGE_THRESHOLD),
            Some(Language::English)
        );
        assert_eq!(
            dominant_language("明天的天气怎么样", QUERY_LANGUAGE_THRESHOLD),
            Some(Language::Chinese)
        );
        assert_eq!(dominant_language("...!!!", QUERY_LANGUAGE_THRESHOLD), None);
    }

    #[test]
    fn chinese_answer_to_english_query_is_inconsistent() {
        assert!(!language_consistent(
            "What is the capital of Japan?",
            "日本的首都是东京。"
        ));
        assert!(language_consistent("What is 12 x 7?", "The answer is 84."));
        assert!(language_consistent("明天的天气怎么样", "明天多云,气温十四度。"));
    }

    #[test]
    fn punctuation_only_answer_is_consistent() {
        assert!(language_consistent("What is the weather?", "42 --- !!!"));
        assert!(language_consistent("", ""));
    }
}
