/// Rough token estimate for populating `usage` fields. This is never used
/// for control flow (truncation, context-window checks) — only to give
/// clients a plausible `prompt_tokens`/`completion_tokens` number, matching
/// what the upstream itself does not report.
///
/// Heuristic: average English text tokenizes to roughly 4 bytes per token;
/// CJK and other multi-byte text runs closer to 1-2 characters per token.
/// We split the difference by counting chars, weighting non-ASCII chars
/// heavier than ASCII ones.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let mut weighted = 0.0f64;
    for ch in text.chars() {
        weighted += if ch.is_ascii() { 0.25 } else { 1.0 };
    }
    weighted.ceil().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn ascii_text_uses_quarter_weight() {
        let estimate = estimate_tokens("abcdefgh");
        assert_eq!(estimate, 2);
    }

    #[test]
    fn non_ascii_text_weighs_heavier_than_ascii() {
        let ascii = estimate_tokens("aaaa");
        let cjk = estimate_tokens("你好吗呀");
        assert!(cjk > ascii);
    }

    #[test]
    fn single_char_never_rounds_to_zero() {
        assert_eq!(estimate_tokens("a"), 1);
    }
}
