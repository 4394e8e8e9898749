//! Coarse token estimation for budget gating.

/// Estimate the token count of `text` as one token per four characters.
///
/// Not a tokenizer: good enough to keep a prompt under a budget, not for exact
/// model context accounting.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_down() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefghi"), 2);
    }

    #[test]
    fn test_should_count_characters_not_bytes() {
        assert_eq!(estimate_tokens("ñññññññá"), 2);
    }
}
