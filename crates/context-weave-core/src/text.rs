//! Shared text normalization.

use std::collections::BTreeSet;

/// Lowercased alphanumeric word tokens. `_` counts as a word character so
/// identifiers like `parse_token` stay whole; one-character tokens are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct tokens of `text`.
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Fix JWT parse_token() in src/auth, a b"),
            vec!["fix", "jwt", "parse_token", "in", "src", "auth"]
        );
    }

    #[test]
    fn test_token_set_dedups() {
        assert_eq!(token_set("a cat, the Cat").len(), 2);
    }
}
