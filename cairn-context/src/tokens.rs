//! Approximate token counting for context budgets.

/// Estimates how many model tokens a piece of text will consume.
///
/// Budgets only need to be approximately right, so implementations are free to trade
/// accuracy for speed. Swap in a real tokenizer by implementing this trait.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Estimates tokens as `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    /// Four characters per token, a common rule of thumb for English and code.
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

impl<T: TokenEstimator + ?Sized> TokenEstimator for &T {
    fn estimate(&self, text: &str) -> usize {
        (**self).estimate(text)
    }
}

/// Estimates tokens with the default [`CharRatioEstimator`].
pub fn estimate_tokens(text: &str) -> usize {
    CharRatioEstimator::default().estimate(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_custom_ratio() {
        let estimator = CharRatioEstimator::new(2);
        assert_eq!(estimator.estimate("abcde"), 3);
        assert_eq!(CharRatioEstimator::new(0).estimate("abc"), 3);
    }
}
