//! Content size estimation.
//!
//! Sizes of pinned context, memory entries, and model prompts are measured
//! in estimated tokens. The estimator is an injected pure function so
//! callers can swap in a real tokenizer; the default is a chars-per-token
//! heuristic.

use std::fmt;
use std::sync::Arc;

/// Default chars-per-token ratio for the heuristic estimator.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Deterministic content → size function, monotonic in content length.
#[derive(Clone)]
pub struct TokenEstimator {
    estimate: Arc<dyn Fn(&str) -> u64 + Send + Sync>,
    label: String,
}

impl TokenEstimator {
    /// `ceil(chars / ratio)`. Non-positive or non-finite ratios fall back to
    /// [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn chars_per_token(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() && ratio > 0.0 {
            ratio
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self {
            estimate: Arc::new(move |content: &str| {
                (content.chars().count() as f64 / ratio).ceil() as u64
            }),
            label: format!("chars_per_token({ratio})"),
        }
    }

    /// Wrap an arbitrary estimator function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> u64 + Send + Sync + 'static,
    {
        Self {
            estimate: Arc::new(f),
            label: "custom".into(),
        }
    }

    pub fn estimate(&self, content: &str) -> u64 {
        (self.estimate)(content)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::chars_per_token(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenEstimator").field(&self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rounds_up() {
        let est = TokenEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abcdefg"), 2);
        assert_eq!(est.estimate("abcdefgh"), 3);
    }

    #[test]
    fn monotonic_in_length() {
        let est = TokenEstimator::default();
        let mut last = 0;
        for n in 0..200 {
            let size = est.estimate(&"x".repeat(n));
            assert!(size >= last);
            last = size;
        }
    }

    #[test]
    fn bad_ratio_uses_default() {
        let a = TokenEstimator::chars_per_token(0.0);
        let b = TokenEstimator::default();
        assert_eq!(a.estimate("hello world"), b.estimate("hello world"));
    }

    #[test]
    fn custom_function() {
        let est = TokenEstimator::from_fn(|s| s.len() as u64);
        assert_eq!(est.estimate("abcd"), 4);
        assert!(format!("{est:?}").contains("custom"));
    }
}
