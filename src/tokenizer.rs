//! Token cost estimation for budget checks.
//!
//! The estimate does not try to reproduce the provider's BPE exactly.  It
//! takes the larger of a character based approximation (about four characters
//! per token) and the number of pre-tokenizer pieces, where a piece is a
//! maximal run of letters, digits or punctuation.  Both quantities can only
//! grow when two strings are joined, so a request cannot slip under the
//! budget by concatenating its messages.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::ChatMessage;

static PIECE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\p{L}+|\p{N}+|[^\s\p{L}\p{N}]+").expect("static pattern"));

const CHARS_PER_TOKEN: usize = 4;

/// Deterministic token estimator with optional text normalisation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenEstimator {
    /// Decompose to NFD and drop combining marks before counting.
    pub strip_diacritics: bool,
    /// Remove `\n` and `\r` before counting.
    pub strip_newlines: bool,
}

impl TokenEstimator {
    pub fn new(strip_diacritics: bool, strip_newlines: bool) -> Self {
        Self {
            strip_diacritics,
            strip_newlines,
        }
    }

    pub fn estimate(&self, text: &str) -> usize {
        let text = self.normalize(text);
        if text.is_empty() {
            return 0;
        }
        let by_chars = text.chars().count().div_ceil(CHARS_PER_TOKEN);
        let by_pieces = PIECE_RE.find_iter(&text).count();
        by_chars.max(by_pieces)
    }

    /// Sum of the estimates for every message's content.
    pub fn estimate_messages(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.estimate(&m.content)).sum()
    }

    fn normalize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        if self.strip_diacritics && !text.is_ascii() {
            out = Cow::Owned(out.nfd().filter(|c| !is_combining_mark(*c)).collect());
        }
        if self.strip_newlines && out.contains(['\n', '\r']) {
            out = Cow::Owned(out.chars().filter(|c| *c != '\n' && *c != '\r').collect());
        }
        out
    }
}
