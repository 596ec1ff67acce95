//! Token counting for generated answers.
//!
//! Counts are used for throughput only, so a deterministic approximation of a
//! BPE vocabulary is sufficient. Text is pre-split the way byte-level BPE
//! tokenizers do (letters, digit groups, punctuation runs); each CJK ideograph
//! or syllable counts as one token and letter runs count one token per
//! `chars_per_token` characters.
//!
//! No vocabulary is loaded, so counts are estimates: they will not equal the
//! token ids a model's own BPE tokenizer produces, and `token_count` and
//! throughput are only comparable between runs counted by the same
//! [`Tokenizer`]. Plug a vocabulary-backed implementation in through the trait
//! when exact model token counts are needed.

use regex::Regex;

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

const PRE_TOKENIZE: &str = concat!(
    r"[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]",
    r"|[[\p{L}\p{M}]--[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]]+",
    r"|\p{N}{1,3}",
    r"|[^\s\p{L}\p{M}\p{N}]",
);

pub struct RegexTokenizer {
    pattern: Regex,
    chars_per_token: usize,
}

impl RegexTokenizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(PRE_TOKENIZE)?,
            chars_per_token: 4,
        })
    }

    /// Letters per token for non-CJK words; clamped to at least 1.
    pub fn with_chars_per_token(mut self, chars_per_token: usize) -> Self {
        self.chars_per_token = chars_per_token.max(1);
        self
    }
}

impl Tokenizer for RegexTokenizer {
    fn count(&self, text: &str) -> usize {
        self.pattern
            .find_iter(text)
            .map(|piece| {
                let chars = piece.as_str().chars().count();
                let is_word = piece
                    .as_str()
                    .chars()
                    .next()
                    .is_some_and(char::is_alphabetic);
                if is_word && chars > 1 {
                    chars.div_ceil(self.chars_per_token)
                } else {
                    1
                }
            })
            .sum()
    }
}
