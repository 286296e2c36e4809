//! Hashing word tokenizer for language instructions.

use anyhow::{ensure, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;
pub const EOS_ID: usize = 2;
const RESERVED: usize = 3;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(word: &str) -> u64 {
    word.bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(FNV_PRIME))
}

/// Lowercases, splits on whitespace and hashes each word into the vocabulary.
///
/// Ids below 3 are reserved: `<pad>` = 0, `<unk>` = 1, `<eos>` = 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTokenizer {
    pub vocab_size: usize,
    pub max_tokens: usize,
}

impl WordTokenizer {
    pub fn new(vocab_size: usize, max_tokens: usize) -> Result<Self> {
        ensure!(
            vocab_size > RESERVED,
            "vocabulary of {} leaves no room beyond the reserved ids",
            vocab_size
        );
        ensure!(max_tokens > 0, "max_tokens must be positive");
        Ok(Self {
            vocab_size,
            max_tokens,
        })
    }

    pub fn token_id(&self, word: &str) -> usize {
        let word: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        if word.is_empty() {
            return UNK_ID;
        }
        RESERVED + (fnv1a(&word) % (self.vocab_size - RESERVED) as u64) as usize
    }

    /// Exactly `max_tokens` ids: words, `<eos>` when it fits, then `<pad>`.
    /// Empty instructions encode to all padding.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        let mut ids: Vec<usize> = text
            .split_whitespace()
            .map(|w| self.token_id(w))
            .take(self.max_tokens)
            .collect();
        if !ids.is_empty() && ids.len() < self.max_tokens {
            ids.push(EOS_ID);
        }
        ids.resize(self.max_tokens, PAD_ID);
        ids
    }

    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Array2<usize> {
        let mut out = Array2::from_elem((texts.len(), self.max_tokens), PAD_ID);
        for (mut row, text) in out.rows_mut().into_iter().zip(texts) {
            for (slot, id) in row.iter_mut().zip(self.encode(text.as_ref())) {
                *slot = id;
            }
        }
        out
    }
}
