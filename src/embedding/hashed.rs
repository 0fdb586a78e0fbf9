//! Deterministic feature-hashing embedder.
//!
//! Lowercased word tokens and their character trigrams are hashed (FNV-1a)
//! into a fixed number of signed buckets, then L2-normalized. Texts sharing
//! vocabulary land close together, which is enough for offline use and tests.

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Trigram features weigh less than whole words.
const TRIGRAM_WEIGHT: f32 = 0.5;

pub struct HashedEmbeddingProvider {
    dimensions: usize,
}

impl HashedEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();

        let mut saw_word = false;
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            saw_word = true;
            self.add_feature(&mut v, word, 1.0);

            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.add_feature(&mut v, &format!("#{trigram}"), TRIGRAM_WEIGHT);
                }
            }
        }

        // Punctuation-only input still gets a stable, non-zero vector
        if !saw_word {
            self.add_feature(&mut v, &format!("raw:{text}"), 1.0);
        }

        Ok(l2_normalize(&v))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}
