use crate::error::Result;

/// Deterministic local embedding provider.
///
/// Projects word and character-trigram features into a fixed-size vector
/// via feature hashing, then L2-normalizes. Texts sharing vocabulary get
/// high cosine similarity, which is what retrieval and guardrail checks
/// need when no hosted embedding API is available (offline deployments,
/// CI). No network, no model files, stable across runs and platforms.
pub struct LocalEmbedder {
    dimensions: usize,
}

/// Weight given to whole-word features relative to trigram features.
/// Words carry most of the signal; trigrams add robustness to
/// inflection ("running" vs "run").
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.4;

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a batch of texts. Infallible, but keeps the same signature
    /// shape as the API-backed provider.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    /// Embed one text into an L2-normalized feature-hashed vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in tokenize(text) {
            bump(&mut vector, &token, WORD_WEIGHT);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    bump(&mut vector, &trigram, TRIGRAM_WEIGHT);
                }
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }

        vector
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Accumulate a feature into its hashed bucket. The sign bit from the
/// hash halves the collision bias (standard hashing-trick construction).
fn bump(vector: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let bucket = (hash % vector.len() as u64) as usize;
    let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
    vector[bucket] += sign * weight;
}

/// FNV-1a 64-bit hash.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
