//! Local feature-hashing embedder.
//!
//! Unigram and bigram features are hashed into signed buckets and the vector is
//! L2-normalised, so cosine similarity reduces to a dot product. Identical text
//! always maps to an identical vector, across processes and releases.

pub const DEFAULT_DIMENSIONS: usize = 384;

/// Text → vector in the store's shared embedding space.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

pub struct HashEmbedder {
    model_id: String,
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self::with_dimensions(model_id, DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(model_id: &str, dimensions: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimensions: dimensions.max(8),
        }
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0_f32; self.dimensions];
        for feature in features(text) {
            let hash = stable_hash(&feature);
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
            vector[index] += sign * weight;
        }
        normalize(&mut vector);
        vector
    }
}

fn stable_hash(feature: &str) -> u64 {
    let digest = blake3::hash(feature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

fn features(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    let mut out = Vec::with_capacity(words.len() * 2);
    for (i, word) in words.iter().enumerate() {
        out.push(format!("w:{}", word));
        if let Some(next) = words.get(i + 1) {
            out.push(format!("b:{}_{}", word, next));
        }
    }
    out
}

fn normalize(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    if norm <= 0.0 {
        return;
    }
    for v in values {
        *v = (f64::from(*v) / norm) as f32;
    }
}

/// Dot product of two normalised vectors; 0.0 on dimension mismatch or empty input.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    left.iter()
        .zip(right.iter())
        .map(|(l, r)| f64::from(*l) * f64::from(*r))
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text_identical_vector() {
        let e = HashEmbedder::new("local-hash-v1");
        let a = e.embed("Lusail luxury residential absorption slowed in 2024");
        let b = e.embed("Lusail luxury residential absorption slowed in 2024");
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let e = HashEmbedder::new("local-hash-v1");
        let q = e.embed("hotel occupancy rates Doha");
        let near = e.embed("Doha hotel occupancy rates climbed to 78%");
        let far = e.embed("water desalination capacity expansion tender");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_empty_text_zero_vector() {
        let e = HashEmbedder::with_dimensions("x", 16);
        let v = e.embed("   ");
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
