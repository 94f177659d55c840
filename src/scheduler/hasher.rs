use rayon::prelude::*;

use crate::types::{Chunk, Fingerprint, TaskError};

/// Payloads below this size are hashed inline; rayon overhead dominates otherwise.
const PARALLEL_THRESHOLD_BYTES: usize = 64 * 1024;

const TAG_TEXT: u8 = 0x01;
const TAG_IMAGE: u8 = 0x02;
const TAG_AUDIO: u8 = 0x03;

/// Content fingerprinting for chunks. Namespaced so that embeddings from
/// different models never share a cache key.
#[derive(Debug, Clone)]
pub struct ChunkHasher {
    namespace: String,
}

impl ChunkHasher {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fingerprint(&self, chunk: &Chunk) -> Result<Fingerprint, TaskError> {
        chunk.validate()?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.namespace.len() as u64).to_le_bytes());
        hasher.update(self.namespace.as_bytes());

        match chunk {
            Chunk::Text { tokens } => {
                hasher.update(&[TAG_TEXT]);
                hasher.update(&(tokens.len() as u64).to_le_bytes());
                for t in tokens {
                    hasher.update(&t.to_le_bytes());
                }
            }
            Chunk::Image {
                width,
                height,
                channels,
                pixels,
                ..
            } => {
                hasher.update(&[TAG_IMAGE, *channels]);
                hasher.update(&width.to_le_bytes());
                hasher.update(&height.to_le_bytes());
                if pixels.len() >= PARALLEL_THRESHOLD_BYTES {
                    hasher.update_rayon(pixels);
                } else {
                    hasher.update(pixels);
                }
            }
            Chunk::Audio {
                sample_rate,
                samples,
                ..
            } => {
                hasher.update(&[TAG_AUDIO]);
                hasher.update(&sample_rate.to_le_bytes());
                hasher.update(&(samples.len() as u64).to_le_bytes());
                for s in samples {
                    // -0.0 and 0.0 are the same sample
                    let s = if *s == 0.0 { 0.0f32 } else { *s };
                    hasher.update(&s.to_le_bytes());
                }
            }
        }

        Ok(Fingerprint::from_hash(hasher.finalize()))
    }

    /// One fingerprint (or failure) per chunk, in input order.
    pub fn fingerprint_all(&self, chunks: &[Chunk]) -> Vec<Result<Fingerprint, TaskError>> {
        chunks
            .par_iter()
            .map(|chunk| self.fingerprint(chunk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fill: u8) -> Chunk {
        Chunk::Image {
            width: 4,
            height: 4,
            channels: 3,
            pixels: vec![fill; 48],
            n_tokens: 16,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = ChunkHasher::new("model-a");
        let h1 = hasher.fingerprint(&Chunk::text(vec![1, 2, 3])).unwrap();
        let h2 = hasher.fingerprint(&Chunk::text(vec![1, 2, 3])).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_content_changes_hash() {
        let hasher = ChunkHasher::new("model-a");
        assert_ne!(
            hasher.fingerprint(&image(0)).unwrap(),
            hasher.fingerprint(&image(1)).unwrap()
        );
    }

    #[test]
    fn test_namespace_separates_models() {
        let a = ChunkHasher::new("model-a").fingerprint(&image(7)).unwrap();
        let b = ChunkHasher::new("model-b").fingerprint(&image(7)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_signed_zero_normalized() {
        let hasher = ChunkHasher::new("m");
        let pos = Chunk::Audio {
            sample_rate: 16_000,
            samples: vec![0.0, 0.5],
            n_tokens: 1,
        };
        let neg = Chunk::Audio {
            sample_rate: 16_000,
            samples: vec![-0.0, 0.5],
            n_tokens: 1,
        };
        assert_eq!(
            hasher.fingerprint(&pos).unwrap(),
            hasher.fingerprint(&neg).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_all_isolates_failures() {
        let hasher = ChunkHasher::new("m");
        let chunks = vec![Chunk::text(vec![1]), Chunk::text(vec![]), image(3)];
        let out = hasher.fingerprint_all(&chunks);
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(TaskError::MalformedChunk(_))));
        assert_eq!(out[2].as_ref().unwrap(), &hasher.fingerprint(&image(3)).unwrap());
    }

    #[test]
    fn test_large_image_parallel_path() {
        let hasher = ChunkHasher::new("m");
        let big = Chunk::Image {
            width: 256,
            height: 256,
            channels: 3,
            pixels: vec![9; 256 * 256 * 3],
            n_tokens: 256,
        };
        let a = hasher.fingerprint(&big).unwrap();
        let b = hasher.fingerprint(&big.clone()).unwrap();
        assert_eq!(a, b);
    }
}
