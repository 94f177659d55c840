use serde::{Deserialize, Serialize};

use super::error::TaskError;

/// One multimodal input unit of a request's prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Chunk {
    Text {
        tokens: Vec<u32>,
    },
    Image {
        width: u32,
        height: u32,
        channels: u8,
        pixels: Vec<u8>,
        /// Tokens the projector emits for this tile.
        n_tokens: usize,
    },
    Audio {
        sample_rate: u32,
        samples: Vec<f32>,
        n_tokens: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Image,
    Audio,
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

impl Chunk {
    pub fn text(tokens: impl Into<Vec<u32>>) -> Self {
        Self::Text {
            tokens: tokens.into(),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        match self {
            Self::Text { .. } => ChunkKind::Text,
            Self::Image { .. } => ChunkKind::Image,
            Self::Audio { .. } => ChunkKind::Audio,
        }
    }

    /// Token footprint used against the batch token budget.
    pub fn n_tokens(&self) -> usize {
        match self {
            Self::Text { tokens } => tokens.len(),
            Self::Image { n_tokens, .. } | Self::Audio { n_tokens, .. } => *n_tokens,
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            Self::Text { tokens } => {
                if tokens.is_empty() {
                    return Err(TaskError::MalformedChunk("empty text chunk".to_string()));
                }
            }
            Self::Image {
                width,
                height,
                channels,
                pixels,
                ..
            } => {
                if *width == 0 || *height == 0 || *channels == 0 {
                    return Err(TaskError::MalformedChunk(format!(
                        "image has zero dimension ({}x{}x{})",
                        width, height, channels
                    )));
                }
                let expected = *width as usize * *height as usize * *channels as usize;
                if pixels.len() != expected {
                    return Err(TaskError::MalformedChunk(format!(
                        "image buffer holds {} bytes, expected {}",
                        pixels.len(),
                        expected
                    )));
                }
            }
            Self::Audio {
                sample_rate,
                samples,
                ..
            } => {
                if *sample_rate == 0 {
                    return Err(TaskError::MalformedChunk(
                        "audio sample rate is zero".to_string(),
                    ));
                }
                if samples.is_empty() {
                    return Err(TaskError::MalformedChunk("empty audio chunk".to_string()));
                }
                if samples.iter().any(|s| !s.is_finite()) {
                    return Err(TaskError::MalformedChunk(
                        "audio contains non-finite samples".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
