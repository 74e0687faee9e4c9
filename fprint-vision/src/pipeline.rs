use crate::capture::RawImage;
use crate::embedding::{Descriptor, EmbeddingClient};
use crate::error::Result;
use crate::normalize::{Normalizer, Tensor};

/// Full pipeline: normalize capture → run embedding model
#[derive(Clone)]
pub struct Pipeline {
    pub normalizer: Normalizer,
    pub encoder: EmbeddingClient,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, encoder: EmbeddingClient) -> Self {
        Self {
            normalizer,
            encoder,
        }
    }

    pub fn normalize(&self, raw: &RawImage) -> Result<Tensor> {
        self.normalizer.normalize(raw)
    }

    pub fn embed(&self, tensor: &Tensor) -> Result<Descriptor> {
        self.encoder.embed(tensor)
    }

    /// Process a capture and return its descriptor (convenience method)
    pub fn extract_descriptor(&self, raw: &RawImage) -> Result<Descriptor> {
        let tensor = self.normalize(raw)?;
        self.embed(&tensor)
    }
}
