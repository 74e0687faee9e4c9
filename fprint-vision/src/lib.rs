pub mod capture;
pub mod embedding;
pub mod error;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod video;

// Re-export commonly used types
pub use capture::{Capture, Captured, FileCapture, RawImage};
pub use embedding::{Descriptor, EmbeddingClient, EmbeddingModel, DESCRIPTOR_LEN};
pub use error::VisionError;
pub use model::OrtModel;
pub use normalize::{GuideWindow, Normalizer, Tensor, INPUT_SIZE};
pub use pipeline::Pipeline;
pub use video::Camera;
