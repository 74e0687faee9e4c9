use std::path::Path;

use anyhow::{Context, Result};
#[cfg(any(feature = "openvino", feature = "cuda"))]
use ort::ep::{self, ExecutionProvider};
use ort::{
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Value,
};

use crate::embedding::EmbeddingModel;
use crate::error::VisionError;
use crate::normalize::Tensor;

pub fn session_builder() -> Result<SessionBuilder> {
    #[allow(unused_mut)]
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

/// Siamese fingerprint encoder exported to ONNX: `[1, 96, 96, 1]` in,
/// `[1, 128]` out.
pub struct OrtModel {
    session: Session,
}

impl OrtModel {
    /// Any failure here means enroll and verify cannot run this session.
    pub fn load(path: &Path) -> std::result::Result<Self, VisionError> {
        let session = session_builder()
            .and_then(|b| {
                b.commit_from_file(path)
                    .with_context(|| format!("load embedding model {}", path.display()))
            })
            .map_err(|e| VisionError::ModelUnavailable(format!("{e:#}")))?;
        log::info!("loaded embedding model from {}", path.display());
        Ok(Self { session })
    }
}

impl EmbeddingModel for OrtModel {
    fn infer(&mut self, tensor: &Tensor) -> Result<Vec<f32>> {
        let input = Value::from_array(tensor.array().clone())?;
        let outputs = self.session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        log::debug!("model output shape {:?}", shape.iter().collect::<Vec<_>>());

        // Shape checking is the client's job; pass everything through.
        Ok(data.to_vec())
    }
}
