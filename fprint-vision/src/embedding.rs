use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};
use crate::normalize::Tensor;

/// Length of every descriptor produced by the embedding model.
pub const DESCRIPTOR_LEN: usize = 128;

/// Fixed-length float vector standing for one fingerprint capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Black-box model: a normalized tensor in, a vector out.
pub trait EmbeddingModel: Send {
    fn infer(&mut self, tensor: &Tensor) -> anyhow::Result<Vec<f32>>;
}

/// Runs the embedding model once per call and checks what comes back.
///
/// The model sits behind a lock so a timed-out call that is still running
/// keeps exclusive use of it. Later bounded calls fail without spawning
/// while it does.
#[derive(Clone)]
pub struct EmbeddingClient {
    model: Arc<Mutex<Box<dyn EmbeddingModel>>>,
    expected_len: usize,
    timeout: Option<Duration>,
}

impl EmbeddingClient {
    pub fn new(model: Box<dyn EmbeddingModel>) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            expected_len: DESCRIPTOR_LEN,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expected_len(mut self, len: usize) -> Self {
        self.expected_len = len;
        self
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Produces a descriptor. Never retries: a failed inference is reported
    /// as `ModelExecutionFailed`, as is a call exceeding the timeout.
    pub fn embed(&self, tensor: &Tensor) -> Result<Descriptor> {
        let output = match self.timeout {
            None => self.model.lock().infer(tensor),
            Some(timeout) => self.infer_bounded(tensor, timeout)?,
        }
        .map_err(|e| VisionError::ModelExecutionFailed(format!("{e:#}")))?;

        self.validate(output)
    }

    fn infer_bounded(
        &self,
        tensor: &Tensor,
        timeout: Duration,
    ) -> Result<anyhow::Result<Vec<f32>>> {
        // A timed-out call may still hold the model.
        let mut model = self.model.try_lock_arc_for(timeout).ok_or_else(|| {
            log::error!("embedding model still busy after {:?}", timeout);
            VisionError::ModelExecutionFailed(format!(
                "model busy with a timed-out call after {timeout:?}"
            ))
        })?;
        let (tx, rx) = mpsc::channel();
        let tensor = tensor.clone();

        std::thread::Builder::new()
            .name("fprint-infer".into())
            .spawn(move || {
                let out = model.infer(&tensor);
                // The receiver is gone once the caller has timed out.
                let _ = tx.send(out);
            })
            .map_err(|e| VisionError::ModelExecutionFailed(format!("spawning inference: {e}")))?;

        rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => {
                log::error!("embedding model did not answer within {:?}", timeout);
                VisionError::ModelExecutionFailed(format!("inference timed out after {timeout:?}"))
            }
            mpsc::RecvTimeoutError::Disconnected => {
                VisionError::ModelExecutionFailed("inference thread panicked".into())
            }
        })
    }

    fn validate(&self, output: Vec<f32>) -> Result<Descriptor> {
        if output.len() != self.expected_len {
            return Err(VisionError::ModelExecutionFailed(format!(
                "model returned {} values, expected {}",
                output.len(),
                self.expected_len
            )));
        }
        if let Some(i) = output.iter().position(|v| !v.is_finite()) {
            return Err(VisionError::ModelExecutionFailed(format!(
                "model returned non-finite value at index {i}"
            )));
        }
        Ok(Descriptor(output))
    }
}
