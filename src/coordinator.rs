use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use fprint_vision::{
    Capture, Captured, EmbeddingClient, Normalizer, OrtModel, Pipeline, RawImage,
};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::matcher::{self, Decision};
use crate::storage::{DescriptorStore, Loaded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Enroll,
    Verify,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    Confirming,
    Normalizing,
    Embedding,
    Storing,
    Matching,
    Deleting,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Capturing => "capture",
            Phase::Confirming => "confirmation",
            Phase::Normalizing => "image preprocessing",
            Phase::Embedding => "embedding",
            Phase::Storing => "saving",
            Phase::Matching => "matching",
            Phase::Deleting => "deleting",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a workflow ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Enrolled {
        identity: usize,
    },
    Verified {
        decision: Decision,
        /// Set when the store could not be read and was matched as empty.
        warning: Option<Error>,
    },
    Deleted {
        position: usize,
    },
    Cancelled,
    Failed {
        step: Phase,
        error: Error,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Enrolled { identity } => write!(
                f,
                "Fingerprint registered successfully! (ID: {})",
                identity
            ),
            Outcome::Verified { decision, .. } => write!(f, "{}", decision),
            Outcome::Deleted { position } => write!(f, "{} deleted", label(*position)),
            Outcome::Cancelled => write!(f, "Cancelled"),
            Outcome::Failed { step, error } => write!(f, "{} failed: {}", step, error),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("a {0:?} workflow is already in progress")]
pub struct Busy(pub Workflow);

/// Asked once before a delete goes ahead.
pub trait Confirm {
    fn confirm(&mut self, position: usize) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(usize) -> bool,
{
    fn confirm(&mut self, position: usize) -> bool {
        self(position)
    }
}

/// User-visible name for an identity.
pub fn label(identity: usize) -> String {
    format!("Fingerprint {}", identity)
}

/// Releases the single-flight slot when dropped.
struct Slot {
    active: Arc<Mutex<Option<Workflow>>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

enum JobState {
    Finished(Outcome),
    Running(JoinHandle<Outcome>),
}

/// Handle on a started workflow. Processing after the capture (or the
/// delete confirmation) runs on a worker thread and cannot be interrupted.
pub struct Job {
    workflow: Workflow,
    phase: Arc<Mutex<Phase>>,
    state: JobState,
}

impl Job {
    fn finished(workflow: Workflow, phase: Arc<Mutex<Phase>>, outcome: Outcome) -> Self {
        *phase.lock() = match outcome {
            Outcome::Failed { .. } => Phase::Failed,
            Outcome::Cancelled => Phase::Idle,
            _ => Phase::Done,
        };
        Self {
            workflow,
            phase,
            state: JobState::Finished(outcome),
        }
    }

    pub fn workflow(&self) -> Workflow {
        self.workflow
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            JobState::Finished(_) => true,
            JobState::Running(handle) => handle.is_finished(),
        }
    }

    pub fn wait(self) -> Outcome {
        match self.state {
            JobState::Finished(outcome) => outcome,
            JobState::Running(handle) => handle.join().unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                let step = std::mem::replace(&mut *self.phase.lock(), Phase::Failed);
                log::error!("{:?} worker panicked during {}: {}", self.workflow, step, msg);
                Outcome::Failed {
                    step,
                    error: Error::Internal(msg),
                }
            }),
        }
    }
}

/// Sequences capture, normalization, embedding and the store for the
/// enroll, verify and delete workflows. Only one workflow runs at a time.
pub struct Coordinator {
    store: Arc<DescriptorStore>,
    pipeline: std::result::Result<Arc<Pipeline>, Error>,
    threshold: f32,
    active: Arc<Mutex<Option<Workflow>>>,
}

impl Coordinator {
    /// `pipeline` is the outcome of loading the model. A load failure is
    /// logged here once and then fails every enroll and verify.
    pub fn new(
        store: DescriptorStore,
        pipeline: std::result::Result<Pipeline, Error>,
        threshold: f32,
    ) -> Self {
        if let Err(e) = &pipeline {
            log::error!("{}; enroll and verify are disabled", e);
        }
        Self {
            store: Arc::new(store),
            pipeline: pipeline.map(Arc::new),
            threshold,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Delete and listing only; no model is loaded.
    pub fn store_only(store: DescriptorStore, threshold: f32) -> Self {
        Self {
            store: Arc::new(store),
            pipeline: Err(Error::ModelUnavailable("no model loaded".into())),
            threshold,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let store = DescriptorStore::open(cfg.store_path());
        let pipeline = OrtModel::load(&cfg.model_path)
            .map(|model| {
                let encoder =
                    EmbeddingClient::new(Box::new(model)).with_timeout(cfg.inference_timeout());
                Pipeline::new(Normalizer::new(cfg.guide), encoder)
            })
            .map_err(Error::from);
        Self::new(store, pipeline, cfg.threshold)
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// The model load error, if enroll and verify are unavailable.
    pub fn model_error(&self) -> Option<&Error> {
        self.pipeline.as_ref().err()
    }

    /// Workflow currently holding the single-flight slot.
    pub fn active(&self) -> Option<Workflow> {
        *self.active.lock()
    }

    /// Current enrollments, freshly read.
    pub fn enrolled(&self) -> Loaded {
        self.store.load_all()
    }

    pub fn enroll(&self, capture: &mut dyn Capture) -> std::result::Result<Job, Busy> {
        self.start_capture(Workflow::Enroll, capture)
    }

    pub fn verify(&self, capture: &mut dyn Capture) -> std::result::Result<Job, Busy> {
        self.start_capture(Workflow::Verify, capture)
    }

    pub fn delete(
        &self,
        position: usize,
        confirm: &mut dyn Confirm,
    ) -> std::result::Result<Job, Busy> {
        let slot = self.claim(Workflow::Delete)?;
        let phase = Arc::new(Mutex::new(Phase::Confirming));

        if !confirm.confirm(position) {
            log::info!("delete of {} cancelled", label(position));
            return Ok(Job::finished(Workflow::Delete, phase, Outcome::Cancelled));
        }

        let store = Arc::clone(&self.store);
        let worker_phase = Arc::clone(&phase);
        let spawned = spawn_worker(move || {
            let _slot = slot;
            let outcome = run_step(&worker_phase, Phase::Deleting, || store.delete_at(position))
                .map(|()| Outcome::Deleted { position });
            finish(&worker_phase, outcome)
        });
        Ok(self.job(Workflow::Delete, phase, spawned))
    }

    fn start_capture(
        &self,
        workflow: Workflow,
        capture: &mut dyn Capture,
    ) -> std::result::Result<Job, Busy> {
        let slot = self.claim(workflow)?;
        let phase = Arc::new(Mutex::new(Phase::Capturing));

        let pipeline = match &self.pipeline {
            Ok(p) => Arc::clone(p),
            Err(e) => {
                let outcome = Outcome::Failed {
                    step: Phase::Embedding,
                    error: e.clone(),
                };
                return Ok(Job::finished(workflow, phase, outcome));
            }
        };

        let raw = match capture.capture() {
            Ok(Captured::Image(raw)) => raw,
            Ok(Captured::Cancelled) => {
                log::info!("{:?} cancelled during capture", workflow);
                return Ok(Job::finished(workflow, phase, Outcome::Cancelled));
            }
            Err(e) => {
                log::error!("capture failed: {:#}", e);
                let outcome = Outcome::Failed {
                    step: Phase::Capturing,
                    error: Error::InvalidImage(format!("{e:#}")),
                };
                return Ok(Job::finished(workflow, phase, outcome));
            }
        };

        let store = Arc::clone(&self.store);
        let threshold = self.threshold;
        let worker_phase = Arc::clone(&phase);
        let spawned = spawn_worker(move || {
            let _slot = slot;
            let outcome = match workflow {
                Workflow::Enroll => enroll_steps(&pipeline, &store, &raw, &worker_phase),
                _ => verify_steps(&pipeline, &store, &raw, threshold, &worker_phase),
            };
            finish(&worker_phase, outcome)
        });
        Ok(self.job(workflow, phase, spawned))
    }

    fn claim(&self, workflow: Workflow) -> std::result::Result<Slot, Busy> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            log::warn!("{:?} refused: {:?} in progress", workflow, current);
            return Err(Busy(current));
        }
        *active = Some(workflow);
        Ok(Slot {
            active: Arc::clone(&self.active),
        })
    }

    fn job(
        &self,
        workflow: Workflow,
        phase: Arc<Mutex<Phase>>,
        spawned: std::io::Result<JoinHandle<Outcome>>,
    ) -> Job {
        match spawned {
            Ok(handle) => Job {
                workflow,
                phase,
                state: JobState::Running(handle),
            },
            Err(e) => {
                let outcome = Outcome::Failed {
                    step: *phase.lock(),
                    error: Error::Internal(format!("spawning worker: {e}")),
                };
                Job::finished(workflow, phase, outcome)
            }
        }
    }
}

fn spawn_worker<F>(f: F) -> std::io::Result<JoinHandle<Outcome>>
where
    F: FnOnce() -> Outcome + Send + 'static,
{
    std::thread::Builder::new()
        .name("fprint-worker".into())
        .spawn(f)
}

fn enroll_steps(
    pipeline: &Pipeline,
    store: &DescriptorStore,
    raw: &RawImage,
    phase: &Mutex<Phase>,
) -> std::result::Result<Outcome, Outcome> {
    let tensor = run_step(phase, Phase::Normalizing, || Ok(pipeline.normalize(raw)?))?;
    let descriptor = run_step(phase, Phase::Embedding, || Ok(pipeline.embed(&tensor)?))?;
    let identity = run_step(phase, Phase::Storing, || store.append(descriptor))?;
    log::info!("enrolled {}", label(identity));
    Ok(Outcome::Enrolled { identity })
}

fn verify_steps(
    pipeline: &Pipeline,
    store: &DescriptorStore,
    raw: &RawImage,
    threshold: f32,
    phase: &Mutex<Phase>,
) -> std::result::Result<Outcome, Outcome> {
    let tensor = run_step(phase, Phase::Normalizing, || Ok(pipeline.normalize(raw)?))?;
    let probe = run_step(phase, Phase::Embedding, || Ok(pipeline.embed(&tensor)?))?;
    let (decision, warning) = run_step(phase, Phase::Matching, || {
        let loaded = store.load_all();
        Ok((
            matcher::decide(&probe, &loaded.descriptors, threshold),
            loaded.warning,
        ))
    })?;
    log::info!("verification: {}", decision.report());
    Ok(Outcome::Verified { decision, warning })
}

/// Enters `step`, runs it, and turns an error into the terminal outcome.
fn run_step<T>(
    phase: &Mutex<Phase>,
    step: Phase,
    f: impl FnOnce() -> Result<T>,
) -> std::result::Result<T, Outcome> {
    *phase.lock() = step;
    f().map_err(|error| {
        log::error!("{} failed: {}", step, error);
        Outcome::Failed { step, error }
    })
}

fn finish(phase: &Mutex<Phase>, outcome: std::result::Result<Outcome, Outcome>) -> Outcome {
    match outcome {
        Ok(done) => {
            *phase.lock() = Phase::Done;
            done
        }
        Err(failed) => {
            *phase.lock() = Phase::Failed;
            failed
        }
    }
}
