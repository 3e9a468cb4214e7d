use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{error, info, warn};

use crate::backend::{InferenceBackend, TractBackend};
use crate::errors::{LoadError, PredictError};
use crate::labels::load_labels;
use crate::models::ClassificationResult;
use crate::preprocess::Preprocessing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            _ if s.starts_with("cuda") => Ok(Device::Gpu),
            _ => Err(format!("unknown device {s:?}, expected cpu or gpu")),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu => f.write_str("gpu"),
        }
    }
}

/// Everything `ModelHandle::load` needs, resolved by startup wiring.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub device: Device,
    pub preprocessing: Preprocessing,
}

/// A fully initialised model. Never mutated after construction.
pub struct ModelHandle {
    backend: Box<dyn InferenceBackend>,
    labels: Vec<String>,
    device: Device,
    preprocessing: Preprocessing,
}

impl ModelHandle {
    /// Reads the ONNX artifact and class table. Blocking; call once at startup.
    pub fn load(options: &LoadOptions) -> Result<Self, LoadError> {
        let device = match options.device {
            Device::Cpu => Device::Cpu,
            Device::Gpu => {
                warn!("GPU requested but tract executes on CPU only, using cpu");
                Device::Cpu
            }
        };

        let input_size = options.preprocessing.input_size;
        let backend = TractBackend::load(&options.model_path, input_size)?;
        let labels = load_labels(&options.labels_path)?;

        Self::new(Box::new(backend), labels, device, options.preprocessing)
    }

    pub fn new(
        backend: Box<dyn InferenceBackend>,
        labels: Vec<String>,
        device: Device,
        preprocessing: Preprocessing,
    ) -> Result<Self, LoadError> {
        if let Some(outputs) = backend.output_width() {
            if outputs != labels.len() {
                return Err(LoadError::LabelMismatch {
                    outputs,
                    labels: labels.len(),
                });
            }
        }

        Ok(Self {
            backend,
            labels,
            device,
            preprocessing,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn predict(&self, image_bytes: &[u8]) -> Result<ClassificationResult, PredictError> {
        let rgb = self.preprocessing.decode(image_bytes)?;
        let input = self.preprocessing.to_tensor(rgb);
        let scores = self.backend.forward(&input)?;

        if scores.is_empty() {
            return Err(PredictError::Inference("empty model output".into()));
        }
        if scores.len() != self.labels.len() {
            return Err(PredictError::Inference(format!(
                "{} scores for {} classes",
                scores.len(),
                self.labels.len()
            )));
        }

        let probabilities = to_distribution(&scores);
        let (index, confidence) = top1(&probabilities)
            .ok_or_else(|| PredictError::Inference("no finite scores".into()))?;
        let class_name = self
            .labels
            .get(index)
            .cloned()
            .ok_or_else(|| PredictError::Inference(format!("no class {index}")))?;

        Ok(ClassificationResult {
            class_name,
            confidence: round_confidence(confidence),
        })
    }
}

/// Returns the scores unchanged when they already form a probability
/// distribution, otherwise treats them as logits and applies softmax.
fn to_distribution(scores: &[f32]) -> Vec<f32> {
    let is_distribution = scores
        .iter()
        .all(|p| p.is_finite() && (0.0..=1.0).contains(p))
        && (scores.iter().sum::<f32>() - 1.0).abs() <= 1e-3;
    if is_distribution {
        return scores.to_vec();
    }

    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return scores.to_vec();
    }

    let exps: Vec<f32> = scores
        .iter()
        .map(|s| if s.is_finite() { (s - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Highest finite score. Ties resolve to the lowest class index.
fn top1(probabilities: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &p) in probabilities.iter().enumerate() {
        if !p.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if p <= current => {}
            _ => best = Some((index, p)),
        }
    }
    best
}

fn round_confidence(p: f32) -> f64 {
    let p = (p as f64).clamp(0.0, 1.0);
    (p * 10_000.0).round() / 10_000.0
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum ServiceState {
    Uninitialized,
    Loading,
    Ready(Arc<ModelHandle>),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not loaded yet; retrying later may succeed.
    Starting,
    Ready,
    /// Load failed; permanent for the process lifetime.
    Failed,
}

/// Owns the single model instance of the process.
///
/// `Uninitialized -> Loading -> Ready | Failed`. The handle is published only
/// once fully built, so readers observe either no model or a usable one.
pub struct ClassifierService {
    state: RwLock<ServiceState>,
}

impl Default for ClassifierService {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServiceState::Uninitialized),
        }
    }

    pub fn load(&self, options: &LoadOptions) -> Result<(), LoadError> {
        info!(
            "Loading classification model from {} (labels: {}, device: {})",
            options.model_path.display(),
            options.labels_path.display(),
            options.device
        );
        self.load_with(|| ModelHandle::load(options))
    }

    /// Runs `loader` outside the lock and publishes its outcome. Only the
    /// first call does anything; later ones fail with `AlreadyLoaded`.
    pub fn load_with<F>(&self, loader: F) -> Result<(), LoadError>
    where
        F: FnOnce() -> Result<ModelHandle, LoadError>,
    {
        {
            let mut state = self.write();
            match *state {
                ServiceState::Uninitialized => *state = ServiceState::Loading,
                _ => return Err(LoadError::AlreadyLoaded),
            }
        }

        let outcome = match panic::catch_unwind(AssertUnwindSafe(loader)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let cause = panic_message(payload.as_ref());
                let reason = format!("model loader panicked: {cause}");
                Err(LoadError::Incompatible(reason))
            }
        };

        let mut state = self.write();
        match outcome {
            Ok(handle) => {
                info!(
                    "Classification model ready: {} classes on {}",
                    handle.labels().len(),
                    handle.device()
                );
                *state = ServiceState::Ready(Arc::new(handle));
                Ok(())
            }
            Err(e) => {
                error!("Failed to load classification model: {}", e);
                *state = ServiceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    pub fn readiness(&self) -> Readiness {
        match *self.read() {
            ServiceState::Uninitialized | ServiceState::Loading => Readiness::Starting,
            ServiceState::Ready(_) => Readiness::Ready,
            ServiceState::Failed(_) => Readiness::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Cause of a failed load, for operator diagnostics.
    pub fn failure(&self) -> Option<String> {
        match &*self.read() {
            ServiceState::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    pub fn predict(&self, image_bytes: &[u8]) -> Result<ClassificationResult, PredictError> {
        let handle = match &*self.read() {
            ServiceState::Ready(handle) => Arc::clone(handle),
            _ => return Err(PredictError::NotLoaded),
        };
        handle.predict(image_bytes)
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
