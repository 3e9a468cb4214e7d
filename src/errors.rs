use std::path::PathBuf;

use thiserror::Error;

/// Failure to bring the model up at startup. Never fatal to the process.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model artifact not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read class labels from {}: {source}", .path.display())]
    Labels {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("class label file {} is malformed: {reason}", .path.display())]
    MalformedLabels { path: PathBuf, reason: String },

    #[error("class label file {} contains no classes", .0.display())]
    NoLabels(PathBuf),

    #[error("model is incompatible with the runtime: {0}")]
    Incompatible(String),

    #[error("model outputs {outputs} scores but {labels} class labels were provided")]
    LabelMismatch { outputs: usize, labels: usize },

    #[error("model has already been loaded")]
    AlreadyLoaded,
}

/// Failure of a single prediction. No partial results are ever produced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictError {
    #[error("model not loaded")]
    NotLoaded,

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Client-supplied upload rejected before it reaches the classifier.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("uploaded file is not an image (declared content type: {0})")]
    NotAnImage(String),

    #[error("upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("no file was found in the upload")]
    MissingFile,

    #[error("malformed upload: {0}")]
    MalformedUpload(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
