use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::classifier::{Device, LoadOptions};
use crate::errors::ConfigError;
use crate::preprocess::{Normalization, Preprocessing};

const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Startup configuration read from `CLASSIFIER_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub device: Device,
    pub preprocessing: Preprocessing,
    pub max_upload_bytes: usize,
    pub inference_timeout: Duration,
    pub cors_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            model_path: PathBuf::from("models/best.onnx"),
            labels_path: PathBuf::from("models/labels.txt"),
            device: Device::Cpu,
            preprocessing: Preprocessing::default(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            inference_timeout: Duration::from_secs(10),
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from any key lookup, falling back to defaults
    /// for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let preprocessing = Preprocessing {
            input_size: parse_positive(
                &lookup,
                "CLASSIFIER_INPUT_SIZE",
                defaults.preprocessing.input_size,
            )?,
            normalization: parse(
                &lookup,
                "CLASSIFIER_NORMALIZATION",
                defaults.preprocessing.normalization,
            )?,
            max_dimension: parse_positive(
                &lookup,
                "CLASSIFIER_MAX_IMAGE_DIMENSION",
                defaults.preprocessing.max_dimension,
            )?,
        };

        let timeout_ms = parse_positive(
            &lookup,
            "CLASSIFIER_INFERENCE_TIMEOUT_MS",
            defaults.inference_timeout.as_millis() as u64,
        )?;

        let cors_origins = match lookup("CLASSIFIER_CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.cors_origins,
        };

        let bind_addr = lookup("CLASSIFIER_BIND_ADDR");

        Ok(Self {
            bind_addr: bind_addr.unwrap_or(defaults.bind_addr),
            model_path: lookup("CLASSIFIER_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            labels_path: lookup("CLASSIFIER_LABELS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.labels_path),
            device: parse(&lookup, "CLASSIFIER_DEVICE", defaults.device)?,
            preprocessing,
            max_upload_bytes: parse_positive(
                &lookup,
                "CLASSIFIER_MAX_UPLOAD_BYTES",
                defaults.max_upload_bytes,
            )?,
            inference_timeout: Duration::from_millis(timeout_ms),
            cors_origins,
        })
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            model_path: self.model_path.clone(),
            labels_path: self.labels_path.clone(),
            device: self.device,
            preprocessing: self.preprocessing,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: T::Err::to_string(&e),
            value,
        }),
    }
}

fn parse_positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
    T::Err: ToString,
{
    let value = parse(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: lookup(key).unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
