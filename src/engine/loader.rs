//! Model Loader
//!
//! Reads every configured model once at startup and compiles it for the
//! configured OpenVINO device. The resulting handles are immutable and shared
//! across requests; nothing is reloaded per request.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use openvino::{CompiledModel, Core};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use tracing::info;

use crate::config::{Config, InferenceConfig, ModelConfig};
use crate::error::LoadError;

use super::detector::{ObjectDetector, YoloDetector};
use super::labels::LabelSet;

/// Output layout family of a YOLO checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// `[1, N, 5 + C]`: box, objectness, class scores
    Yolov5,
    /// `[1, 4 + C, N]`: box, class scores
    Yolov8,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Yolov5 => "yolov5",
            ModelFamily::Yolov8 => "yolov8",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolov5" => Ok(ModelFamily::Yolov5),
            "yolov8" => Ok(ModelFamily::Yolov8),
            other => Err(format!("unknown model family `{}`", other)),
        }
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    /// OpenVINO CompiledModel methods are thread-safe in C++, but Rust bindings
    /// require &mut self.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

impl Deref for SafeCompiledModel {
    type Target = CompiledModel;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A compiled model plus everything needed to interpret its output
pub struct LoadedModel {
    pub name: String,
    pub family: ModelFamily,
    pub input_size: (u32, u32),
    pub labels: LabelSet,
    pub compiled: SafeCompiledModel,
}

/// Owns the OpenVINO core used to read and compile artifacts
pub struct ModelLoader {
    core: Core,
    device: String,
}

impl ModelLoader {
    pub fn new(config: &InferenceConfig) -> Result<Self, LoadError> {
        let core = Core::new().map_err(|e| LoadError::Runtime(e.to_string()))?;
        Ok(Self {
            core,
            device: config.device.clone(),
        })
    }

    /// Read, compile and label one model artifact
    pub fn load(&mut self, config: &ModelConfig) -> Result<LoadedModel, LoadError> {
        let (xml, bin) = artifact_paths(&config.path)?;
        let labels = LabelSet::load(config.labels.as_deref())?;

        info!("Loading model: {} ({}) from {}", config.name, config.family, xml.display());
        let start = Instant::now();

        let xml = path_str(&xml)?;
        let bin = bin.as_deref().map(path_str).transpose()?.unwrap_or("");

        let model = self
            .core
            .read_model_from_file(xml, bin)
            .map_err(|e| LoadError::Runtime(format!("failed to read {}: {}", xml, e)))?;
        let compiled = self
            .core
            .compile_model(&model, self.device.as_str().into())
            .map_err(|e| LoadError::Runtime(format!("failed to compile for {}: {}", self.device, e)))?;

        info!(
            "Model {} loaded in {:?} with {} classes",
            config.name,
            start.elapsed(),
            labels.len()
        );

        Ok(LoadedModel {
            name: config.name.clone(),
            family: config.family,
            input_size: (config.input_width, config.input_height),
            labels,
            compiled: SafeCompiledModel(Arc::new(compiled)),
        })
    }
}

/// Resolve the files OpenVINO needs for an artifact.
///
/// ONNX files are self-contained. IR `.xml` graphs carry their weights in a
/// sibling `.bin`, which must exist as well.
pub fn artifact_paths(path: &Path) -> Result<(PathBuf, Option<PathBuf>), LoadError> {
    if !path.is_file() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }

    let is_ir = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("xml"))
        .unwrap_or(false);

    if is_ir {
        let weights = path.with_extension("bin");
        if !weights.is_file() {
            return Err(LoadError::Missing(weights));
        }
        Ok((path.to_path_buf(), Some(weights)))
    } else {
        Ok((path.to_path_buf(), None))
    }
}

fn path_str(path: &Path) -> Result<&str, LoadError> {
    path.to_str()
        .ok_or_else(|| LoadError::Config(format!("non UTF-8 model path {}", path.display())))
}

/// Process-scoped set of ready detectors, keyed by model name
pub struct ModelRegistry {
    detectors: Vec<Arc<dyn ObjectDetector>>,
}

impl ModelRegistry {
    /// First detector is the default
    pub fn new(detectors: Vec<Arc<dyn ObjectDetector>>) -> Result<Self, LoadError> {
        if detectors.is_empty() {
            return Err(LoadError::Config("no models configured".to_string()));
        }
        Ok(Self { detectors })
    }

    /// Load every configured model. Any failure aborts startup.
    pub fn load(config: &Config) -> Result<Self, LoadError> {
        let mut loader = ModelLoader::new(&config.inference)?;

        let mut detectors: Vec<Arc<dyn ObjectDetector>> = Vec::with_capacity(config.models.len());
        for model_config in &config.models {
            let model = loader.load(model_config)?;
            detectors.push(Arc::new(YoloDetector::new(Arc::new(model), &config.inference)));
        }

        Self::new(detectors)
    }

    /// Look up a detector by name, or the default when no name is given
    pub fn get(&self, name: Option<&str>) -> Option<Arc<dyn ObjectDetector>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => self.detectors.first().cloned(),
            Some(name) => self
                .detectors
                .iter()
                .find(|d| d.name().eq_ignore_ascii_case(name))
                .cloned(),
        }
    }

    pub fn default_name(&self) -> &str {
        self.detectors[0].name()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ObjectDetector>> {
        self.detectors.iter()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
