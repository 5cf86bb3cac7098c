//! Class label tables

use std::path::Path;

use crate::error::LoadError;

/// The 80 COCO classes YOLO checkpoints are trained on, in class-id order
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Canonical form used wherever labels are compared
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Ordered class names, indexed by class id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    names: Vec<String>,
}

impl LabelSet {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn coco() -> Self {
        Self::new(COCO_LABELS.iter().map(|s| s.to_string()).collect())
    }

    /// Read one label per line; blank lines and `#` comments are skipped
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Labels {
            path: path.to_path_buf(),
            source,
        })?;

        let names: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        if names.is_empty() {
            return Err(LoadError::EmptyLabels(path.to_path_buf()));
        }
        Ok(Self::new(names))
    }

    /// Labels file if configured, COCO otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::coco()),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    /// Case-insensitive lookup of a label's class id
    pub fn index_of(&self, label: &str) -> Option<usize> {
        let label = normalize_label(label);
        self.names.iter().position(|n| normalize_label(n) == label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index_of(label).is_some()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
