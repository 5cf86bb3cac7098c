//! YOLO Object Detector
//!
//! Runs a compiled YOLOv5/YOLOv8 checkpoint on a single frame and decodes the
//! raw prediction tensor into labelled boxes in original image coordinates.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use openvino::{ElementType, Shape, Tensor};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::InferenceConfig;

use super::labels::LabelSet;
use super::loader::{LoadedModel, ModelFamily};
use super::preprocess::{preprocess_for_detection, ResizeInfo};

/// Axis-aligned box: top-left corner plus size, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One labelled region found in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Detection {
    pub label: String,
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Anything that can turn a decoded frame into detections.
///
/// Implementations are shared read-only between concurrent requests.
pub trait ObjectDetector: Send + Sync {
    fn name(&self) -> &str;

    fn family(&self) -> ModelFamily;

    fn labels(&self) -> &LabelSet;

    /// Detections sorted by descending confidence. Candidates scoring below
    /// `min_confidence` may be dropped early.
    fn detect(&self, image: &DynamicImage, min_confidence: f32) -> Result<Vec<Detection>>;
}

/// Network-space candidate before NMS, corners in input pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Candidate {
    fn from_center(class_id: usize, confidence: f32, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            class_id,
            confidence,
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Map back to the source image; boxes that collapse after clamping are dropped
    pub fn into_detection(self, resize_info: &ResizeInfo, labels: &LabelSet) -> Option<Detection> {
        let (x1, y1) = resize_info.to_original(self.x1, self.y1);
        let (x2, y2) = resize_info.to_original(self.x2, self.y2);
        let (x1, x2) = (resize_info.clamp_x(x1), resize_info.clamp_x(x2));
        let (y1, y2) = (resize_info.clamp_y(y1), resize_info.clamp_y(y2));

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let label = labels
            .name(self.class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", self.class_id));

        Some(Detection {
            label,
            class_id: self.class_id,
            confidence: self.confidence.clamp(0.0, 1.0),
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
        })
    }
}

/// OpenVINO-backed YOLO detector
pub struct YoloDetector {
    model: Arc<LoadedModel>,
    candidate_confidence: f32,
    nms_threshold: f32,
}

impl YoloDetector {
    pub fn new(model: Arc<LoadedModel>, config: &InferenceConfig) -> Self {
        Self {
            model,
            candidate_confidence: config.candidate_confidence,
            nms_threshold: config.nms_threshold,
        }
    }

    /// Read tensor data as f32 vector
    fn read_tensor_f32(tensor: &Tensor, len: usize) -> Result<Vec<f32>> {
        let raw = tensor.get_raw_data()?;
        if raw.len() < len * std::mem::size_of::<f32>() {
            bail!("output tensor holds {} bytes, expected {} floats", raw.len(), len);
        }

        let data: Vec<f32> = unsafe {
            let ptr = raw.as_ptr() as *const f32;
            std::slice::from_raw_parts(ptr, len).to_vec()
        };

        Ok(data)
    }
}

impl ObjectDetector for YoloDetector {
    fn name(&self) -> &str {
        &self.model.name
    }

    fn family(&self) -> ModelFamily {
        self.model.family
    }

    fn labels(&self) -> &LabelSet {
        &self.model.labels
    }

    fn detect(&self, image: &DynamicImage, min_confidence: f32) -> Result<Vec<Detection>> {
        let (input_w, input_h) = self.model.input_size;
        let (input_tensor, resize_info) = preprocess_for_detection(image, self.model.input_size)?;

        let mut request = self.model.compiled.create_infer_request()?;

        let input_shape = Shape::new(&[1, 3, input_h as i64, input_w as i64])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;

        let input_data = input_tensor
            .as_slice()
            .context("input tensor is not contiguous")?;
        unsafe {
            let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }

        request.set_input_tensor(&input)?;
        request.infer()?;

        let output = request.get_output_tensor_by_index(0)?;
        let dims: Vec<usize> = output
            .get_shape()?
            .get_dimensions()
            .iter()
            .map(|&d| d as usize)
            .collect();
        let total: usize = dims.iter().product();
        let data = Self::read_tensor_f32(&output, total)?;

        let floor = self.candidate_confidence.min(min_confidence);
        let candidates = decode_output(
            self.model.family,
            &data,
            &dims,
            Some(self.model.labels.len()),
            floor,
        )?;
        let before = candidates.len();
        let kept = non_max_suppression(candidates, self.nms_threshold);

        tracing::debug!(
            "{}: {} candidates, {} after NMS",
            self.model.name,
            before,
            kept.len()
        );

        Ok(kept
            .into_iter()
            .filter_map(|c| c.into_detection(&resize_info, &self.model.labels))
            .collect())
    }
}

/// Decode a raw YOLO prediction tensor into candidates scoring at least `floor`.
///
/// YOLOv8 exports predictions attribute-major (`[1, 4 + C, N]`), YOLOv5
/// anchor-major with an objectness column (`[1, N, 5 + C]`). Either may be
/// transposed; the axis matching the expected attribute count wins, and
/// without a class-count hint the shorter axis is taken as attributes.
pub fn decode_output(
    family: ModelFamily,
    data: &[f32],
    dims: &[usize],
    num_classes: Option<usize>,
    floor: f32,
) -> Result<Vec<Candidate>> {
    let (rows, cols) = match dims {
        [1, a, b] => (*a, *b),
        [a, b] => (*a, *b),
        other => bail!("unexpected output shape {:?}", other),
    };
    if data.len() < rows * cols {
        bail!("output holds {} values, shape {:?} needs {}", data.len(), dims, rows * cols);
    }

    let class_offset = match family {
        ModelFamily::Yolov8 => 4,
        ModelFamily::Yolov5 => 5,
    };

    let attr_major = match num_classes.map(|c| c + class_offset) {
        Some(n) if rows == n && cols != n => true,
        Some(n) if cols == n && rows != n => false,
        _ => rows < cols,
    };
    let (num_anchors, num_attrs) = if attr_major { (cols, rows) } else { (rows, cols) };
    let at = |anchor: usize, attr: usize| -> f32 {
        if attr_major {
            data[attr * num_anchors + anchor]
        } else {
            data[anchor * num_attrs + attr]
        }
    };

    if num_attrs <= class_offset {
        bail!("{} output has only {} attributes per anchor", family, num_attrs);
    }
    let num_classes = num_attrs - class_offset;

    let mut candidates = Vec::new();
    for anchor in 0..num_anchors {
        let objectness = match family {
            ModelFamily::Yolov5 => {
                let obj = at(anchor, 4);
                if obj < floor {
                    continue;
                }
                obj
            }
            ModelFamily::Yolov8 => 1.0,
        };

        let (class_id, class_score) = (0..num_classes)
            .map(|c| (c, at(anchor, class_offset + c)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        let confidence = objectness * class_score;
        if !confidence.is_finite() || confidence < floor {
            continue;
        }

        candidates.push(Candidate::from_center(
            class_id,
            confidence,
            at(anchor, 0),
            at(anchor, 1),
            at(anchor, 2),
            at(anchor, 3),
        ));
    }

    Ok(candidates)
}

/// Class-aware non-maximum suppression, highest confidence first
pub fn non_max_suppression(mut boxes: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    if boxes.is_empty() {
        return boxes;
    }

    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if suppressed[j] || boxes[j].class_id != boxes[i].class_id {
                continue;
            }
            if compute_iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute intersection over union
pub fn compute_iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(class_id: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Candidate {
        Candidate { class_id, confidence, x1, y1, x2, y2 }
    }

    #[test]
    fn test_iou_calculation() {
        let a = candidate(0, 0.9, 0.0, 0.0, 10.0, 10.0);
        let b = candidate(0, 0.8, 5.0, 5.0, 15.0, 15.0);

        // Intersection 25, union 175
        let iou = compute_iou(&a, &b);
        assert!((iou - 0.143).abs() < 0.01);
    }

    #[test]
    fn test_nms_suppresses_same_class_only() {
        let boxes = vec![
            candidate(0, 0.7, 0.0, 0.0, 10.0, 10.0),
            candidate(0, 0.9, 1.0, 1.0, 11.0, 11.0),
            candidate(1, 0.8, 1.0, 1.0, 11.0, 11.0),
        ];

        let kept = non_max_suppression(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    /// Two anchors, three classes, attribute-major like a YOLOv8 export
    fn yolov8_output() -> (Vec<f32>, Vec<usize>) {
        #[rustfmt::skip]
        let data = vec![
            // cx
            100.0, 300.0,
            // cy
            100.0, 300.0,
            // w
            40.0, 20.0,
            // h
            80.0, 20.0,
            // class 0, 1, 2
            0.10, 0.05,
            0.85, 0.10,
            0.05, 0.20,
        ];
        (data, vec![1, 7, 2])
    }

    #[test]
    fn test_decode_yolov8_layout() {
        let (data, dims) = yolov8_output();
        let candidates = decode_output(ModelFamily::Yolov8, &data, &dims, Some(3), 0.25).unwrap();

        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!(c.class_id, 1);
        assert!((c.confidence - 0.85).abs() < 1e-6);
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (80.0, 60.0, 120.0, 140.0));
    }

    #[test]
    fn test_decode_yolov8_transposed_layout() {
        let (data, _) = yolov8_output();
        // Re-pack anchor-major
        let mut transposed = Vec::new();
        for anchor in 0..2 {
            for attr in 0..7 {
                transposed.push(data[attr * 2 + anchor]);
            }
        }
        let candidates = decode_output(ModelFamily::Yolov8, &transposed, &[1, 2, 7], Some(3), 0.15).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].class_id, 2);
    }

    #[test]
    fn test_decode_yolov5_applies_objectness() {
        #[rustfmt::skip]
        let data = vec![
            // cx, cy, w, h, obj, c0, c1
            50.0, 50.0, 10.0, 10.0, 0.9, 0.9, 0.1,
            70.0, 70.0, 10.0, 10.0, 0.2, 0.1, 0.99,
            90.0, 90.0, 10.0, 10.0, 0.6, 0.3, 0.2,
        ];
        let candidates = decode_output(ModelFamily::Yolov5, &data, &[1, 3, 7], Some(2), 0.25).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 0);
        assert!((candidates[0].confidence - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(decode_output(ModelFamily::Yolov8, &[0.0; 8], &[1, 2, 2, 2], None, 0.25).is_err());
        assert!(decode_output(ModelFamily::Yolov8, &[0.0; 3], &[1, 4, 2], None, 0.25).is_err());
        assert!(decode_output(ModelFamily::Yolov5, &[0.0; 10], &[1, 5, 2], None, 0.25).is_err());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let (data, dims) = yolov8_output();
        let first = decode_output(ModelFamily::Yolov8, &data, &dims, Some(3), 0.1).unwrap();
        let second = decode_output(ModelFamily::Yolov8, &data, &dims, Some(3), 0.1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_candidate_maps_back_and_clamps() {
        let info = ResizeInfo::new((1280, 640), (640, 640));
        let labels = LabelSet::coco();

        // Box spilling over the left edge of the letterboxed image
        let detection = candidate(2, 0.7, -10.0, 170.0, 40.0, 210.0)
            .into_detection(&info, &labels)
            .unwrap();

        assert_eq!(detection.label, "car");
        assert_eq!(detection.bbox.x, 0.0);
        assert!((detection.bbox.y - 20.0).abs() < 1e-3);
        assert!((detection.bbox.width - 80.0).abs() < 1e-3);
        assert!((detection.bbox.height - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_candidate_in_padding_is_dropped() {
        let info = ResizeInfo::new((1280, 640), (640, 640));
        let labels = LabelSet::coco();
        let in_padding = candidate(0, 0.9, 10.0, 0.0, 50.0, 100.0);
        assert!(in_padding.into_detection(&info, &labels).is_none());
    }

    #[test]
    fn test_unlabelled_class_gets_placeholder_name() {
        let info = ResizeInfo::new((640, 640), (640, 640));
        let labels = LabelSet::new(vec!["only".to_string()]);
        let detection = candidate(3, 0.5, 0.0, 0.0, 10.0, 10.0)
            .into_detection(&info, &labels)
            .unwrap();
        assert_eq!(detection.label, "class_3");
    }
}
