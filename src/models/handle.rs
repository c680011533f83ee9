use crate::detection::DetectionResult;
use crate::image::ImagePreprocessor;
use crate::models::backend::InferenceBackend;
use crate::models::decode::{non_max_suppression, Decoder};
use crate::models::{BackendKind, DeviceMode, ModelDescriptor};
use crate::Result;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::Serialize;

/// 加载时确定的后处理参数，加载后不可修改
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSettings {
    pub confidence: f32,
    pub nms_iou: f32,
    /// (height, width)
    pub input_size: (usize, usize),
}

impl DetectionSettings {
    pub fn for_kind(kind: BackendKind) -> Self {
        let (confidence, nms_iou) = kind.default_thresholds();
        Self {
            confidence,
            nms_iou,
            input_size: kind.default_input_size(),
        }
    }
}

/// 当前模型信息快照（`/info`）
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub model_path: String,
    pub model_type: &'static str,
    pub classes_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchors_path: Option<String>,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub input_shape: [usize; 3],
    pub confidence: f32,
    pub nms_iou: f32,
    pub device: DeviceMode,
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
}

/// 一个已加载、可直接推理的模型实例
///
/// 句柄通过 `Arc` 共享；发布新句柄后，旧句柄在最后一个进行中的推理结束时释放。
pub struct DetectorHandle {
    descriptor: ModelDescriptor,
    labels: Vec<String>,
    decoder: Decoder,
    settings: DetectionSettings,
    backend: Box<dyn InferenceBackend>,
    generation: u64,
    loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("name", &self.descriptor.name)
            .field("generation", &self.generation)
            .field("device", &self.backend.device())
            .finish()
    }
}

impl DetectorHandle {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        labels: Vec<String>,
        decoder: Decoder,
        settings: DetectionSettings,
        backend: Box<dyn InferenceBackend>,
        generation: u64,
    ) -> Self {
        Self {
            descriptor,
            labels,
            decoder,
            settings,
            backend,
            generation,
            loaded_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn device(&self) -> DeviceMode {
        self.backend.device()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 对一张图像执行检测，结果按模型输出顺序排列
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectionResult>> {
        let (input, letterbox) = ImagePreprocessor::letterbox(image, self.settings.input_size);

        let outputs = self.backend.forward(input)?;
        let candidates = self.decoder.decode(
            &outputs,
            self.labels.len(),
            self.settings.input_size,
            self.settings.confidence,
        )?;
        let raw_count = candidates.len();
        let kept = non_max_suppression(candidates, self.settings.nms_iou);

        tracing::debug!(
            "Model {} produced {} candidates, {} after NMS",
            self.descriptor.name,
            raw_count,
            kept.len()
        );

        let detections = kept
            .into_iter()
            .map(|c| {
                let label = self
                    .labels
                    .get(c.class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", c.class_id));
                DetectionResult::from_corners(label, c.score, letterbox.to_original(&c.bbox))
            })
            .collect();

        Ok(detections)
    }

    pub fn info(&self) -> ModelInfo {
        let (h, w) = self.settings.input_size;
        ModelInfo {
            name: self.descriptor.name.clone(),
            model_path: self.descriptor.weights_path.display().to_string(),
            model_type: self.descriptor.backend_kind.display_name(),
            classes_path: self.descriptor.labels_path.display().to_string(),
            anchors_path: self
                .descriptor
                .anchors_path
                .as_ref()
                .map(|p| p.display().to_string()),
            num_classes: self.labels.len(),
            class_names: self.labels.clone(),
            input_shape: [3, h, w],
            confidence: self.settings.confidence,
            nms_iou: self.settings.nms_iou,
            device: self.device(),
            generation: self.generation,
            loaded_at: self.loaded_at,
        }
    }
}
