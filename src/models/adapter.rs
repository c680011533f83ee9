use crate::models::backend::BackendFactory;
use crate::models::decode::{parse_anchors, Decoder};
use crate::models::{BackendKind, DetectionSettings, DetectorHandle, DeviceMode, ModelDescriptor};
use crate::utils::error::{LoadErrorKind, ServiceError};
use crate::Result;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 阈值覆盖，未设置的项使用方言默认值
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdOverrides {
    pub confidence: Option<f32>,
    pub nms_iou: Option<f32>,
}

/// 把两种模型方言统一为同一个加载入口
///
/// 加载过程不修改任何共享状态，失败时直接丢弃已创建的资源。
pub struct DetectorAdapter {
    factory: Arc<dyn BackendFactory>,
    overrides: ThresholdOverrides,
    next_generation: AtomicU64,
}

impl DetectorAdapter {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            overrides: ThresholdOverrides::default(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_overrides(mut self, overrides: ThresholdOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn load(&self, descriptor: &ModelDescriptor, device: DeviceMode) -> Result<DetectorHandle> {
        tracing::info!(
            "Loading {} model '{}' from {}",
            descriptor.backend_kind.display_name(),
            descriptor.name,
            descriptor.weights_path.display()
        );

        ensure_readable(&descriptor.weights_path, "weights")?;
        let labels = read_labels(&descriptor.labels_path)?;

        let decoder = match descriptor.backend_kind {
            BackendKind::LegacyAnchored => {
                let path = descriptor.anchors_path.as_deref().ok_or_else(|| {
                    ServiceError::load(
                        LoadErrorKind::MissingFile,
                        format!("Model '{}' requires an anchors file", descriptor.name),
                    )
                })?;
                Decoder::Anchored {
                    anchors: read_anchors(path)?,
                }
            }
            BackendKind::AnchorFree => Decoder::AnchorFree,
        };

        let backend = self.factory.create(descriptor, device)?;

        let expected = descriptor.backend_kind.expected_outputs();
        if backend.output_count() != expected {
            return Err(ServiceError::load(
                LoadErrorKind::UnsupportedBackend,
                format!(
                    "{} model '{}' must have {} outputs, found {}",
                    descriptor.backend_kind.display_name(),
                    descriptor.name,
                    expected,
                    backend.output_count()
                ),
            ));
        }

        let mut settings = DetectionSettings::for_kind(descriptor.backend_kind);
        if let Some(confidence) = self.overrides.confidence {
            settings.confidence = confidence.clamp(0.0, 1.0);
        }
        if let Some(nms_iou) = self.overrides.nms_iou {
            settings.nms_iou = nms_iou.clamp(0.0, 1.0);
        }

        if backend.device() != device {
            tracing::warn!("Model '{}' requested on {} but runs on {}", descriptor.name, device, backend.device());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Model '{}' loaded: {} classes, device={}, generation={}",
            descriptor.name,
            labels.len(),
            backend.device(),
            generation
        );

        Ok(DetectorHandle::new(
            descriptor.clone(),
            labels,
            decoder,
            settings,
            backend,
            generation,
        ))
    }
}

fn ensure_readable(path: &Path, what: &str) -> Result<()> {
    std::fs::File::open(path).map(|_| ()).map_err(|e| {
        ServiceError::load(
            LoadErrorKind::MissingFile,
            format!("Cannot read {} file {}: {}", what, path.display(), e),
        )
    })
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        ServiceError::load(
            LoadErrorKind::MissingFile,
            format!("Cannot read {} file {}: {}", what, path.display(), e),
        )
    })
}

/// 每行一个类别名，忽略空行
fn read_labels(path: &Path) -> Result<Vec<String>> {
    let labels: Vec<String> = read_text(path, "classes")?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if labels.is_empty() {
        return Err(ServiceError::load(
            LoadErrorKind::CorruptWeights,
            format!("Classes file {} is empty", path.display()),
        ));
    }
    Ok(labels)
}

fn read_anchors(path: &Path) -> Result<Vec<[f32; 2]>> {
    let text = read_text(path, "anchors")?;
    parse_anchors(&text).map_err(|e| {
        ServiceError::load(
            LoadErrorKind::CorruptWeights,
            format!("Invalid anchors file {}: {}", path.display(), e),
        )
    })
}
