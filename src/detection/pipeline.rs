use crate::detection::{DetectionOutcome, InferOptions};
use crate::image::{ImageLoader, OverlayRenderer};
use crate::models::{DetectorHandle, ModelManager};
use crate::utils::error::ServiceError;
use crate::{Config, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 检测流水线：解码图像、调用当前模型、整理结果
///
/// 每次调用开始时取一次模型快照，整个请求都使用同一个模型，
/// 并发的切换只影响之后的请求。
#[derive(Clone)]
pub struct DetectionPipeline {
    manager: Arc<ModelManager>,
    max_image_bytes: usize,
    inference_timeout: Duration,
}

impl DetectionPipeline {
    pub fn new(manager: Arc<ModelManager>, config: &Config) -> Self {
        Self {
            manager,
            max_image_bytes: config.max_image_bytes(),
            inference_timeout: config.swap_config.inference_timeout,
        }
    }

    /// 处理base64图像
    pub async fn infer_base64(&self, base64_data: &str, options: InferOptions) -> Result<DetectionOutcome> {
        let bytes = ImageLoader::decode_base64(base64_data)?;
        self.infer(bytes, options).await
    }

    /// 处理原始图像字节
    pub async fn infer(&self, bytes: Vec<u8>, options: InferOptions) -> Result<DetectionOutcome> {
        let start_time = Instant::now();
        let handle = self.manager.current().ok_or(ServiceError::NoActiveModel)?;
        let max_bytes = self.max_image_bytes;
        let timeout = self.effective_timeout(&options);

        tracing::debug!(
            "Running detection with model '{}' (generation {}), {} bytes",
            handle.descriptor().name,
            handle.generation(),
            bytes.len()
        );

        let task = tokio::task::spawn_blocking(move || run_detection(&handle, &bytes, max_bytes, &options));

        let mut outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(ServiceError::Inference(format!("Detection task failed: {}", e))),
            Err(_) => return Err(ServiceError::InferenceTimeout(timeout)),
        };
        outcome.processing_time = start_time.elapsed();

        tracing::info!(
            "Detection completed: {} objects in {:.2}ms (model '{}')",
            outcome.detection_count(),
            outcome.processing_time.as_secs_f64() * 1000.0,
            outcome.model
        );

        Ok(outcome)
    }

    /// 调用方给出的超时不能超过配置的上限
    fn effective_timeout(&self, options: &InferOptions) -> Duration {
        options
            .timeout_ms
            .map(|ms| Duration::from_millis(ms).min(self.inference_timeout))
            .unwrap_or(self.inference_timeout)
    }
}

fn run_detection(
    handle: &DetectorHandle,
    bytes: &[u8],
    max_bytes: usize,
    options: &InferOptions,
) -> Result<DetectionOutcome> {
    let image = ImageLoader::from_bytes(bytes, max_bytes)?;
    let detections = handle.detect(&image)?;

    let result_image = if options.return_image {
        Some(OverlayRenderer::render_png(&image, &detections, handle.labels())?)
    } else {
        None
    };

    Ok(DetectionOutcome {
        detections,
        result_image,
        model: handle.descriptor().name.clone(),
        generation: handle.generation(),
        processing_time: Duration::ZERO,
    })
}
