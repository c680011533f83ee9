use crate::{
    detection::{DetectionOutcome, DetectionResult, InferOptions, PredictVariant},
    image::ImageLoader,
    models::{CatalogEntryView, DeviceMode, ModelInfo},
    utils::error::ServiceError,
    web::{
        extractors::{RequestId, ValidatedJson},
        AppState,
    },
    Result,
};
use axum::{
    extract::{Multipart, Path, State},
    response::Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// `/predict/{variant}` 请求体
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    /// Base64编码的图像数据
    #[serde(default)]
    pub image_data: String,

    #[serde(default)]
    pub options: InferOptions,
}

/// `/models/switch` 请求体
#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    #[serde(default)]
    pub model_name: String,

    /// 不指定时使用当前的设备偏好
    #[serde(default)]
    pub device: Option<DeviceMode>,
}

/// `/models/device` 请求体
#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device: DeviceMode,

    /// 是否立即在新设备上重新加载当前模型
    #[serde(default)]
    pub reload: bool,
}

#[derive(Debug, Serialize)]
pub struct DetectionPayload {
    pub detections: Vec<DetectionResult>,
    pub detection_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub result: DetectionPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_image: Option<String>,
    pub message: &'static str,
    pub model: String,
    pub processing_time_ms: f64,
}

/// 旧版上传接口的响应，不带 `success` 包装
#[derive(Debug, Serialize)]
pub struct LegacyPredictResponse {
    pub detections: Vec<DetectionResult>,
    pub detection_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub success: bool,
    pub models: Vec<CatalogEntryView>,
}

#[derive(Debug, Serialize)]
pub struct SwitchResponse {
    pub success: bool,
    pub message: String,
    pub current_model: ModelInfo,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub success: bool,
    pub message: String,
    pub device: DeviceMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_model: Option<ModelInfo>,
}

fn encode_image(outcome: &mut DetectionOutcome) -> Option<String> {
    outcome
        .result_image
        .take()
        .map(|png| base64::engine::general_purpose::STANDARD.encode(png))
}

/// JSON base64检测处理器
pub async fn predict_variant_handler(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(variant): Path<String>,
    ValidatedJson(request): ValidatedJson<PredictRequest>,
) -> Result<Json<PredictResponse>> {
    let variant: PredictVariant = variant.parse().map_err(ServiceError::InvalidInput)?;

    tracing::info!(
        "Processing {:?} request: request_id={}, return_image={}",
        variant,
        request_id,
        request.options.return_image
    );

    let mut outcome = state.pipeline.infer_base64(&request.image_data, request.options).await?;

    tracing::info!(
        "{:?} completed: request_id={}, detections={}, model={}, time={:.3}s",
        variant,
        request_id,
        outcome.detection_count(),
        outcome.model,
        outcome.processing_time.as_secs_f32()
    );

    let result_image = encode_image(&mut outcome);
    Ok(Json(PredictResponse {
        success: true,
        result: DetectionPayload {
            detection_count: outcome.detection_count(),
            detections: outcome.detections,
        },
        result_image,
        message: variant.success_message(),
        model: outcome.model,
        processing_time_ms: outcome.processing_time.as_secs_f64() * 1000.0,
    }))
}

/// 从multipart表单读取图像与 `return_image` 选项
async fn read_upload(multipart: &mut Multipart) -> Result<(Vec<u8>, InferOptions)> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut options = InferOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InvalidInput(format!("Failed to read multipart field: {}", e)))?
    {
        let field_name = field.name().unwrap_or("unknown").to_string();

        match field_name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::InvalidInput(format!("Failed to read file data: {}", e)))?;
                if data.is_empty() {
                    return Err(ServiceError::InvalidInput("No image provided".to_string()));
                }
                tracing::debug!("Received file: {} bytes", data.len());
                image_data = Some(data.to_vec());
            }
            "image_base64" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::InvalidInput(format!("Failed to read image_base64: {}", e)))?;
                // 文件字段优先
                if image_data.is_none() {
                    image_data = Some(ImageLoader::decode_base64(&text)?);
                }
            }
            "return_image" => {
                let value = field.text().await.unwrap_or_default();
                options.return_image = value.trim().eq_ignore_ascii_case("true");
            }
            _ => {
                tracing::debug!("Ignoring unknown field: {}", field_name);
            }
        }
    }

    let image_data = image_data.ok_or_else(|| ServiceError::InvalidInput("No image provided".to_string()))?;
    Ok((image_data, options))
}

/// Multipart文件上传处理器（旧版接口）
pub async fn predict_upload_handler(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    mut multipart: Multipart,
) -> Result<Json<LegacyPredictResponse>> {
    tracing::info!("Processing multipart request: request_id={}", request_id);

    let (image_data, options) = read_upload(&mut multipart).await?;
    let mut outcome = state.pipeline.infer(image_data, options).await?;

    let result_image = encode_image(&mut outcome);
    Ok(Json(LegacyPredictResponse {
        detection_count: outcome.detection_count(),
        detections: outcome.detections,
        result_image,
    }))
}

/// 只返回检测结果的上传接口
pub async fn predict_simple_handler(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    mut multipart: Multipart,
) -> Result<Json<LegacyPredictResponse>> {
    tracing::info!("Processing simple multipart request: request_id={}", request_id);

    let (image_data, _) = read_upload(&mut multipart).await?;
    let outcome = state.pipeline.infer(image_data, InferOptions::default()).await?;

    Ok(Json(LegacyPredictResponse {
        detection_count: outcome.detection_count(),
        detections: outcome.detections,
        result_image: None,
    }))
}

/// 可用模型列表
pub async fn list_models_handler(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.manager.list_models().iter().map(CatalogEntryView::from).collect();
    Json(ModelsResponse { success: true, models })
}

/// 切换当前模型
pub async fn switch_model_handler(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<SwitchRequest>,
) -> Result<Json<SwitchResponse>> {
    tracing::info!("Switch requested: model={}, device={:?}", request.model_name, request.device);

    let info = state.manager.switch(&request.model_name, request.device).await?;

    Ok(Json(SwitchResponse {
        success: true,
        message: format!("Model switched to {} successfully", info.name),
        current_model: info,
    }))
}

/// 修改设备偏好，可选地立即重新加载当前模型
pub async fn device_handler(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<DeviceRequest>,
) -> Result<Json<DeviceResponse>> {
    state.manager.set_device(request.device);

    if !request.reload {
        return Ok(Json(DeviceResponse {
            success: true,
            message: format!("Device preference set to {}; applies to the next model load", request.device),
            device: request.device,
            current_model: state.manager.current_info(),
        }));
    }

    let info = state.manager.reload(request.device).await?;
    Ok(Json(DeviceResponse {
        success: true,
        message: format!("Model {} reloaded on {}", info.name, info.device),
        device: request.device,
        current_model: Some(info),
    }))
}
