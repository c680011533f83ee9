use crate::utils::error::ServiceError;
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use serde::Deserialize;

/// 验证的JSON提取器，解析或验证失败都返回 `INVALID_REQUEST`
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: for<'de> Deserialize<'de> + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|err| ServiceError::InvalidInput(format!("JSON parse error: {}", err.body_text())))?;

        value.validate().map_err(ServiceError::InvalidInput)?;

        Ok(ValidatedJson(value))
    }
}

/// 验证trait
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

impl Validate for crate::web::handlers::PredictRequest {
    fn validate(&self) -> Result<(), String> {
        if self.image_data.trim().is_empty() {
            return Err("No image data provided".to_string());
        }
        if self.options.timeout_ms == Some(0) {
            return Err("timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

impl Validate for crate::web::handlers::SwitchRequest {
    fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("Model name is required".to_string());
        }
        // 模型名即文件名，不允许跳出模型目录
        if self.model_name.contains(['/', '\\']) || self.model_name.contains("..") {
            return Err(format!("Invalid model name '{}'", self.model_name));
        }
        Ok(())
    }
}

impl Validate for crate::web::handlers::DeviceRequest {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 请求ID提取器
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get("X-Request-ID")
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(RequestId(request_id))
    }
}
