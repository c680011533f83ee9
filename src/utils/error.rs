use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// 模型加载失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    /// 权重、类别或锚框文件不存在或不可读
    MissingFile,
    /// 文件存在但内容无法使用
    CorruptWeights,
    /// 后端无法以该方言运行此模型
    UnsupportedBackend,
}

impl std::fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            LoadErrorKind::MissingFile => "missing file",
            LoadErrorKind::CorruptWeights => "corrupt weights",
            LoadErrorKind::UnsupportedBackend => "unsupported backend",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Model {0} not found")]
    ModelNotFound(String),

    #[error("Model loading failed ({kind}): {message}")]
    Load {
        kind: LoadErrorKind,
        message: String,
    },

    #[error("Model loading timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("Another model switch is in progress")]
    SwitchInProgress,

    #[error("No model is currently loaded")]
    NoActiveModel,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File too large: {0} bytes, max allowed: {1} bytes")]
    FileTooLarge(usize, usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("ORT error: {0}")]
    Ort(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn load(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        ServiceError::Load {
            kind,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            // 超出大小的图像同样按无效输入处理
            ServiceError::Decode(_)
            | ServiceError::InvalidInput(_)
            | ServiceError::FileTooLarge(_, _)
            | ServiceError::Base64(_) => StatusCode::BAD_REQUEST,
            ServiceError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::SwitchInProgress => StatusCode::CONFLICT,
            ServiceError::NoActiveModel => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::InferenceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Decode(_)
            | ServiceError::InvalidInput(_)
            | ServiceError::FileTooLarge(_, _)
            | ServiceError::Base64(_) => "INVALID_REQUEST",
            ServiceError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            ServiceError::Load { .. } | ServiceError::LoadTimeout(_) => "MODEL_SWITCH_ERROR",
            ServiceError::SwitchInProgress => "SWITCH_IN_PROGRESS",
            ServiceError::NoActiveModel => "MODEL_NOT_LOADED",
            ServiceError::Inference(_) | ServiceError::Ort(_) => "MODEL_ERROR",
            ServiceError::InferenceTimeout(_) => "INFERENCE_TIMEOUT",
            ServiceError::Config(_) => "CONFIG_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let error_response = serde_json::json!({
            "success": false,
            "error": {
                "code": self.error_code(),
                "message": message,
            },
            "message": message,
        });

        if status.is_server_error() {
            tracing::error!("Request failed: {} ({})", self, status);
        } else {
            tracing::warn!("Request rejected: {} ({})", self, status);
        }

        (status, axum::Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_codes() {
        let not_found = ServiceError::ModelNotFound("XYZ".to_string());
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.error_code(), "MODEL_NOT_FOUND");

        let load = ServiceError::load(LoadErrorKind::MissingFile, "no weights");
        assert_eq!(load.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(load.error_code(), "MODEL_SWITCH_ERROR");

        let decode = ServiceError::Decode("garbage".to_string());
        assert_eq!(decode.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(decode.error_code(), "INVALID_REQUEST");

        let oversized = ServiceError::FileTooLarge(2048, 1024);
        assert_eq!(oversized.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(oversized.error_code(), "INVALID_REQUEST");

        let inference = ServiceError::Inference("bad output".to_string());
        assert_eq!(inference.error_code(), "MODEL_ERROR");
    }

    #[test]
    fn test_load_error_message_names_kind() {
        let err = ServiceError::load(LoadErrorKind::UnsupportedBackend, "3 outputs expected");
        assert!(err.to_string().contains("unsupported backend"));
    }
}
