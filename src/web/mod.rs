pub mod extractors;
pub mod handlers;
pub mod middleware;

use crate::utils::error::ServiceError;
use crate::{detection::DetectionPipeline, models::ModelManager, Config, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

/// 处理器共享的状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ModelManager>,
    pub pipeline: DetectionPipeline,
}

impl AppState {
    pub fn new(config: Config, manager: Arc<ModelManager>) -> Self {
        let pipeline = DetectionPipeline::new(Arc::clone(&manager), &config);
        Self {
            config: Arc::new(config),
            manager,
            pipeline,
        }
    }
}

pub async fn serve(config: Config) -> Result<()> {
    // 初始化模型管理器，默认模型加载失败时仍然启动
    let manager = Arc::new(ModelManager::from_config(&config));
    manager.init().await;

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| ServiceError::Config(format!("Invalid bind address {}: {}", config.bind_addr, e)))?;

    let app = create_app(AppState::new(config, manager));

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /predict/concentration    - JSON base64 detection");
    tracing::info!("  POST /predict/characterization - JSON base64 detection");
    tracing::info!("  POST /predict                  - Multipart upload (legacy)");
    tracing::info!("  GET  /models                   - Available models");
    tracing::info!("  POST /models/switch            - Switch active model");
    tracing::info!("  POST /models/device            - Change device preference");
    tracing::info!("  GET  /info                     - Active model information");
    tracing::info!("  GET  /health                   - Health check");
    tracing::info!("  GET  /api/info                 - Service information");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to bind to address {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServiceError::Internal(format!("Server failed to start: {}", e)))?;

    tracing::info!("Server stopped");
    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    let server_config = &state.config.server_config;

    Router::new()
        // 检测API路由
        .route("/predict/:variant", post(handlers::predict_variant_handler))
        .route("/predict", post(handlers::predict_upload_handler))
        .route("/predict_simple", post(handlers::predict_simple_handler))
        // 模型管理路由
        .route("/models", get(handlers::list_models_handler))
        .route("/models/switch", post(handlers::switch_model_handler))
        .route("/models/device", post(handlers::device_handler))
        // 系统路由
        .route("/info", get(model_info_handler))
        .route("/health", get(health_handler))
        .route("/api/info", get(service_info_handler))
        // 添加中间件
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(DefaultBodyLimit::max(server_config.max_request_size))
        .layer(RequestBodyLimitLayer::new(server_config.max_request_size))
        .layer(TimeoutLayer::new(Duration::from_secs(server_config.request_timeout)))
        // 所有路由共享同一个并发上限
        .layer(GlobalConcurrencyLimitLayer::new(server_config.max_connections.max(1)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// 健康检查端点
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": state.manager.has_model(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// 当前模型信息
async fn model_info_handler(State(state): State<AppState>) -> Result<Json<crate::models::ModelInfo>> {
    state.manager.current_info().map(Json).ok_or(ServiceError::NoActiveModel)
}

/// 服务信息端点
async fn service_info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(json!({
        "service": "YOLO Detection Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "models": state.manager.stats(),
        "limits": {
            "max_request_size": config.server_config.max_request_size,
            "max_connections": config.server_config.max_connections,
            "request_timeout_secs": config.server_config.request_timeout,
            "load_timeout_secs": config.swap_config.load_timeout.as_secs(),
            "inference_timeout_secs": config.swap_config.inference_timeout.as_secs(),
        },
        "features": {
            "hot_swap": true,
            "accelerator": cfg!(feature = "cuda"),
            "multipart_upload": true,
            "result_image": true,
        }
    }))
}
