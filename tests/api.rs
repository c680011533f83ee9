use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::Engine;
use http_body_util::BodyExt;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayD};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;
use yolo_service::{
    config::Config,
    models::{BackendFactory, BackendKind, DetectorAdapter, DeviceMode, InferenceBackend, ModelDescriptor, ModelManager},
    web::{create_app, AppState},
    Result,
};

struct FixedBackend {
    outputs: Vec<ArrayD<f32>>,
    device: DeviceMode,
    delay: Option<Duration>,
    crash: bool,
}

impl InferenceBackend for FixedBackend {
    fn forward(&self, _input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.crash {
            panic!("backend crashed during forward");
        }
        Ok(self.outputs.clone())
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn device(&self) -> DeviceMode {
        self.device
    }
}

/// 无锚框模型输出一个中心在 (320, 320) 的 64x64 目标，锚框模型不输出目标
///
/// 名为 `CRASH` 的模型推理时崩溃，`SLOW` 每次推理耗时200毫秒
struct FixedFactory;

impl BackendFactory for FixedFactory {
    fn create(&self, descriptor: &ModelDescriptor, device: DeviceMode) -> Result<Box<dyn InferenceBackend>> {
        let outputs = match descriptor.backend_kind {
            BackendKind::AnchorFree => {
                let mut map = Array3::<f32>::zeros((1, 6, 1));
                for (k, v) in [320.0, 320.0, 64.0, 64.0, 0.9, 0.2].into_iter().enumerate() {
                    map[[0, k, 0]] = v;
                }
                vec![map.into_dyn()]
            }
            BackendKind::LegacyAnchored => [20usize, 10, 5]
                .iter()
                .map(|&g| Array4::<f32>::from_elem((1, 21, g, g), -10.0).into_dyn())
                .collect(),
        };
        Ok(Box::new(FixedBackend {
            outputs,
            device,
            delay: (descriptor.name == "SLOW").then(|| Duration::from_millis(200)),
            crash: descriptor.name == "CRASH",
        }))
    }
}

fn model_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in ["MOF", "GLU"] {
        std::fs::write(dir.path().join(format!("{}.onnx", name)), b"weights").unwrap();
    }
    std::fs::write(dir.path().join("voc_classes.txt"), "vial\ncrystal\n").unwrap();
    std::fs::write(dir.path().join("glu_classes.txt"), "glucose\nbubble\n").unwrap();
    std::fs::write(
        dir.path().join("yolo_anchors.txt"),
        "10,13, 16,30, 33,23, 30,61, 62,45, 59,119, 116,90, 156,198, 373,326",
    )
    .unwrap();
    dir
}

async fn app(dir: &TempDir, default_model: &str) -> (Router, Arc<ModelManager>) {
    app_with(dir, default_model, |_| {}).await
}

async fn app_with(dir: &TempDir, default_model: &str, adjust: impl FnOnce(&mut Config)) -> (Router, Arc<ModelManager>) {
    let mut config = Config::new(
        "127.0.0.1:0".to_string(),
        dir.path(),
        default_model.to_string(),
        DeviceMode::Cpu,
        Some(1),
        false,
    )
    .unwrap();
    adjust(&mut config);
    let manager = Arc::new(ModelManager::new(&config, DetectorAdapter::new(Arc::new(FixedFactory))));
    manager.init().await;
    (create_app(AppState::new(config, Arc::clone(&manager))), manager)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 80, 160])));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn png_base64(width: u32, height: u32) -> String {
    base64::engine::general_purpose::STANDARD.encode(png(width, height))
}

fn current_models(body: &Value) -> Vec<String> {
    body["models"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["is_current"] == true)
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_switch_model_flow() {
    let dir = model_dir();
    let (app, _) = app(&dir, "MOF").await;

    let (status, body) = send(&app, get("/models")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"].as_array().unwrap().len(), 2);
    assert_eq!(current_models(&body), vec!["MOF"]);

    let (status, body) = send(&app, post_json("/models/switch", json!({"model_name": "GLU"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["current_model"]["model_type"], "YOLOv8");
    assert_eq!(body["current_model"]["class_names"], json!(["glucose", "bubble"]));

    let (_, body) = send(&app, get("/models")).await;
    assert_eq!(current_models(&body), vec!["GLU"]);
    let glu = body["models"].as_array().unwrap().iter().find(|m| m["name"] == "GLU").unwrap();
    assert_eq!(glu["model_type"], "v8");
    assert!(glu.get("anchors_path").is_none());

    let (status, body) = send(&app, get("/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "GLU");
    assert_eq!(body["input_shape"], json!([3, 640, 640]));
}

#[tokio::test]
async fn test_switch_errors_leave_active_model() {
    let dir = model_dir();
    let (app, manager) = app(&dir, "MOF").await;
    let generation = manager.current().unwrap().generation();

    let (status, body) = send(&app, post_json("/models/switch", json!({"model_name": "XYZ"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "MODEL_NOT_FOUND");

    std::fs::remove_file(dir.path().join("glu_classes.txt")).unwrap();
    let (status, body) = send(&app, post_json("/models/switch", json!({"model_name": "GLU"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "MODEL_SWITCH_ERROR");

    let (status, body) = send(&app, post_json("/models/switch", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let (_, body) = send(&app, get("/info")).await;
    assert_eq!(body["name"], "MOF");
    assert_eq!(body["generation"], generation);
}

#[tokio::test]
async fn test_predict_concentration() {
    let dir = model_dir();
    let (app, _) = app(&dir, "GLU").await;

    let request = json!({"image_data": png_base64(640, 640), "options": {"return_image": true}});
    let (status, body) = send(&app, post_json("/predict/concentration", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Concentration detection completed successfully");
    assert_eq!(body["result"]["detection_count"], 1);

    let det = &body["result"]["detections"][0];
    assert_eq!(det["class"], "glucose");
    assert_eq!(
        (det["x"].as_i64(), det["y"].as_i64(), det["width"].as_i64(), det["height"].as_i64()),
        (Some(288), Some(288), Some(64), Some(64))
    );

    let png = base64::engine::general_purpose::STANDARD
        .decode(body["result_image"].as_str().unwrap())
        .unwrap();
    assert_eq!(image::load_from_memory(&png).unwrap().dimensions(), (640, 640));
}

#[tokio::test]
async fn test_predict_characterization_without_detections() {
    let dir = model_dir();
    let (app, _) = app(&dir, "MOF").await;

    let request = json!({"image_data": png_base64(100, 60)});
    let (status, body) = send(&app, post_json("/predict/characterization", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["detection_count"], 0);
    assert!(body.get("result_image").is_none());
}

#[tokio::test]
async fn test_predict_invalid_requests() {
    let dir = model_dir();
    let (app, _) = app(&dir, "GLU").await;

    let (status, body) = send(&app, post_json("/predict/concentration", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let garbage = base64::engine::general_purpose::STANDARD.encode(b"definitely not an image");
    let (status, body) = send(&app, post_json("/predict/concentration", json!({"image_data": garbage}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let request = json!({"image_data": png_base64(8, 8)});
    let (status, body) = send(&app, post_json("/predict/titration", request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_service_without_model() {
    let dir = model_dir();
    std::fs::remove_file(dir.path().join("MOF.onnx")).unwrap();
    let (app, _) = app(&dir, "MOF").await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], false);

    let (status, body) = send(&app, get("/info")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "MODEL_NOT_LOADED");

    let request = json!({"image_data": png_base64(8, 8)});
    let (status, _) = send(&app, post_json("/predict/concentration", request)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // 切换到可用模型后恢复服务
    let (status, _) = send(&app, post_json("/models/switch", json!({"model_name": "GLU"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, get("/health")).await;
    assert_eq!(body["model_loaded"], true);
}

#[tokio::test]
async fn test_multipart_upload() {
    let dir = model_dir();
    let (app, _) = app(&dir, "GLU").await;

    let boundary = "XBOUNDARYX";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"return_image\"\r\n\r\ntrue\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\n",
            b = boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(&png(320, 320));
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("success").is_none());
    assert_eq!(body["detection_count"], 1);
    assert_eq!(body["detections"][0]["class"], "glucose");
    assert!(body["result_image"].is_string());
}

#[tokio::test]
async fn test_device_preference() {
    let dir = model_dir();
    let (app, manager) = app(&dir, "MOF").await;

    let (status, body) = send(&app, post_json("/models/device", json!({"device": "accelerator"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device"], "accelerator");
    assert_eq!(body["current_model"]["device"], "cpu");
    assert_eq!(manager.device_preference(), DeviceMode::Accelerator);

    let (status, body) = send(
        &app,
        post_json("/models/device", json!({"device": "accelerator", "reload": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_model"]["device"], "accelerator");
    assert_eq!(body["current_model"]["name"], "MOF");

    let (status, body) = send(&app, post_json("/models/device", json!({"device": "tpu"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_api_info_reports_stats() {
    let dir = model_dir();
    let (app, _) = app(&dir, "MOF").await;
    send(&app, post_json("/models/switch", json!({"model_name": "GLU"}))).await;

    let (status, body) = send(&app, get("/api/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"]["current_model"], "GLU");
    assert_eq!(body["models"]["switch_count"], 2);
    assert_eq!(body["models"]["state"], "idle");
}

#[tokio::test]
async fn test_backend_crash_is_model_error() {
    let dir = model_dir();
    std::fs::write(dir.path().join("CRASH.onnx"), b"weights").unwrap();
    let (app, manager) = app(&dir, "CRASH").await;

    let request = json!({"image_data": png_base64(64, 64)});
    let (status, body) = send(&app, post_json("/predict/concentration", request)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "MODEL_ERROR");

    // 崩溃后模型仍可用于后续请求和切换
    assert_eq!(manager.current_info().unwrap().name, "CRASH");
    let (status, _) = send(&app, post_json("/models/switch", json!({"model_name": "GLU"}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_predict_honors_caller_timeout() {
    let dir = model_dir();
    std::fs::write(dir.path().join("SLOW.onnx"), b"weights").unwrap();
    let (app, _) = app(&dir, "SLOW").await;

    let request = json!({"image_data": png_base64(64, 64), "options": {"timeout_ms": 20}});
    let (status, body) = send(&app, post_json("/predict/characterization", request)).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], "INFERENCE_TIMEOUT");

    let request = json!({"image_data": png_base64(64, 64), "options": {"timeout_ms": 0}});
    let (status, body) = send(&app, post_json("/predict/characterization", request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let request = json!({"image_data": png_base64(64, 64), "options": {"timeout_ms": 5000}});
    let (status, body) = send(&app, post_json("/predict/characterization", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "SLOW");
}

#[tokio::test]
async fn test_max_connections_limits_in_flight_requests() {
    let dir = model_dir();
    std::fs::write(dir.path().join("SLOW.onnx"), b"weights").unwrap();
    let (app, _) = app_with(&dir, "SLOW", |config| config.server_config.max_connections = 1).await;

    let image = png_base64(64, 64);
    let started = Instant::now();
    let (first, second) = tokio::join!(
        send(&app, post_json("/predict/concentration", json!({"image_data": image.clone()}))),
        send(&app, post_json("/predict/concentration", json!({"image_data": image}))),
    );
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    // 上限为1时两次推理只能依次执行
    assert!(started.elapsed() >= Duration::from_millis(400));
}
