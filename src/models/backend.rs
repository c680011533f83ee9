use crate::config::OnnxConfig;
use crate::models::{DeviceMode, ModelDescriptor};
use crate::utils::error::{LoadErrorKind, ServiceError};
use crate::Result;
use ndarray::{Array4, ArrayD};
use ort::{
    inputs,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Tensor,
};
use parking_lot::Mutex;
use std::path::Path;

/// 执行前向推理的外部后端
///
/// 输入为NCHW、数值范围[0,1]的张量，输出为模型的原始输出，顺序与模型定义一致。
pub trait InferenceBackend: Send + Sync {
    fn forward(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>>;

    /// 模型输出的数量
    fn output_count(&self) -> usize;

    /// 实际使用的设备
    fn device(&self) -> DeviceMode;
}

/// 根据权重文件创建后端实例
pub trait BackendFactory: Send + Sync {
    fn create(&self, descriptor: &ModelDescriptor, device: DeviceMode) -> Result<Box<dyn InferenceBackend>>;
}

/// 基于ONNX Runtime的后端
pub struct OrtBackend {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
    device: DeviceMode,
}

impl InferenceBackend for OrtBackend {
    fn forward(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let input_tensor = Tensor::from_array(input).map_err(|e| ServiceError::Ort(e.to_string()))?;

        // 推理 - 立即提取数据避免生命周期冲突
        let mut session = self.session.lock();
        let outputs = session
            .run(inputs![self.input_name.as_str() => input_tensor])
            .map_err(|e| ServiceError::Ort(e.to_string()))?;

        self.output_names
            .iter()
            .map(|name| match outputs.get(name.as_str()) {
                Some(output) => output
                    .try_extract_array::<f32>()
                    .map(|view| view.into_owned())
                    .map_err(|e| ServiceError::Ort(e.to_string())),
                None => {
                    let available: Vec<String> = outputs.keys().map(|s| s.to_string()).collect();
                    Err(ServiceError::Inference(format!(
                        "Output '{}' not found. Available outputs: {:?}",
                        name, available
                    )))
                }
            })
            .collect()
    }

    fn output_count(&self) -> usize {
        self.output_names.len()
    }

    fn device(&self) -> DeviceMode {
        self.device
    }
}

/// 创建ONNX Runtime会话的工厂
pub struct OrtBackendFactory {
    config: OnnxConfig,
}

impl OrtBackendFactory {
    pub fn new(config: OnnxConfig) -> Self {
        Self { config }
    }

    fn build_session(&self, path: &Path, device: DeviceMode) -> std::result::Result<Session, String> {
        let builder = Session::builder()
            .map_err(|e| e.to_string())?
            .with_optimization_level(optimization_level(self.config.optimization_level))
            .map_err(|e| e.to_string())?
            .with_intra_threads(self.config.intra_threads)
            .map_err(|e| e.to_string())?;

        let builder = match device {
            DeviceMode::Cpu => builder,
            DeviceMode::Accelerator => with_accelerator(builder, &self.config)?,
        };

        builder.commit_from_file(path).map_err(|e| e.to_string())
    }
}

impl BackendFactory for OrtBackendFactory {
    fn create(&self, descriptor: &ModelDescriptor, device: DeviceMode) -> Result<Box<dyn InferenceBackend>> {
        let weights_path = descriptor.weights_path.as_path();
        let is_onnx = weights_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));
        if !is_onnx {
            return Err(ServiceError::load(
                LoadErrorKind::UnsupportedBackend,
                format!(
                    "ONNX Runtime cannot execute {}; export the model to .onnx",
                    weights_path.display()
                ),
            ));
        }

        tracing::info!("Loading model from: {} (device: {})", weights_path.display(), device);

        let (session, actual_device) = match self.build_session(weights_path, device) {
            Ok(session) => (session, device),
            Err(e) if device == DeviceMode::Accelerator => {
                tracing::warn!("Accelerator unavailable ({}), falling back to CPU", e);
                let session = self
                    .build_session(weights_path, DeviceMode::Cpu)
                    .map_err(|e| ServiceError::load(LoadErrorKind::CorruptWeights, e))?;
                (session, DeviceMode::Cpu)
            }
            Err(e) => return Err(ServiceError::load(LoadErrorKind::CorruptWeights, e)),
        };

        let input_name = match session.inputs.first() {
            Some(input) => input.name.clone(),
            None => {
                return Err(ServiceError::load(
                    LoadErrorKind::UnsupportedBackend,
                    "Model has no inputs",
                ))
            }
        };

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        for (i, name) in output_names.iter().enumerate() {
            tracing::debug!("Model output[{}]: '{}'", i, name);
        }

        Ok(Box::new(OrtBackend {
            session: Mutex::new(session),
            input_name,
            output_names,
            device: actual_device,
        }))
    }
}

fn optimization_level(level: i32) -> GraphOptimizationLevel {
    match level {
        i32::MIN..=0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

#[cfg(feature = "cuda")]
fn with_accelerator(builder: SessionBuilder, config: &OnnxConfig) -> std::result::Result<SessionBuilder, String> {
    use ort::execution_providers::CUDAExecutionProvider;

    builder
        .with_execution_providers([CUDAExecutionProvider::default()
            .with_device_id(config.device_id)
            .build()
            .error_on_failure()])
        .map_err(|e| format!("CUDA provider failed: {}", e))
}

#[cfg(not(feature = "cuda"))]
fn with_accelerator(_builder: SessionBuilder, _config: &OnnxConfig) -> std::result::Result<SessionBuilder, String> {
    Err("built without accelerator support (enable the `cuda` feature)".to_string())
}
