use crate::models::{DeviceMode, ThresholdOverrides};
use crate::utils::error::ServiceError;
use crate::Result;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// 服务器绑定地址
    pub bind_addr: String,

    /// 模型文件目录
    pub models_dir: PathBuf,

    /// 启动时加载的模型名称
    pub default_model: String,

    /// 设备偏好（影响之后的模型加载）
    pub device: DeviceMode,

    /// 工作线程数量
    pub workers: usize,

    /// 开发模式
    pub dev_mode: bool,

    /// ONNX Runtime配置
    pub onnx_config: OnnxConfig,

    /// 服务器配置
    pub server_config: ServerConfig,

    /// 模型切换与推理的时间限制
    pub swap_config: SwapConfig,

    /// 模型目录扫描配置
    pub catalog_config: CatalogConfig,

    /// 检测阈值覆盖，未设置时使用模型方言的默认值
    pub thresholds: ThresholdOverrides,
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// CPU线程数
    pub intra_threads: usize,

    /// 优化级别 (0-3)
    pub optimization_level: i32,

    /// 加速设备编号
    pub device_id: i32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 请求超时时间（秒）
    pub request_timeout: u64,

    /// 最大请求体大小（字节）
    pub max_request_size: usize,

    /// 最大并发连接数
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct SwapConfig {
    /// 单次模型加载的最长时间
    pub load_timeout: Duration,

    /// 单次推理的最长时间
    pub inference_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// 视为权重文件的扩展名（不含点）
    pub weights_extensions: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            weights_extensions: vec!["onnx".to_string(), "pth".to_string()],
        }
    }
}

impl Config {
    pub fn new(
        bind_addr: String,
        models_dir: impl Into<PathBuf>,
        default_model: String,
        device: DeviceMode,
        workers: Option<usize>,
        dev_mode: bool,
    ) -> Result<Self> {
        if default_model.trim().is_empty() {
            return Err(ServiceError::Config("Default model name is empty".to_string()));
        }

        let cpu_cores = num_cpus::get();
        let workers = workers.unwrap_or(cpu_cores);

        let onnx_config = OnnxConfig {
            intra_threads: (cpu_cores * 3 / 4).max(1), // 使用75%的CPU核心
            optimization_level: 3,
            device_id: 0,
        };

        let server_config = ServerConfig {
            request_timeout: if dev_mode { 300 } else { 60 },
            max_request_size: 100 * 1024 * 1024, // 100MB
            max_connections: if dev_mode { 10 } else { 1000 },
        };

        let swap_config = SwapConfig {
            load_timeout: Duration::from_secs(if dev_mode { 600 } else { 120 }),
            inference_timeout: Duration::from_secs(if dev_mode { 120 } else { 30 }),
        };

        Ok(Self {
            bind_addr,
            models_dir: models_dir.into(),
            default_model,
            device,
            workers,
            dev_mode,
            onnx_config,
            server_config,
            swap_config,
            catalog_config: CatalogConfig::default(),
            thresholds: ThresholdOverrides::default(),
        })
    }

    /// 由HOST/PORT组合绑定地址
    pub fn bind_from_parts(host: &str, port: u16) -> String {
        format!("{}:{}", host, port)
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdOverrides) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// 最大可接受的图像字节数（base64解码后）
    pub fn max_image_bytes(&self) -> usize {
        self.server_config.max_request_size
    }
}
