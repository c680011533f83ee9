use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use yolo_service::{
    config::Config,
    models::{DeviceMode, ThresholdOverrides},
    web::serve,
};

#[derive(Parser)]
#[command(name = "yolo-service")]
#[command(about = "Hot-swappable YOLO object detection service")]
struct Args {
    /// Host to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Model directory path
    #[arg(long, env = "MODELS_DIR", default_value = "model_data")]
    models_dir: String,

    /// Model loaded at startup
    #[arg(long, env = "DEFAULT_MODEL", default_value = "MOF")]
    default_model: String,

    /// Prefer the accelerator (CUDA) for model loading
    #[arg(
        long,
        env = "USE_CUDA",
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = parse_switch
    )]
    use_cuda: bool,

    /// Confidence threshold override
    #[arg(long, env = "CONFIDENCE")]
    confidence: Option<f32>,

    /// NMS IoU threshold override
    #[arg(long, env = "NMS_IOU")]
    nms_iou: Option<f32>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable development mode
    #[arg(long)]
    dev: bool,
}

/// 只有 `true`（不区分大小写）视为开启
fn parse_switch(value: &str) -> std::result::Result<bool, String> {
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_target(false)
        .init();

    let device = if args.use_cuda { DeviceMode::Accelerator } else { DeviceMode::Cpu };
    let config = Config::new(
        Config::bind_from_parts(&args.host, args.port),
        args.models_dir,
        args.default_model,
        device,
        args.workers,
        args.dev,
    )?
    .with_thresholds(ThresholdOverrides {
        confidence: args.confidence,
        nms_iou: args.nms_iou,
    });

    tracing::info!("Starting YOLO detection service...");
    tracing::info!("Bind address: {}", config.bind_addr);
    tracing::info!("Models directory: {}", config.models_dir.display());
    tracing::info!("Default model: {} (device: {})", config.default_model, config.device);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()?;

    // 启动服务器
    runtime.block_on(serve(config))?;

    Ok(())
}
