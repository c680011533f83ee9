use crate::models::{
    CatalogEntry, DetectorAdapter, DetectorHandle, DeviceMode, ModelCatalog, ModelDescriptor, ModelInfo,
    OrtBackendFactory,
};
use crate::utils::error::{LoadErrorKind, ServiceError};
use crate::{Config, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 切换状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapState {
    Idle,
    Loading,
}

/// 模型管理器统计信息
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub state: SwapState,
    pub current_model: Option<String>,
    pub generation: Option<u64>,
    pub device_preference: DeviceMode,
    pub switch_count: u64,
    pub failed_switches: u64,
    pub models_dir: String,
}

/// 持有唯一的当前模型并负责热切换
///
/// 推理方通过 `current()` 取得 `Arc` 快照，之后的切换不会影响已开始的推理。
/// 切换时新模型在阻塞线程池中加载，加载完成后才替换指针，写锁只在替换时持有。
pub struct ModelManager {
    catalog: ModelCatalog,
    adapter: Arc<DetectorAdapter>,
    active: RwLock<Option<Arc<DetectorHandle>>>,
    switch_lock: tokio::sync::Mutex<()>,
    device: RwLock<DeviceMode>,
    loading: AtomicBool,
    switch_count: AtomicU64,
    failed_switches: AtomicU64,
    load_timeout: Duration,
    default_model: String,
}

impl ModelManager {
    pub fn new(config: &Config, adapter: DetectorAdapter) -> Self {
        Self {
            catalog: ModelCatalog::new(config.models_dir.clone(), config.catalog_config.clone()),
            adapter: Arc::new(adapter),
            active: RwLock::new(None),
            switch_lock: tokio::sync::Mutex::new(()),
            device: RwLock::new(config.device),
            loading: AtomicBool::new(false),
            switch_count: AtomicU64::new(0),
            failed_switches: AtomicU64::new(0),
            load_timeout: config.swap_config.load_timeout,
            default_model: config.default_model.clone(),
        }
    }

    /// 使用ONNX Runtime后端
    pub fn from_config(config: &Config) -> Self {
        let factory = OrtBackendFactory::new(config.onnx_config.clone());
        Self::new(
            config,
            DetectorAdapter::new(Arc::new(factory)).with_overrides(config.thresholds),
        )
    }

    /// 加载默认模型，失败时服务仍然启动，只是没有可用模型
    pub async fn init(&self) -> Option<ModelInfo> {
        tracing::info!("Initializing model manager with default model '{}'...", self.default_model);

        match self.switch(&self.default_model, None).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!(
                    "Failed to load default model '{}': {}. Service starts without an active model",
                    self.default_model,
                    e
                );
                None
            }
        }
    }

    /// 切换到指定模型
    ///
    /// 同一时间只允许一次切换，并发的请求返回 `SwitchInProgress`。
    /// 任何失败都不会改变当前模型。
    pub async fn switch(&self, name: &str, device: Option<DeviceMode>) -> Result<ModelInfo> {
        let _switching = self.switch_lock.try_lock().map_err(|_| ServiceError::SwitchInProgress)?;

        let descriptor = match self.catalog.resolve(name) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.failed_switches.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let device = device.unwrap_or_else(|| self.device_preference());

        self.load_and_publish(descriptor, device).await
    }

    /// 在指定设备上重新加载当前模型
    pub async fn reload(&self, device: DeviceMode) -> Result<ModelInfo> {
        let _switching = self.switch_lock.try_lock().map_err(|_| ServiceError::SwitchInProgress)?;

        let descriptor = self
            .current()
            .map(|handle| handle.descriptor().clone())
            .ok_or(ServiceError::NoActiveModel)?;

        self.load_and_publish(descriptor, device).await
    }

    async fn load_and_publish(&self, descriptor: ModelDescriptor, device: DeviceMode) -> Result<ModelInfo> {
        let _loading = LoadingGuard::enter(&self.loading);
        let name = descriptor.name.clone();

        let adapter = Arc::clone(&self.adapter);
        let task = tokio::task::spawn_blocking(move || adapter.load(&descriptor, device));

        // 超时后加载任务仍在后台运行，结果被直接丢弃
        let loaded = match tokio::time::timeout(self.load_timeout, task).await {
            Ok(Ok(result)) => result,
            // 后端在加载中崩溃，视为权重不可用
            Ok(Err(e)) => Err(ServiceError::load(
                LoadErrorKind::CorruptWeights,
                format!("Model loading task failed: {}", e),
            )),
            Err(_) => Err(ServiceError::LoadTimeout(self.load_timeout)),
        };

        let handle = match loaded {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.failed_switches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Switch to model '{}' failed, keeping current model: {}", name, e);
                return Err(e);
            }
        };

        let info = handle.info();
        let previous = self.active.write().replace(handle);
        self.switch_count.fetch_add(1, Ordering::Relaxed);

        match previous {
            Some(old) => tracing::info!(
                "Switched model '{}' (generation {}) -> '{}' (generation {}), {} in-flight references to the old model",
                old.descriptor().name,
                old.generation(),
                info.name,
                info.generation,
                Arc::strong_count(&old) - 1
            ),
            None => tracing::info!("Model '{}' is now active (generation {})", info.name, info.generation),
        }

        Ok(info)
    }

    /// 当前模型的快照
    pub fn current(&self) -> Option<Arc<DetectorHandle>> {
        self.active.read().clone()
    }

    pub fn current_info(&self) -> Option<ModelInfo> {
        self.current().map(|handle| handle.info())
    }

    pub fn has_model(&self) -> bool {
        self.active.read().is_some()
    }

    /// 修改之后加载使用的设备，不影响当前模型
    pub fn set_device(&self, mode: DeviceMode) {
        let previous = std::mem::replace(&mut *self.device.write(), mode);
        if previous != mode {
            tracing::info!("Device preference changed: {} -> {}", previous, mode);
        }
    }

    pub fn device_preference(&self) -> DeviceMode {
        *self.device.read()
    }

    pub fn list_models(&self) -> Vec<CatalogEntry> {
        let current = self.current();
        self.catalog.list(current.as_deref())
    }

    pub fn status(&self) -> SwapState {
        if self.loading.load(Ordering::Acquire) {
            SwapState::Loading
        } else {
            SwapState::Idle
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let current = self.current();
        ManagerStats {
            state: self.status(),
            current_model: current.as_ref().map(|h| h.descriptor().name.clone()),
            generation: current.as_ref().map(|h| h.generation()),
            device_preference: self.device_preference(),
            switch_count: self.switch_count.load(Ordering::Relaxed),
            failed_switches: self.failed_switches.load(Ordering::Relaxed),
            models_dir: self.catalog.root().display().to_string(),
        }
    }
}

/// 加载期间把状态置为 `Loading`，离开作用域时恢复
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
