use crate::config::CatalogConfig;
use crate::models::{DetectorHandle, ModelDescriptor};
use crate::utils::error::ServiceError;
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 模型目录中的一项
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub descriptor: ModelDescriptor,
    pub is_current: bool,
}

/// `/models` 响应中的单个模型
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntryView {
    pub name: String,
    pub model_path: String,
    pub classes_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchors_path: Option<String>,
    pub model_type: crate::models::BackendKind,
    pub is_current: bool,
}

impl From<&CatalogEntry> for CatalogEntryView {
    fn from(entry: &CatalogEntry) -> Self {
        let d = &entry.descriptor;
        Self {
            name: d.name.clone(),
            model_path: d.weights_path.display().to_string(),
            classes_path: d.labels_path.display().to_string(),
            anchors_path: d.anchors_path.as_ref().map(|p| p.display().to_string()),
            model_type: d.backend_kind,
            is_current: entry.is_current,
        }
    }
}

/// 扫描存储目录得到可安装的模型，不接触当前激活的模型
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    root: PathBuf,
    config: CatalogConfig,
}

impl ModelCatalog {
    pub fn new(root: impl Into<PathBuf>, config: CatalogConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 列出所有模型，并标记当前激活的那一个
    pub fn list(&self, current: Option<&DetectorHandle>) -> Vec<CatalogEntry> {
        let current_path = current.map(|h| canonical(&h.descriptor().weights_path));

        self.scan()
            .into_iter()
            .map(|descriptor| {
                let is_current = current_path
                    .as_ref()
                    .is_some_and(|p| *p == canonical(&descriptor.weights_path));
                CatalogEntry {
                    descriptor,
                    is_current,
                }
            })
            .collect()
    }

    /// 按名称查找模型描述符
    pub fn resolve(&self, name: &str) -> Result<ModelDescriptor> {
        self.scan()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ServiceError::ModelNotFound(name.to_string()))
    }

    fn scan(&self) -> Vec<ModelDescriptor> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Model directory {} unavailable: {}", self.root.display(), e);
                return Vec::new();
            }
        };

        let mut descriptors: Vec<ModelDescriptor> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_weights_file(path))
            .filter_map(|path| {
                let name = path.file_stem()?.to_str()?.to_string();
                Some(ModelDescriptor::from_convention(&self.root, &name, path))
            })
            .collect();

        // 同名的不同格式只保留扩展名列表中靠前的那个
        descriptors.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| self.extension_rank(&a.weights_path).cmp(&self.extension_rank(&b.weights_path)))
        });
        descriptors.dedup_by(|later, earlier| later.name == earlier.name);

        tracing::debug!("Catalog scan found {} models in {}", descriptors.len(), self.root.display());
        descriptors
    }

    fn is_weights_file(&self, path: &Path) -> bool {
        self.extension_rank(path) < self.config.weights_extensions.len()
    }

    fn extension_rank(&self, path: &Path) -> usize {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        ext.and_then(|ext| self.config.weights_extensions.iter().position(|e| *e == ext))
            .unwrap_or(usize::MAX)
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
