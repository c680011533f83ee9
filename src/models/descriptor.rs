use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 检测模型的两种方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// 基于锚框的多尺度检测器（YOLOv5风格，需要锚框文件）
    #[serde(rename = "v5")]
    LegacyAnchored,
    /// 无锚框单阶段检测器（YOLOv8风格）
    #[serde(rename = "v8")]
    AnchorFree,
}

impl BackendKind {
    /// `/info` 中报告的模型类型
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::LegacyAnchored => "YOLOv5",
            BackendKind::AnchorFree => "YOLOv8",
        }
    }

    pub fn requires_anchors(&self) -> bool {
        matches!(self, BackendKind::LegacyAnchored)
    }

    /// 该方言期望的模型输出数量
    pub fn expected_outputs(&self) -> usize {
        match self {
            BackendKind::LegacyAnchored => 3,
            BackendKind::AnchorFree => 1,
        }
    }

    /// (置信度阈值, NMS IoU阈值)
    pub fn default_thresholds(&self) -> (f32, f32) {
        match self {
            BackendKind::LegacyAnchored => (0.5, 0.3),
            BackendKind::AnchorFree => (0.5, 0.3),
        }
    }

    /// 默认输入尺寸 (height, width)
    pub fn default_input_size(&self) -> (usize, usize) {
        (640, 640)
    }
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Cpu,
    #[serde(alias = "gpu", alias = "cuda")]
    Accelerator,
}

impl std::str::FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceMode::Cpu),
            "accelerator" | "gpu" | "cuda" => Ok(DeviceMode::Accelerator),
            other => Err(format!("Unknown device '{}', expected cpu or accelerator", other)),
        }
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Cpu => f.write_str("cpu"),
            DeviceMode::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// 模型的静态元数据，与是否已加载无关
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub weights_path: PathBuf,
    pub labels_path: PathBuf,
    pub anchors_path: Option<PathBuf>,
    pub backend_kind: BackendKind,
}

/// 命名约定表中的一行
struct NamingRule {
    name: &'static str,
    labels_file: &'static str,
    kind: BackendKind,
}

const NAMING_RULES: &[NamingRule] = &[
    NamingRule {
        name: "MOF",
        labels_file: "voc_classes.txt",
        kind: BackendKind::LegacyAnchored,
    },
    NamingRule {
        name: "5101520",
        labels_file: "concentration_classes.txt",
        kind: BackendKind::LegacyAnchored,
    },
    NamingRule {
        name: "GLU",
        labels_file: "glu_classes.txt",
        kind: BackendKind::AnchorFree,
    },
];

/// 未登记的模型使用通用类别文件与锚框方言
const DEFAULT_LABELS_FILE: &str = "voc_classes.txt";
const DEFAULT_KIND: BackendKind = BackendKind::LegacyAnchored;
const ANCHORS_FILE: &str = "yolo_anchors.txt";

impl ModelDescriptor {
    /// 根据命名约定为 `root` 下的权重文件构造描述符
    pub fn from_convention(root: &Path, name: &str, weights_path: PathBuf) -> Self {
        let (labels_file, kind) = NAMING_RULES
            .iter()
            .find(|rule| rule.name == name)
            .map(|rule| (rule.labels_file, rule.kind))
            .unwrap_or((DEFAULT_LABELS_FILE, DEFAULT_KIND));

        let anchors_path = kind.requires_anchors().then(|| root.join(ANCHORS_FILE));

        Self {
            name: name.to_string(),
            weights_path,
            labels_path: root.join(labels_file),
            anchors_path,
            backend_kind: kind,
        }
    }
}
