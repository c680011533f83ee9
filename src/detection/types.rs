use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 单个检测结果，原图像素坐标（左上角 + 宽高）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl DetectionResult {
    /// 由原图坐标系下的 [x_min, y_min, x_max, y_max] 构造
    pub fn from_corners(label: String, confidence: f32, bbox: [f32; 4]) -> Self {
        let x_min = bbox[0].round() as i32;
        let y_min = bbox[1].round() as i32;
        let x_max = bbox[2].round() as i32;
        let y_max = bbox[3].round() as i32;

        Self {
            label,
            confidence: if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 },
            x: x_min,
            y: y_min,
            width: (x_max - x_min).max(0),
            height: (y_max - y_min).max(0),
        }
    }
}

/// 推理选项
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferOptions {
    /// 是否返回绘制了检测框的图像
    #[serde(default)]
    pub return_image: bool,

    /// 本次推理的超时（毫秒），不超过服务配置的上限
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// 一次推理的完整结果
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub detections: Vec<DetectionResult>,
    /// PNG编码的标注图像
    pub result_image: Option<Vec<u8>>,
    /// 产生结果的模型名称
    pub model: String,
    /// 产生结果的模型代数
    pub generation: u64,
    pub processing_time: Duration,
}

impl DetectionOutcome {
    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }
}

/// `/predict/{variant}` 支持的分析类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictVariant {
    Concentration,
    Characterization,
}

impl PredictVariant {
    pub fn success_message(&self) -> &'static str {
        match self {
            PredictVariant::Concentration => "Concentration detection completed successfully",
            PredictVariant::Characterization => "Particle characterization completed successfully",
        }
    }
}

impl std::str::FromStr for PredictVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concentration" => Ok(PredictVariant::Concentration),
            "characterization" => Ok(PredictVariant::Characterization),
            other => Err(format!("Unknown prediction variant '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_corners_clamps() {
        let det = DetectionResult::from_corners("cup".to_string(), 1.3, [10.4, 20.6, 5.0, 50.0]);
        assert_eq!(det.confidence, 1.0);
        assert_eq!((det.x, det.y), (10, 21));
        assert_eq!(det.width, 0);
        assert_eq!(det.height, 29);

        let nan = DetectionResult::from_corners("cup".to_string(), f32::NAN, [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_detection_serializes_class_field() {
        let det = DetectionResult::from_corners("GLU".to_string(), 0.8, [1.0, 2.0, 11.0, 22.0]);
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["class"], "GLU");
        assert_eq!(value["width"], 10);
        assert_eq!(value["height"], 20);
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("concentration".parse::<PredictVariant>().unwrap(), PredictVariant::Concentration);
        assert!("titration".parse::<PredictVariant>().is_err());
    }
}
