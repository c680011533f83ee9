use crate::utils::error::ServiceError;
use crate::Result;
use ndarray::{ArrayD, Ix3, Ix4};
use std::cmp::Ordering;

/// 模型输入坐标系下的候选框
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    /// [x_min, y_min, x_max, y_max]
    pub bbox: [f32; 4],
    /// 在模型输出中出现的顺序
    pub index: usize,
}

/// 输出解码方式，在加载时确定，推理时不再判断模型类型
#[derive(Debug, Clone, PartialEq)]
pub enum Decoder {
    /// 三个尺度的特征图，每个尺度三个锚框
    Anchored { anchors: Vec<[f32; 2]> },
    /// 单个密集预测图
    AnchorFree,
}

const ANCHORS_PER_SCALE: usize = 3;

impl Decoder {
    /// 解码原始输出并按置信度过滤
    pub fn decode(
        &self,
        outputs: &[ArrayD<f32>],
        num_classes: usize,
        input_size: (usize, usize),
        confidence: f32,
    ) -> Result<Vec<Candidate>> {
        match self {
            Decoder::Anchored { anchors } => {
                decode_anchored(outputs, anchors, num_classes, input_size, confidence)
            }
            Decoder::AnchorFree => decode_anchor_free(outputs, num_classes, confidence),
        }
    }
}

fn decode_anchored(
    outputs: &[ArrayD<f32>],
    anchors: &[[f32; 2]],
    num_classes: usize,
    input_size: (usize, usize),
    confidence: f32,
) -> Result<Vec<Candidate>> {
    if anchors.len() < outputs.len() * ANCHORS_PER_SCALE {
        return Err(ServiceError::Inference(format!(
            "{} anchors cannot cover {} output scales",
            anchors.len(),
            outputs.len()
        )));
    }

    let maps = outputs
        .iter()
        .map(|o| {
            o.view().into_dimensionality::<Ix4>().map_err(|_| {
                ServiceError::Inference(format!(
                    "Unsupported anchored output shape: {:?}, expected (batch, channels, height, width)",
                    o.shape()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // 特征图越大步长越小，对应越小的锚框组
    let mut grid_sizes: Vec<usize> = maps.iter().map(|m| m.shape()[2]).collect();
    grid_sizes.sort_unstable_by(|a, b| b.cmp(a));

    let attrs = 5 + num_classes;
    let (input_h, input_w) = input_size;
    let mut candidates = Vec::new();
    let mut index = 0;

    for map in &maps {
        let (batch, channels, grid_h, grid_w) = map.dim();
        if batch != 1 {
            return Err(ServiceError::Inference("Expected batch size 1 for detection".to_string()));
        }
        if channels != ANCHORS_PER_SCALE * attrs {
            return Err(ServiceError::Inference(format!(
                "Output has {} channels but {} classes need {}",
                channels,
                num_classes,
                ANCHORS_PER_SCALE * attrs
            )));
        }

        let group = grid_sizes.iter().position(|&g| g == grid_h).unwrap_or(0);
        let stride_y = input_h as f32 / grid_h as f32;
        let stride_x = input_w as f32 / grid_w as f32;

        for a in 0..ANCHORS_PER_SCALE {
            let [anchor_w, anchor_h] = anchors[group * ANCHORS_PER_SCALE + a];
            let base = a * attrs;
            for gy in 0..grid_h {
                for gx in 0..grid_w {
                    let at = |k: usize| map[[0, base + k, gy, gx]];

                    let objectness = sigmoid(at(4));
                    let (class_id, class_score) = (0..num_classes)
                        .map(|c| (c, sigmoid(at(5 + c))))
                        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                        .unwrap_or((0, 0.0));
                    let score = objectness * class_score;

                    let current = index;
                    index += 1;
                    if score < confidence {
                        continue;
                    }

                    let cx = (sigmoid(at(0)) * 2.0 - 0.5 + gx as f32) * stride_x;
                    let cy = (sigmoid(at(1)) * 2.0 - 0.5 + gy as f32) * stride_y;
                    let w = (sigmoid(at(2)) * 2.0).powi(2) * anchor_w;
                    let h = (sigmoid(at(3)) * 2.0).powi(2) * anchor_h;

                    candidates.push(Candidate {
                        class_id,
                        score,
                        bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                        index: current,
                    });
                }
            }
        }
    }

    Ok(candidates)
}

fn decode_anchor_free(outputs: &[ArrayD<f32>], num_classes: usize, confidence: f32) -> Result<Vec<Candidate>> {
    let output = match outputs {
        [single] => single,
        _ => {
            return Err(ServiceError::Inference(format!(
                "Anchor-free model must produce one output, got {}",
                outputs.len()
            )))
        }
    };

    let pred = output.view().into_dimensionality::<Ix3>().map_err(|_| {
        ServiceError::Inference(format!(
            "Unsupported anchor-free output shape: {:?}, expected (batch, 4 + classes, anchors)",
            output.shape()
        ))
    })?;
    if pred.shape()[0] != 1 {
        return Err(ServiceError::Inference(format!(
            "Expected batch size 1 for detection, got {}",
            pred.shape()[0]
        )));
    }

    let attrs = 4 + num_classes;
    // 支持 (1, 4+nc, N) 与转置后的 (1, N, 4+nc)
    let pred = if pred.shape()[1] == attrs {
        pred
    } else if pred.shape()[2] == attrs {
        pred.permuted_axes([0, 2, 1])
    } else {
        return Err(ServiceError::Inference(format!(
            "Output shape {:?} does not match {} classes",
            pred.shape(),
            num_classes
        )));
    };

    let mut candidates = Vec::new();
    for i in 0..pred.shape()[2] {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, pred[[0, 4 + c, i]]))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .unwrap_or((0, 0.0));
        if score < confidence {
            continue;
        }

        let (cx, cy, w, h) = (pred[[0, 0, i]], pred[[0, 1, i]], pred[[0, 2, i]], pred[[0, 3, i]]);
        candidates.push(Candidate {
            class_id,
            score,
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            index: i,
        });
    }

    Ok(candidates)
}

/// 按类别做非极大值抑制，保留的框按原始输出顺序返回
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut suppressed = vec![false; candidates.len()];
    let mut keep = Vec::new();

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j]
                && candidates[i].class_id == candidates[j].class_id
                && iou(&candidates[i].bbox, &candidates[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        keep.push(candidates[i].clone());
    }

    keep.sort_by_key(|c| c.index);
    keep
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 解析锚框文件：逗号或空白分隔的 w,h 序列
pub fn parse_anchors(text: &str) -> std::result::Result<Vec<[f32; 2]>, String> {
    let values = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>().map_err(|e| format!("invalid anchor value '{}': {}", s, e)))
        .collect::<std::result::Result<Vec<f32>, String>>()?;

    if values.is_empty() || values.len() % 2 != 0 {
        return Err(format!("expected width,height pairs, got {} values", values.len()));
    }
    let anchors: Vec<[f32; 2]> = values.chunks(2).map(|p| [p[0], p[1]]).collect();
    if anchors.len() % ANCHORS_PER_SCALE != 0 {
        return Err(format!(
            "anchor count {} is not a multiple of {}",
            anchors.len(),
            ANCHORS_PER_SCALE
        ));
    }
    Ok(anchors)
}
