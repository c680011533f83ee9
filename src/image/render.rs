use crate::detection::DetectionResult;
use crate::utils::error::ServiceError;
use crate::Result;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;

// 每个类别使用固定颜色
const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [0, 194, 255],
    [52, 69, 147],
];

/// 在原图副本上绘制检测框
pub struct OverlayRenderer;

impl OverlayRenderer {
    pub fn draw(image: &DynamicImage, detections: &[DetectionResult], labels: &[String]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let (w, h) = canvas.dimensions();
        let thickness = ((w + h) / 600).max(2) as i32;

        for det in detections {
            if det.width <= 0 || det.height <= 0 {
                continue;
            }
            let color = Rgb(Self::color_for(&det.label, labels));
            for t in 0..thickness {
                let width = det.width - 2 * t;
                let height = det.height - 2 * t;
                if width <= 0 || height <= 0 {
                    break;
                }
                let rect = Rect::at(det.x + t, det.y + t).of_size(width as u32, height as u32);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }

        canvas
    }

    /// 编码为PNG
    pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        image
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| ServiceError::Internal(format!("Failed to encode result image: {}", e)))?;
        Ok(buf.into_inner())
    }

    pub fn render_png(image: &DynamicImage, detections: &[DetectionResult], labels: &[String]) -> Result<Vec<u8>> {
        Self::encode_png(&Self::draw(image, detections, labels))
    }

    fn color_for(label: &str, labels: &[String]) -> [u8; 3] {
        let index = labels
            .iter()
            .position(|l| l == label)
            .unwrap_or_else(|| label.bytes().map(usize::from).sum());
        PALETTE[index % PALETTE.len()]
    }
}
