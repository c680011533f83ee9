use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array4;

/// 灰色填充值，与训练时的letterbox一致
const PAD_VALUE: f32 = 128.0 / 255.0;

/// letterbox变换参数，用于把模型坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    /// 模型输入坐标 -> 原图像素坐标，并限制在图像范围内
    pub fn to_original(&self, bbox: &[f32; 4]) -> [f32; 4] {
        let w = self.orig_width as f32;
        let h = self.orig_height as f32;
        [
            ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, h),
            ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, h),
        ]
    }
}

pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// 保持宽高比缩放到模型输入尺寸，居中放置并用灰色填充，输出NCHW [0,1]
    pub fn letterbox(image: &DynamicImage, input_size: (usize, usize)) -> (Array4<f32>, Letterbox) {
        let (orig_w, orig_h) = image.dimensions();
        let (target_h, target_w) = input_size;

        let scale = (target_w as f32 / orig_w.max(1) as f32).min(target_h as f32 / orig_h.max(1) as f32);
        let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, target_w as u32);
        let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, target_h as u32);

        let resized = image.resize_exact(new_w, new_h, FilterType::CatmullRom).to_rgb8();

        let offset_x = (target_w as u32 - new_w) / 2;
        let offset_y = (target_h as u32 - new_h) / 2;

        let mut tensor = Array4::<f32>::from_elem((1, 3, target_h, target_w), PAD_VALUE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = (x + offset_x) as usize;
            let ty = (y + offset_y) as usize;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
            }
        }

        let letterbox = Letterbox {
            scale,
            pad_x: offset_x as f32,
            pad_y: offset_y as f32,
            orig_width: orig_w,
            orig_height: orig_h,
        };

        (tensor, letterbox)
    }
}
