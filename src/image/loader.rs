use crate::utils::error::ServiceError;
use crate::Result;
use base64::Engine;
use image::{DynamicImage, GenericImageView, ImageFormat};

pub struct ImageLoader;

impl ImageLoader {
    /// 解码base64字符串为原始字节
    pub fn decode_base64(base64_data: &str) -> Result<Vec<u8>> {
        // 检测并移除可能的数据URL前缀 (data:image/xxx;base64,)
        let trimmed = base64_data.trim();
        let base64_clean = if trimmed.starts_with("data:") {
            trimmed.split_once(',').map(|(_, data)| data).unwrap_or(trimmed)
        } else {
            trimmed
        };

        let bytes = base64::engine::general_purpose::STANDARD.decode(base64_clean)?;
        if bytes.is_empty() {
            return Err(ServiceError::Decode("Empty image payload".to_string()));
        }
        Ok(bytes)
    }

    /// 从字节加载图像
    pub fn from_bytes(bytes: &[u8], max_bytes: usize) -> Result<DynamicImage> {
        if bytes.len() > max_bytes {
            return Err(ServiceError::FileTooLarge(bytes.len(), max_bytes));
        }

        let format = Self::detect_format(bytes)
            .ok_or_else(|| ServiceError::Decode("Unrecognized image format".to_string()))?;
        if !Self::is_supported_format(format) {
            return Err(ServiceError::Decode(format!("Unsupported image format: {:?}", format)));
        }

        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Self::validate_dimensions(&image)?;

        Ok(image)
    }

    /// 检测图像格式
    pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
        image::guess_format(bytes).ok()
    }

    pub fn is_supported_format(format: ImageFormat) -> bool {
        matches!(
            format,
            ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Bmp | ImageFormat::Tiff | ImageFormat::WebP
        )
    }

    /// 验证图像尺寸
    pub fn validate_dimensions(image: &DynamicImage) -> Result<()> {
        let (width, height) = image.dimensions();

        if width == 0 || height == 0 {
            return Err(ServiceError::Decode(format!("Image has no pixels: {}x{}", width, height)));
        }

        if width > 8192 || height > 8192 {
            return Err(ServiceError::Decode(format!(
                "Image too large: {}x{}, maximum 8192x8192",
                width, height
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_base64_with_data_url() {
        let raw = png_bytes(4, 4);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);
        let with_prefix = format!("data:image/png;base64,{}", encoded);

        assert_eq!(ImageLoader::decode_base64(&encoded).unwrap(), raw);
        assert_eq!(ImageLoader::decode_base64(&with_prefix).unwrap(), raw);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(ImageLoader::decode_base64("not base64!!"), Err(ServiceError::Base64(_))));
    }

    #[test]
    fn test_from_bytes() {
        let image = ImageLoader::from_bytes(&png_bytes(32, 16), 1024 * 1024).unwrap();
        assert_eq!(image.dimensions(), (32, 16));
    }

    #[test]
    fn test_from_bytes_rejects_garbage_and_oversize() {
        assert!(matches!(
            ImageLoader::from_bytes(b"definitely not an image", 1024),
            Err(ServiceError::Decode(_))
        ));
        let raw = png_bytes(8, 8);
        assert!(matches!(
            ImageLoader::from_bytes(&raw, 10),
            Err(ServiceError::FileTooLarge(_, 10))
        ));
    }
}
