pub mod loader;
pub mod preprocessing;
pub mod render;

pub use loader::ImageLoader;
pub use preprocessing::{ImagePreprocessor, Letterbox};
pub use render::OverlayRenderer;
