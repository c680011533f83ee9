pub mod pipeline;
pub mod types;

pub use pipeline::DetectionPipeline;
pub use types::{DetectionOutcome, DetectionResult, InferOptions, PredictVariant};
