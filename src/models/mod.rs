pub mod adapter;
pub mod backend;
pub mod catalog;
pub mod decode;
pub mod descriptor;
pub mod handle;
pub mod manager;

pub use adapter::{DetectorAdapter, ThresholdOverrides};
pub use backend::{BackendFactory, InferenceBackend, OrtBackendFactory};
pub use catalog::{CatalogEntry, CatalogEntryView, ModelCatalog};
pub use descriptor::{BackendKind, DeviceMode, ModelDescriptor};
pub use handle::{DetectionSettings, DetectorHandle, ModelInfo};
pub use manager::{ManagerStats, ModelManager, SwapState};
