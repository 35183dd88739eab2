pub mod blob_ref;
pub mod device_capabilities;
pub mod image_metadata;
pub mod protocol_draft;
pub mod queue_task;
pub mod upload_task;

pub use blob_ref::BlobRef;
pub use device_capabilities::{DeviceCapabilities, NetworkClass};
pub use image_metadata::{ImageMetadata, ProtocolImage};
pub use protocol_draft::ProtocolDraft;
pub use queue_task::QueueTask;
pub use upload_task::{Destination, UploadStatus, UploadTask, Variant};
