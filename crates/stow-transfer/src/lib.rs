//! stow-transfer: bridges the sealing codec to chunked object storage
//!
//! - `upload`: [`AttachmentStore::upload_asset`], resumable multi-part upload
//! - `download`: verified, optionally ranged download
//! - `retry`: retry loops that resume instead of restarting
//! - `progress`: progress sink and caller abort

pub mod download;
pub mod progress;
pub mod retry;
pub mod task;
pub mod upload;

pub use progress::{ProgressControl, ProgressSink};
pub use retry::{download_with_retry, upload_with_retry};
pub use task::{PlaintextSource, UploadTask};
pub use upload::{AttachmentStore, MAX_PARTS};
