//! stow-storage: object-storage capability consumed by the transfer orchestrator
//!
//! - `store`: the [`ObjectStore`] trait (single PUT, ranged GET, multi-part lifecycle)
//! - `signer`: injected request-signing capability
//! - `memory`: in-process store with transfer statistics, used by tests and the `memory` backend
//! - `staged`: OpenDAL-backed store that stages multi-part sessions as objects
//! - `operator`: OpenDAL operator factory for S3-compatible endpoints

pub mod health;
pub mod memory;
pub mod operator;
pub mod signer;
pub mod staged;
pub mod store;

pub use health::{check_health, probe, HealthReport};
pub use memory::{MemStore, TransferStats};
pub use operator::{build_memory_operator, build_operator, StorageConfig};
pub use signer::{KeyedSigner, RequestSigner};
pub use staged::OpendalStore;
pub use store::{part_checksum, ByteRange, ObjectReader, ObjectStore, PartInfo, UploadId};
