pub mod config;
pub mod error;
pub mod types;

pub use error::{StowError, StowResult};
pub use types::{Asset, Destination, LocalSource};
