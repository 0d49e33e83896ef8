pub mod config;
pub mod error;
pub mod types;

pub use error::{BdeError, BdeResult};
pub use types::{BioCmd, DeviceStats};
