pub mod config;
pub mod error;
pub mod roi;
pub mod types;

pub use config::{Config, EngineConfig, LoadOptions};
pub use error::ConnectomeError;
pub use roi::*;
pub use types::*;
