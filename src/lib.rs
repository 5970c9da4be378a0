pub mod config;
pub mod error;
pub mod relay;

pub use config::{Config, RelaySettings};
pub use error::{Error, Result};
