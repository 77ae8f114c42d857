pub mod config;
pub mod error;

pub use config::CrondConfig;
pub use error::{Result, SkynetError};
