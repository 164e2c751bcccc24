//! REST surface and process wiring for taskhub.

pub mod config;
pub mod error;
pub mod routes;

pub use config::{AppConfig, ConfigError};
pub use error::ApiError;
pub use routes::{router, AppState};
