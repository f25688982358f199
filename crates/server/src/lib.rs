#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod response;
pub mod routes;

pub use config::Args;
pub use error::{ApiError, ApiResult};
pub use routes::router;
