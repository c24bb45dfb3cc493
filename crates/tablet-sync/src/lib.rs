//! tablet-sync library: native pieces around tablet-sync-core.
//!
//! The HTTP remote for the device web interface, a tokio-backed filesystem
//! and environment configuration, exposed so integration tests can reach them.

pub mod config;
pub mod http;
pub mod native_fs;

pub use config::{Config, ConfigError};
pub use http::HttpRemote;
pub use native_fs::NativeFs;
