//! `cronlock-core`: configuration and process identity shared by the
//! scheduler library and the worker binary.

pub mod config;
pub mod error;
pub mod node;

pub use config::CronlockConfig;
pub use error::{CoreError, Result};
