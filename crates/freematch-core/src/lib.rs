//! Core types and utilities for FreeMatch semi-supervised training.
//!
//! This crate provides the error type, run configuration, backend selection,
//! CLI helpers and evaluation metrics shared by the data, training and tool
//! crates.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result, ResultExt};
pub use metrics::*;

/// Re-export commonly used types
pub mod prelude {
    pub use burn::prelude::*;
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::metrics::*;
}
