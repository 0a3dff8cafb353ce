//! # Configuration
//!
//! Runtime settings loaded from environment variables.

pub mod runtime;

pub use runtime::RuntimeConfig;
