//! Configuration
//!
//! Option loading, validation, and shared type definitions.

#[allow(clippy::module_inception)]
pub mod config;
pub mod types;
pub mod validator;
