//! # Velo Common Library
//!
//! Shared code for the velo sync services:
//! - Common error types
//! - Configuration loading and validation
//! - Event types and the broadcast EventBus

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
