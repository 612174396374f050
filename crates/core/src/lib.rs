//! kronk_core - Configuration and on-disk layout
//!
//! This crate provides:
//! - The base directory and its env-var overrides
//! - The on-disk layout (libraries, models, catalogs, keys)
//! - Model identifier resolution against the models directory

pub mod config;
pub mod layout;

pub use config::{Config, ContextConfig, DEFAULT_API_HOST};
pub use layout::{Layout, ResolvedModel};
