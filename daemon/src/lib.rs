//! kronk_daemon - OpenAI-compatible HTTP surface
//!
//! This crate provides the server that:
//! - Exposes OpenAI-compatible chat, embedding and model endpoints
//! - Streams responses as Server-Sent Events
//! - Converts client disconnects into stream cancellation

pub mod api;
pub mod server;
pub mod state;

pub use server::run_server;
