//! kronk_engine - llama.cpp-backed inference engine
//!
//! This crate drives the native engine one token at a time and exposes the
//! result as a lazy, cancellable stream of response deltas:
//! - Process-wide backend lifecycle and the narrow facade over llama.cpp
//! - Model handles producing per-request execution contexts
//! - The decoder core with its reasoning/completion/tool-call tag machine
//! - A fixed-size slot pool bounding concurrency per model
//! - The request dispatcher and the usage accountant

pub mod backend;
pub mod dispatch;
pub mod metrics;
pub mod model;
pub mod prompt;
pub mod sampler;
pub mod slots;

mod decoder;
mod tooling;

pub use backend::Backend;
pub use dispatch::{Dispatcher, ModelEntry, ModelListing};
pub use metrics::metrics;
pub use model::{Model, ModelConfig, ModelInfo, DEFAULT_LOAD_DEADLINE, DEFAULT_UNLOAD_DEADLINE};
pub use prompt::{PromptAssembler, MEDIA_MARKER};
pub use slots::SlotPool;
