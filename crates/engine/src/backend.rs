//! Process-wide native backend lifecycle.
//!
//! The native library requires a single process-wide initialisation and
//! teardown. The first `Backend::acquire` initialises it; when the last
//! `Arc<Backend>` drops, the library is torn down. Only a `Weak` is stored
//! globally so shutdown order stays deterministic.

use kronk_api::{Error, Result};
use llama_cpp_2::llama_backend::LlamaBackend;
use std::sync::{Arc, Mutex, Weak};

static BACKEND: Mutex<Weak<Backend>> = Mutex::new(Weak::new());

/// Shared handle to the initialised native backend.
pub struct Backend {
    inner: LlamaBackend,
}

impl Backend {
    /// Get the process backend, initialising the native library on first use.
    pub fn acquire() -> Result<Arc<Self>> {
        let mut guard = BACKEND
            .lock()
            .map_err(|_| Error::internal("backend registry poisoned"))?;

        if let Some(backend) = guard.upgrade() {
            return Ok(backend);
        }

        let inner = LlamaBackend::init()
            .map_err(|e| Error::internal(format!("unable to init native backend: {e}")))?;

        let backend = Arc::new(Self { inner });
        *guard = Arc::downgrade(&backend);

        tracing::info!("native backend initialized");
        Ok(backend)
    }

    /// The raw backend handle for facade calls.
    pub fn raw(&self) -> &LlamaBackend {
        &self.inner
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        tracing::info!("native backend released");
    }
}
