//! Slot manager: a fixed-size pool of execution slots per model.
//!
//! Each slot is a dedicated worker thread owning one warm native context.
//! Contexts are reused across requests after a KV-cache clear, retired after
//! an idle deadline, and lazily recreated. Admission is a FIFO semaphore;
//! cancellation before acquisition returns *cancelled*. Release is guard
//! based, so it survives every exit path of a stream job.

use kronk_api::{CancelToken, Error, Result};
use llama_cpp_2::context::LlamaContext;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::Model;

/// Idle time after which a slot's warm context is dropped.
pub const DEFAULT_IDLE_DEADLINE: Duration = Duration::from_secs(60);

/// Work shipped to a slot's worker thread.
pub(crate) type SlotJob = Box<dyn for<'m, 'w> FnOnce(&'m Model, &'w mut WarmContext<'m>) + Send>;

/// The warm native context owned by a slot worker. It never leaves the
/// worker thread, which keeps the context's model borrow honest.
pub struct WarmContext<'m> {
    model: &'m Model,
    ctx: Option<LlamaContext<'m>>,
}

impl<'m> WarmContext<'m> {
    fn new(model: &'m Model) -> Self {
        Self { model, ctx: None }
    }

    /// A context ready for a fresh request: the warm one with its KV cache
    /// cleared, or a newly created one.
    pub fn fresh(&mut self) -> Result<&mut LlamaContext<'m>> {
        match self.ctx {
            Some(ref mut ctx) => {
                ctx.clear_kv_cache();
                Ok(ctx)
            }
            None => {
                let ctx = self.model.new_context()?;
                Ok(self.ctx.insert(ctx))
            }
        }
    }

    /// Drop the warm context. Returns whether one existed.
    pub fn retire(&mut self) -> bool {
        self.ctx.take().is_some()
    }
}

struct SlotSender {
    id: usize,
    tx: SyncSender<SlotJob>,
}

/// A fixed pool of `concurrency` slots for one model.
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<SlotSender>>>,
    model: Arc<Model>,
}

/// An acquired slot. Dropped unused it releases immediately; once `run` is
/// called, release happens when the job finishes on the worker thread.
pub struct Slot {
    sender: Option<SlotSender>,
    permit: Option<OwnedSemaphorePermit>,
    free: Arc<Mutex<Vec<SlotSender>>>,
    model: Arc<Model>,
}

struct ReleaseGuard {
    sender: Option<SlotSender>,
    _permit: Option<OwnedSemaphorePermit>,
    free: Arc<Mutex<Vec<SlotSender>>>,
    model: Arc<Model>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            if let Ok(mut free) = self.free.lock() {
                free.push(sender);
            }
        }
        self.model.stream_finished();
    }
}

impl SlotPool {
    pub fn new(model: Arc<Model>, idle_deadline: Duration) -> Result<Self> {
        let concurrency = model.config().concurrency;

        let free = Arc::new(Mutex::new(Vec::with_capacity(concurrency)));

        for id in 0..concurrency {
            // The channel is rendezvous-sized: a job is only ever sent to a
            // slot just popped from the free list, so sends never block.
            let (tx, rx) = std::sync::mpsc::sync_channel::<SlotJob>(1);

            let worker_model = model.clone();
            std::thread::Builder::new()
                .name(format!("kronk-slot-{id}"))
                .spawn(move || worker(worker_model, rx, idle_deadline, id))
                .map_err(|e| Error::internal(format!("unable to spawn slot worker: {e}")))?;

            free.lock()
                .map_err(|_| Error::internal("slot free list poisoned"))?
                .push(SlotSender { id, tx });
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            free,
            model,
        })
    }

    /// Wait for a free slot, first come first served. Cancellation while
    /// queued returns *cancelled*.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<Slot> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                let cause = cancel.cause().unwrap_or_else(|| "cancelled".to_string());
                return Err(Error::Cancelled(cause));
            }
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Error::internal("slot pool closed"))?
            }
        };

        let sender = self
            .free
            .lock()
            .map_err(|_| Error::internal("slot free list poisoned"))?
            .pop()
            .ok_or_else(|| Error::internal("no free slot behind permit"))?;

        self.model.stream_started();

        Ok(Slot {
            sender: Some(sender),
            permit: Some(permit),
            free: self.free.clone(),
            model: self.model.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.model.config().concurrency
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Slot {
    /// Ship a job to this slot's worker. The slot is released when the job
    /// finishes, including panic unwinds.
    pub(crate) fn run(mut self, job: SlotJob) -> Result<()> {
        let sender = self
            .sender
            .take()
            .ok_or_else(|| Error::internal("slot already consumed"))?;

        let release = ReleaseGuard {
            sender: Some(SlotSender {
                id: sender.id,
                tx: sender.tx.clone(),
            }),
            _permit: self.permit.take(),
            free: self.free.clone(),
            model: self.model.clone(),
        };

        let wrapped: SlotJob = Box::new(move |model, warm| {
            let _release = release;
            job(model, warm);
        });

        sender
            .tx
            .send(wrapped)
            .map_err(|_| Error::internal("slot worker is gone"))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Acquired but never run: hand the slot straight back.
        if let Some(sender) = self.sender.take() {
            if let Ok(mut free) = self.free.lock() {
                free.push(sender);
            }
            self.model.stream_finished();
        }
    }
}

fn worker(model: Arc<Model>, rx: Receiver<SlotJob>, idle_deadline: Duration, slot: usize) {
    let mut warm = WarmContext::new(&model);

    loop {
        match rx.recv_timeout(idle_deadline) {
            Ok(job) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| job(&model, &mut warm)));
                if outcome.is_err() {
                    tracing::error!(slot, "slot job panicked");
                    warm.retire();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if warm.retire() {
                    tracing::debug!(slot, "warm context retired after idle deadline");
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!(slot, "slot worker stopped");
}
