//! Asynchronous copy engine contract.
//!
//! Buffer-copy commands are served by a DMA engine rather than a CU. The
//! engine completes out of band: the completion handle flips flags on a
//! shared [`DmaState`] and wakes the scheduler, which observes the result
//! on its next polling pass.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

const DMA_DONE: u32 = 1 << 0;
const DMA_ERROR: u32 = 1 << 1;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("no DMA channel available")]
    NoChannel,
    #[error("copy engine rejected the request")]
    Rejected,
}

/// Copy request extracted from a start-copy packet.
#[derive(Debug, Clone, Copy)]
pub struct CopyRequest {
    pub src: u32,
    pub dst: u32,
    pub src_offset: u32,
    pub dst_offset: u32,
    pub size: u32,
}

/// Completion flags shared between a command and the engine callback.
#[derive(Debug, Default)]
pub struct DmaState {
    flags: AtomicU32,
}

impl DmaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record completion; called from the engine's context.
    pub fn complete(&self, error: bool) {
        let mut flags = DMA_DONE;
        if error {
            flags |= DMA_ERROR;
        }
        self.flags.fetch_or(flags, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.flags.load(Ordering::Acquire) & DMA_DONE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) & DMA_ERROR != 0
    }

    pub fn clear(&self) {
        self.flags.store(0, Ordering::Release);
    }
}

/// One-shot completion handle passed to the engine with each request.
pub struct CopyDone {
    state: Arc<DmaState>,
    wake: Box<dyn FnOnce() + Send>,
}

impl CopyDone {
    pub fn new(state: Arc<DmaState>, wake: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state,
            wake: Box::new(wake),
        }
    }

    /// Deliver the result and wake the scheduler.
    pub fn complete(self, error: bool) {
        self.state.complete(error);
        (self.wake)();
    }
}

/// Contract against the asynchronous copy engine.
pub trait CopyEngine: Send {
    /// Queue a copy. A hard failure here is unrecoverable for the
    /// submitting command; `done` must be fired exactly once otherwise.
    fn submit_copy(&mut self, req: CopyRequest, done: CopyDone) -> Result<(), CopyError>;
}
