//! Soft (software-emulated) compute units.
//!
//! Soft CUs live in a process-external worker pool. The scheduler only
//! speaks the hand-off contract below: configure and unconfigure address
//! ranges of CU indices, start copies a register map in, and status is a
//! single done poll.

use thiserror::Error;

/// Maximum soft CU index, shared with the worker pool.
pub const MAX_SOFT_CUS: usize = 128;

#[derive(Debug, Error)]
pub enum SoftCuError {
    #[error("soft CU range {start}..{end} exceeds the maximum of {max}")]
    OutOfRange {
        start: usize,
        end: usize,
        max: usize,
    },
    #[error("soft CU {0} is configured already")]
    AlreadyConfigured(usize),
    #[error("soft CU {0} is not configured")]
    NotConfigured(usize),
}

/// Contract against the soft-kernel worker pool.
///
/// Configure and unconfigure are asynchronous on the pool side: they
/// return once the request is accepted, and `configured` is polled until
/// every addressed index reaches the expected state.
pub trait SoftKernelPool: Send {
    /// Hand a configure request for `num` CUs starting at `start_cuidx`
    /// to the pool. Rejection fails the submitting command.
    fn configure(&mut self, start_cuidx: usize, num: usize) -> Result<(), SoftCuError>;

    /// Hand an unconfigure request to the pool.
    fn unconfigure(&mut self, start_cuidx: usize, num: usize) -> Result<(), SoftCuError>;

    /// Copy a register map into the soft CU register file and signal the
    /// pool's wait mechanism.
    fn start(&mut self, cu_idx: usize, regmap: &[u32]) -> Result<(), SoftCuError>;

    /// Whether the worker pool has this CU up.
    fn configured(&self, cu_idx: usize) -> bool;

    /// Poll and consume the done bit of a soft CU.
    ///
    /// The pool mirrors hard CU status registers, where done shares a bit
    /// with idle; a single-bit poll is intentionally good enough here.
    fn done(&mut self, cu_idx: usize) -> bool;
}
