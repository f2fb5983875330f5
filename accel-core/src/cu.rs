//! Compute-unit model.
//!
//! A [`ComputeUnit`] owns the runtime state the scheduler tracks per CU:
//! credit counter, timeout budgets, completion count and the FIFO of
//! commands currently occupying it. Actual register traffic goes through a
//! [`CuAdapter`], implemented per CU model outside this crate.

use std::collections::VecDeque;

bitflags::bitflags! {
    /// Control register status bits common to the supported CU models.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CuStatus: u32 {
        const START = 1 << 0;
        const DONE = 1 << 1;
        const IDLE = 1 << 2;
        const READY = 1 << 3;
    }
}

/// How a register map is laid out in the command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegLayout {
    /// Consecutive register values starting at the control offset.
    Consecutive,
    /// Address/value pairs, for exec-write style commands.
    Pairs,
}

/// Hardware adapter kind encoded in the configure payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuKind {
    /// Standard handshake CU.
    Hls,
    /// ACC adapter CU; polling only.
    Acc,
}

/// Register adapter contract for one CU.
///
/// Implementations own the register I/O; the scheduler never sees an
/// address. `check` returns completions observed since the previous call
/// so the caller can accumulate completion credits.
pub trait CuAdapter: Send {
    /// Copy a register map into the CU register file.
    fn configure(&mut self, regmap: &[u32], layout: RegLayout);

    /// Kick the CU.
    fn start(&mut self);

    /// Completions observed since the last check.
    fn check(&mut self) -> u32;

    /// Issue a reset.
    fn reset(&mut self);

    /// Poll reset completion.
    fn reset_done(&mut self) -> bool;

    /// In-flight command capacity (pipeline depth); defaults to one.
    fn credits(&self) -> u32 {
        1
    }
}

/// Per-CU runtime state.
///
/// The running queue is strictly FIFO: the head entry is the only command
/// completion polling may retire, which enforces in-order completion per
/// CU even when several commands are in flight under the credit scheme.
pub struct ComputeUnit {
    pub idx: usize,
    hw: Box<dyn CuAdapter>,
    credits: u32,
    max_credits: u32,
    /// Completion credits observed but not yet consumed by retirement.
    pub done_cnt: u32,
    /// Run budget in microseconds; zero disables timeout tracking.
    pub run_timeout_us: u32,
    /// Reset budget in microseconds.
    pub reset_timeout_us: u32,
    /// Commands started on this CU, oldest first.
    pub running: VecDeque<u64>,
    /// Total commands ever started here.
    pub usage: u64,
}

impl ComputeUnit {
    pub fn new(idx: usize, hw: Box<dyn CuAdapter>) -> Self {
        let max_credits = hw.credits().max(1);
        Self {
            idx,
            hw,
            credits: max_credits,
            max_credits,
            done_cnt: 0,
            run_timeout_us: 0,
            reset_timeout_us: 0,
            running: VecDeque::new(),
            usage: 0,
        }
    }

    /// Spend one credit; returns the credits remaining afterwards.
    ///
    /// A zero return tells the caller this CU is now full and must be
    /// marked busy in the allocation mask.
    pub fn take_credit(&mut self) -> u32 {
        if self.credits > 0 {
            self.credits -= 1;
        }
        self.credits
    }

    /// Return credits after command retirement, capped at the capacity.
    pub fn refund_credit(&mut self, count: u32) {
        self.credits = (self.credits + count).min(self.max_credits);
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn max_credits(&self) -> u32 {
        self.max_credits
    }

    /// Poll the adapter and accumulate completion credits.
    pub fn check_status(&mut self) {
        self.done_cnt += self.hw.check();
    }

    pub fn configure(&mut self, regmap: &[u32], layout: RegLayout) {
        self.hw.configure(regmap, layout);
    }

    pub fn start(&mut self) {
        self.hw.start();
    }

    pub fn reset(&mut self) {
        self.hw.reset();
    }

    pub fn reset_done(&mut self) -> bool {
        self.hw.reset_done()
    }
}

impl std::fmt::Debug for ComputeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeUnit")
            .field("idx", &self.idx)
            .field("credits", &self.credits)
            .field("done_cnt", &self.done_cnt)
            .field("running", &self.running.len())
            .field("usage", &self.usage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeCu {
        started: u32,
        done_pending: u32,
        depth: u32,
    }

    impl CuAdapter for FakeCu {
        fn configure(&mut self, _regmap: &[u32], _layout: RegLayout) {}

        fn start(&mut self) {
            self.started += 1;
        }

        fn check(&mut self) -> u32 {
            std::mem::take(&mut self.done_pending)
        }

        fn reset(&mut self) {}

        fn reset_done(&mut self) -> bool {
            true
        }

        fn credits(&self) -> u32 {
            self.depth
        }
    }

    #[test]
    fn credits_never_exceed_capacity() {
        let mut cu = ComputeUnit::new(
            0,
            Box::new(FakeCu {
                depth: 2,
                ..Default::default()
            }),
        );
        assert_eq!(cu.take_credit(), 1);
        assert_eq!(cu.take_credit(), 0);
        assert_eq!(cu.take_credit(), 0);
        cu.refund_credit(1);
        cu.refund_credit(5);
        assert_eq!(cu.credits(), 2);
    }

    #[test]
    fn check_accumulates_done_count() {
        let mut cu = ComputeUnit::new(3, Box::new(FakeCu::default()));
        cu.check_status();
        assert_eq!(cu.done_cnt, 0);

        let mut cu = ComputeUnit::new(
            3,
            Box::new(FakeCu {
                done_pending: 2,
                ..Default::default()
            }),
        );
        cu.check_status();
        cu.check_status();
        assert_eq!(cu.done_cnt, 2);
    }
}
