// SPDX-License-Identifier: MIT

//! Command objects and their recycling pool.
//!
//! A command carries one packet through the scheduler. Internal state is
//! owned by the worker; callers only ever see the [`Completion`] published
//! through their notifier on the terminal transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use accel::copy::DmaState;
use accel::packet::{Opcode, Packet};
use parking_lot::Mutex;

use crate::device::DeviceId;

pub type CmdId = u64;

/// Command lifecycle states.
///
/// `Timeout` is flagged internally by the watchdog tick and becomes
/// terminal once the CU reset protocol has run; the scheduler iteration
/// order guarantees a `Timeout` command is reset before it is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    New,
    Queued,
    Running,
    Completed,
    /// CU timed out; after reset this is the terminal "CU recovered" state.
    Timeout,
    Error,
    /// CU timed out and did not come back from reset.
    NoResponse,
}

impl CmdState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CmdState::Completed | CmdState::Timeout | CmdState::Error | CmdState::NoResponse
        )
    }
}

/// Final status published to the submitter, exactly once per command.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub id: CmdId,
    pub state: CmdState,
    /// Where the hardware-visible completion status lives.
    pub cq_slot_idx: usize,
    /// CU that executed the command, -1 if none was involved.
    pub cu_idx: i32,
}

pub type NotifyFn = Box<dyn FnOnce(Completion) + Send>;
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// One in-flight unit of work.
pub struct Command {
    pub id: CmdId,
    pub device: DeviceId,
    pub packet: Packet,
    pub state: CmdState,
    /// Assigned CU, -1 until submission picks one.
    pub cu_idx: i32,
    /// Occupied command queue slot, -1 unless submitted.
    pub slot_idx: i32,
    pub cq_slot_idx: usize,
    /// Remaining timeout ticks; zero disables the watchdog check.
    pub exec_time: u32,
    pub check_timeout: bool,
    /// Whether this command counts against the scheduler poll counter.
    pub polled: bool,
    /// Copy-engine completion flags, shared with the engine callback.
    pub dma: Arc<DmaState>,
    release: Option<ReleaseFn>,
    notify: Option<NotifyFn>,
}

impl Command {
    fn shell() -> Self {
        Self {
            id: 0,
            device: 0,
            packet: Packet::default(),
            state: CmdState::New,
            cu_idx: -1,
            slot_idx: -1,
            cq_slot_idx: 0,
            exec_time: 0,
            check_timeout: false,
            polled: false,
            dma: Arc::new(DmaState::new()),
            release: None,
            notify: None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.packet.opcode()
    }

    pub(crate) fn set_state(&mut self, state: CmdState) {
        log::trace!("cmd {} -> {:?}", self.id, state);
        self.state = state;
    }

    /// Fire the completion notifier with the current state.
    pub(crate) fn notify_completion(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify(Completion {
                id: self.id,
                state: self.state,
                cq_slot_idx: self.cq_slot_idx,
                cu_idx: self.cu_idx,
            });
        }
    }

    /// Return the payload buffer through the caller's release callback.
    pub(crate) fn release_buffer(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("opcode", &self.opcode())
            .field("state", &self.state)
            .field("cu_idx", &self.cu_idx)
            .field("slot_idx", &self.slot_idx)
            .finish()
    }
}

/// Free list of recycled command objects.
///
/// Commands are recycled for later use; the pool itself lives as long as
/// the scheduler. Submitters take from the pool, the worker returns
/// terminal commands to it after releasing their buffers.
pub(crate) struct CmdPool {
    free: Mutex<Vec<Box<Command>>>,
    next_id: AtomicU64,
}

impl CmdPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Take a recycled command or allocate a fresh one, re-initialized for
    /// a new submission.
    pub fn get(
        &self,
        device: DeviceId,
        packet: Packet,
        cq_slot_idx: usize,
        release: ReleaseFn,
        notify: NotifyFn,
    ) -> Box<Command> {
        let mut cmd = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(Command::shell()));
        cmd.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        cmd.device = device;
        cmd.packet = packet;
        cmd.state = CmdState::New;
        cmd.cu_idx = -1;
        cmd.slot_idx = -1;
        cmd.cq_slot_idx = cq_slot_idx;
        cmd.exec_time = 0;
        cmd.check_timeout = false;
        cmd.polled = false;
        // Always fresh: a copy engine callback from a discarded command may
        // still hold the old Arc and fire after the object is reissued.
        cmd.dma = Arc::new(DmaState::new());
        cmd.release = Some(release);
        cmd.notify = Some(notify);
        cmd
    }

    /// Release the buffer and return the command object to the free list.
    pub fn recycle(&self, mut cmd: Box<Command>) {
        cmd.release_buffer();
        cmd.notify = None;
        cmd.packet = Packet::default();
        self.free.lock().push(cmd);
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}
