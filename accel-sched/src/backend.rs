// SPDX-License-Identifier: MIT

//! Submission backends.
//!
//! Two policies cover the supported devices:
//!
//! - [`Backend::Penguin`]: the host drives CUs directly. Kernel starts go
//!   through the CU register adapters, copies through the DMA engine.
//! - [`Backend::PsErt`]: an embedded co-processor runs soft kernels next
//!   to the hard CUs; every command additionally occupies a queue slot
//!   visible to the co-processor.
//!
//! `submit` moves a queued command onto hardware or reports back that
//! resources are exhausted; `query` polls a running command for its
//! terminal state. Both run on the scheduler worker only.

use std::sync::Arc;

use accel::copy::CopyDone;
use accel::cu::RegLayout;
use accel::packet::Opcode;
use log::error;

use crate::command::{CmdState, Command};
use crate::device::{CuClass, DeviceExec};
use crate::scheduler::SchedShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Host-driven scheduling of hard CUs.
    Penguin,
    /// Co-processor assisted scheduling with soft-kernel support.
    PsErt,
}

/// What became of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    /// On hardware; the command is now running.
    Started,
    /// Out of slots, CUs or credits; retry on a later pass.
    Busy,
    /// Unrecoverable; the command must be failed.
    Error,
}

impl Backend {
    pub(crate) fn submit(
        self,
        dev: &mut DeviceExec,
        cmd: &mut Command,
        shared: &Arc<SchedShared>,
    ) -> SubmitOutcome {
        match self {
            Backend::Penguin => penguin_submit(dev, cmd, shared),
            Backend::PsErt => ps_ert_submit(dev, cmd),
        }
    }

    pub(crate) fn query(self, dev: &mut DeviceExec, cmd: &Command) -> Option<CmdState> {
        match self {
            Backend::Penguin => penguin_query(dev, cmd),
            Backend::PsErt => ps_ert_query(dev, cmd),
        }
    }
}

fn penguin_submit(
    dev: &mut DeviceExec,
    cmd: &mut Command,
    shared: &Arc<SchedShared>,
) -> SubmitOutcome {
    match cmd.opcode() {
        Opcode::Configure | Opcode::InitCu => {
            // Config commands were applied when dequeued; they only need a
            // slot so completion is reported like any other command.
            let Some(slot) = dev.acquire_slot() else {
                return SubmitOutcome::Busy;
            };
            cmd.slot_idx = slot as i32;
            SubmitOutcome::Started
        }
        Opcode::StartCopy => {
            // Slot first: the engine may complete before submit returns,
            // and a completed copy without a slot could never retire.
            let Some(slot) = dev.acquire_slot() else {
                return SubmitOutcome::Busy;
            };
            let req = match cmd.packet.as_copy() {
                Ok(p) => accel::copy::CopyRequest {
                    src: p.src,
                    dst: p.dst,
                    src_offset: p.src_offset,
                    dst_offset: p.dst_offset,
                    size: p.size,
                },
                Err(e) => {
                    error!("cmd {}: bad copy payload: {e}", cmd.id);
                    release_or_flag(dev, shared, slot);
                    return SubmitOutcome::Error;
                }
            };
            let Some(engine) = dev.copy_engine.as_mut() else {
                error!("cmd {}: device {} has no copy engine", cmd.id, dev.id);
                release_or_flag(dev, shared, slot);
                return SubmitOutcome::Error;
            };
            let waker = Arc::clone(shared);
            let done = CopyDone::new(Arc::clone(&cmd.dma), move || waker.wake());
            if let Err(e) = engine.submit_copy(req, done) {
                error!("cmd {}: copy engine refused request: {e}", cmd.id);
                release_or_flag(dev, shared, slot);
                return SubmitOutcome::Error;
            }
            cmd.slot_idx = slot as i32;
            SubmitOutcome::Started
        }
        Opcode::StartCu | Opcode::ExecWrite => {
            let layout = if cmd.opcode() == Opcode::ExecWrite {
                RegLayout::Pairs
            } else {
                RegLayout::Consecutive
            };
            let Some(cu) = dev.get_free_cu(&cmd.packet, CuClass::Hard) else {
                return SubmitOutcome::Busy;
            };
            let Some(slot) = dev.acquire_slot() else {
                dev.unget_cu(cu, CuClass::Hard);
                return SubmitOutcome::Busy;
            };
            cmd.cu_idx = cu as i32;
            cmd.slot_idx = slot as i32;
            if let Err(e) = dev.configure_cu(cmd, cu, layout, true) {
                error!("cmd {}: cannot start CU {cu}: {e}", cmd.id);
                dev.unget_cu(cu, CuClass::Hard);
                release_or_flag(dev, shared, slot);
                cmd.cu_idx = -1;
                cmd.slot_idx = -1;
                return SubmitOutcome::Error;
            }
            SubmitOutcome::Started
        }
        other => {
            error!("cmd {}: opcode {other:?} unsupported without a co-processor", cmd.id);
            SubmitOutcome::Error
        }
    }
}

fn penguin_query(dev: &mut DeviceExec, cmd: &Command) -> Option<CmdState> {
    match cmd.opcode() {
        Opcode::Configure | Opcode::InitCu => Some(CmdState::Completed),
        Opcode::StartCopy => {
            if !cmd.dma.is_done() {
                return None;
            }
            Some(if cmd.dma.is_error() {
                CmdState::Error
            } else {
                CmdState::Completed
            })
        }
        Opcode::StartCu | Opcode::ExecWrite => {
            if dev.cu_done(cmd) {
                Some(CmdState::Completed)
            } else {
                None
            }
        }
        other => {
            error!("cmd {}: cannot query opcode {other:?}", cmd.id);
            Some(CmdState::Error)
        }
    }
}

fn ps_ert_submit(dev: &mut DeviceExec, cmd: &mut Command) -> SubmitOutcome {
    // Every command occupies a co-processor visible slot.
    let Some(slot) = dev.acquire_slot() else {
        return SubmitOutcome::Busy;
    };
    cmd.slot_idx = slot as i32;

    let fail = |dev: &mut DeviceExec, cmd: &mut Command, outcome| {
        if !dev.release_slot(slot) {
            error!("cmd {}: slot {slot} double free", cmd.id);
        }
        cmd.slot_idx = -1;
        outcome
    };

    match cmd.opcode() {
        Opcode::Configure | Opcode::InitCu => SubmitOutcome::Started,
        Opcode::SkConfig | Opcode::SkUnconfig => {
            let range = match cmd.packet.as_sk_range() {
                Ok(r) => r,
                Err(e) => {
                    error!("cmd {}: bad soft-kernel payload: {e}", cmd.id);
                    return fail(dev, cmd, SubmitOutcome::Error);
                }
            };
            let configure = cmd.opcode() == Opcode::SkConfig;
            let Some(pool) = dev.soft_pool.as_mut() else {
                error!("cmd {}: device {} has no soft-kernel pool", cmd.id, dev.id);
                return fail(dev, cmd, SubmitOutcome::Error);
            };
            let res = if configure {
                pool.configure(range.start_cuidx, range.num_cus)
            } else {
                pool.unconfigure(range.start_cuidx, range.num_cus)
            };
            if let Err(e) = res {
                error!("cmd {}: soft-kernel pool rejected request: {e}", cmd.id);
                return fail(dev, cmd, SubmitOutcome::Error);
            }
            SubmitOutcome::Started
        }
        Opcode::SkStart => {
            let Some(cu) = dev.get_free_cu(&cmd.packet, CuClass::Soft) else {
                return fail(dev, cmd, SubmitOutcome::Busy);
            };
            let regmap = match cmd.packet.regmap() {
                Ok(r) => r.to_vec(),
                Err(e) => {
                    error!("cmd {}: bad soft-kernel start payload: {e}", cmd.id);
                    dev.unget_cu(cu, CuClass::Soft);
                    return fail(dev, cmd, SubmitOutcome::Error);
                }
            };
            let Some(pool) = dev.soft_pool.as_mut() else {
                error!("cmd {}: device {} has no soft-kernel pool", cmd.id, dev.id);
                dev.unget_cu(cu, CuClass::Soft);
                return fail(dev, cmd, SubmitOutcome::Error);
            };
            if let Err(e) = pool.start(cu, &regmap) {
                error!("cmd {}: soft CU {cu} start failed: {e}", cmd.id);
                dev.unget_cu(cu, CuClass::Soft);
                return fail(dev, cmd, SubmitOutcome::Error);
            }
            cmd.cu_idx = cu as i32;
            SubmitOutcome::Started
        }
        Opcode::StartCu | Opcode::ExecWrite => {
            let layout = if cmd.opcode() == Opcode::ExecWrite {
                RegLayout::Pairs
            } else {
                RegLayout::Consecutive
            };
            let Some(cu) = dev.get_free_cu(&cmd.packet, CuClass::Hard) else {
                return fail(dev, cmd, SubmitOutcome::Busy);
            };
            cmd.cu_idx = cu as i32;
            if let Err(e) = dev.configure_cu(cmd, cu, layout, false) {
                error!("cmd {}: cannot start CU {cu}: {e}", cmd.id);
                dev.unget_cu(cu, CuClass::Hard);
                cmd.cu_idx = -1;
                return fail(dev, cmd, SubmitOutcome::Error);
            }
            SubmitOutcome::Started
        }
        other => {
            error!("cmd {}: opcode {other:?} not supported", cmd.id);
            fail(dev, cmd, SubmitOutcome::Error)
        }
    }
}

fn ps_ert_query(dev: &mut DeviceExec, cmd: &Command) -> Option<CmdState> {
    match cmd.opcode() {
        Opcode::Configure | Opcode::InitCu => Some(CmdState::Completed),
        Opcode::SkConfig => dev.scu_config_done(&cmd.packet).then_some(CmdState::Completed),
        Opcode::SkUnconfig => dev
            .scu_unconfig_done(&cmd.packet)
            .then_some(CmdState::Completed),
        Opcode::SkStart => dev.scu_done(cmd).then_some(CmdState::Completed),
        Opcode::StartCu | Opcode::ExecWrite => {
            dev.cu_done(cmd).then_some(CmdState::Completed)
        }
        other => {
            error!("cmd {}: cannot query opcode {other:?}", cmd.id);
            Some(CmdState::Error)
        }
    }
}

fn release_or_flag(dev: &mut DeviceExec, shared: &SchedShared, slot: usize) {
    if !dev.release_slot(slot) {
        error!("device {}: slot {slot} double free", dev.id);
        shared.fault();
    }
}
