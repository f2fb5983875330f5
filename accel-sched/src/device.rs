// SPDX-License-Identifier: MIT

//! Per-device execution state.
//!
//! A [`DeviceExec`] owns everything the scheduler tracks for one attached
//! device: the command queue slot allocator, the CU busy/valid/init masks,
//! the CU instances themselves, and the collaborator hooks (soft-kernel
//! pool, copy engine). All access happens on the scheduler worker thread;
//! nothing here is shared.

use std::time::Duration;

use accel::bitmask::{Bitmap, BitmaskAllocator};
use accel::cu::{ComputeUnit, CuAdapter, CuKind, RegLayout};
use accel::packet::{
    ConfigFlags, Opcode, Packet, PacketError, CU_ACC_ADAPTER, CU_ADDR_MASK, CU_FREE_RUNNING,
};
use accel::softcu::SoftKernelPool;
use accel::copy::CopyEngine;
use accel::{first_set, idx_from_mask, CQ_SIZE, MASK_BITS, MAX_CUS, MAX_SLOTS};
use log::{debug, info, warn};
use thiserror::Error;

use crate::backend::Backend;
use crate::command::{CmdId, Command};
use crate::scheduler::SchedulerConfig;

pub type DeviceId = usize;

/// Slot count used before a configure command arrives.
const DEFAULT_NUM_SLOTS: usize = 16;

/// Builds register adapters for the CUs named by the configure command.
pub trait CuFactory: Send {
    fn create_cu(&mut self, idx: usize, addr: u32, kind: CuKind) -> Box<dyn CuAdapter>;
}

/// Whether an allocation targets the hard or the soft CU mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuClass {
    Hard,
    Soft,
}

/// Everything a device brings along when it attaches.
pub struct DeviceConfig {
    /// Device has an embedded scheduler co-processor.
    pub ert: bool,
    pub cu_factory: Box<dyn CuFactory>,
    pub soft_pool: Option<Box<dyn SoftKernelPool>>,
    pub copy_engine: Option<Box<dyn CopyEngine>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device is configured already, reconfiguration is not supported")]
    AlreadyConfigured,
    #[error("configure requires an otherwise idle command queue")]
    SchedulerBusy,
    #[error("invalid slot size {0}")]
    BadSlotSize(usize),
    #[error("{0} CUs exceeds the supported maximum of {MAX_CUS}")]
    TooManyCus(usize),
    #[error("CU index {0} out of configured range")]
    CuOutOfRange(usize),
    #[error("CU {0} has no adapter instance")]
    MissingCu(usize),
    #[error("a run timeout requires a non-zero reset timeout")]
    InvalidResetTimeout,
    #[error(transparent)]
    BadPacket(#[from] PacketError),
}

/// Execution core of one attached device.
pub struct DeviceExec {
    pub id: DeviceId,
    pub(crate) ert: bool,
    pub(crate) backend: Backend,
    pub(crate) polling_mode: bool,
    pub(crate) configured: bool,
    pub(crate) num_slots: usize,
    pub(crate) num_cus: usize,
    slots: BitmaskAllocator,
    /// Hard CUs with no credit left.
    cu_status: Bitmap,
    /// Soft CUs currently occupied.
    scu_status: Bitmap,
    /// Hard CUs that exist and are schedulable.
    cu_valid: Bitmap,
    /// Hard CUs that received their one-time init.
    cu_init: Bitmap,
    /// Indexed by CU; `None` for free-running CUs.
    pub(crate) cus: Vec<Option<ComputeUnit>>,
    /// Command occupying each slot, for completion bookkeeping.
    pub(crate) submitted: Vec<Option<CmdId>>,
    factory: Box<dyn CuFactory>,
    pub(crate) soft_pool: Option<Box<dyn SoftKernelPool>>,
    pub(crate) copy_engine: Option<Box<dyn CopyEngine>>,
    /// Watchdog tick length, for converting run timeouts to ticks.
    tick: Duration,
    /// Poll interval of the reset protocol.
    reset_poll: Duration,
}

impl DeviceExec {
    pub(crate) fn new(id: DeviceId, cfg: DeviceConfig, sched: &SchedulerConfig) -> Self {
        Self {
            id,
            ert: cfg.ert,
            backend: Backend::Penguin,
            polling_mode: true,
            configured: false,
            num_slots: DEFAULT_NUM_SLOTS,
            num_cus: 0,
            slots: BitmaskAllocator::new(DEFAULT_NUM_SLOTS),
            cu_status: Bitmap::new(MAX_CUS),
            scu_status: Bitmap::new(MAX_CUS),
            cu_valid: Bitmap::new(MAX_CUS),
            cu_init: Bitmap::new(MAX_CUS),
            cus: Vec::new(),
            submitted: vec![None; MAX_SLOTS],
            factory: cfg.cu_factory,
            soft_pool: cfg.soft_pool,
            copy_engine: cfg.copy_engine,
            tick: sched.watchdog_tick,
            reset_poll: sched.reset_poll,
        }
    }

    /// Apply a configure command.
    ///
    /// Rejected outright when other commands are pending or in flight; the
    /// slot allocator is replaced here, which is only sound while nothing
    /// holds a slot.
    pub(crate) fn configure(&mut self, pkt: &Packet, queue_busy: bool) -> Result<(), ConfigError> {
        if queue_busy {
            return Err(ConfigError::SchedulerBusy);
        }
        if self.configured {
            return Err(ConfigError::AlreadyConfigured);
        }
        let cfg = pkt.as_configure()?;

        if cfg.slot_size == 0 || cfg.slot_size > CQ_SIZE {
            return Err(ConfigError::BadSlotSize(cfg.slot_size));
        }
        let num_slots = CQ_SIZE / cfg.slot_size;
        if num_slots == 0 || num_slots > MAX_SLOTS {
            return Err(ConfigError::BadSlotSize(cfg.slot_size));
        }
        if cfg.num_cus > MAX_CUS {
            return Err(ConfigError::TooManyCus(cfg.num_cus));
        }

        self.num_slots = num_slots;
        self.slots = BitmaskAllocator::new(num_slots);
        self.num_cus = cfg.num_cus;
        self.cus = Vec::with_capacity(cfg.num_cus);

        let mut has_acc = false;
        for (idx, &addr) in cfg.cu_addrs.iter().enumerate() {
            if addr == CU_FREE_RUNNING {
                info!("device {}: CU {} is free-running", self.id, idx);
                self.cus.push(None);
                continue;
            }
            let kind = if addr & !CU_ADDR_MASK & CU_ACC_ADAPTER != 0 {
                has_acc = true;
                CuKind::Acc
            } else {
                CuKind::Hls
            };
            let hw = self.factory.create_cu(idx, addr & CU_ADDR_MASK, kind);
            self.cus.push(Some(ComputeUnit::new(idx, hw)));
            self.cu_valid.set(idx);
        }

        self.backend = if self.ert {
            Backend::PsErt
        } else {
            Backend::Penguin
        };
        self.polling_mode = cfg.flags.contains(ConfigFlags::POLLING);
        if self.ert && !self.polling_mode {
            debug!("device {}: co-processor present, forcing polling", self.id);
            self.polling_mode = true;
        }
        if has_acc && !self.polling_mode {
            warn!(
                "device {}: ACC adapter CUs support polling only, forcing polling",
                self.id
            );
            self.polling_mode = true;
        }
        if !self.polling_mode && self.num_cus > MASK_BITS {
            warn!(
                "device {}: {} CUs exceed the interrupt fan-in, forcing polling",
                self.id, self.num_cus
            );
            self.polling_mode = true;
        }

        self.configured = true;
        info!(
            "device {} configured: {} slots of {} bytes, {} CUs, {:?} backend, polling={}",
            self.id, self.num_slots, cfg.slot_size, self.num_cus, self.backend, self.polling_mode
        );
        Ok(())
    }

    /// Apply an init-CUs command: store timeout budgets and preload the
    /// register files of the addressed CUs.
    ///
    /// Returns whether timeout tracking was armed, which tells the
    /// scheduler to start its watchdog.
    pub(crate) fn init_cus(&mut self, pkt: &Packet) -> Result<bool, ConfigError> {
        let hdr = pkt.as_init_cu()?;
        if hdr.run_timeout_us != 0 && hdr.reset_timeout_us == 0 {
            return Err(ConfigError::InvalidResetTimeout);
        }

        let mut warn_reinit = false;
        for mask in 0..pkt.cu_mask_count() {
            let cmd_mask = pkt.cu_mask_word(mask);
            let inited = self.cu_init.word(mask);
            if cmd_mask & inited != 0 {
                warn_reinit = true;
            }
            let mut uninited = (cmd_mask | inited) ^ inited;
            let busy = self.cu_status.word(mask);

            while let Some(bit) = first_set(uninited) {
                uninited &= !(1 << bit);
                let idx = idx_from_mask(bit, mask);
                if busy & (1 << bit) != 0 {
                    warn!("device {}: CU {} busy, skipping init", self.id, idx);
                    continue;
                }
                if idx >= self.num_cus {
                    return Err(ConfigError::CuOutOfRange(idx));
                }
                if !self.cu_valid.is_set(idx) {
                    warn!("device {}: CU {} not schedulable, skipping init", self.id, idx);
                    continue;
                }
                let cu = self.cus[idx]
                    .as_mut()
                    .ok_or(ConfigError::MissingCu(idx))?;
                cu.run_timeout_us = hdr.run_timeout_us;
                cu.reset_timeout_us = hdr.reset_timeout_us;
                cu.configure(pkt.regmap()?, RegLayout::Consecutive);
                self.cu_init.set(idx);
            }
        }
        if warn_reinit {
            info!(
                "device {}: CUs can only be initialized once, repeated masks ignored",
                self.id
            );
        }
        Ok(hdr.run_timeout_us != 0)
    }

    pub(crate) fn acquire_slot(&mut self) -> Option<usize> {
        self.slots.acquire()
    }

    #[must_use]
    pub(crate) fn release_slot(&mut self, idx: usize) -> bool {
        self.slots.release(idx)
    }

    /// Pick a free CU out of the packet's requested masks, lowest index
    /// first, and spend a credit on it.
    ///
    /// For hard CUs the pick is additionally restricted to valid CUs, and
    /// a CU whose last credit was just spent is marked busy. Callers that
    /// fail a later allocation step must roll back with [`Self::unget_cu`].
    pub(crate) fn get_free_cu(&mut self, pkt: &Packet, class: CuClass) -> Option<usize> {
        for mask in 0..pkt.cu_mask_count() {
            let requested = pkt.cu_mask_word(mask);
            let busy = match class {
                CuClass::Hard => self.cu_status.word(mask),
                CuClass::Soft => self.scu_status.word(mask),
            };
            let mut free = (requested | busy) ^ busy;
            if class == CuClass::Hard {
                free &= self.cu_valid.word(mask);
            }
            let Some(bit) = first_set(free) else { continue };
            let idx = idx_from_mask(bit, mask);
            // Mask words come straight from the packet; a request past the
            // CU range must not take down the worker.
            if idx >= MAX_CUS {
                warn!(
                    "device {}: requested CU {} beyond the supported range",
                    self.id, idx
                );
                continue;
            }
            match class {
                CuClass::Hard => {
                    let cu = self.cus.get_mut(idx)?.as_mut()?;
                    if cu.take_credit() == 0 {
                        self.cu_status.set(idx);
                    }
                }
                CuClass::Soft => self.scu_status.set(idx),
            }
            return Some(idx);
        }
        None
    }

    /// Roll back a [`Self::get_free_cu`] pick that never started.
    pub(crate) fn unget_cu(&mut self, idx: usize, class: CuClass) {
        match class {
            CuClass::Hard => {
                if let Some(cu) = self.cus.get_mut(idx).and_then(|c| c.as_mut()) {
                    cu.refund_credit(1);
                }
                self.cu_status.clear(idx);
            }
            CuClass::Soft => self.scu_status.clear(idx),
        }
    }

    /// Write the register map, arm the timeout budget if requested, and
    /// kick the CU.
    pub(crate) fn configure_cu(
        &mut self,
        cmd: &mut Command,
        idx: usize,
        layout: RegLayout,
        arm_timeout: bool,
    ) -> Result<(), ConfigError> {
        let regmap = cmd.packet.regmap()?;
        let tick_us = self.tick.as_micros().max(1) as u32;
        let cu = self.cus[idx].as_mut().ok_or(ConfigError::MissingCu(idx))?;
        cu.configure(regmap, layout);
        if arm_timeout && cu.run_timeout_us > 0 {
            cmd.exec_time = cu.run_timeout_us / tick_us + 1;
            cmd.check_timeout = true;
        }
        cu.start();
        cu.running.push_back(cmd.id);
        cu.usage += 1;
        Ok(())
    }

    /// Poll a hard CU for completion of `cmd`.
    ///
    /// Only the head of the CU's running FIFO may retire, which keeps
    /// per-CU completion in submission order under the credit scheme.
    pub(crate) fn cu_done(&mut self, cmd: &Command) -> bool {
        if cmd.cu_idx < 0 {
            return false;
        }
        let idx = cmd.cu_idx as usize;
        let Some(cu) = self.cus.get_mut(idx).and_then(|c| c.as_mut()) else {
            return false;
        };
        if cu.running.front() != Some(&cmd.id) {
            return false;
        }
        cu.check_status();
        if cu.done_cnt == 0 {
            return false;
        }
        cu.done_cnt -= 1;
        cu.running.pop_front();
        cu.refund_credit(1);
        self.cu_status.clear(idx);
        true
    }

    /// Poll the soft-kernel pool for completion of `cmd`.
    pub(crate) fn scu_done(&mut self, cmd: &Command) -> bool {
        if cmd.cu_idx < 0 {
            return false;
        }
        let idx = cmd.cu_idx as usize;
        let Some(pool) = self.soft_pool.as_mut() else {
            return false;
        };
        if !pool.done(idx) {
            return false;
        }
        self.scu_status.clear(idx);
        true
    }

    /// Whether every soft CU addressed by a configure request is up.
    pub(crate) fn scu_config_done(&self, pkt: &Packet) -> bool {
        let Ok(range) = pkt.as_sk_range() else {
            return false;
        };
        let Some(pool) = self.soft_pool.as_ref() else {
            return false;
        };
        (range.start_cuidx..range.start_cuidx + range.num_cus).all(|idx| pool.configured(idx))
    }

    /// Whether every soft CU addressed by an unconfigure request is down.
    pub(crate) fn scu_unconfig_done(&self, pkt: &Packet) -> bool {
        let Ok(range) = pkt.as_sk_range() else {
            return false;
        };
        let Some(pool) = self.soft_pool.as_ref() else {
            return false;
        };
        (range.start_cuidx..range.start_cuidx + range.num_cus).all(|idx| !pool.configured(idx))
    }

    /// Run the blocking reset protocol against a timed-out CU.
    ///
    /// Returns the terminal state for the command: `Timeout` when the CU
    /// came back, `NoResponse` when it did not. The busy bit and credit
    /// are returned either way; a dead CU surfaces as repeated timeouts
    /// rather than silently shrinking the schedulable set.
    pub(crate) fn reset_cu(&mut self, cmd: &Command) -> crate::command::CmdState {
        use crate::command::CmdState;

        if cmd.cu_idx < 0 {
            return CmdState::Error;
        }
        let idx = cmd.cu_idx as usize;
        let reset_poll = self.reset_poll;
        let poll_us = reset_poll.as_micros().max(1) as u32;
        let Some(cu) = self.cus.get_mut(idx).and_then(|c| c.as_mut()) else {
            return CmdState::Error;
        };

        let mut ticks = cu.reset_timeout_us / poll_us + 1;
        warn!("device {}: resetting timed-out CU {}", self.id, idx);
        cu.reset();
        while ticks > 0 {
            if cu.reset_done() {
                break;
            }
            std::thread::sleep(reset_poll);
            ticks -= 1;
        }
        cu.running.retain(|&id| id != cmd.id);
        cu.refund_credit(1);
        let state = if ticks == 0 {
            log::error!("device {}: CU {} did not return from reset", self.id, idx);
            CmdState::NoResponse
        } else {
            warn!("device {}: CU {} reset complete", self.id, idx);
            CmdState::Timeout
        };
        self.cu_status.clear(idx);
        state
    }

    /// Forget a discarded command's CU allocation without waiting for
    /// completion. Used when a device is reset or detached with commands
    /// still in flight.
    pub(crate) fn abort_cu_cmd(&mut self, cmd: &Command) {
        if cmd.cu_idx < 0 {
            return;
        }
        let idx = cmd.cu_idx as usize;
        match cmd.opcode() {
            Opcode::SkStart => self.scu_status.clear(idx),
            Opcode::StartCu | Opcode::ExecWrite => {
                if let Some(cu) = self.cus.get_mut(idx).and_then(|c| c.as_mut()) {
                    cu.running.retain(|&id| id != cmd.id);
                    cu.refund_credit(1);
                }
                self.cu_status.clear(idx);
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn cu_is_busy(&self, idx: usize) -> bool {
        self.cu_status.is_set(idx)
    }

    #[cfg(test)]
    pub(crate) fn scu_is_busy(&self, idx: usize) -> bool {
        self.scu_status.is_set(idx)
    }

    #[cfg(test)]
    pub(crate) fn slots_held(&self) -> usize {
        self.slots.held()
    }
}

impl std::fmt::Debug for DeviceExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceExec")
            .field("id", &self.id)
            .field("configured", &self.configured)
            .field("backend", &self.backend)
            .field("num_slots", &self.num_slots)
            .field("num_cus", &self.num_cus)
            .field("polling_mode", &self.polling_mode)
            .finish()
    }
}
