// SPDX-License-Identifier: MIT

//! The scheduler worker and its public handles.
//!
//! One worker thread owns the command queue and every attached device.
//! Producers never touch scheduler state directly: submissions, device
//! attach/detach and resets all travel through a lock-free intake queue
//! and are applied at the top of the worker's next pass. The worker
//! sleeps on a condvar whenever there is nothing to poll and nothing
//! pending, and is woken by submitters, completion interrupts, the copy
//! engine and the watchdog tick.
//!
//! Per pass the worker:
//!
//! 1. drains the intake queue (commands enter `Queued`, devices come
//!    and go),
//! 2. decrements timeout budgets if the watchdog ticked,
//! 3. steps every queued command through its state machine, recycling
//!    the ones that reached a terminal state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use accel::packet::{Opcode, Packet};
use crossbeam_queue::SegQueue;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::backend::SubmitOutcome;
use crate::command::{CmdId, CmdPool, CmdState, Command, Completion};
use crate::device::{DeviceConfig, DeviceExec, DeviceId};
use crate::watchdog::Watchdog;
use crate::SchedError;

/// Yield to the OS after this many back-to-back passes.
const MAX_SCHED_LOOP: u32 = 8;

/// Scheduler-wide timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Watchdog period; also the granularity of run timeouts.
    pub watchdog_tick: Duration,
    /// Poll interval of the CU reset protocol.
    pub reset_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            watchdog_tick: Duration::from_millis(500),
            reset_poll: Duration::from_millis(1),
        }
    }
}

/// Producer-to-worker messages.
pub(crate) enum Intake {
    Cmd(Box<Command>),
    Attach(Box<DeviceExec>),
    Detach(DeviceId, SyncSender<()>),
    Reset(DeviceId, SyncSender<()>),
}

/// Signal block shared between the worker and everyone who can wake it.
pub(crate) struct SchedShared {
    pub(crate) pending: SegQueue<Intake>,
    /// Intake depth, readable without popping.
    num_pending: AtomicUsize,
    /// A completion interrupt arrived.
    intc: AtomicBool,
    /// The watchdog ticked; decrement timeout budgets.
    check: AtomicBool,
    stop: AtomicBool,
    /// An internal invariant broke; the worker halts after this pass.
    error: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SchedShared {
    fn new() -> Self {
        Self {
            pending: SegQueue::new(),
            num_pending: AtomicUsize::new(0),
            intc: AtomicBool::new(false),
            check: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            error: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    pub(crate) fn push(&self, item: Intake) {
        self.pending.push(item);
        self.num_pending.fetch_add(1, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn interrupt(&self) {
        self.intc.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn tick(&self) {
        self.check.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn fault(&self) {
        self.error.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn faulted(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }
}

/// Worker-private scheduler state.
pub(crate) struct SchedCore {
    shared: Arc<SchedShared>,
    pool: Arc<CmdPool>,
    cfg: SchedulerConfig,
    /// Commands in flight, in arrival order.
    cq: VecDeque<Box<Command>>,
    devices: BTreeMap<DeviceId, DeviceExec>,
    /// Commands that must be polled for completion. While non-zero the
    /// worker spins instead of sleeping.
    poll: usize,
    loop_cnt: u32,
    /// Commands other than the one being stepped, for the configure
    /// idle-queue check.
    inflight_others: usize,
    watchdog: Option<Watchdog>,
}

impl SchedCore {
    pub(crate) fn new(shared: Arc<SchedShared>, pool: Arc<CmdPool>, cfg: SchedulerConfig) -> Self {
        Self {
            shared,
            pool,
            cfg,
            cq: VecDeque::new(),
            devices: BTreeMap::new(),
            poll: 0,
            loop_cnt: 0,
            inflight_others: 0,
            watchdog: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("scheduler worker up");
        loop {
            self.wait();
            if self.shared.stopped() || self.shared.faulted() {
                break;
            }
            self.queue_cmds();
            if self.shared.check.swap(false, Ordering::AcqRel) {
                self.check_timeouts();
            }
            self.iterate_cmds();

            self.loop_cnt += 1;
            if self.loop_cnt >= MAX_SCHED_LOOP {
                self.loop_cnt = 0;
                thread::yield_now();
            }
        }
        if self.shared.faulted() {
            error!("scheduler worker halting on internal error");
        }
        self.drain_all();
        debug!("scheduler worker down");
    }

    /// Block until there is something to do.
    fn wait(&self) {
        let mut guard = self.shared.lock.lock();
        while !self.should_run() {
            self.shared.cond.wait(&mut guard);
        }
    }

    fn should_run(&self) -> bool {
        let sh = &self.shared;
        if sh.stopped() || sh.faulted() {
            return true;
        }
        if sh.num_pending.load(Ordering::Acquire) > 0 {
            return true;
        }
        if sh.intc.swap(false, Ordering::AcqRel) {
            return true;
        }
        if self.poll > 0 {
            return true;
        }
        sh.check.load(Ordering::Acquire)
    }

    /// Drain the intake queue: enqueue commands, apply device lifecycle.
    pub(crate) fn queue_cmds(&mut self) {
        while let Some(item) = self.shared.pending.pop() {
            self.shared.num_pending.fetch_sub(1, Ordering::SeqCst);
            match item {
                Intake::Cmd(mut cmd) => {
                    trace!("cmd {} queued", cmd.id);
                    cmd.set_state(CmdState::Queued);
                    self.cq.push_back(cmd);
                }
                Intake::Attach(dev) => {
                    debug!("device {} attached", dev.id);
                    self.devices.insert(dev.id, *dev);
                }
                Intake::Detach(id, done) => {
                    self.discard_device_cmds(id);
                    if self.devices.remove(&id).is_some() {
                        debug!("device {id} detached");
                    }
                    let _ = done.send(());
                }
                Intake::Reset(id, done) => {
                    self.discard_device_cmds(id);
                    info!("device {id} reset, stale commands discarded");
                    let _ = done.send(());
                }
            }
        }
    }

    /// Throw away every in-flight command of one device, releasing the
    /// resources the worker still tracks for them.
    fn discard_device_cmds(&mut self, id: DeviceId) {
        let mut kept = VecDeque::with_capacity(self.cq.len());
        while let Some(cmd) = self.cq.pop_front() {
            if cmd.device != id {
                kept.push_back(cmd);
                continue;
            }
            info!("discarding stale cmd {} for device {id}", cmd.id);
            if cmd.polled {
                self.poll -= 1;
            }
            if let Some(dev) = self.devices.get_mut(&id) {
                dev.abort_cu_cmd(&cmd);
                if cmd.slot_idx >= 0 {
                    let slot = cmd.slot_idx as usize;
                    dev.submitted[slot] = None;
                    if !dev.release_slot(slot) {
                        error!("device {id}: stale cmd {} held unowned slot {slot}", cmd.id);
                        self.shared.fault();
                    }
                }
            }
            self.pool.recycle(cmd);
        }
        self.cq = kept;
    }

    /// Burn one watchdog tick off every running command that has a
    /// timeout budget.
    pub(crate) fn check_timeouts(&mut self) {
        for cmd in self.cq.iter_mut() {
            if cmd.state != CmdState::Running || !cmd.check_timeout {
                continue;
            }
            cmd.exec_time = cmd.exec_time.saturating_sub(1);
            if cmd.exec_time == 0 {
                warn!("cmd {} exceeded its run budget on CU {}", cmd.id, cmd.cu_idx);
                cmd.set_state(CmdState::Timeout);
            }
        }
    }

    /// Step every command once; terminal commands are recycled.
    pub(crate) fn iterate_cmds(&mut self) {
        let mut work = std::mem::take(&mut self.cq);
        let total = work.len();
        for _ in 0..total {
            let Some(mut cmd) = work.pop_front() else { break };
            self.inflight_others = self.cq.len() + work.len();
            self.step(&mut cmd);
            if cmd.state.is_terminal() {
                self.pool.recycle(cmd);
            } else {
                self.cq.push_back(cmd);
            }
        }
    }

    /// Advance one command as far as it will go this pass.
    ///
    /// The order matters: a queued command may start and complete in one
    /// pass, and a command flagged `Timeout` by the tick above must run
    /// the reset protocol before it becomes terminal.
    fn step(&mut self, cmd: &mut Command) {
        if cmd.state == CmdState::Queued {
            self.queued_to_running(cmd);
        }
        if cmd.state == CmdState::Running {
            self.running_to_complete(cmd);
        }
        if cmd.state == CmdState::Timeout {
            self.timeout_to_reset(cmd);
        }
    }

    fn queued_to_running(&mut self, cmd: &mut Command) {
        let opcode = cmd.opcode();
        let queue_busy =
            self.inflight_others > 0 || self.shared.num_pending.load(Ordering::Acquire) > 0;
        let mut arm_watchdog = false;
        {
            let Some(dev) = self.devices.get_mut(&cmd.device) else {
                warn!("cmd {} targets unknown device {}", cmd.id, cmd.device);
                cmd.set_state(CmdState::Error);
                cmd.notify_completion();
                return;
            };

            // Config commands apply their payload before submission so a
            // failure surfaces on the command instead of being swallowed.
            if opcode == Opcode::Configure {
                if let Err(e) = dev.configure(&cmd.packet, queue_busy) {
                    warn!("cmd {}: configure rejected: {e}", cmd.id);
                    cmd.set_state(CmdState::Error);
                    cmd.notify_completion();
                    return;
                }
            }
            if opcode == Opcode::InitCu {
                match dev.init_cus(&cmd.packet) {
                    Ok(arm) => arm_watchdog = arm,
                    Err(e) => {
                        warn!("cmd {}: CU init rejected: {e}", cmd.id);
                        cmd.set_state(CmdState::Error);
                        cmd.notify_completion();
                        return;
                    }
                }
            }

            let backend = dev.backend;
            match backend.submit(dev, cmd, &self.shared) {
                SubmitOutcome::Started => {
                    cmd.set_state(CmdState::Running);
                    if dev.ert || dev.polling_mode || opcode == Opcode::StartCopy {
                        cmd.polled = true;
                        self.poll += 1;
                    }
                    if cmd.slot_idx >= 0 {
                        dev.submitted[cmd.slot_idx as usize] = Some(cmd.id);
                    }
                }
                SubmitOutcome::Busy => {
                    trace!("cmd {}: resources busy, staying queued", cmd.id);
                }
                SubmitOutcome::Error => {
                    cmd.set_state(CmdState::Error);
                    cmd.notify_completion();
                }
            }
        }
        if arm_watchdog {
            self.start_watchdog();
        }
    }

    fn running_to_complete(&mut self, cmd: &mut Command) {
        let Some(dev) = self.devices.get_mut(&cmd.device) else {
            warn!("cmd {} lost its device {}", cmd.id, cmd.device);
            cmd.set_state(CmdState::Error);
            cmd.notify_completion();
            return;
        };
        let backend = dev.backend;
        if let Some(state) = backend.query(dev, cmd) {
            Self::mark_complete(&self.shared, &mut self.poll, dev, cmd, state);
        }
    }

    fn timeout_to_reset(&mut self, cmd: &mut Command) {
        let Some(dev) = self.devices.get_mut(&cmd.device) else {
            warn!("cmd {} lost its device {}", cmd.id, cmd.device);
            cmd.set_state(CmdState::Error);
            cmd.notify_completion();
            return;
        };
        let state = dev.reset_cu(cmd);
        Self::mark_complete(&self.shared, &mut self.poll, dev, cmd, state);
    }

    /// Retire a command: free its slot, publish the terminal state.
    fn mark_complete(
        shared: &SchedShared,
        poll: &mut usize,
        dev: &mut DeviceExec,
        cmd: &mut Command,
        state: CmdState,
    ) {
        cmd.set_state(state);
        if cmd.polled {
            *poll -= 1;
            cmd.polled = false;
        }
        if cmd.slot_idx >= 0 {
            let slot = cmd.slot_idx as usize;
            dev.submitted[slot] = None;
            if !dev.release_slot(slot) {
                error!("cmd {}: released slot {slot} it did not hold", cmd.id);
                shared.fault();
            }
            cmd.slot_idx = -1;
        }
        cmd.notify_completion();
    }

    fn start_watchdog(&mut self) {
        if self.watchdog.is_some() {
            return;
        }
        match Watchdog::start(Arc::clone(&self.shared), self.cfg.watchdog_tick) {
            Ok(wd) => self.watchdog = Some(wd),
            Err(e) => {
                // Timeouts will not fire, commands still complete.
                error!("cannot start watchdog, timeout tracking disabled: {e}");
            }
        }
    }

    /// Final cleanup once the loop exits: answer pending control
    /// messages, fail and recycle everything still queued.
    fn drain_all(&mut self) {
        while let Some(item) = self.shared.pending.pop() {
            self.shared.num_pending.fetch_sub(1, Ordering::SeqCst);
            match item {
                Intake::Cmd(mut cmd) => {
                    cmd.set_state(CmdState::Error);
                    cmd.notify_completion();
                    self.pool.recycle(cmd);
                }
                Intake::Attach(_) => {}
                Intake::Detach(_, done) | Intake::Reset(_, done) => {
                    let _ = done.send(());
                }
            }
        }
        while let Some(mut cmd) = self.cq.pop_front() {
            cmd.set_state(CmdState::Error);
            cmd.notify_completion();
            self.pool.recycle(cmd);
        }
        self.devices.clear();
        self.watchdog = None;
    }

    #[cfg(test)]
    pub(crate) fn poll_count(&self) -> usize {
        self.poll
    }

    #[cfg(test)]
    pub(crate) fn cq_len(&self) -> usize {
        self.cq.len()
    }

    #[cfg(test)]
    pub(crate) fn device(&self, id: DeviceId) -> Option<&DeviceExec> {
        self.devices.get(&id)
    }
}

/// Owning handle to the scheduler worker.
///
/// Dropping the scheduler stops the worker; commands still in flight are
/// failed and their buffers released.
pub struct Scheduler {
    shared: Arc<SchedShared>,
    pool: Arc<CmdPool>,
    cfg: SchedulerConfig,
    next_device: AtomicUsize,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker thread.
    pub fn start(cfg: SchedulerConfig) -> Result<Self, SchedError> {
        let shared = Arc::new(SchedShared::new());
        let pool = Arc::new(CmdPool::new());
        let core = SchedCore::new(Arc::clone(&shared), Arc::clone(&pool), cfg);
        let worker = thread::Builder::new()
            .name("accel-sched".into())
            .spawn(move || core.run())
            .map_err(SchedError::Spawn)?;
        Ok(Self {
            shared,
            pool,
            cfg,
            next_device: AtomicUsize::new(0),
            worker: Some(worker),
        })
    }

    /// Attach a device and hand back its submission handle.
    pub fn attach(&self, cfg: DeviceConfig) -> DeviceHandle {
        let id = self.next_device.fetch_add(1, Ordering::Relaxed);
        let dev = DeviceExec::new(id, cfg, &self.cfg);
        self.shared.push(Intake::Attach(Box::new(dev)));
        DeviceHandle {
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
            id,
            detached: false,
        }
    }

    /// Signal that completion interrupts arrived; wakes the worker for a
    /// polling pass.
    pub fn notify_interrupt(&self) {
        self.shared.interrupt();
    }

    /// Whether the worker halted on an internal error.
    pub fn has_faulted(&self) -> bool {
        self.shared.faulted()
    }

    /// Stop the worker and wait for it to drain.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("scheduler worker panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_worker();
        }
    }
}

/// Per-device submission handle, cheap to use from any thread.
pub struct DeviceHandle {
    shared: Arc<SchedShared>,
    pool: Arc<CmdPool>,
    id: DeviceId,
    detached: bool,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Queue one packet for execution.
    ///
    /// `release` runs when the command's buffer may be reused; `notify`
    /// runs exactly once with the terminal state.
    pub fn submit(
        &self,
        packet: Packet,
        cq_slot_idx: usize,
        release: impl FnOnce() + Send + 'static,
        notify: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<CmdId, SchedError> {
        if self.shared.stopped() {
            return Err(SchedError::Stopped);
        }
        if self.shared.faulted() {
            return Err(SchedError::Faulted);
        }
        let cmd = self
            .pool
            .get(self.id, packet, cq_slot_idx, Box::new(release), Box::new(notify));
        let id = cmd.id;
        self.shared.push(Intake::Cmd(cmd));
        Ok(id)
    }

    /// Wake the worker for a completion-polling pass.
    pub fn notify_interrupt(&self) {
        self.shared.interrupt();
    }

    /// Discard every in-flight command of this device and wait until the
    /// worker acknowledges. The device stays attached.
    pub fn reset(&self) -> Result<(), SchedError> {
        self.control(|done| Intake::Reset(self.id, done))
    }

    /// Detach the device, discarding its in-flight commands.
    pub fn detach(mut self) -> Result<(), SchedError> {
        self.detached = true;
        self.control(|done| Intake::Detach(self.id, done))
    }

    fn control(
        &self,
        make: impl FnOnce(SyncSender<()>) -> Intake,
    ) -> Result<(), SchedError> {
        if self.shared.stopped() {
            return Err(SchedError::Stopped);
        }
        let (done, ack) = sync_channel(1);
        self.shared.push(make(done));
        ack.recv().map_err(|_| SchedError::Stopped)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.detached || self.shared.stopped() {
            return;
        }
        // Fire and forget; the ack channel is dropped unused.
        let (done, _ack) = sync_channel(1);
        self.shared.push(Intake::Detach(self.id, done));
    }
}
