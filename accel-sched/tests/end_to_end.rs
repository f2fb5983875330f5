// SPDX-License-Identifier: MIT

//! End-to-end scheduler tests against mock hardware.
//!
//! These run the real worker thread; command completions are observed
//! through the notifier callbacks only, like a real client would.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use accel::copy::{CopyDone, CopyEngine, CopyError, CopyRequest};
use accel::cu::{CuAdapter, CuKind, RegLayout};
use accel::packet::{ConfigFlags, Packet};
use accel::softcu::{SoftCuError, SoftKernelPool};
use accel_sched::device::{CuFactory, DeviceConfig};
use accel_sched::scheduler::{DeviceHandle, Scheduler, SchedulerConfig};
use accel_sched::{CmdState, Completion, SchedError};
use parking_lot::Mutex;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// CU that reports completion on the first status check after a start.
#[derive(Clone, Default)]
struct AutoCu {
    pending: Arc<Mutex<u32>>,
    stuck: bool,
}

impl CuAdapter for AutoCu {
    fn configure(&mut self, _regmap: &[u32], _layout: RegLayout) {}

    fn start(&mut self) {
        if !self.stuck {
            *self.pending.lock() += 1;
        }
    }

    fn check(&mut self) -> u32 {
        std::mem::take(&mut *self.pending.lock())
    }

    fn reset(&mut self) {}

    fn reset_done(&mut self) -> bool {
        true
    }
}

struct AutoFactory {
    stuck: bool,
}

impl CuFactory for AutoFactory {
    fn create_cu(&mut self, _idx: usize, _addr: u32, _kind: CuKind) -> Box<dyn CuAdapter> {
        Box::new(AutoCu {
            stuck: self.stuck,
            ..Default::default()
        })
    }
}

/// Copy engine that completes inline, optionally with an error.
struct InlineCopy {
    fail: bool,
}

impl CopyEngine for InlineCopy {
    fn submit_copy(&mut self, _req: CopyRequest, done: CopyDone) -> Result<(), CopyError> {
        done.complete(self.fail);
        Ok(())
    }
}

/// Copy engine that completes from another thread after a short delay.
struct ThreadedCopy;

impl CopyEngine for ThreadedCopy {
    fn submit_copy(&mut self, _req: CopyRequest, done: CopyDone) -> Result<(), CopyError> {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            done.complete(false);
        });
        Ok(())
    }
}

#[derive(Default)]
struct MockPool {
    up: HashSet<usize>,
    finished: HashSet<usize>,
}

impl SoftKernelPool for MockPool {
    fn configure(&mut self, start_cuidx: usize, num: usize) -> Result<(), SoftCuError> {
        for idx in start_cuidx..start_cuidx + num {
            self.up.insert(idx);
        }
        Ok(())
    }

    fn unconfigure(&mut self, start_cuidx: usize, num: usize) -> Result<(), SoftCuError> {
        for idx in start_cuidx..start_cuidx + num {
            self.up.remove(&idx);
        }
        Ok(())
    }

    fn start(&mut self, cu_idx: usize, _regmap: &[u32]) -> Result<(), SoftCuError> {
        if !self.up.contains(&cu_idx) {
            return Err(SoftCuError::NotConfigured(cu_idx));
        }
        self.finished.insert(cu_idx);
        Ok(())
    }

    fn configured(&self, cu_idx: usize) -> bool {
        self.up.contains(&cu_idx)
    }

    fn done(&mut self, cu_idx: usize) -> bool {
        self.finished.remove(&cu_idx)
    }
}

fn submit(dev: &DeviceHandle, pkt: Packet) -> mpsc::Receiver<Completion> {
    let (tx, rx) = mpsc::channel();
    dev.submit(pkt, 0, || {}, move |c| {
        let _ = tx.send(c);
    })
    .expect("submit failed");
    rx
}

fn wait(rx: &mpsc::Receiver<Completion>) -> CmdState {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("command never completed")
        .state
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        watchdog_tick: Duration::from_millis(10),
        reset_poll: Duration::from_micros(100),
    }
}

fn attach_penguin(
    sched: &Scheduler,
    stuck: bool,
    copy_engine: Option<Box<dyn CopyEngine>>,
) -> DeviceHandle {
    sched.attach(DeviceConfig {
        ert: false,
        cu_factory: Box::new(AutoFactory { stuck }),
        soft_pool: None,
        copy_engine,
    })
}

#[test]
fn configure_and_run_kernels() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = attach_penguin(&sched, false, None);

    let cfg = submit(
        &dev,
        Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100, 0x200]),
    );
    assert_eq!(wait(&cfg), CmdState::Completed);

    let runs: Vec<_> = (0..8)
        .map(|i| submit(&dev, Packet::start_cu(0b11, &[i, i + 1])))
        .collect();
    for rx in &runs {
        assert_eq!(wait(rx), CmdState::Completed);
    }
    sched.shutdown();
}

#[test]
fn copy_commands_complete_out_of_band() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = attach_penguin(&sched, false, Some(Box::new(ThreadedCopy)));

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);

    let copy = submit(&dev, Packet::start_copy(1, 2, 0, 0, 4096));
    assert_eq!(wait(&copy), CmdState::Completed);
}

#[test]
fn copy_engine_error_fails_the_command() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = attach_penguin(&sched, false, Some(Box::new(InlineCopy { fail: true })));

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);

    let copy = submit(&dev, Packet::start_copy(1, 2, 0, 0, 4096));
    assert_eq!(wait(&copy), CmdState::Error);
    assert!(!sched.has_faulted());
}

#[test]
fn copy_without_engine_fails_the_command() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = attach_penguin(&sched, false, None);

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);

    let copy = submit(&dev, Packet::start_copy(1, 2, 0, 0, 4096));
    assert_eq!(wait(&copy), CmdState::Error);
}

#[test]
fn stuck_cu_times_out_and_recovers() {
    init_logging();
    let sched = Scheduler::start(fast_config()).unwrap();
    let dev = attach_penguin(&sched, true, None);

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);

    // 20ms budget over 10ms ticks
    let init = submit(&dev, Packet::init_cu(20_000, 1_000, 0b1, &[]));
    assert_eq!(wait(&init), CmdState::Completed);

    let run = submit(&dev, Packet::start_cu(0b1, &[]));
    assert_eq!(wait(&run), CmdState::Timeout);
}

#[test]
fn zero_run_timeout_disables_the_watchdog() {
    init_logging();
    let sched = Scheduler::start(fast_config()).unwrap();
    let dev = attach_penguin(&sched, true, None);

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);
    let init = submit(&dev, Packet::init_cu(0, 0, 0b1, &[]));
    assert_eq!(wait(&init), CmdState::Completed);

    let run = submit(&dev, Packet::start_cu(0b1, &[]));
    assert!(run.recv_timeout(Duration::from_millis(100)).is_err());

    // reset clears the stuck command so shutdown is clean
    dev.reset().unwrap();
}

#[test]
fn soft_kernels_run_through_the_co_processor() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = sched.attach(DeviceConfig {
        ert: true,
        cu_factory: Box::new(AutoFactory { stuck: false }),
        soft_pool: Some(Box::new(MockPool::default())),
        copy_engine: None,
    });

    let cfg = submit(
        &dev,
        Packet::configure(4096, 12, 0, ConfigFlags::ERT, &[0x100]),
    );
    assert_eq!(wait(&cfg), CmdState::Completed);

    let sk_cfg = submit(&dev, Packet::sk_config(0, 4));
    assert_eq!(wait(&sk_cfg), CmdState::Completed);

    let start = submit(&dev, Packet::sk_start(0b0100, &[1, 2]));
    let done = wait(&start);
    assert_eq!(done, CmdState::Completed);

    // hard CUs still work alongside the soft ones
    let hard = submit(&dev, Packet::start_cu(0b1, &[]));
    assert_eq!(wait(&hard), CmdState::Completed);

    let sk_uncfg = submit(&dev, Packet::sk_unconfig(0, 4));
    assert_eq!(wait(&sk_uncfg), CmdState::Completed);
}

#[test]
fn starting_an_unconfigured_soft_cu_fails() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = sched.attach(DeviceConfig {
        ert: true,
        cu_factory: Box::new(AutoFactory { stuck: false }),
        soft_pool: Some(Box::new(MockPool::default())),
        copy_engine: None,
    });

    let cfg = submit(
        &dev,
        Packet::configure(4096, 12, 0, ConfigFlags::ERT, &[0x100]),
    );
    assert_eq!(wait(&cfg), CmdState::Completed);

    let start = submit(&dev, Packet::sk_start(0b1, &[]));
    assert_eq!(wait(&start), CmdState::Error);
}

#[test]
fn detach_then_submit_to_second_device() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();

    let first = attach_penguin(&sched, true, None);
    let cfg = submit(&first, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);
    // command that will never finish on its own
    let _stuck = submit(&first, Packet::start_cu(0b1, &[]));
    first.detach().unwrap();

    let second = attach_penguin(&sched, false, None);
    let cfg = submit(&second, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);
    let run = submit(&second, Packet::start_cu(0b1, &[]));
    assert_eq!(wait(&run), CmdState::Completed);
}

#[test]
fn shutdown_fails_whatever_is_left() {
    init_logging();
    let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
    let dev = attach_penguin(&sched, true, None);

    let cfg = submit(&dev, Packet::configure(4096, 12, 0, ConfigFlags::POLLING, &[0x100]));
    assert_eq!(wait(&cfg), CmdState::Completed);
    let stuck = submit(&dev, Packet::start_cu(0b1, &[]));

    sched.shutdown();
    assert_eq!(wait(&stuck), CmdState::Error);
    assert!(matches!(
        dev.submit(Packet::start_cu(0b1, &[]), 0, || {}, |_| {}),
        Err(SchedError::Stopped)
    ));
}
