// SPDX-License-Identifier: MIT

//! Watchdog tick thread.
//!
//! Started lazily the first time a CU is initialized with a run timeout.
//! All it does is flag the shared check bit once per tick and wake the
//! worker; the worker decrements the per-command budgets. Run timeouts
//! are therefore only as precise as the tick length.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::scheduler::SchedShared;

pub(crate) struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn start(
        shared: Arc<SchedShared>,
        tick: Duration,
    ) -> Result<Self, std::io::Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("accel-cu-timer".into())
            .spawn(move || {
                debug!("watchdog up, tick {tick:?}");
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    shared.tick();
                }
                debug!("watchdog down");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
