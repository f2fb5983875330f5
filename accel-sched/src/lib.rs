// SPDX-License-Identifier: MIT

//! Command scheduler for accelerator compute units.
//!
//! This crate turns command packets into CU register traffic:
//!
//! - [`command`]: command objects, lifecycle states, recycling pool
//! - [`device`]: per-device slot allocator, CU masks, config handling
//! - [`backend`]: host-driven and co-processor submission policies
//! - [`scheduler`]: the single worker thread and its public handles
//! - [`watchdog`]: the tick source behind CU run timeouts
//!
//! The layering mirrors the split in the `accel` crate: hardware access
//! stays behind the `CuAdapter`, `SoftKernelPool` and `CopyEngine` traits,
//! so this crate is pure policy and fully testable off hardware.
//!
//! ```no_run
//! use accel::packet::{ConfigFlags, Packet};
//! use accel_sched::device::DeviceConfig;
//! use accel_sched::scheduler::{Scheduler, SchedulerConfig};
//! # fn factory() -> Box<dyn accel_sched::device::CuFactory> { unimplemented!() }
//!
//! # fn main() -> Result<(), accel_sched::SchedError> {
//! let sched = Scheduler::start(SchedulerConfig::default())?;
//! let dev = sched.attach(DeviceConfig {
//!     ert: false,
//!     cu_factory: factory(),
//!     soft_pool: None,
//!     copy_engine: None,
//! });
//! dev.submit(
//!     Packet::configure(4096, 12, 0x8000_0000, ConfigFlags::POLLING, &[0x100]),
//!     0,
//!     || {},
//!     |c| log::info!("configure finished: {:?}", c.state),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod command;
pub mod device;
pub mod scheduler;
mod watchdog;

pub use backend::Backend;
pub use command::{CmdId, CmdState, Completion};
pub use device::{ConfigError, CuFactory, DeviceConfig, DeviceId};
pub use scheduler::{DeviceHandle, Scheduler, SchedulerConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("scheduler is stopped")]
    Stopped,
    #[error("scheduler halted on an internal error")]
    Faulted,
    #[error("failed to spawn scheduler worker")]
    Spawn(#[source] std::io::Error),
}
