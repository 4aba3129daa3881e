#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod args;
pub mod consts;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod mem;
pub mod params;
pub mod serial;
pub mod stats;
pub mod vcpu;
pub mod vm;

pub use error::{HypervisorError, HypervisorResult};
pub use vm::{KvminiVm, VmResult, launch};
