use std::{io, path::PathBuf};

use thiserror::Error;
pub use vmm_sys_util::errno::Error as Errno;

/// Errors raised while setting up or running a guest.
#[derive(Error, Debug)]
pub enum HypervisorError {
	#[error("The hypervisor interface {} is unavailable: {source}", path.display())]
	Unavailable {
		path: PathBuf,
		#[source]
		source: Errno,
	},

	#[error("The host refused to create the {resource}: {source}")]
	Creation {
		resource: &'static str,
		#[source]
		source: Errno,
	},

	#[error("Memory region for slot {slot} was rejected: {reason}")]
	InvalidRegion { slot: u32, reason: RegionError },

	#[error("Unable to map {size:#x} bytes of guest memory: {source}")]
	Allocation {
		size: usize,
		#[source]
		source: Errno,
	},

	#[error("The guest image {} was not found or is unreadable: {source}", path.display())]
	SourceUnavailable {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("The guest image does not fit into {capacity:#x} bytes of guest memory")]
	ImageTooLarge { capacity: usize },

	#[error("vCPU configuration failed: {0}")]
	Configuration(String),

	#[error("Resuming the vCPU failed: {0}")]
	Resume(#[source] Errno),

	#[error("Unknown exit reason: {0}")]
	UnknownExit(String),

	#[error("Unable to emit port I/O output: {0}")]
	Output(#[from] io::Error),
}

/// Why the host or the VM context refused a memory region.
#[derive(Error, Debug)]
pub enum RegionError {
	#[error("slot is already occupied")]
	SlotOccupied,
	#[error("guest address {0:#x} is not page aligned")]
	MisalignedAddress(u64),
	#[error("size {0:#x} is not a non-zero multiple of the page size")]
	InvalidSize(usize),
	#[error("region overlaps slot {0}")]
	Overlapping(u32),
	#[error("host rejected the region: {0}")]
	Host(Errno),
}

pub type HypervisorResult<T> = Result<T, HypervisorError>;
