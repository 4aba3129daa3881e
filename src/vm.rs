use std::{
	fs::File,
	io::BufReader,
	path::{Path, PathBuf},
};

use crate::{
	HypervisorResult,
	consts::*,
	error::{Errno, HypervisorError, RegionError},
	mem::{LoadImageError, MemoryError, MmapMemory},
	params::Params,
	serial::KvminiSerial,
	stats::CpuStats,
	vcpu::{Vcpu, VcpuStopReason, VirtualCPU},
};

#[cfg(target_os = "linux")]
pub type DefaultBackend = crate::linux::KvmHandle;

/// Trait marking an interface for creating (accelerated) VMs.
pub trait VirtualizationBackend {
	type Vm: VmBackend;
	const NAME: &str;

	/// Version of the host interface.
	fn api_version(&self) -> Result<i32, Errno>;

	/// Creates a new, empty VM.
	fn create_vm(&self) -> Result<Self::Vm, Errno>;

	/// Size of the run state every vCPU shares with the host.
	fn vcpu_mmap_size(&self) -> Result<usize, Errno>;
}

/// Host side of a single VM.
pub trait VmBackend {
	type VCPU: VirtualCPU;

	/// Installs `size` bytes at `host_address` as guest-physical memory at
	/// `guest_address`. A size of zero removes the slot.
	///
	/// # Safety
	///
	/// The host memory must stay mapped until the slot is removed again.
	unsafe fn set_user_memory_region(
		&self,
		slot: u32,
		guest_address: u64,
		size: usize,
		host_address: *mut u8,
	) -> Result<(), Errno>;

	/// Creates a vCPU. The VM must outlive it.
	fn create_vcpu(&self, id: u32) -> Result<Self::VCPU, Errno>;
}

/// Exclusive access to the host's virtualization interface.
///
/// Every other resource is created from the handle, so it has to outlive them.
pub struct VirtualizationHandle<B: VirtualizationBackend> {
	backend: Option<B>,
	path: PathBuf,
}

impl<B: VirtualizationBackend> VirtualizationHandle<B> {
	pub fn new(backend: B, path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		debug!("Opened {} ({})", path.display(), B::NAME);
		Self {
			backend: Some(backend),
			path,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn is_open(&self) -> bool {
		self.backend.is_some()
	}

	fn backend(&self) -> HypervisorResult<&B> {
		self.backend
			.as_ref()
			.ok_or_else(|| HypervisorError::Unavailable {
				path: self.path.clone(),
				source: Errno::new(libc::EBADF),
			})
	}

	pub fn api_version(&self) -> HypervisorResult<i32> {
		self.backend()?
			.api_version()
			.map_err(|source| HypervisorError::Unavailable {
				path: self.path.clone(),
				source,
			})
	}

	pub fn create_vm(&self) -> HypervisorResult<VmContext<B::Vm>> {
		let backend = self
			.backend()?
			.create_vm()
			.map_err(|source| HypervisorError::Creation {
				resource: "virtual machine",
				source,
			})?;
		debug!("Created VM");
		Ok(VmContext {
			regions: Vec::new(),
			backend,
		})
	}

	pub fn vcpu_mmap_size(&self) -> HypervisorResult<usize> {
		self.backend()?
			.vcpu_mmap_size()
			.map_err(|source| HypervisorError::Unavailable {
				path: self.path.clone(),
				source,
			})
	}

	/// Releases the handle. Closing a closed handle does nothing.
	pub fn close(&mut self) {
		if let Some(backend) = self.backend.take() {
			debug!("Close {}", self.path.display());
			drop(backend);
		}
	}
}

impl<B: VirtualizationBackend> Drop for VirtualizationHandle<B> {
	fn drop(&mut self) {
		self.close();
	}
}

#[derive(Debug)]
struct MemorySlot {
	slot: u32,
	guest_address: u64,
	mem: MmapMemory,
}

impl MemorySlot {
	fn contains(&self, guest_address: u64) -> bool {
		guest_address >= self.guest_address
			&& guest_address - self.guest_address < self.mem.size() as u64
	}
}

/// A VM and the guest memory installed into it.
pub struct VmContext<V: VmBackend> {
	// Dropped before `backend`.
	regions: Vec<MemorySlot>,
	backend: V,
}

impl<V: VmBackend> VmContext<V> {
	pub fn backend(&self) -> &V {
		&self.backend
	}

	/// Installs `mem` as guest-physical memory at `guest_address`.
	///
	/// The context keeps the memory until it is destroyed, so the host mapping
	/// outlives its registration.
	pub fn install_memory_region(
		&mut self,
		slot: u32,
		guest_address: u64,
		mem: MmapMemory,
	) -> HypervisorResult<()> {
		let invalid = |reason| HypervisorError::InvalidRegion { slot, reason };

		if self.regions.iter().any(|r| r.slot == slot) {
			return Err(invalid(RegionError::SlotOccupied));
		}
		if guest_address % PAGE_SIZE as u64 != 0 {
			return Err(invalid(RegionError::MisalignedAddress(guest_address)));
		}
		if mem.size() == 0 || mem.size() % PAGE_SIZE != 0 {
			return Err(invalid(RegionError::InvalidSize(mem.size())));
		}
		let end = guest_address
			.checked_add(mem.size() as u64)
			.ok_or(invalid(RegionError::InvalidSize(mem.size())))?;
		if let Some(other) = self
			.regions
			.iter()
			.find(|r| guest_address < r.guest_address + r.mem.size() as u64 && r.guest_address < end)
		{
			return Err(invalid(RegionError::Overlapping(other.slot)));
		}

		unsafe {
			self.backend.set_user_memory_region(
				slot,
				guest_address,
				mem.size(),
				mem.host_start(),
			)
		}
		.map_err(|errno| invalid(RegionError::Host(errno)))?;
		debug!(
			"Installed {:#x} bytes at guest address {guest_address:#x} into slot {slot}",
			mem.size()
		);

		self.regions.push(MemorySlot {
			slot,
			guest_address,
			mem,
		});
		Ok(())
	}

	pub fn region(&self, slot: u32) -> Option<&MmapMemory> {
		self.regions
			.iter()
			.find(|r| r.slot == slot)
			.map(|r| &r.mem)
	}

	pub fn region_mut(&mut self, slot: u32) -> Option<&mut MmapMemory> {
		self.regions
			.iter_mut()
			.find(|r| r.slot == slot)
			.map(|r| &mut r.mem)
	}

	/// Reads `len` bytes at a guest-physical address.
	pub fn read(&self, guest_address: u64, len: usize) -> Result<&[u8], MemoryError> {
		let region = self
			.regions
			.iter()
			.find(|r| r.contains(guest_address))
			.ok_or(MemoryError::BoundsViolation)?;
		region
			.mem
			.slice_at(guest_address - region.guest_address, len)
	}

	/// Writes `data` to a guest-physical address.
	pub fn write(&mut self, guest_address: u64, data: &[u8]) -> Result<(), MemoryError> {
		let region = self
			.regions
			.iter_mut()
			.find(|r| r.contains(guest_address))
			.ok_or(MemoryError::BoundsViolation)?;
		region
			.mem
			.slice_at_mut(guest_address - region.guest_address, data.len())?
			.copy_from_slice(data);
		Ok(())
	}

	/// Creates vCPU `id`.
	///
	/// The vCPU must be dropped before this context. [`KvminiVm`] guarantees
	/// this through its field order.
	pub fn create_vcpu(&self, id: u32) -> HypervisorResult<V::VCPU> {
		let cpu = self
			.backend
			.create_vcpu(id)
			.map_err(|source| HypervisorError::Creation {
				resource: "vCPU",
				source,
			})?;
		debug!("Created vCPU {id}");
		Ok(cpu)
	}
}

impl<V: VmBackend> Drop for VmContext<V> {
	fn drop(&mut self) {
		// The host must forget a slot before its memory is unmapped.
		for region in self.regions.iter().rev() {
			debug!("Remove memory slot {}", region.slot);
			if let Err(errno) = unsafe {
				self.backend.set_user_memory_region(
					region.slot,
					region.guest_address,
					0,
					region.mem.host_start(),
				)
			} {
				error!("Unable to remove memory slot {}: {errno}", region.slot);
			}
		}
		while let Some(region) = self.regions.pop() {
			drop(region);
		}
		debug!("Destroy VM");
	}
}

/// Outcome of a guest run.
#[derive(Debug)]
pub struct VmResult {
	/// Process exit code: 0 on halt or shutdown, 1 otherwise.
	pub code: i32,
	pub stop_reason: Option<VcpuStopReason>,
	pub error: Option<HypervisorError>,
	/// Port I/O lines, if the output is buffered.
	pub output: Option<String>,
	pub stats: Option<CpuStats>,
}

impl VmResult {
	fn failed(err: HypervisorError) -> Self {
		Self {
			code: 1,
			stop_reason: None,
			error: Some(err),
			output: None,
			stats: None,
		}
	}
}

/// A ready-to-run guest with a single vCPU.
///
/// The fields are declared in teardown order.
pub struct KvminiVm<B: VirtualizationBackend> {
	vcpu: Vcpu<<B::Vm as VmBackend>::VCPU>,
	vm: VmContext<B::Vm>,
	handle: VirtualizationHandle<B>,
	serial: KvminiSerial,
	params: Params,
}

impl<B: VirtualizationBackend> KvminiVm<B> {
	/// Creates the VM, loads `image` and prepares the vCPU for the first entry.
	///
	/// On failure, everything acquired so far is released in reverse order.
	pub fn new(
		handle: VirtualizationHandle<B>,
		image: &Path,
		params: Params,
	) -> HypervisorResult<Self> {
		let memory_size = params.memory_size.get();
		match params.linear_entry_point() {
			Some(entry) if entry < memory_size as u64 => {}
			_ => {
				return Err(HypervisorError::Configuration(format!(
					"entry point {:#x}:{:#x} lies outside of the guest memory",
					params.code_segment, params.entry_point
				)));
			}
		}

		let serial = KvminiSerial::from_params(&params.output)?;

		let version = handle.api_version()?;
		info!("{} API version {version}", B::NAME);

		let mut vm = handle.create_vm()?;

		let mem = MmapMemory::new(memory_size)?;
		vm.install_memory_region(RAM_SLOT, RAM_START, mem)?;

		let file = File::open(image).map_err(|source| HypervisorError::SourceUnavailable {
			path: image.to_path_buf(),
			source,
		})?;
		let region = vm.region_mut(RAM_SLOT).ok_or_else(|| {
			HypervisorError::Configuration(format!("memory slot {RAM_SLOT} is not installed"))
		})?;
		let loaded = region
			.load_image(BufReader::new(file))
			.map_err(|err| match err {
				LoadImageError::Io(source) => HypervisorError::SourceUnavailable {
					path: image.to_path_buf(),
					source,
				},
				LoadImageError::TooLarge { capacity } => {
					HypervisorError::ImageTooLarge { capacity }
				}
			})?;
		debug!("Loaded {loaded:#x} bytes from {}", image.display());

		let mut vcpu = Vcpu::new(vm.create_vcpu(BOOT_CPU_ID)?, &params);
		vcpu.initialize_segments(params.code_segment)?;
		vcpu.initialize_general_registers(
			params.entry_point,
			params.rflags,
			&params.register_seed,
		)?;
		vcpu.map_run_state(handle.vcpu_mmap_size()?)?;
		trace!("VM initialization complete");

		Ok(Self {
			vcpu,
			vm,
			handle,
			serial,
			params,
		})
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	pub fn vm(&self) -> &VmContext<B::Vm> {
		&self.vm
	}

	pub fn vcpu(&self) -> &Vcpu<<B::Vm as VmBackend>::VCPU> {
		&self.vcpu
	}

	pub fn handle(&self) -> &VirtualizationHandle<B> {
		&self.handle
	}

	/// Runs the guest until it halts, shuts down or fails.
	pub fn run(&mut self) -> VmResult {
		let (code, stop_reason, error) = match self.vcpu.run(&self.serial) {
			Ok(reason) => (0, Some(reason), None),
			Err(err) => {
				error!("vCPU {} failed: {err}", self.vcpu.id());
				(1, None, Some(err))
			}
		};

		VmResult {
			code,
			stop_reason,
			error,
			output: self.serial.buffered_output(),
			stats: self.vcpu.stats().cloned(),
		}
	}
}

/// Sets up a VM for `image`, runs it and releases all resources.
pub fn launch<B: VirtualizationBackend>(
	handle: VirtualizationHandle<B>,
	image: &Path,
	params: Params,
) -> VmResult {
	match KvminiVm::new(handle, image, params) {
		Ok(mut vm) => vm.run(),
		Err(err) => {
			error!("Unable to set up the VM: {err}");
			VmResult::failed(err)
		}
	}
}
