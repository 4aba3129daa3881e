#![allow(dead_code)]

use std::{
	cell::RefCell,
	collections::VecDeque,
	fs,
	path::{Path, PathBuf},
	rc::Rc,
};

use kvminilib::{
	HypervisorError, HypervisorResult,
	error::Errno,
	params::{Output, Params},
	vcpu::{Registers, SegmentRegisters, VcpuExit, VirtualCPU},
	vm::{VirtualizationBackend, VirtualizationHandle, VmBackend},
};
use tempfile::TempDir;

/// Size the fake host reports for the vCPU run state.
pub const RUN_STATE_SIZE: usize = 0x3000;

/// Every acquisition and release the fake host has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	CreateVm,
	InstallRegion {
		slot: u32,
		guest_address: u64,
		size: usize,
	},
	CreateVcpu(u32),
	SetSegments,
	SetRegisters,
	MapRunState(usize),
	Run,
	DestroyVcpu(u32),
	RemoveRegion {
		slot: u32,
	},
	DestroyVm,
	CloseHandle,
}

/// Host operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	ApiVersion,
	CreateVm,
	InstallRegion,
	CreateVcpu,
	SetSegments,
	SetRegisters,
	RunStateSize,
	MapRunState,
}

/// Exits the fake vCPU reports, one per resumption.
#[derive(Debug, Clone)]
pub enum FakeExit {
	Out(u16, Vec<u8>),
	In(u16, usize),
	Hlt,
	Shutdown,
	Unknown(&'static str),
	Fail(i32),
}

#[derive(Default)]
struct State {
	events: Vec<Event>,
	fail_at: Option<Step>,
	exits: VecDeque<FakeExit>,
}

/// A scripted stand-in for the host's virtualization interface.
#[derive(Clone, Default)]
pub struct FakeHost(Rc<RefCell<State>>);

impl FakeHost {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn failing_at(step: Step) -> Self {
		let host = Self::new();
		host.0.borrow_mut().fail_at = Some(step);
		host
	}

	pub fn with_exits(exits: impl IntoIterator<Item = FakeExit>) -> Self {
		let host = Self::new();
		host.0.borrow_mut().exits.extend(exits);
		host
	}

	pub fn handle(&self) -> VirtualizationHandle<FakeKvm> {
		VirtualizationHandle::new(FakeKvm(self.clone()), "/dev/fake-kvm")
	}

	pub fn events(&self) -> Vec<Event> {
		self.0.borrow().events.clone()
	}

	fn record(&self, event: Event) {
		self.0.borrow_mut().events.push(event);
	}

	fn check(&self, step: Step) -> Result<(), Errno> {
		if self.0.borrow().fail_at == Some(step) {
			Err(Errno::new(libc::EINVAL))
		} else {
			Ok(())
		}
	}

	fn next_exit(&self) -> Option<FakeExit> {
		self.0.borrow_mut().exits.pop_front()
	}
}

pub struct FakeKvm(FakeHost);

impl VirtualizationBackend for FakeKvm {
	type Vm = FakeVm;
	const NAME: &str = "FakeKvm";

	fn api_version(&self) -> Result<i32, Errno> {
		self.0.check(Step::ApiVersion)?;
		Ok(12)
	}

	fn create_vm(&self) -> Result<FakeVm, Errno> {
		self.0.check(Step::CreateVm)?;
		self.0.record(Event::CreateVm);
		Ok(FakeVm(self.0.clone()))
	}

	fn vcpu_mmap_size(&self) -> Result<usize, Errno> {
		self.0.check(Step::RunStateSize)?;
		Ok(RUN_STATE_SIZE)
	}
}

impl Drop for FakeKvm {
	fn drop(&mut self) {
		self.0.record(Event::CloseHandle);
	}
}

pub struct FakeVm(FakeHost);

impl VmBackend for FakeVm {
	type VCPU = FakeCpu;

	unsafe fn set_user_memory_region(
		&self,
		slot: u32,
		guest_address: u64,
		size: usize,
		_host_address: *mut u8,
	) -> Result<(), Errno> {
		if size == 0 {
			self.0.record(Event::RemoveRegion { slot });
		} else {
			self.0.check(Step::InstallRegion)?;
			self.0.record(Event::InstallRegion {
				slot,
				guest_address,
				size,
			});
		}
		Ok(())
	}

	fn create_vcpu(&self, id: u32) -> Result<FakeCpu, Errno> {
		self.0.check(Step::CreateVcpu)?;
		self.0.record(Event::CreateVcpu(id));
		Ok(FakeCpu {
			id,
			host: self.0.clone(),
			regs: Registers::default(),
			sregs: SegmentRegisters::default(),
			io: Vec::new(),
		})
	}
}

impl Drop for FakeVm {
	fn drop(&mut self) {
		self.0.record(Event::DestroyVm);
	}
}

pub struct FakeCpu {
	id: u32,
	host: FakeHost,
	regs: Registers,
	sregs: SegmentRegisters,
	io: Vec<u8>,
}

impl FakeCpu {
	/// Data of the last port I/O exit as seen by the guest.
	pub fn last_io(&self) -> &[u8] {
		&self.io
	}

	fn step(&self, step: Step) -> HypervisorResult<()> {
		self.host
			.check(step)
			.map_err(|errno| HypervisorError::Configuration(format!("{step:?}: {errno}")))
	}
}

impl VirtualCPU for FakeCpu {
	fn id(&self) -> u32 {
		self.id
	}

	fn registers(&self) -> HypervisorResult<Registers> {
		Ok(self.regs)
	}

	fn set_registers(&mut self, regs: &Registers) -> HypervisorResult<()> {
		self.step(Step::SetRegisters)?;
		self.host.record(Event::SetRegisters);
		self.regs = *regs;
		Ok(())
	}

	fn segments(&self) -> HypervisorResult<SegmentRegisters> {
		Ok(self.sregs)
	}

	fn set_segments(&mut self, segments: &SegmentRegisters) -> HypervisorResult<()> {
		self.step(Step::SetSegments)?;
		self.host.record(Event::SetSegments);
		self.sregs = *segments;
		Ok(())
	}

	fn map_run_state(&mut self, size: usize) -> HypervisorResult<()> {
		self.step(Step::MapRunState)?;
		self.host.record(Event::MapRunState(size));
		Ok(())
	}

	fn run(&mut self) -> HypervisorResult<VcpuExit<'_>> {
		self.host.record(Event::Run);
		match self.host.next_exit() {
			Some(FakeExit::Out(port, data)) => {
				self.io = data;
				Ok(VcpuExit::IoOut(port, &self.io))
			}
			Some(FakeExit::In(port, size)) => {
				self.io = vec![0; size];
				Ok(VcpuExit::IoIn(port, &mut self.io))
			}
			Some(FakeExit::Hlt) => Ok(VcpuExit::Hlt),
			Some(FakeExit::Shutdown) => Ok(VcpuExit::Shutdown),
			Some(FakeExit::Unknown(reason)) => Ok(VcpuExit::Unknown(reason.to_string())),
			Some(FakeExit::Fail(errno)) => Err(HypervisorError::Resume(Errno::new(errno))),
			None => Err(HypervisorError::Resume(Errno::new(libc::EFAULT))),
		}
	}
}

impl Drop for FakeCpu {
	fn drop(&mut self) {
		self.host.record(Event::DestroyVcpu(self.id));
	}
}

/// Writes `bytes` to a guest image in a fresh temporary directory.
pub fn guest_image(bytes: &[u8]) -> (TempDir, PathBuf) {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("guest");
	fs::write(&path, bytes).unwrap();
	(dir, path)
}

/// The reference configuration with port I/O lines captured in a buffer.
pub fn buffered_params() -> Params {
	Params {
		output: Output::Buffer,
		..Default::default()
	}
}

/// Events of a complete setup of the reference configuration.
pub fn setup_events() -> Vec<Event> {
	vec![
		Event::CreateVm,
		Event::InstallRegion {
			slot: 0,
			guest_address: 0,
			size: 0x10000,
		},
		Event::CreateVcpu(0),
		Event::SetSegments,
		Event::SetRegisters,
		Event::MapRunState(RUN_STATE_SIZE),
	]
}

/// Events of the teardown of the reference configuration.
pub fn teardown_events() -> Vec<Event> {
	vec![
		Event::DestroyVcpu(0),
		Event::RemoveRegion { slot: 0 },
		Event::DestroyVm,
		Event::CloseHandle,
	]
}

pub fn missing_image(dir: &Path) -> PathBuf {
	dir.join("does-not-exist")
}
