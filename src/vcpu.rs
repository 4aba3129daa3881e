use std::fmt;

use crate::{
	HypervisorResult,
	consts::RFLAGS_RESERVED,
	error::HypervisorError,
	params::{Gpr, Params, RegisterSeed, UnknownExitPolicy},
	serial::KvminiSerial,
	stats::{CpuStats, VmExit},
};

/// General purpose registers, instruction pointer and flags of a vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rsp: u64,
	pub rbp: u64,
	pub r8: u64,
	pub r9: u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	pub rip: u64,
	pub rflags: u64,
}

impl Registers {
	pub fn gpr_mut(&mut self, gpr: Gpr) -> &mut u64 {
		match gpr {
			Gpr::Rax => &mut self.rax,
			Gpr::Rbx => &mut self.rbx,
			Gpr::Rcx => &mut self.rcx,
			Gpr::Rdx => &mut self.rdx,
			Gpr::Rsi => &mut self.rsi,
			Gpr::Rdi => &mut self.rdi,
			Gpr::Rsp => &mut self.rsp,
			Gpr::Rbp => &mut self.rbp,
			Gpr::R8 => &mut self.r8,
			Gpr::R9 => &mut self.r9,
			Gpr::R10 => &mut self.r10,
			Gpr::R11 => &mut self.r11,
			Gpr::R12 => &mut self.r12,
			Gpr::R13 => &mut self.r13,
			Gpr::R14 => &mut self.r14,
			Gpr::R15 => &mut self.r15,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
	pub selector: u16,
	pub base: u64,
}

impl Segment {
	/// Real-address mode segment: the base is the selector shifted by four.
	pub fn real_mode(selector: u16) -> Self {
		Self {
			selector,
			base: u64::from(selector) << 4,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegisters {
	pub cs: Segment,
	pub ss: Segment,
	pub ds: Segment,
	pub es: Segment,
	pub fs: Segment,
	pub gs: Segment,
}

impl SegmentRegisters {
	/// Flat real-address mode with every segment at `origin`.
	pub fn real_mode(origin: u16) -> Self {
		let seg = Segment::real_mode(origin);
		Self {
			cs: seg,
			ss: seg,
			ds: seg,
			es: seg,
			fs: seg,
			gs: seg,
		}
	}
}

/// Why the guest returned control to the host.
///
/// The data slices point into the shared run state and stay valid until the
/// vCPU is resumed.
#[derive(Debug)]
pub enum VcpuExit<'a> {
	/// The guest reads from a port; the slice receives the value.
	IoIn(u16, &'a mut [u8]),
	/// The guest writes the slice to a port.
	IoOut(u16, &'a [u8]),
	Hlt,
	Shutdown,
	/// Any exit without a dedicated handler, described by the backend.
	Unknown(String),
}

/// Reasons for a successful end of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuStopReason {
	/// The guest executed `hlt`.
	Halt,
	/// The guest shut down, e.g. through a triple fault.
	Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
	Created,
	RegistersInitialized,
	Running,
	Halted,
	ShutDown,
	Faulted,
	UnknownExit,
}

impl VcpuState {
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			Self::Halted | Self::ShutDown | Self::Faulted | Self::UnknownExit
		)
	}
}

impl fmt::Display for VcpuState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Functionality a virtual CPU backend must provide to be used by kvmini
pub trait VirtualCPU {
	fn id(&self) -> u32;

	/// The current general purpose registers as reported by the host.
	fn registers(&self) -> HypervisorResult<Registers>;

	fn set_registers(&mut self, regs: &Registers) -> HypervisorResult<()>;

	/// The current segment registers as reported by the host.
	fn segments(&self) -> HypervisorResult<SegmentRegisters>;

	/// Loads the segment registers. State the host keeps besides selector and
	/// base (limits, access rights) is left untouched.
	fn set_segments(&mut self, segments: &SegmentRegisters) -> HypervisorResult<()>;

	/// Maps the shared run state of `size` bytes.
	fn map_run_state(&mut self, size: usize) -> HypervisorResult<()>;

	/// Continues execution of the guest. Blocks until the guest exits.
	fn run(&mut self) -> HypervisorResult<VcpuExit<'_>>;

	/// Prints the VCPU's registers to stdout.
	fn print_registers(&self) {
		println!();
		println!("Dump state of CPU {}", self.id());
		println!();
		match self.registers() {
			Ok(regs) => println!("{regs:#x?}"),
			Err(err) => println!("Registers unavailable: {err}"),
		}
		match self.segments() {
			Ok(sregs) => println!("{sregs:#x?}"),
			Err(err) => println!("Segment registers unavailable: {err}"),
		}
	}
}

/// Zero-extends up to 32 bits of port data (little endian).
pub fn port_data(data: &[u8]) -> u32 {
	let mut buf = [0u8; 4];
	let len = data.len().min(buf.len());
	buf[..len].copy_from_slice(&data[..len]);
	u32::from_le_bytes(buf)
}

/// Drives a single vCPU from creation to a terminal state.
pub struct Vcpu<C: VirtualCPU> {
	cpu: C,
	state: VcpuState,
	run_state_size: Option<usize>,
	unknown_exit: UnknownExitPolicy,
	verbose: bool,
	stats: Option<CpuStats>,
}

impl<C: VirtualCPU> Vcpu<C> {
	pub fn new(cpu: C, params: &Params) -> Self {
		let stats = params.stats.then(|| CpuStats::new(cpu.id()));
		Self {
			cpu,
			state: VcpuState::Created,
			run_state_size: None,
			unknown_exit: params.unknown_exit,
			verbose: params.verbose,
			stats,
		}
	}

	pub fn id(&self) -> u32 {
		self.cpu.id()
	}

	pub fn state(&self) -> VcpuState {
		self.state
	}

	pub fn registers(&self) -> HypervisorResult<Registers> {
		self.cpu.registers()
	}

	pub fn segments(&self) -> HypervisorResult<SegmentRegisters> {
		self.cpu.segments()
	}

	pub fn backend(&self) -> &C {
		&self.cpu
	}

	fn expect_setup(&self, operation: &str) -> HypervisorResult<()> {
		match self.state {
			VcpuState::Created | VcpuState::RegistersInitialized if self.run_state_size.is_none() => {
				Ok(())
			}
			state => Err(HypervisorError::Configuration(format!(
				"cannot {operation} in state {state}{}",
				if self.run_state_size.is_some() {
					" after the run state was mapped"
				} else {
					""
				}
			))),
		}
	}

	/// Loads every segment register with `origin` for flat real-address mode.
	pub fn initialize_segments(&mut self, origin: u16) -> HypervisorResult<()> {
		self.expect_setup("initialize segments")?;
		debug!("Load segments of vCPU {} with {origin:#x}", self.id());
		self.cpu.set_segments(&SegmentRegisters::real_mode(origin))
	}

	/// Sets instruction pointer, flags and the seeded general purpose registers.
	/// All other general purpose registers are cleared.
	pub fn initialize_general_registers(
		&mut self,
		entry_point: u64,
		rflags: u64,
		seed: &RegisterSeed,
	) -> HypervisorResult<()> {
		self.expect_setup("initialize registers")?;

		let mut regs = Registers {
			rip: entry_point,
			rflags: rflags | RFLAGS_RESERVED,
			..Default::default()
		};
		for (gpr, value) in seed.iter() {
			*regs.gpr_mut(gpr) = value;
		}
		debug!(
			"Initialize vCPU {}: rip = {:#x}, rflags = {:#x}",
			self.id(),
			regs.rip,
			regs.rflags
		);
		self.cpu.set_registers(&regs)?;

		self.state = VcpuState::RegistersInitialized;
		Ok(())
	}

	/// Maps the run state, through which the host reports exits.
	pub fn map_run_state(&mut self, size: usize) -> HypervisorResult<()> {
		if self.state != VcpuState::RegistersInitialized || self.run_state_size.is_some() {
			return Err(HypervisorError::Configuration(format!(
				"cannot map the run state in state {}{}",
				self.state,
				if self.run_state_size.is_some() {
					" twice"
				} else {
					""
				}
			)));
		}
		debug!("Map run state of vCPU {} ({size:#x} bytes)", self.id());
		self.cpu.map_run_state(size)?;
		self.run_state_size = Some(size);
		Ok(())
	}

	/// Enters the guest once and returns the exit.
	///
	/// Split off from `&mut self` so the exit can borrow the backend while the
	/// state is updated.
	fn enter<'a>(
		cpu: &'a mut C,
		state: &mut VcpuState,
		run_state_size: Option<usize>,
	) -> HypervisorResult<VcpuExit<'a>> {
		if run_state_size.is_none() {
			return Err(HypervisorError::Configuration(format!(
				"cannot resume in state {state} before the run state is mapped"
			)));
		}
		if !matches!(
			state,
			VcpuState::RegistersInitialized | VcpuState::Running
		) {
			return Err(HypervisorError::Configuration(format!(
				"cannot resume in state {state}"
			)));
		}

		*state = VcpuState::Running;
		cpu.run().inspect_err(|_| *state = VcpuState::Faulted)
	}

	/// Resumes the guest and blocks until it exits.
	pub fn resume(&mut self) -> HypervisorResult<VcpuExit<'_>> {
		Self::enter(&mut self.cpu, &mut self.state, self.run_state_size)
	}

	/// Runs the guest until it halts, shuts down or fails.
	pub fn run(&mut self, serial: &KvminiSerial) -> HypervisorResult<VcpuStopReason> {
		if let Some(stats) = self.stats.as_mut() {
			stats.start_time_measurement();
		}
		let res = self.dispatch(serial);
		if let Some(stats) = self.stats.as_mut() {
			stats.stop_time_measurement();
		}

		if self.verbose && matches!(res, Err(_) | Ok(VcpuStopReason::Shutdown)) {
			self.cpu.print_registers();
		}
		res
	}

	fn dispatch(&mut self, serial: &KvminiSerial) -> HypervisorResult<VcpuStopReason> {
		let id = self.cpu.id();
		loop {
			trace!("vCPU {id}: entering guest");
			let exit = Self::enter(&mut self.cpu, &mut self.state, self.run_state_size)?;

			let kind = match &exit {
				VcpuExit::IoIn(..) => VmExit::PortRead,
				VcpuExit::IoOut(..) => VmExit::PortWrite,
				VcpuExit::Hlt => VmExit::Hlt,
				VcpuExit::Shutdown => VmExit::Shutdown,
				VcpuExit::Unknown(_) => VmExit::Unknown,
			};
			if let Some(stats) = self.stats.as_mut() {
				stats.increment_val(kind);
			}

			match exit {
				VcpuExit::IoOut(port, data) => {
					if let Err(err) = serial.port_io(port, port_data(data)) {
						self.state = VcpuState::Faulted;
						return Err(err.into());
					}
				}
				VcpuExit::IoIn(port, data) => {
					// No device is attached to any port.
					data.fill(0xff);
					if let Err(err) = serial.port_io(port, port_data(data)) {
						self.state = VcpuState::Faulted;
						return Err(err.into());
					}
				}
				VcpuExit::Hlt => {
					info!("vCPU {id}: guest halted");
					self.state = VcpuState::Halted;
					return Ok(VcpuStopReason::Halt);
				}
				VcpuExit::Shutdown => {
					info!("vCPU {id}: guest shut down");
					self.state = VcpuState::ShutDown;
					return Ok(VcpuStopReason::Shutdown);
				}
				VcpuExit::Unknown(reason) => match self.unknown_exit {
					UnknownExitPolicy::Resume => {
						warn!("vCPU {id}: ignoring unknown exit {reason}");
					}
					UnknownExitPolicy::Fail => {
						self.state = VcpuState::UnknownExit;
						return Err(HypervisorError::UnknownExit(reason));
					}
				},
			}
		}
	}

	/// Statistics of the last run, if enabled.
	pub fn stats(&self) -> Option<&CpuStats> {
		self.stats.as_ref()
	}
}

impl<C: VirtualCPU> Drop for Vcpu<C> {
	fn drop(&mut self) {
		debug!("Drop vCPU {} in state {}", self.cpu.id(), self.state);
	}
}
