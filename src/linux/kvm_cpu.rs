use kvm_bindings::*;
use kvm_ioctls::{VcpuExit as KvmExit, VcpuFd, VmFd};

use crate::{
	HypervisorResult,
	error::{Errno, HypervisorError},
	vcpu::{Registers, Segment, SegmentRegisters, VcpuExit, VirtualCPU},
	vm::VmBackend,
};

fn configuration_error(operation: &str, errno: Errno) -> HypervisorError {
	HypervisorError::Configuration(format!("{operation} failed: {errno}"))
}

pub struct KvmVm {
	vm_fd: VmFd,
}

impl KvmVm {
	pub(crate) fn new(vm_fd: VmFd) -> Self {
		Self { vm_fd }
	}
}

impl VmBackend for KvmVm {
	type VCPU = KvmCpu;

	unsafe fn set_user_memory_region(
		&self,
		slot: u32,
		guest_address: u64,
		size: usize,
		host_address: *mut u8,
	) -> Result<(), Errno> {
		let region = kvm_userspace_memory_region {
			slot,
			flags: 0,
			guest_phys_addr: guest_address,
			memory_size: size as u64,
			userspace_addr: host_address as u64,
		};
		unsafe { self.vm_fd.set_user_memory_region(region) }
	}

	fn create_vcpu(&self, id: u32) -> Result<KvmCpu, Errno> {
		let vcpu = self.vm_fd.create_vcpu(id.into())?;
		Ok(KvmCpu {
			id,
			vcpu,
			run_state_size: None,
		})
	}
}

pub struct KvmCpu {
	id: u32,
	vcpu: VcpuFd,
	run_state_size: Option<usize>,
}

impl KvmCpu {
	fn show_segment(name: &str, seg: &kvm_segment) {
		println!(
			"{}       {:#06x}      {:#016x}  {:#08x}  {:#02x}    {:x} {:x}   {:x}  {:x} {:x} {:x} {:x}",
			name,
			seg.selector,
			seg.base,
			seg.limit,
			seg.type_,
			seg.present,
			seg.dpl,
			seg.db,
			seg.s,
			seg.l,
			seg.g,
			seg.avl
		);
	}

	/// Size of the run state shared with KVM, once it has been mapped.
	pub fn run_state_size(&self) -> Option<usize> {
		self.run_state_size
	}
}

impl VirtualCPU for KvmCpu {
	fn id(&self) -> u32 {
		self.id
	}

	fn registers(&self) -> HypervisorResult<Registers> {
		let regs = self
			.vcpu
			.get_regs()
			.map_err(|e| configuration_error("KVM_GET_REGS", e))?;
		Ok(Registers {
			rax: regs.rax,
			rbx: regs.rbx,
			rcx: regs.rcx,
			rdx: regs.rdx,
			rsi: regs.rsi,
			rdi: regs.rdi,
			rsp: regs.rsp,
			rbp: regs.rbp,
			r8: regs.r8,
			r9: regs.r9,
			r10: regs.r10,
			r11: regs.r11,
			r12: regs.r12,
			r13: regs.r13,
			r14: regs.r14,
			r15: regs.r15,
			rip: regs.rip,
			rflags: regs.rflags,
		})
	}

	fn set_registers(&mut self, regs: &Registers) -> HypervisorResult<()> {
		let kvm_regs = kvm_regs {
			rax: regs.rax,
			rbx: regs.rbx,
			rcx: regs.rcx,
			rdx: regs.rdx,
			rsi: regs.rsi,
			rdi: regs.rdi,
			rsp: regs.rsp,
			rbp: regs.rbp,
			r8: regs.r8,
			r9: regs.r9,
			r10: regs.r10,
			r11: regs.r11,
			r12: regs.r12,
			r13: regs.r13,
			r14: regs.r14,
			r15: regs.r15,
			rip: regs.rip,
			rflags: regs.rflags,
		};
		self.vcpu
			.set_regs(&kvm_regs)
			.map_err(|e| configuration_error("KVM_SET_REGS", e))
	}

	fn segments(&self) -> HypervisorResult<SegmentRegisters> {
		let sregs = self
			.vcpu
			.get_sregs()
			.map_err(|e| configuration_error("KVM_GET_SREGS", e))?;
		let seg = |s: &kvm_segment| Segment {
			selector: s.selector,
			base: s.base,
		};
		Ok(SegmentRegisters {
			cs: seg(&sregs.cs),
			ss: seg(&sregs.ss),
			ds: seg(&sregs.ds),
			es: seg(&sregs.es),
			fs: seg(&sregs.fs),
			gs: seg(&sregs.gs),
		})
	}

	fn set_segments(&mut self, segments: &SegmentRegisters) -> HypervisorResult<()> {
		let mut sregs = self
			.vcpu
			.get_sregs()
			.map_err(|e| configuration_error("KVM_GET_SREGS", e))?;
		for (kvm_seg, seg) in [
			(&mut sregs.cs, segments.cs),
			(&mut sregs.ss, segments.ss),
			(&mut sregs.ds, segments.ds),
			(&mut sregs.es, segments.es),
			(&mut sregs.fs, segments.fs),
			(&mut sregs.gs, segments.gs),
		] {
			kvm_seg.selector = seg.selector;
			kvm_seg.base = seg.base;
		}
		self.vcpu
			.set_sregs(&sregs)
			.map_err(|e| configuration_error("KVM_SET_SREGS", e))
	}

	fn map_run_state(&mut self, size: usize) -> HypervisorResult<()> {
		// kvm-ioctls maps `kvm_run` together with the vCPU and unmaps it on drop.
		if size < size_of::<kvm_run>() {
			return Err(HypervisorError::Configuration(format!(
				"run state of {size:#x} bytes cannot hold kvm_run"
			)));
		}
		self.run_state_size = Some(size);
		Ok(())
	}

	fn run(&mut self) -> HypervisorResult<VcpuExit<'_>> {
		match self.vcpu.run() {
			Ok(KvmExit::IoIn(port, data)) => Ok(VcpuExit::IoIn(port, data)),
			Ok(KvmExit::IoOut(port, data)) => Ok(VcpuExit::IoOut(port, data)),
			Ok(KvmExit::Hlt) => Ok(VcpuExit::Hlt),
			Ok(KvmExit::Shutdown) => Ok(VcpuExit::Shutdown),
			Ok(vcpu_exit) => Ok(VcpuExit::Unknown(format!("{vcpu_exit:?}"))),
			Err(errno) => Err(HypervisorError::Resume(errno)),
		}
	}

	fn print_registers(&self) {
		let (regs, sregs) = match (self.vcpu.get_regs(), self.vcpu.get_sregs()) {
			(Ok(regs), Ok(sregs)) => (regs, sregs),
			(Err(err), _) | (_, Err(err)) => {
				println!("Unable to read the state of CPU {}: {err}", self.id);
				return;
			}
		};

		println!();
		println!("Dump state of CPU {}", self.id);
		println!();
		println!("Registers:");
		println!("----------");
		println!(
			"rax: {:#18x}       r8: {:#18x}   cr0: {:#18x}",
			regs.rax, regs.r8, sregs.cr0
		);
		println!(
			"rbx: {:#18x}       r9: {:#18x}   cr2: {:#18x}",
			regs.rbx, regs.r9, sregs.cr2
		);
		println!(
			"rcx: {:#18x}      r10: {:#18x}   cr3: {:#18x}",
			regs.rcx, regs.r10, sregs.cr3
		);
		println!(
			"rdx: {:#18x}      r11: {:#18x}   cr4: {:#18x}",
			regs.rdx, regs.r11, sregs.cr4
		);
		println!(
			"rsi: {:#18x}      r12: {:#18x}   efer:{:#18x}",
			regs.rsi, regs.r12, sregs.efer
		);
		println!("rdi: {:#18x}      r13: {:#18x}", regs.rdi, regs.r13);
		println!("rsp: {:#18x}      r14: {:#18x}", regs.rsp, regs.r14);
		println!("rbp: {:#18x}      r15: {:#18x}", regs.rbp, regs.r15);
		println!("rip: {:#18x}   rflags: {:#18x}", regs.rip, regs.rflags);
		println!();
		println!("Segment registers:");
		println!("------------------");
		println!("register  selector  base              limit     type  p dpl db s l g avl");
		Self::show_segment("cs ", &sregs.cs);
		Self::show_segment("ss ", &sregs.ss);
		Self::show_segment("ds ", &sregs.ds);
		Self::show_segment("es ", &sregs.es);
		Self::show_segment("fs ", &sregs.fs);
		Self::show_segment("gs ", &sregs.gs);
	}
}
