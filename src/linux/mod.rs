pub mod kvm_cpu;

use std::{ffi::CString, os::unix::ffi::OsStrExt, path::Path};

use kvm_ioctls::Kvm;

use crate::{
	HypervisorResult,
	error::{Errno, HypervisorError},
	linux::kvm_cpu::KvmVm,
	vm::{VirtualizationBackend, VirtualizationHandle},
};

/// An open KVM device.
pub struct KvmHandle {
	kvm: Kvm,
}

impl KvmHandle {
	/// Opens the KVM device at `path` for reading and writing.
	pub fn open(path: impl AsRef<Path>) -> HypervisorResult<VirtualizationHandle<Self>> {
		let path = path.as_ref();
		let unavailable = |source| HypervisorError::Unavailable {
			path: path.to_path_buf(),
			source,
		};
		let c_path = CString::new(path.as_os_str().as_bytes())
			.map_err(|_| unavailable(Errno::new(libc::EINVAL)))?;
		let kvm = Kvm::new_with_path(c_path).map_err(unavailable)?;
		Ok(VirtualizationHandle::new(Self { kvm }, path))
	}
}

impl VirtualizationBackend for KvmHandle {
	type Vm = KvmVm;
	const NAME: &str = "KVM";

	fn api_version(&self) -> Result<i32, Errno> {
		let version = self.kvm.get_api_version();
		if version < 0 {
			Err(Errno::last())
		} else {
			Ok(version)
		}
	}

	fn create_vm(&self) -> Result<KvmVm, Errno> {
		Ok(KvmVm::new(self.kvm.create_vm()?))
	}

	fn vcpu_mmap_size(&self) -> Result<usize, Errno> {
		self.kvm.get_vcpu_mmap_size()
	}
}
