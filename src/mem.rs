use std::{
	io::{self, Read},
	num::NonZeroUsize,
	os::raw::c_void,
	ptr::NonNull,
	slice,
};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;

use crate::{
	HypervisorResult,
	consts::PAGE_SIZE,
	error::{Errno, HypervisorError},
};

#[derive(Error, Debug)]
pub enum MemoryError {
	#[error("Memory bounds exceeded")]
	BoundsViolation,
}

#[derive(Error, Debug)]
pub enum LoadImageError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("guest image exceeds the guest memory of {capacity:#x} bytes")]
	TooLarge { capacity: usize },
}

/// Anonymous host memory that backs the guest RAM.
///
/// The mapping is shared, zero initialized and page aligned. Its host address
/// never changes, so it can be handed to the hypervisor for as long as the
/// value lives.
#[derive(Debug)]
pub struct MmapMemory {
	host_address: NonNull<c_void>,
	memory_size: usize,
}

impl MmapMemory {
	pub fn new(memory_size: usize) -> HypervisorResult<Self> {
		let length = NonZeroUsize::new(memory_size)
			.filter(|_| memory_size % PAGE_SIZE == 0)
			.ok_or(HypervisorError::Allocation {
				size: memory_size,
				source: Errno::new(libc::EINVAL),
			})?;

		let host_address = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED | MapFlags::MAP_NORESERVE,
			)
		}
		.map_err(|errno| HypervisorError::Allocation {
			size: memory_size,
			source: Errno::new(errno as i32),
		})?;
		debug!("Mapped {memory_size:#x} bytes of guest memory at {host_address:p}");

		Ok(Self {
			host_address,
			memory_size,
		})
	}

	/// Returns the size of the memory in bytes
	pub fn size(&self) -> usize {
		self.memory_size
	}

	/// Returns a pointer to the beginning of the memory on the host.
	pub fn host_start(&self) -> *mut u8 {
		self.host_address.as_ptr().cast()
	}

	pub fn as_slice(&self) -> &[u8] {
		unsafe { slice::from_raw_parts(self.host_start(), self.memory_size) }
	}

	pub fn as_slice_mut(&mut self) -> &mut [u8] {
		unsafe { slice::from_raw_parts_mut(self.host_start(), self.memory_size) }
	}

	fn check_range(&self, offset: u64, len: usize) -> Result<usize, MemoryError> {
		let start = usize::try_from(offset).map_err(|_| MemoryError::BoundsViolation)?;
		let end = start
			.checked_add(len)
			.ok_or(MemoryError::BoundsViolation)?;
		if end <= self.memory_size {
			Ok(start)
		} else {
			Err(MemoryError::BoundsViolation)
		}
	}

	/// Read-only view of `len` bytes starting at `offset`.
	pub fn slice_at(&self, offset: u64, len: usize) -> Result<&[u8], MemoryError> {
		let start = self.check_range(offset, len)?;
		Ok(&self.as_slice()[start..start + len])
	}

	/// Writeable view of `len` bytes starting at `offset`.
	pub fn slice_at_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8], MemoryError> {
		let start = self.check_range(offset, len)?;
		Ok(&mut self.as_slice_mut()[start..start + len])
	}

	/// Read the value at `offset` (unaligned reads are allowed).
	pub fn read<T: Copy>(&self, offset: u64) -> Result<T, MemoryError> {
		let start = self.check_range(offset, size_of::<T>())?;
		Ok(unsafe { self.host_start().add(start).cast::<T>().read_unaligned() })
	}

	/// Copies a whole guest image to the start of the memory.
	///
	/// Returns the number of bytes loaded. The stream is consumed until it is
	/// exhausted; a stream that is longer than the memory is rejected instead of
	/// being truncated.
	pub fn load_image(&mut self, mut source: impl Read) -> Result<usize, LoadImageError> {
		let capacity = self.memory_size;
		let mem = self.as_slice_mut();
		let mut loaded = 0;

		loop {
			let res = if loaded == capacity {
				// The memory is full, so the stream must be exhausted as well.
				let mut probe = [0u8; 1];
				match source.read(&mut probe) {
					Ok(0) => break,
					Ok(_) => return Err(LoadImageError::TooLarge { capacity }),
					Err(err) => Err(err),
				}
			} else {
				source.read(&mut mem[loaded..])
			};

			match res {
				Ok(0) => break,
				Ok(n) => loaded += n,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => return Err(err.into()),
			}
		}

		trace!("Loaded {loaded:#x} bytes of guest image");
		Ok(loaded)
	}
}

impl Drop for MmapMemory {
	fn drop(&mut self) {
		debug!("Unmap guest memory at {:p}", self.host_address);
		if let Err(errno) = unsafe { munmap(self.host_address, self.memory_size) } {
			error!("Unable to unmap guest memory: {errno}");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::consts::DEFAULT_GUEST_SIZE;

	#[test]
	fn test_mmap_memory_readwrite() {
		let mut mem = MmapMemory::new(16 * PAGE_SIZE).unwrap();
		let slice = mem.as_slice_mut();
		slice[0xfe] = 0xaa;
		slice[0xff] = 0xbb;
		slice[0x100] = 0x78;
		slice[0x101] = 0x56;
		slice[0x102] = 0x34;
		slice[0x103] = 0x12;

		assert_eq!(mem.read::<u64>(0x100).unwrap(), 0x12345678);
		// unaligned read
		assert_eq!(mem.read::<u64>(0xfe).unwrap(), 0x12345678bbaa);
		assert_eq!(mem.slice_at(0xfe, 2).unwrap(), &[0xaa, 0xbb]);
	}

	#[test]
	fn test_mmap_memory_is_zeroed() {
		let mem = MmapMemory::new(DEFAULT_GUEST_SIZE).unwrap();
		assert_eq!(mem.size(), DEFAULT_GUEST_SIZE);
		assert!(mem.as_slice().iter().all(|&b| b == 0));
		assert_eq!(mem.host_start() as usize % PAGE_SIZE, 0);
	}

	#[test]
	fn test_mmap_memory_invalid_size() {
		for size in [0, PAGE_SIZE + 1] {
			assert!(matches!(
				MmapMemory::new(size),
				Err(HypervisorError::Allocation { .. })
			));
		}
	}

	#[test]
	fn test_bounds() {
		let mut mem = MmapMemory::new(PAGE_SIZE).unwrap();
		assert!(mem.slice_at(0, PAGE_SIZE).is_ok());
		assert!(matches!(
			mem.slice_at(1, PAGE_SIZE),
			Err(MemoryError::BoundsViolation)
		));
		assert!(mem.read::<u32>(PAGE_SIZE as u64 - 2).is_err());
		assert!(mem.slice_at_mut(u64::MAX, 1).is_err());
	}

	#[test]
	fn test_load_image() {
		let mut mem = MmapMemory::new(PAGE_SIZE).unwrap();
		let image = [0xb0, 0x02, 0xe6, 0x10, 0xf4];
		assert_eq!(mem.load_image(Cursor::new(image)).unwrap(), image.len());
		assert_eq!(mem.slice_at(0, image.len()).unwrap(), &image);
		assert_eq!(mem.read::<u8>(image.len() as u64).unwrap(), 0);
	}

	#[test]
	fn test_load_image_is_idempotent() {
		let mut mem = MmapMemory::new(PAGE_SIZE).unwrap();
		let image: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

		mem.load_image(Cursor::new(&image)).unwrap();
		let first = mem.as_slice().to_vec();
		mem.load_image(Cursor::new(&image)).unwrap();
		assert_eq!(first, mem.as_slice());
	}

	#[test]
	fn test_load_image_exactly_full() {
		let mut mem = MmapMemory::new(PAGE_SIZE).unwrap();
		let image = vec![0xf4; PAGE_SIZE];
		assert_eq!(mem.load_image(Cursor::new(image)).unwrap(), PAGE_SIZE);
	}

	#[test]
	fn test_load_image_too_large() {
		let mut mem = MmapMemory::new(PAGE_SIZE).unwrap();
		let image = vec![0x90; PAGE_SIZE + 1];
		assert!(matches!(
			mem.load_image(Cursor::new(image)),
			Err(LoadImageError::TooLarge { capacity: PAGE_SIZE })
		));
	}
}
