use std::{
	convert::Infallible,
	fmt,
	num::ParseIntError,
	path::PathBuf,
	str::FromStr,
};

use byte_unit::{Byte, Unit};
use thiserror::Error;

use crate::consts::*;

#[derive(Debug, Clone)]
pub struct Params {
	/// Guest RAM size
	pub memory_size: GuestMemorySize,

	/// Real-mode segment loaded into every segment register
	pub code_segment: u16,

	/// Initial instruction pointer, relative to the code segment
	pub entry_point: u64,

	/// Initial RFLAGS
	pub rflags: u64,

	/// Initial values of the general purpose registers
	pub register_seed: RegisterSeed,

	/// Path of the hypervisor device
	pub device: PathBuf,

	/// Port I/O output handling
	pub output: Output,

	/// Collect run statistics
	pub stats: bool,

	/// Handling of exits the dispatch loop does not know
	pub unknown_exit: UnknownExitPolicy,

	/// Dump the vCPU state on abnormal termination
	pub verbose: bool,
}

impl Default for Params {
	fn default() -> Self {
		Self {
			memory_size: Default::default(),
			code_segment: CODE_START,
			entry_point: DEFAULT_ENTRY_POINT,
			rflags: DEFAULT_RFLAGS,
			register_seed: Default::default(),
			device: PathBuf::from(KVM_DEVICE),
			output: Default::default(),
			stats: false,
			unknown_exit: Default::default(),
			verbose: false,
		}
	}
}

impl Params {
	/// Guest-physical address of the first instruction.
	pub fn linear_entry_point(&self) -> Option<u64> {
		(u64::from(self.code_segment) << 4).checked_add(self.entry_point)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestMemorySize(Byte);

impl GuestMemorySize {
	const fn minimum() -> Byte {
		Byte::from_u64(PAGE_SIZE as u64)
	}

	pub fn get(self) -> usize {
		// Checked to fit into `usize` on construction.
		self.0.as_u64() as usize
	}
}

impl Default for GuestMemorySize {
	fn default() -> Self {
		Self(Byte::from_u64(DEFAULT_GUEST_SIZE as u64))
	}
}

impl fmt::Display for GuestMemorySize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Error, Debug)]
pub enum InvalidGuestMemorySizeError {
	#[error(
		"Not enough guest memory. Must be at least {min:#} (is {cur:#})",
		min = GuestMemorySize::minimum().get_adjusted_unit(Unit::KiB),
		cur = .0.get_adjusted_unit(Unit::KiB),
	)]
	MemoryTooSmall(Byte),
	#[error(
		"Invalid amount of guest memory. Must be a multiple of 4 KiB (is {cur:#})",
		cur = .0.get_adjusted_unit(Unit::KiB),
	)]
	NotPageAligned(Byte),
	#[error("Guest memory of {0} bytes is not addressable on this host")]
	TooLarge(Byte),
}

impl TryFrom<Byte> for GuestMemorySize {
	type Error = InvalidGuestMemorySizeError;

	fn try_from(value: Byte) -> Result<Self, Self::Error> {
		if value < Self::minimum() {
			Err(InvalidGuestMemorySizeError::MemoryTooSmall(value))
		} else if value.as_u64() % PAGE_SIZE as u64 != 0 {
			Err(InvalidGuestMemorySizeError::NotPageAligned(value))
		} else if usize::try_from(value.as_u64()).is_err() {
			Err(InvalidGuestMemorySizeError::TooLarge(value))
		} else {
			Ok(Self(value))
		}
	}
}

#[derive(Error, Debug)]
pub enum ParseByteError {
	#[error(transparent)]
	Parse(#[from] byte_unit::ParseError),

	#[error(transparent)]
	InvalidMemorySize(#[from] InvalidGuestMemorySizeError),
}

impl FromStr for GuestMemorySize {
	type Err = ParseByteError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let requested = Byte::from_str(s)?;
		let memory_size = requested.try_into()?;
		Ok(memory_size)
	}
}

/// Parses decimal numbers and hexadecimal numbers with a `0x` prefix.
pub fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
	let s = s.trim();
	match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16),
		None => s.parse(),
	}
}

/// A general purpose register of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gpr {
	Rax,
	Rbx,
	Rcx,
	Rdx,
	Rsi,
	Rdi,
	Rsp,
	Rbp,
	R8,
	R9,
	R10,
	R11,
	R12,
	R13,
	R14,
	R15,
}

impl Gpr {
	const ALL: [(Gpr, &'static str); 16] = [
		(Gpr::Rax, "rax"),
		(Gpr::Rbx, "rbx"),
		(Gpr::Rcx, "rcx"),
		(Gpr::Rdx, "rdx"),
		(Gpr::Rsi, "rsi"),
		(Gpr::Rdi, "rdi"),
		(Gpr::Rsp, "rsp"),
		(Gpr::Rbp, "rbp"),
		(Gpr::R8, "r8"),
		(Gpr::R9, "r9"),
		(Gpr::R10, "r10"),
		(Gpr::R11, "r11"),
		(Gpr::R12, "r12"),
		(Gpr::R13, "r13"),
		(Gpr::R14, "r14"),
		(Gpr::R15, "r15"),
	];

	pub fn name(self) -> &'static str {
		Self::ALL
			.iter()
			.find(|(gpr, _)| *gpr == self)
			.map(|(_, name)| *name)
			.unwrap_or_default()
	}
}

impl fmt::Display for Gpr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Error, Debug)]
pub enum ParseRegisterSeedError {
	#[error("Unknown register `{0}`")]
	UnknownRegister(String),
	#[error("Expected `register=value`, got `{0}`")]
	MissingValue(String),
	#[error("Invalid value for {register}: {source}")]
	InvalidValue {
		register: Gpr,
		#[source]
		source: ParseIntError,
	},
}

impl FromStr for Gpr {
	type Err = ParseRegisterSeedError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let lower = s.trim().to_ascii_lowercase();
		Self::ALL
			.iter()
			.find(|(_, name)| *name == lower)
			.map(|(gpr, _)| *gpr)
			.ok_or_else(|| ParseRegisterSeedError::UnknownRegister(s.to_string()))
	}
}

/// Initial values of general purpose registers.
///
/// Registers that are not part of the seed start out as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSeed(Vec<(Gpr, u64)>);

impl RegisterSeed {
	pub fn empty() -> Self {
		Self(Vec::new())
	}

	/// Sets `gpr` to `value`, replacing an earlier value.
	pub fn set(&mut self, gpr: Gpr, value: u64) {
		match self.0.iter_mut().find(|(r, _)| *r == gpr) {
			Some(entry) => entry.1 = value,
			None => self.0.push((gpr, value)),
		}
	}

	pub fn get(&self, gpr: Gpr) -> Option<u64> {
		self.0.iter().find(|(r, _)| *r == gpr).map(|(_, v)| *v)
	}

	pub fn iter(&self) -> impl Iterator<Item = (Gpr, u64)> + '_ {
		self.0.iter().copied()
	}
}

impl Default for RegisterSeed {
	fn default() -> Self {
		let mut seed = Self::empty();
		seed.set(Gpr::Rax, 2);
		seed.set(Gpr::Rbx, 2);
		seed
	}
}

impl fmt::Display for RegisterSeed {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, (gpr, value)) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(",")?;
			}
			write!(f, "{gpr}={value:#x}")?;
		}
		Ok(())
	}
}

impl FromStr for RegisterSeed {
	type Err = ParseRegisterSeedError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut seed = Self::empty();
		for item in s.split([' ', ',']).filter(|item| !item.is_empty()) {
			let (name, value) = item
				.split_once('=')
				.ok_or_else(|| ParseRegisterSeedError::MissingValue(item.to_string()))?;
			let register = name.parse()?;
			let value = parse_u64(value)
				.map_err(|source| ParseRegisterSeedError::InvalidValue { register, source })?;
			seed.set(register, value);
		}
		Ok(seed)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Output {
	#[default]
	StdIo,
	File(PathBuf),
	Buffer,
	None,
}

impl FromStr for Output {
	type Err = Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"none" | "None" => Ok(Self::None),
			"-" | "stdout" => Ok(Self::StdIo),
			p => Ok(Self::File(p.into())),
		}
	}
}

/// What the dispatch loop does with an exit reason it has no handler for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownExitPolicy {
	/// Stop the guest with an error.
	#[default]
	Fail,
	/// Log the exit and resume the guest.
	Resume,
}

#[derive(Error, Debug)]
#[error("Unknown exit policy `{0}` (expected `fail` or `resume`)")]
pub struct ParseUnknownExitPolicyError(String);

impl FromStr for UnknownExitPolicy {
	type Err = ParseUnknownExitPolicyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"fail" => Ok(Self::Fail),
			"resume" => Ok(Self::Resume),
			_ => Err(ParseUnknownExitPolicyError(s.to_string())),
		}
	}
}

impl fmt::Display for UnknownExitPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Fail => f.write_str("fail"),
			Self::Resume => f.write_str("resume"),
		}
	}
}
