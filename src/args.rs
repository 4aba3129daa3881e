use std::path::PathBuf;

use clap::Parser;

use crate::{
	consts::*,
	params::{GuestMemorySize, Output, Params, RegisterSeed, UnknownExitPolicy, parse_u64},
};

fn parse_segment(s: &str) -> Result<u16, String> {
	let value = parse_u64(s).map_err(|e| e.to_string())?;
	u16::try_from(value).map_err(|_| format!("segment {value:#x} exceeds 16 bits"))
}

/// Used by clap to derive CLI parameters for kvmini.
#[derive(Parser, Debug)]
#[clap(version, author, about)]
pub struct Args {
	#[clap(flatten, next_help_heading = "Host OPTIONS")]
	pub host_args: HostArgs,

	#[clap(flatten, next_help_heading = "Memory OPTIONS")]
	pub memory_args: MemoryArgs,

	#[clap(flatten, next_help_heading = "Cpu OPTIONS")]
	pub cpu_args: CpuArgs,

	#[clap(flatten, next_help_heading = "Guest OPTIONS")]
	pub guest_args: GuestArgs,
}

/// Arguments for the host side of kvmini.
#[derive(Parser, Debug)]
pub struct HostArgs {
	/// Hypervisor device
	#[clap(long, default_value = KVM_DEVICE, env = "KVMINI_DEVICE")]
	pub device: PathBuf,

	/// Port I/O output redirection.
	///
	/// None discards all output, Omit for stdout
	#[clap(short, long, value_name = "FILE", env = "KVMINI_OUTPUT")]
	pub output: Option<Output>,

	/// Display statistics after the execution
	#[clap(long)]
	pub stats: bool,

	/// Dump the vCPU registers if the guest fails
	#[clap(short, long)]
	pub verbose: bool,
}

#[derive(Parser, Debug)]
pub struct MemoryArgs {
	/// Guest RAM size
	#[clap(short = 'm', long, default_value_t, env = "KVMINI_MEMORY_SIZE")]
	pub memory_size: GuestMemorySize,
}

/// Arguments for the initial state of the vCPU.
#[derive(Parser, Debug)]
pub struct CpuArgs {
	/// Real-mode segment loaded into cs, ss, ds, es, fs and gs
	#[clap(long, default_value = "0x0", value_parser = parse_segment, env = "KVMINI_CODE_SEGMENT")]
	pub code_segment: u16,

	/// Initial instruction pointer, relative to the code segment
	#[clap(long, default_value = "0x0", value_parser = parse_u64, env = "KVMINI_ENTRY_POINT")]
	pub entry_point: u64,

	/// Initial RFLAGS (bit 1 is always set)
	#[clap(long, default_value = "0x2", value_parser = parse_u64, env = "KVMINI_FLAGS")]
	pub flags: u64,

	/// Initial general purpose registers
	///
	/// A list of `register=value` pairs, separated by commas or spaces.
	/// Registers that are not listed start out as zero.
	///
	/// # Examples
	///
	/// * `--registers "rax=2 rbx=2"`
	///
	/// * `--registers rcx=0x10,rsp=0x8000`
	#[clap(long, default_value_t, env = "KVMINI_REGISTERS")]
	pub registers: RegisterSeed,

	/// Handling of unknown exits (fail, resume)
	#[clap(long, default_value_t, env = "KVMINI_ON_UNKNOWN_EXIT")]
	pub on_unknown_exit: UnknownExitPolicy,
}

/// Arguments for the guest program.
#[derive(Parser, Debug)]
pub struct GuestArgs {
	/// The flat binary to execute
	#[clap(long, default_value = DEFAULT_GUEST_IMAGE, env = "KVMINI_IMAGE")]
	pub image: PathBuf,
}

impl From<Args> for Params {
	fn from(args: Args) -> Self {
		let Args {
			host_args:
				HostArgs {
					device,
					output,
					stats,
					verbose,
				},
			memory_args: MemoryArgs { memory_size },
			cpu_args:
				CpuArgs {
					code_segment,
					entry_point,
					flags,
					registers,
					on_unknown_exit,
				},
			guest_args: GuestArgs { image: _ },
		} = args;
		Self {
			memory_size,
			code_segment,
			entry_point,
			rflags: flags,
			register_seed: registers,
			device,
			output: output.unwrap_or_default(),
			stats,
			unknown_exit: on_unknown_exit,
			verbose,
		}
	}
}
