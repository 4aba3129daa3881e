pub const PAGE_SIZE: usize = 0x1000;

/// Guest RAM of the reference configuration (64 KiB).
pub const DEFAULT_GUEST_SIZE: usize = 0x10000;
/// Guest-physical address the RAM is installed at.
pub const RAM_START: u64 = 0x0;
/// Memory slot the RAM is installed in.
pub const RAM_SLOT: u32 = 0;

/// Real-mode segment all segment registers are loaded with.
pub const CODE_START: u16 = 0x0000;
pub const DEFAULT_ENTRY_POINT: u64 = 0x0;
/// Bit 1 of RFLAGS is reserved and always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;
pub const DEFAULT_RFLAGS: u64 = RFLAGS_RESERVED;

pub const DEFAULT_GUEST_IMAGE: &str = "guest";
pub const KVM_DEVICE: &str = "/dev/kvm";

/// The only vCPU of the guest.
pub const BOOT_CPU_ID: u32 = 0;
