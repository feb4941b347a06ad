//! Common types used across the crate.

/// Platform capabilities reported by KVM at negotiation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// KVM API version (always 12 once negotiation succeeded).
    pub api_version: i32,
    /// Maximum number of vCPUs per VM.
    pub max_vcpus: u32,
    /// Number of user memory slots per VM.
    pub nr_memslots: u32,
    /// Size of the per-vCPU run area mapping.
    pub vcpu_mmap_size: usize,
}

/// The subset of general purpose registers this harness sets up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    /// Instruction pointer.
    pub rip: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Flags register.
    pub rflags: u64,
}

/// Reason for vCPU exit, decoded from the run area after `KVM_RUN` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed `hlt`.
    Halt,
    /// Guest wrote to an I/O port.
    ///
    /// `data` holds `size * count` bytes; `count` is greater than one only
    /// for string instructions (`rep outsb` and friends).
    IoOut {
        port: u16,
        size: u8,
        count: u32,
        data: Vec<u8>,
    },
    /// Guest read from an I/O port and waits for `size * count` bytes.
    IoIn { port: u16, size: u8, count: u32 },
    /// The vCPU could not be entered.
    FailEntry {
        hardware_entry_failure_reason: u64,
        cpu: u32,
    },
    /// KVM hit an internal error while emulating.
    InternalError { suberror: u32, data: Vec<u64> },
    /// Guest triple-faulted or otherwise shut down.
    Shutdown,
    /// Exit reason this crate does not handle.
    Unknown(u32),
}

impl VcpuExit {
    /// Returns the KVM name of the exit reason.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Halt => "KVM_EXIT_HLT",
            Self::IoOut { .. } | Self::IoIn { .. } => "KVM_EXIT_IO",
            Self::FailEntry { .. } => "KVM_EXIT_FAIL_ENTRY",
            Self::InternalError { .. } => "KVM_EXIT_INTERNAL_ERROR",
            Self::Shutdown => "KVM_EXIT_SHUTDOWN",
            Self::Unknown(_) => "KVM_EXIT_UNKNOWN",
        }
    }
}
