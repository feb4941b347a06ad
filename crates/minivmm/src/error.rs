//! Error types for the harness.

use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Errors that can occur while setting up or running the VM.
///
/// Every variant is fatal. Setup errors are reported before any guest
/// instruction executes; runtime errors end the run loop in the `Failed`
/// state. See [`HypervisorError::class`].
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The virtualization device could not be opened.
    #[error("failed to open {path}: {source}")]
    SubsystemUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The subsystem speaks a different API version.
    #[error("unsupported KVM API version: {actual} (expected {expected})")]
    VersionMismatch { expected: i32, actual: i32 },

    /// A required capability is not reported by the subsystem.
    #[error("required extension {name} not available")]
    MissingCapability { name: &'static str, cap: u32 },

    /// The subsystem failed to answer a capability query.
    #[error("failed to query extension {name}: {source}")]
    CapabilityCheckFailed {
        name: &'static str,
        cap: u32,
        #[source]
        source: KvmError,
    },

    /// Failed to create the virtual machine.
    #[error("failed to create VM: {0}")]
    VmCreationFailed(#[source] KvmError),

    /// Guest memory could not be mapped.
    #[error("failed to allocate {size} bytes of guest memory: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// A copy into or out of guest memory falls outside the buffer.
    #[error("access of {len} bytes at offset {offset:#x} exceeds region size {size:#x}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The memory slot is already registered.
    #[error("memory slot {0} is already in use")]
    SlotInUse(u32),

    /// The guest physical range overlaps an existing region.
    #[error("region [{start:#x}, {end:#x}) overlaps slot {existing}")]
    RegionOverlap { start: u64, end: u64, existing: u32 },

    /// The subsystem rejected a memory region.
    #[error("failed to register memory slot {slot}: {source}")]
    MemoryRegistrationFailed {
        slot: u32,
        #[source]
        source: KvmError,
    },

    /// Failed to create a vCPU.
    #[error("failed to create vCPU {id}: {source}")]
    VcpuCreationFailed {
        id: u32,
        #[source]
        source: KvmError,
    },

    /// The run area could not be sized or mapped.
    #[error("failed to map run area of vCPU {id}: {source}")]
    MmapFailed {
        id: u32,
        #[source]
        source: KvmError,
    },

    /// The subsystem reported a run area smaller than `kvm_run`.
    #[error("KVM_GET_VCPU_MMAP_SIZE unexpectedly small: {reported} < {required}")]
    ProtocolSizeError { reported: usize, required: usize },

    /// A register read ioctl failed.
    #[error("failed to read {register} of vCPU {id}: {source}")]
    RegisterReadFailed {
        id: u32,
        register: &'static str,
        #[source]
        source: KvmError,
    },

    /// A register write ioctl failed.
    #[error("failed to write {register} of vCPU {id}: {source}")]
    RegisterWriteFailed {
        id: u32,
        register: &'static str,
        #[source]
        source: KvmError,
    },

    /// The vCPU was run before its registers were initialized.
    #[error("vCPU {0} has not been initialized")]
    VcpuNotInitialized(u32),

    /// The run loop is not in the state the operation requires.
    #[error("run loop state error: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// KVM_RUN returned an error.
    #[error("KVM_RUN failed on vCPU {id}: {source}")]
    RunFailed {
        id: u32,
        #[source]
        source: KvmError,
    },

    /// The vCPU could not be entered.
    #[error("KVM_EXIT_FAIL_ENTRY: hardware_entry_failure_reason = {hardware_entry_failure_reason:#x} (cpu {cpu})")]
    FailEntry {
        hardware_entry_failure_reason: u64,
        cpu: u32,
    },

    /// KVM reported an internal error.
    #[error("KVM_EXIT_INTERNAL_ERROR: suberror = {suberror:#x}")]
    InternalError { suberror: u32 },

    /// The exit reason is not handled by the dispatcher.
    #[error("unhandled exit reason ({reason:#x})")]
    UnhandledExit { reason: u32 },

    /// The run area describes a payload outside of the mapping.
    #[error("malformed exit data: {0}")]
    MalformedExit(String),
}

/// Raw failure of a single ioctl or mmap, with the errno it produced.
#[derive(Debug, Clone, Error)]
#[error("KVM error ({errno}): {message}")]
pub struct KvmError {
    pub errno: i32,
    pub message: String,
}

impl KvmError {
    /// Captures `errno` from the last failed system call.
    pub fn last_os_error() -> Self {
        Self::from(std::io::Error::last_os_error())
    }
}

impl From<std::io::Error> for KvmError {
    fn from(e: std::io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(-1),
            message: e.to_string(),
        }
    }
}

/// Coarse classification of [`HypervisorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The host cannot support the VM; no guest code has run.
    Setup,
    /// Guest execution cannot continue.
    Runtime,
}

impl HypervisorError {
    /// Returns whether this error happened during setup or while running.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::RunFailed { .. }
            | Self::FailEntry { .. }
            | Self::InternalError { .. }
            | Self::UnhandledExit { .. }
            | Self::MalformedExit(_)
            | Self::VcpuNotInitialized(_)
            | Self::InvalidState { .. } => ErrorClass::Runtime,
            _ => ErrorClass::Setup,
        }
    }

    /// Returns whether this error is a VM exit that ended the run, as opposed
    /// to a failure of the host side.
    #[must_use]
    pub const fn is_fatal_exit(&self) -> bool {
        matches!(
            self,
            Self::FailEntry { .. } | Self::InternalError { .. } | Self::UnhandledExit { .. }
        )
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        let err = HypervisorError::VersionMismatch {
            expected: 12,
            actual: 11,
        };
        assert_eq!(err.class(), ErrorClass::Setup);

        let err = HypervisorError::ProtocolSizeError {
            reported: 64,
            required: 288,
        };
        assert_eq!(err.class(), ErrorClass::Setup);

        let err = HypervisorError::UnhandledExit { reason: 0x1234 };
        assert_eq!(err.class(), ErrorClass::Runtime);

        let err = HypervisorError::FailEntry {
            hardware_entry_failure_reason: 0x80000021,
            cpu: 0,
        };
        assert_eq!(err.class(), ErrorClass::Runtime);
    }

    #[test]
    fn test_fatal_exits() {
        let err = HypervisorError::FailEntry {
            hardware_entry_failure_reason: 0x21,
            cpu: 0,
        };
        assert!(err.is_fatal_exit());
        assert_eq!(
            err.to_string(),
            "KVM_EXIT_FAIL_ENTRY: hardware_entry_failure_reason = 0x21 (cpu 0)"
        );

        let err = HypervisorError::InternalError { suberror: 1 };
        assert!(err.is_fatal_exit());
        assert_eq!(err.to_string(), "KVM_EXIT_INTERNAL_ERROR: suberror = 0x1");

        assert!(HypervisorError::UnhandledExit { reason: 6 }.is_fatal_exit());

        // Runtime, but not reported by the guest.
        assert!(!HypervisorError::VcpuNotInitialized(0).is_fatal_exit());
        assert!(!HypervisorError::RunFailed {
            id: 0,
            source: KvmError {
                errno: libc::EINTR,
                message: "Interrupted system call".to_string(),
            },
        }
        .is_fatal_exit());
    }

    #[test]
    fn test_error_messages() {
        let err = HypervisorError::UnhandledExit { reason: 0x1a };
        assert_eq!(err.to_string(), "unhandled exit reason (0x1a)");

        let err = HypervisorError::OutOfBounds {
            offset: 0xffe,
            len: 4,
            size: 0x1000,
        };
        assert!(err.to_string().contains("0xffe"));

        let err = HypervisorError::MissingCapability {
            name: "KVM_CAP_USER_MEMORY",
            cap: 3,
        };
        assert_eq!(
            err.to_string(),
            "required extension KVM_CAP_USER_MEMORY not available"
        );
    }
}
