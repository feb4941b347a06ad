//! Capability negotiation with `/dev/kvm`.

use std::path::Path;
use std::sync::Arc;

use crate::{
    config::DEFAULT_DEVICE_PATH,
    error::{HypervisorError, Result},
    types::PlatformCapabilities,
};

use super::ffi::{
    KVM_API_VERSION, KVM_CAP_MAX_VCPUS, KVM_CAP_NR_MEMSLOTS, KVM_CAP_USER_MEMORY, KvmResult,
    KvmSystem,
};
use super::vm::KvmVm;

/// A negotiated handle to the KVM subsystem.
///
/// Construction succeeds only if the API version matches exactly and user
/// memory regions are supported, so every VM created from it can rely on
/// both.
///
/// # Example
///
/// ```no_run
/// use minivmm::linux::KvmHypervisor;
///
/// # fn main() -> minivmm::Result<()> {
/// let hypervisor = KvmHypervisor::negotiate()?;
/// println!("Max vCPUs: {}", hypervisor.capabilities().max_vcpus);
/// # Ok(())
/// # }
/// ```
pub struct KvmHypervisor {
    /// KVM system handle.
    kvm: Arc<KvmSystem>,
    /// Platform capabilities.
    capabilities: PlatformCapabilities,
}

impl KvmHypervisor {
    /// Negotiates with the default device, `/dev/kvm`.
    pub fn negotiate() -> Result<Self> {
        Self::negotiate_with(DEFAULT_DEVICE_PATH)
    }

    /// Opens the device at `path` and verifies it can host this crate's VM.
    ///
    /// # Errors
    ///
    /// - `SubsystemUnavailable` if the device cannot be opened
    /// - `VersionMismatch` if the API version is not 12
    /// - `MissingCapability` if `KVM_CAP_USER_MEMORY` is absent
    /// - `CapabilityCheckFailed` if the extension query itself fails
    pub fn negotiate_with(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let kvm = KvmSystem::open(path).map_err(|source| HypervisorError::SubsystemUnavailable {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!("Opened {}", path.display());

        // A failing ioctl here means the device is not KVM at all.
        let api_version = kvm.api_version().map_err(|e| HypervisorError::SubsystemUnavailable {
            path: path.display().to_string(),
            source: std::io::Error::from_raw_os_error(e.errno),
        })?;

        if api_version != KVM_API_VERSION {
            return Err(HypervisorError::VersionMismatch {
                expected: KVM_API_VERSION,
                actual: api_version,
            });
        }

        require_extension(
            "KVM_CAP_USER_MEMORY",
            KVM_CAP_USER_MEMORY,
            kvm.check_extension(KVM_CAP_USER_MEMORY),
        )?;

        let capabilities = Self::detect_capabilities(&kvm, api_version);

        tracing::info!(
            "KVM hypervisor initialized: api_version={}, max_vcpus={}, memslots={}",
            capabilities.api_version,
            capabilities.max_vcpus,
            capabilities.nr_memslots
        );

        Ok(Self {
            kvm: Arc::new(kvm),
            capabilities,
        })
    }

    /// Collects informational capabilities. None of these are required.
    fn detect_capabilities(kvm: &KvmSystem, api_version: i32) -> PlatformCapabilities {
        let max_vcpus = kvm.check_extension(KVM_CAP_MAX_VCPUS).unwrap_or(1).max(1) as u32;
        let nr_memslots = kvm.check_extension(KVM_CAP_NR_MEMSLOTS).unwrap_or(32).max(1) as u32;
        // Validated when a vCPU is created; 0 here just means unknown.
        let vcpu_mmap_size = kvm.vcpu_mmap_size().unwrap_or(0);

        PlatformCapabilities {
            api_version,
            max_vcpus,
            nr_memslots,
            vcpu_mmap_size,
        }
    }

    /// Returns the platform capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &PlatformCapabilities {
        &self.capabilities
    }

    /// Creates a new, empty VM.
    pub fn create_vm(&self) -> Result<KvmVm> {
        KvmVm::new(Arc::clone(&self.kvm))
    }
}

/// Turns the answer to `KVM_CHECK_EXTENSION` for a required capability
/// into an error unless it is positive.
fn require_extension(name: &'static str, cap: u32, reported: KvmResult<i32>) -> Result<()> {
    match reported {
        Ok(value) if value > 0 => Ok(()),
        Ok(_) => Err(HypervisorError::MissingCapability { name, cap }),
        Err(source) => Err(HypervisorError::CapabilityCheckFailed { name, cap, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KvmError;

    #[test]
    fn test_require_extension() {
        assert!(require_extension("KVM_CAP_USER_MEMORY", 3, Ok(1)).is_ok());

        assert!(matches!(
            require_extension("KVM_CAP_USER_MEMORY", 3, Ok(0)),
            Err(HypervisorError::MissingCapability { cap: 3, .. })
        ));
    }

    #[test]
    fn test_require_extension_keeps_errno() {
        let failure = KvmError {
            errno: libc::EBADF,
            message: "Bad file descriptor".to_string(),
        };

        let err = require_extension("KVM_CAP_USER_MEMORY", 3, Err(failure)).unwrap_err();
        match &err {
            HypervisorError::CapabilityCheckFailed { source, .. } => {
                assert_eq!(source.errno, libc::EBADF);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_missing_device() {
        let result = KvmHypervisor::negotiate_with("/nonexistent/kvm");
        assert!(matches!(
            result,
            Err(HypervisorError::SubsystemUnavailable { .. })
        ));
    }

    #[test]
    fn test_non_kvm_device() {
        // /dev/null opens fine but rejects every KVM ioctl.
        let result = KvmHypervisor::negotiate_with("/dev/null");
        assert!(matches!(
            result,
            Err(HypervisorError::SubsystemUnavailable { .. })
        ));
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_negotiate() {
        let hypervisor = KvmHypervisor::negotiate().unwrap();
        let caps = hypervisor.capabilities();
        assert_eq!(caps.api_version, 12);
        assert!(caps.max_vcpus >= 1);
        assert!(caps.vcpu_mmap_size >= 4096);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_create_vm() {
        let hypervisor = KvmHypervisor::negotiate().unwrap();
        let vm = hypervisor.create_vm();
        assert!(vm.is_ok());
    }
}
