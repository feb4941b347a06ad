//! Virtual machine implementation for Linux KVM.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{
    error::{HypervisorError, KvmError, Result},
    memory::{MemoryMap, MemoryRegion},
};

use super::ffi::{KVM_MEM_READONLY, KvmSystem, KvmUserspaceMemoryRegion, KvmVmFd};
use super::run::RunArea;
use super::vcpu::KvmVcpu;

/// Global VM ID counter.
static VM_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Virtual machine implementation for Linux KVM.
///
/// Owns the VM file descriptor and every registered memory region. Fields
/// drop in declaration order: the VM fd is closed before the guest memory
/// behind it is unmapped.
pub struct KvmVm {
    /// Unique VM ID.
    id: u64,
    /// KVM VM file descriptor.
    vm_fd: KvmVmFd,
    /// Registered guest memory.
    memory: MemoryMap,
    /// Created vCPU IDs.
    vcpus: Vec<u32>,
    /// KVM system handle; the run area size is queried from it.
    kvm: Arc<KvmSystem>,
}

impl KvmVm {
    /// Creates a new KVM VM with no memory and no vCPUs.
    pub(crate) fn new(kvm: Arc<KvmSystem>) -> Result<Self> {
        let id = VM_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

        let vm_fd = kvm.create_vm().map_err(HypervisorError::VmCreationFailed)?;

        tracing::info!("Created KVM VM {}", id);

        Ok(Self {
            id,
            vm_fd,
            memory: MemoryMap::new(),
            vcpus: Vec::new(),
            kvm,
        })
    }

    /// Returns the VM ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the registered memory.
    #[must_use]
    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// Registers `region` with the VM and takes ownership of it.
    ///
    /// Slot and range conflicts are rejected before KVM is asked. From this
    /// point on the guest can access the region's buffer directly.
    pub fn register_memory_region(&mut self, region: MemoryRegion) -> Result<()> {
        self.memory.check(&region)?;

        let mut flags = 0u32;
        if region.read_only {
            flags |= KVM_MEM_READONLY;
        }

        let descriptor = KvmUserspaceMemoryRegion {
            slot: region.slot,
            flags,
            guest_phys_addr: region.guest_addr.raw(),
            memory_size: region.size(),
            userspace_addr: region.memory().host_address() as u64,
        };

        // Safety: the region moves into `self.memory`, which is dropped
        // after `self.vm_fd`.
        unsafe { self.vm_fd.set_user_memory_region(&descriptor) }.map_err(|source| {
            HypervisorError::MemoryRegistrationFailed {
                slot: region.slot,
                source,
            }
        })?;

        tracing::debug!(
            "VM {}: registered slot {} at {}: {} bytes, read_only={}",
            self.id,
            region.slot,
            region.guest_addr,
            region.size(),
            region.read_only
        );

        self.memory.insert(region);
        Ok(())
    }

    /// Creates vCPU `id` and maps its run area.
    ///
    /// The run area size comes from the system handle and is validated
    /// before anything is mapped.
    pub fn create_vcpu(&mut self, id: u32) -> Result<KvmVcpu> {
        if self.vcpus.contains(&id) {
            return Err(HypervisorError::VcpuCreationFailed {
                id,
                source: KvmError {
                    errno: libc::EEXIST,
                    message: "vCPU already created".to_string(),
                },
            });
        }

        let vcpu_fd = self
            .vm_fd
            .create_vcpu(id)
            .map_err(|source| HypervisorError::VcpuCreationFailed { id, source })?;

        let reported = self
            .kvm
            .vcpu_mmap_size()
            .map_err(|source| HypervisorError::MmapFailed { id, source })?;
        let mmap_size = RunArea::check_size(reported)?;

        let run = RunArea::map(vcpu_fd.as_raw_fd(), mmap_size)
            .map_err(|source| HypervisorError::MmapFailed { id, source })?;

        self.vcpus.push(id);

        tracing::debug!(
            "VM {}: created vCPU {} with {}-byte run area at {:p}",
            self.id,
            id,
            mmap_size,
            run.host_address()
        );

        Ok(KvmVcpu::new(id, vcpu_fd, run))
    }
}

impl Drop for KvmVm {
    fn drop(&mut self) {
        tracing::debug!("Dropped VM {}", self.id);
    }
}
