//! A complete single-vCPU machine.

use crate::{
    config::MachineConfig,
    dispatch::{ExitDispatcher, ExitSummary},
    error::{HypervisorError, Result},
    memory::{GuestAddress, GuestMemory, MemoryRegion},
    traits::IoHandler,
    types::{PlatformCapabilities, Registers},
};

use super::hypervisor::KvmHypervisor;
use super::vcpu::KvmVcpu;
use super::vm::KvmVm;

/// Memory slot used for guest RAM.
pub const RAM_SLOT: u32 = 0;

/// vCPU ID of the boot processor.
pub const BOOT_VCPU_ID: u32 = 0;

/// One VM with one RAM region and one vCPU, set up from a [`MachineConfig`].
///
/// Teardown follows field order: the vCPU (run area, then fd), then the VM
/// (fd, then guest RAM), then the system handle.
pub struct Machine {
    vcpu: KvmVcpu,
    vm: KvmVm,
    hypervisor: KvmHypervisor,
}

impl Machine {
    /// Builds a machine ready to run.
    ///
    /// The configuration is validated before `/dev/kvm` is opened. Any
    /// resource acquired before a later step fails is released on return.
    pub fn new(config: &MachineConfig) -> Result<Self> {
        config.validate()?;

        let hypervisor = KvmHypervisor::negotiate_with(&config.device_path)?;
        let mut vm = hypervisor.create_vm()?;

        let entry = config.entry_point as usize;
        let mut ram = GuestMemory::allocate(config.memory_size)?;
        ram.load(&config.program, entry)?;

        let guest_addr = GuestAddress::new(config.guest_addr);
        vm.register_memory_region(MemoryRegion::new(RAM_SLOT, guest_addr, ram))?;

        let mut vcpu = vm.create_vcpu(BOOT_VCPU_ID)?;
        vcpu.initialize_state(
            config.guest_addr + config.entry_point,
            config.guest_addr + config.stack_top(),
        )?;

        tracing::info!(
            "Machine ready: {} bytes of RAM at {}, {}-byte program at {:#x}",
            config.memory_size,
            guest_addr,
            config.program.len(),
            config.entry_point
        );

        Ok(Self {
            vcpu,
            vm,
            hypervisor,
        })
    }

    /// Runs the guest until it halts, shuts down or fails.
    ///
    /// Each call starts a fresh dispatch loop from wherever the vCPU stopped.
    pub fn run<H: IoHandler>(&mut self, handler: H) -> Result<ExitSummary> {
        let mut dispatcher = ExitDispatcher::new(handler);
        dispatcher.run(&mut self.vcpu)
    }

    /// Returns the negotiated capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &PlatformCapabilities {
        self.hypervisor.capabilities()
    }

    /// Returns the VM.
    #[must_use]
    pub fn vm(&self) -> &KvmVm {
        &self.vm
    }

    /// Returns the vCPU.
    #[must_use]
    pub fn vcpu(&self) -> &KvmVcpu {
        &self.vcpu
    }

    /// Reads the vCPU's current registers.
    pub fn registers(&self) -> Result<Registers> {
        self.vcpu.registers()
    }

    /// Reads `len` bytes of guest RAM starting at RAM offset `offset`.
    pub fn read_ram(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        match self.vm.memory().get(RAM_SLOT) {
            Some(region) => region.memory().read(offset, len),
            None => Err(HypervisorError::InvalidState {
                expected: "RAM registered".to_string(),
                actual: "no RAM".to_string(),
            }),
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        tracing::debug!("Tearing down machine (VM {})", self.vm.id());
    }
}
