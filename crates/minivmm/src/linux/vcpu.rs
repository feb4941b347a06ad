//! Virtual CPU implementation for Linux KVM.

use crate::{
    error::{HypervisorError, Result},
    traits::Vcpu,
    types::{Registers, VcpuExit},
};

use super::ffi::{KvmRegs, KvmVcpuFd};
use super::run::RunArea;

/// Bit 1 of RFLAGS is reserved and must always be set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// Virtual CPU implementation for Linux KVM.
///
/// A vCPU refuses to run until [`KvmVcpu::initialize_state`] has written
/// every register it sets up.
pub struct KvmVcpu {
    /// vCPU ID.
    id: u32,
    /// Shared run area. Unmapped before the fd is closed.
    run: RunArea,
    /// KVM vCPU file descriptor.
    vcpu_fd: KvmVcpuFd,
    /// Register state written by `initialize_state`.
    initial: Option<Registers>,
}

impl KvmVcpu {
    pub(crate) fn new(id: u32, vcpu_fd: KvmVcpuFd, run: RunArea) -> Self {
        Self {
            id,
            run,
            vcpu_fd,
            initial: None,
        }
    }

    /// Sets up flat real-mode state: CS base and selector zero, so linear
    /// addresses equal offsets, and execution starts at `entry_point` with
    /// the stack at `stack_top`.
    pub fn initialize_state(&mut self, entry_point: u64, stack_top: u64) -> Result<()> {
        self.initial = None;

        let mut sregs =
            self.vcpu_fd
                .get_sregs()
                .map_err(|source| HypervisorError::RegisterReadFailed {
                    id: self.id,
                    register: "sregs",
                    source,
                })?;

        sregs.cs.base = 0;
        sregs.cs.selector = 0;

        self.vcpu_fd
            .set_sregs(&sregs)
            .map_err(|source| HypervisorError::RegisterWriteFailed {
                id: self.id,
                register: "sregs",
                source,
            })?;

        let regs = KvmRegs {
            rsp: stack_top,
            rip: entry_point,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };

        self.vcpu_fd
            .set_regs(&regs)
            .map_err(|source| HypervisorError::RegisterWriteFailed {
                id: self.id,
                register: "regs",
                source,
            })?;

        let initial = Registers {
            rip: entry_point,
            rsp: stack_top,
            rflags: RFLAGS_RESERVED,
        };
        tracing::debug!(
            "vCPU {} initialized: rip={:#x}, rsp={:#x}, rflags={:#x}",
            self.id,
            initial.rip,
            initial.rsp,
            initial.rflags
        );
        self.initial = Some(initial);

        Ok(())
    }

    /// Returns the registers written at initialization, if it completed.
    #[must_use]
    pub fn initial_registers(&self) -> Option<Registers> {
        self.initial
    }

    /// Reads the current instruction pointer, stack pointer and flags.
    pub fn registers(&self) -> Result<Registers> {
        let regs = self
            .vcpu_fd
            .get_regs()
            .map_err(|source| HypervisorError::RegisterReadFailed {
                id: self.id,
                register: "regs",
                source,
            })?;

        Ok(Registers {
            rip: regs.rip,
            rsp: regs.rsp,
            rflags: regs.rflags,
        })
    }

    /// Returns the shared run area.
    #[must_use]
    pub fn run_area(&self) -> &RunArea {
        &self.run
    }
}

impl Vcpu for KvmVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn run(&mut self) -> Result<VcpuExit> {
        if self.initial.is_none() {
            return Err(HypervisorError::VcpuNotInitialized(self.id));
        }

        self.vcpu_fd
            .run()
            .map_err(|source| HypervisorError::RunFailed {
                id: self.id,
                source,
            })?;

        self.run.decode_exit()
    }

    fn complete_io_in(&mut self, data: &[u8]) -> Result<()> {
        self.run.complete_io_in(data)
    }
}

impl Drop for KvmVcpu {
    fn drop(&mut self) {
        tracing::debug!("Dropped vCPU {}", self.id);
    }
}
