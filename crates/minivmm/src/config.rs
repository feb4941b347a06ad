//! Machine configuration types.

use crate::error::{HypervisorError, Result};
use crate::guest;
use crate::memory::{GuestAddress, PAGE_SIZE};

/// Default path of the KVM device.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/kvm";

/// First linear address a flat real-mode guest cannot execute from.
///
/// CS is set up with base 0 and the instruction pointer is 16 bits wide.
pub const REAL_MODE_LIMIT: u64 = 0x1_0000;

/// Machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Path to the KVM device.
    pub device_path: String,
    /// Guest RAM size in bytes.
    pub memory_size: usize,
    /// Guest physical address where RAM starts.
    pub guest_addr: u64,
    /// Initial instruction pointer, as an offset into guest RAM.
    pub entry_point: u64,
    /// Initial stack pointer. Defaults to the top of guest RAM.
    pub stack_top: Option<u64>,
    /// Guest code, loaded at `entry_point`.
    pub program: Vec<u8>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            memory_size: PAGE_SIZE, // 4KB
            guest_addr: 0,
            entry_point: 0,
            stack_top: None,
            program: guest::PMIO_DEMO.to_vec(),
        }
    }
}

impl MachineConfig {
    /// Creates a new builder for machine configuration.
    #[must_use]
    pub fn builder() -> MachineConfigBuilder {
        MachineConfigBuilder::default()
    }

    /// Returns the initial stack pointer.
    #[must_use]
    pub fn stack_top(&self) -> u64 {
        self.stack_top.unwrap_or(self.memory_size as u64)
    }

    /// Checks the configuration before any privileged operation runs.
    pub fn validate(&self) -> Result<()> {
        if self.memory_size == 0 || self.memory_size % PAGE_SIZE != 0 {
            return Err(HypervisorError::invalid_config(format!(
                "memory size {} is not a non-zero multiple of {}",
                self.memory_size, PAGE_SIZE
            )));
        }

        if !GuestAddress::new(self.guest_addr).is_aligned(PAGE_SIZE as u64) {
            return Err(HypervisorError::invalid_config(format!(
                "guest address {:#x} is not page aligned",
                self.guest_addr
            )));
        }

        let entry = usize::try_from(self.entry_point).unwrap_or(usize::MAX);
        if entry >= self.memory_size {
            return Err(HypervisorError::invalid_config(format!(
                "entry point {:#x} is outside guest RAM ({:#x} bytes)",
                self.entry_point, self.memory_size
            )));
        }

        if self.program.is_empty() {
            return Err(HypervisorError::invalid_config("guest program is empty"));
        }

        if entry.saturating_add(self.program.len()) > self.memory_size {
            return Err(HypervisorError::invalid_config(format!(
                "guest program of {} bytes does not fit at {:#x}",
                self.program.len(),
                self.entry_point
            )));
        }

        // The whole program must be reachable through a 16-bit IP.
        let program_end = self
            .guest_addr
            .checked_add(self.entry_point)
            .and_then(|start| start.checked_add(self.program.len() as u64));
        if program_end.map_or(true, |end| end > REAL_MODE_LIMIT) {
            return Err(HypervisorError::invalid_config(format!(
                "program at {:#x} + {:#x} is beyond the real-mode limit {:#x}",
                self.guest_addr, self.entry_point, REAL_MODE_LIMIT
            )));
        }

        if self.stack_top() > self.memory_size as u64 {
            return Err(HypervisorError::invalid_config(format!(
                "stack top {:#x} is above guest RAM",
                self.stack_top()
            )));
        }

        Ok(())
    }
}

/// Builder for [`MachineConfig`].
#[derive(Debug, Default)]
pub struct MachineConfigBuilder {
    config: MachineConfig,
}

impl MachineConfigBuilder {
    /// Sets the KVM device path.
    #[must_use]
    pub fn device_path(mut self, path: impl Into<String>) -> Self {
        self.config.device_path = path.into();
        self
    }

    /// Sets the guest RAM size in bytes.
    #[must_use]
    pub fn memory_size(mut self, size: usize) -> Self {
        self.config.memory_size = size;
        self
    }

    /// Sets the guest physical base of RAM.
    #[must_use]
    pub fn guest_addr(mut self, addr: u64) -> Self {
        self.config.guest_addr = addr;
        self
    }

    /// Sets the entry point offset.
    #[must_use]
    pub fn entry_point(mut self, entry: u64) -> Self {
        self.config.entry_point = entry;
        self
    }

    /// Sets the initial stack pointer.
    #[must_use]
    pub fn stack_top(mut self, top: u64) -> Self {
        self.config.stack_top = Some(top);
        self
    }

    /// Sets the guest code.
    #[must_use]
    pub fn program(mut self, program: impl Into<Vec<u8>>) -> Self {
        self.config.program = program.into();
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> MachineConfig {
        self.config
    }
}
