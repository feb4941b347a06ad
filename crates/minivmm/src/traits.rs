//! Core traits at the seam between the run loop and the backend.
//!
//! The exit dispatcher only talks to a vCPU through [`Vcpu`], so the loop
//! can be driven by KVM in production and by a scripted vCPU in tests.

use crate::{error::HypervisorError, types::VcpuExit};

/// Virtual CPU trait for executing guest code.
pub trait Vcpu {
    /// Returns the vCPU ID.
    fn id(&self) -> u32;

    /// Runs the vCPU until a VM exit occurs.
    ///
    /// Blocks the calling thread for as long as the guest executes.
    ///
    /// # Errors
    ///
    /// Returns an error if the run request itself fails or the exit data
    /// cannot be decoded. Guest-visible state is unreliable afterwards.
    fn run(&mut self) -> Result<VcpuExit, HypervisorError>;

    /// Supplies the data for the pending [`VcpuExit::IoIn`].
    ///
    /// Must be called before the next [`Vcpu::run`]; the guest's `in`
    /// instruction completes with these bytes when it resumes.
    ///
    /// # Errors
    ///
    /// Returns an error if no I/O read is pending or `data` has the wrong
    /// length.
    fn complete_io_in(&mut self, data: &[u8]) -> Result<(), HypervisorError>;
}

/// Host-side handler for port I/O exits.
pub trait IoHandler {
    /// Handles a byte the guest wrote to `port`.
    fn io_write(&mut self, port: u16, value: u8);

    /// Fills `data` with the bytes the guest reads from `port`.
    ///
    /// The default answers every read with zeros.
    fn io_read(&mut self, port: u16, data: &mut [u8]) {
        tracing::warn!(
            "No device on port {:#x}, answering {}-byte read with zeros",
            port,
            data.len()
        );
        data.fill(0);
    }
}

impl<H: IoHandler + ?Sized> IoHandler for &mut H {
    fn io_write(&mut self, port: u16, value: u8) {
        (**self).io_write(port, value);
    }

    fn io_read(&mut self, port: u16, data: &mut [u8]) {
        (**self).io_read(port, data);
    }
}
