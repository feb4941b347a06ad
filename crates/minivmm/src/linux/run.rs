//! The shared `kvm_run` area of a vCPU.

use std::ptr::{self, NonNull};

use crate::error::{HypervisorError, KvmError, Result};
use crate::types::VcpuExit;

use super::ffi::{
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO, KVM_EXIT_IO_IN,
    KVM_EXIT_IO_OUT, KVM_EXIT_SHUTDOWN, KvmResult, KvmRun, KvmRunIo,
};

/// Mapping of a vCPU's `kvm_run` structure.
///
/// The kernel writes exit information here before `KVM_RUN` returns, and
/// reads I/O-in data from here when the vCPU re-enters. The contents are
/// only meaningful between a successful run and the next one.
pub struct RunArea {
    run: NonNull<KvmRun>,
    size: usize,
}

// Safety: the mapping is owned by this value; access needs `&self`/`&mut self`.
unsafe impl Send for RunArea {}

impl RunArea {
    /// Smallest mapping this crate can decode.
    pub const MIN_SIZE: usize = std::mem::size_of::<KvmRun>();

    /// Validates the size reported by `KVM_GET_VCPU_MMAP_SIZE`.
    ///
    /// A smaller mapping means the kernel ABI does not match ours.
    pub fn check_size(reported: usize) -> Result<usize> {
        if reported < Self::MIN_SIZE {
            return Err(HypervisorError::ProtocolSizeError {
                reported,
                required: Self::MIN_SIZE,
            });
        }
        Ok(reported)
    }

    /// Maps `size` bytes of the vCPU file descriptor, shared.
    ///
    /// `size` must already have passed [`RunArea::check_size`].
    pub fn map(vcpu_fd: libc::c_int, size: usize) -> KvmResult<Self> {
        debug_assert!(size >= Self::MIN_SIZE);
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                vcpu_fd,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(KvmError::last_os_error());
        }

        let run = NonNull::new(addr.cast::<KvmRun>()).ok_or_else(|| KvmError {
            errno: -1,
            message: "mmap returned a null mapping".to_string(),
        })?;

        Ok(Self { run, size })
    }

    /// Returns the mapping size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the host address of the mapping.
    #[must_use]
    pub fn host_address(&self) -> *mut u8 {
        self.run.as_ptr().cast()
    }

    /// Reads the exit reason of the last run.
    #[must_use]
    pub fn exit_reason(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.run.as_ptr()).exit_reason).read_volatile() }
    }

    fn io(&self) -> KvmRunIo {
        unsafe { ptr::addr_of!((*self.run.as_ptr()).exit_data.io).read_volatile() }
    }

    /// Returns the byte range of the I/O payload within the mapping.
    fn io_payload(&self, io: &KvmRunIo) -> Result<(usize, usize)> {
        let len = usize::from(io.size) * io.count as usize;
        let start = usize::try_from(io.data_offset).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if start >= Self::MIN_SIZE && end <= self.size => Ok((start, len)),
            _ => Err(HypervisorError::MalformedExit(format!(
                "I/O payload of {} bytes at offset {:#x} is outside the {}-byte run area",
                len, io.data_offset, self.size
            ))),
        }
    }

    /// Decodes the exit of the last run.
    pub fn decode_exit(&self) -> Result<VcpuExit> {
        let reason = self.exit_reason();
        let base = self.run.as_ptr();

        let exit = match reason {
            KVM_EXIT_HLT => VcpuExit::Halt,

            KVM_EXIT_IO => {
                let io = self.io();
                match io.direction {
                    KVM_EXIT_IO_OUT => {
                        let (start, len) = self.io_payload(&io)?;
                        let mut data = vec![0u8; len];
                        unsafe {
                            ptr::copy_nonoverlapping(
                                base.cast::<u8>().add(start),
                                data.as_mut_ptr(),
                                len,
                            );
                        }
                        VcpuExit::IoOut {
                            port: io.port,
                            size: io.size,
                            count: io.count,
                            data,
                        }
                    }
                    KVM_EXIT_IO_IN => {
                        self.io_payload(&io)?;
                        VcpuExit::IoIn {
                            port: io.port,
                            size: io.size,
                            count: io.count,
                        }
                    }
                    other => {
                        return Err(HypervisorError::MalformedExit(format!(
                            "unknown I/O direction {other}"
                        )));
                    }
                }
            }

            KVM_EXIT_FAIL_ENTRY => {
                let fail = unsafe { ptr::addr_of!((*base).exit_data.fail_entry).read_volatile() };
                VcpuExit::FailEntry {
                    hardware_entry_failure_reason: fail.hardware_entry_failure_reason,
                    cpu: fail.cpu,
                }
            }

            KVM_EXIT_INTERNAL_ERROR => {
                let internal = unsafe { ptr::addr_of!((*base).exit_data.internal).read_volatile() };
                let ndata = (internal.ndata as usize).min(internal.data.len());
                VcpuExit::InternalError {
                    suberror: internal.suberror,
                    data: internal.data[..ndata].to_vec(),
                }
            }

            KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown,

            other => VcpuExit::Unknown(other),
        };

        Ok(exit)
    }

    /// Writes the data for a pending I/O-in exit.
    pub fn complete_io_in(&mut self, data: &[u8]) -> Result<()> {
        if self.exit_reason() != KVM_EXIT_IO || self.io().direction != KVM_EXIT_IO_IN {
            return Err(HypervisorError::InvalidState {
                expected: "pending KVM_EXIT_IO read".to_string(),
                actual: format!("exit reason {}", self.exit_reason()),
            });
        }

        let io = self.io();
        let (start, len) = self.io_payload(&io)?;
        if data.len() != len {
            return Err(HypervisorError::MalformedExit(format!(
                "I/O read expects {} bytes, got {}",
                len,
                data.len()
            )));
        }

        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.run.as_ptr().cast::<u8>().add(start),
                len,
            );
        }
        Ok(())
    }
}

impl Drop for RunArea {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.run.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {}-byte run area", self.size);
    }
}
