//! FFI bindings for Linux KVM API.
//!
//! This module provides safe Rust wrappers around the KVM ioctl interface.
//! All ioctl commands and structure layouts follow `<linux/kvm.h>`.

#![allow(non_camel_case_types)]

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::error::KvmError;

// ============================================================================
// KVM ioctl Numbers
// ============================================================================

/// KVM magic number for ioctl encoding.
const KVMIO: u8 = 0xAE;

/// Macro to create KVM ioctl numbers.
macro_rules! kvm_io {
    ($nr:expr) => {
        nix::request_code_none!(KVMIO, $nr)
    };
}

macro_rules! kvm_ior {
    ($nr:expr, $ty:ty) => {
        nix::request_code_read!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

macro_rules! kvm_iow {
    ($nr:expr, $ty:ty) => {
        nix::request_code_write!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

// System ioctls
pub const KVM_GET_API_VERSION: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x00);
pub const KVM_CREATE_VM: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x01);
pub const KVM_CHECK_EXTENSION: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x04);

// VM ioctls
pub const KVM_SET_USER_MEMORY_REGION: nix::sys::ioctl::ioctl_num_type =
    kvm_iow!(0x46, KvmUserspaceMemoryRegion);
pub const KVM_CREATE_VCPU: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x41);

// vCPU ioctls
pub const KVM_RUN: nix::sys::ioctl::ioctl_num_type = kvm_io!(0x80);
pub const KVM_GET_REGS: nix::sys::ioctl::ioctl_num_type = kvm_ior!(0x81, KvmRegs);
pub const KVM_SET_REGS: nix::sys::ioctl::ioctl_num_type = kvm_iow!(0x82, KvmRegs);
pub const KVM_GET_SREGS: nix::sys::ioctl::ioctl_num_type = kvm_ior!(0x83, KvmSregs);
pub const KVM_SET_SREGS: nix::sys::ioctl::ioctl_num_type = kvm_iow!(0x84, KvmSregs);

/// The only API version this crate speaks. Stable since Linux 2.6.22.
pub const KVM_API_VERSION: i32 = 12;

// ============================================================================
// KVM Capability Constants
// ============================================================================

pub const KVM_CAP_USER_MEMORY: u32 = 3;
pub const KVM_CAP_NR_MEMSLOTS: u32 = 10;
pub const KVM_CAP_MAX_VCPUS: u32 = 66;

// ============================================================================
// KVM Exit Reasons
// ============================================================================

pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;

// I/O direction
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

// ============================================================================
// Memory Region Flags
// ============================================================================

pub const KVM_MEM_READONLY: u32 = 1 << 1;

// ============================================================================
// Data Structures
// ============================================================================

/// Userspace memory region descriptor.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// x86_64 general purpose registers.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// x86_64 segment descriptor.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

/// x86_64 descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

/// x86_64 special registers.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

// ============================================================================
// KVM Run Structure
// ============================================================================

/// KVM run structure for vCPU execution.
/// This is mmap'd and shared between kernel and userspace.
///
/// Only the header and the exit union are declared; the kernel's mapping is
/// larger and this is the minimum the harness depends on.
#[repr(C)]
pub struct KvmRun {
    // Request flags
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],

    // Exit information
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    // CR8 value
    pub cr8: u64,

    // APIC base
    pub apic_base: u64,

    // Exit data (union in C, using largest variant)
    pub exit_data: KvmRunExitData,
}

/// Exit data union (using repr(C) struct to represent the union).
#[repr(C)]
pub union KvmRunExitData {
    pub fail_entry: KvmRunFailEntry,
    pub io: KvmRunIo,
    pub internal: KvmRunInternal,
    pub padding: [u8; 256],
}

/// KVM_EXIT_FAIL_ENTRY data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

/// I/O exit data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

/// KVM_EXIT_INTERNAL_ERROR data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunInternal {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

// ============================================================================
// Safe Wrapper Types
// ============================================================================

/// Result type for KVM operations.
pub type KvmResult<T> = Result<T, KvmError>;

fn check(ret: libc::c_int) -> KvmResult<libc::c_int> {
    if ret < 0 {
        return Err(KvmError::last_os_error());
    }
    Ok(ret)
}

/// Safe wrapper for KVM system handle (/dev/kvm).
pub struct KvmSystem {
    fd: OwnedFd,
}

impl KvmSystem {
    /// Opens the KVM device read/write with close-on-exec.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;

        Ok(Self {
            fd: OwnedFd::from(file),
        })
    }

    /// Gets the KVM API version.
    pub fn api_version(&self) -> KvmResult<i32> {
        check(unsafe { libc::ioctl(self.fd.as_raw_fd(), KVM_GET_API_VERSION, 0) })
    }

    /// Checks if an extension is supported.
    ///
    /// Returns 0 when unsupported, otherwise an extension-specific value.
    pub fn check_extension(&self, extension: u32) -> KvmResult<i32> {
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_CHECK_EXTENSION,
                extension as libc::c_ulong,
            )
        })
    }

    /// Gets the size of the vCPU mmap region.
    pub fn vcpu_mmap_size(&self) -> KvmResult<usize> {
        let ret = check(unsafe { libc::ioctl(self.fd.as_raw_fd(), KVM_GET_VCPU_MMAP_SIZE, 0) })?;
        Ok(ret as usize)
    }

    /// Creates a new VM.
    pub fn create_vm(&self) -> KvmResult<KvmVmFd> {
        let ret = check(unsafe { libc::ioctl(self.fd.as_raw_fd(), KVM_CREATE_VM, 0) })?;
        Ok(KvmVmFd {
            fd: unsafe { OwnedFd::from_raw_fd(ret) },
        })
    }
}

/// Safe wrapper for KVM VM file descriptor.
pub struct KvmVmFd {
    fd: OwnedFd,
}

impl KvmVmFd {
    /// Sets a memory region for the VM.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr` must point to a mapping of at least
    /// `region.memory_size` bytes that outlives this VM.
    pub unsafe fn set_user_memory_region(&self, region: &KvmUserspaceMemoryRegion) -> KvmResult<()> {
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_SET_USER_MEMORY_REGION,
                region as *const _ as libc::c_ulong,
            )
        })?;
        Ok(())
    }

    /// Creates a new vCPU.
    pub fn create_vcpu(&self, id: u32) -> KvmResult<KvmVcpuFd> {
        let ret = check(unsafe {
            libc::ioctl(self.fd.as_raw_fd(), KVM_CREATE_VCPU, id as libc::c_ulong)
        })?;
        Ok(KvmVcpuFd {
            fd: unsafe { OwnedFd::from_raw_fd(ret) },
        })
    }
}

/// Safe wrapper for KVM vCPU file descriptor.
pub struct KvmVcpuFd {
    fd: OwnedFd,
}

impl KvmVcpuFd {
    /// Runs the vCPU until a VM exit occurs.
    ///
    /// Every failure, `EINTR` included, is reported to the caller.
    pub fn run(&self) -> KvmResult<()> {
        check(unsafe { libc::ioctl(self.fd.as_raw_fd(), KVM_RUN, 0) })?;
        Ok(())
    }

    /// Gets the general purpose registers.
    pub fn get_regs(&self) -> KvmResult<KvmRegs> {
        let mut regs = KvmRegs::default();
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_GET_REGS,
                &mut regs as *mut _ as libc::c_ulong,
            )
        })?;
        Ok(regs)
    }

    /// Sets the general purpose registers.
    pub fn set_regs(&self, regs: &KvmRegs) -> KvmResult<()> {
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_SET_REGS,
                regs as *const _ as libc::c_ulong,
            )
        })?;
        Ok(())
    }

    /// Gets the special registers.
    pub fn get_sregs(&self) -> KvmResult<KvmSregs> {
        let mut sregs = KvmSregs::default();
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_GET_SREGS,
                &mut sregs as *mut _ as libc::c_ulong,
            )
        })?;
        Ok(sregs)
    }

    /// Sets the special registers.
    pub fn set_sregs(&self, sregs: &KvmSregs) -> KvmResult<()> {
        check(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                KVM_SET_SREGS,
                sregs as *const _ as libc::c_ulong,
            )
        })?;
        Ok(())
    }

    /// Returns the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts_match_kernel() {
        assert_eq!(std::mem::size_of::<KvmUserspaceMemoryRegion>(), 32);
        assert_eq!(std::mem::size_of::<KvmRegs>(), 144);
        assert_eq!(std::mem::size_of::<KvmSegment>(), 24);
        assert_eq!(std::mem::size_of::<KvmDtable>(), 16);
        assert_eq!(std::mem::size_of::<KvmSregs>(), 312);
        assert_eq!(std::mem::offset_of!(KvmRun, exit_reason), 8);
        assert_eq!(std::mem::offset_of!(KvmRun, exit_data), 32);
        assert_eq!(std::mem::size_of::<KvmRun>(), 32 + 256);
    }

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(KVM_GET_API_VERSION as u64, 0xae00);
        assert_eq!(KVM_CREATE_VM as u64, 0xae01);
        assert_eq!(KVM_RUN as u64, 0xae80);
        assert_eq!(KVM_SET_USER_MEMORY_REGION as u64, 0x4020_ae46);
        assert_eq!(KVM_GET_REGS as u64, 0x8090_ae81);
        assert_eq!(KVM_SET_SREGS as u64, 0x4138_ae84);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_kvm_open() {
        let kvm = KvmSystem::open(Path::new("/dev/kvm")).expect("Failed to open /dev/kvm");
        let version = kvm.api_version().expect("Failed to get API version");
        println!("KVM API version: {}", version);
        assert_eq!(version, KVM_API_VERSION);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_kvm_extensions() {
        let kvm = KvmSystem::open(Path::new("/dev/kvm")).expect("Failed to open /dev/kvm");

        let user_mem = kvm
            .check_extension(KVM_CAP_USER_MEMORY)
            .expect("Failed to check extension");
        println!("KVM_CAP_USER_MEMORY: {}", user_mem);
        assert!(user_mem > 0);
    }
}
