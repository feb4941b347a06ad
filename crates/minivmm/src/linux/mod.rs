//! Linux KVM backend.
//!
//! Talks to `/dev/kvm` directly through ioctls. Layering follows the KVM
//! file descriptor hierarchy:
//!
//! - [`KvmHypervisor`]: the negotiated system handle
//! - [`KvmVm`]: a VM and its registered memory
//! - [`KvmVcpu`]: a vCPU and its shared run area
//! - [`Machine`]: all three, torn down in reverse order of creation
//!
//! # Requirements
//!
//! - Linux kernel with KVM support enabled
//! - `/dev/kvm` readable and writable by the current user
//! - x86_64 host

pub mod ffi;
mod hypervisor;
mod machine;
mod run;
mod vcpu;
mod vm;

pub use hypervisor::KvmHypervisor;
pub use machine::{Machine, BOOT_VCPU_ID, RAM_SLOT};
pub use run::RunArea;
pub use vcpu::{KvmVcpu, RFLAGS_RESERVED};
pub use vm::KvmVm;
