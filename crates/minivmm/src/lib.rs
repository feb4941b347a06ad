//! # minivmm
//!
//! A minimal KVM harness: negotiate with `/dev/kvm`, map one region of
//! guest RAM, start one vCPU in flat real mode and dispatch its VM exits
//! until the guest halts.
//!
//! The platform-independent pieces are usable (and tested) anywhere:
//! - [`MachineConfig`]: what to load and where
//! - [`GuestMemory`] and [`MemoryMap`]: host buffers backing guest RAM
//! - [`ExitDispatcher`]: the run/exit loop, driven through the [`Vcpu`] trait
//!
//! The KVM backend lives in [`linux`] and is only built on x86_64 Linux.
//!
//! ## Example
//!
//! ```no_run
//! use minivmm::{linux::Machine, IoRecorder, MachineConfig, RunState};
//!
//! # fn main() -> minivmm::Result<()> {
//! let mut machine = Machine::new(&MachineConfig::default())?;
//! let mut recorder = IoRecorder::new();
//! let summary = machine.run(&mut recorder)?;
//! assert_eq!(summary.state, RunState::Halted);
//! assert_eq!(recorder.events()[0].value, 42);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// FFI bindings require extensive pointer casts.
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::borrow_as_ptr)]
// Documentation and style lints.
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::unreadable_literal)]
#![allow(unused_unsafe)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod guest;
pub mod memory;
pub mod traits;
pub mod types;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

pub use config::{MachineConfig, MachineConfigBuilder, DEFAULT_DEVICE_PATH};
pub use dispatch::{ExitDispatcher, ExitSummary, IoEvent, IoRecorder, RunState};
pub use error::{ErrorClass, HypervisorError, KvmError, Result};
pub use memory::{GuestAddress, GuestMemory, MemoryMap, MemoryRegion, PAGE_SIZE};
pub use traits::{IoHandler, Vcpu};
pub use types::{PlatformCapabilities, Registers, VcpuExit};
