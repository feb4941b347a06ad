//! VM-exit dispatch.
//!
//! [`ExitDispatcher`] drives one vCPU through `KVM_RUN` until the guest
//! reaches a terminal exit. Port writes and reads are the only exits that
//! hand control back to the guest; halt, shutdown and every failure end the
//! loop and are never retried.

use std::fmt;

use crate::error::{HypervisorError, Result};
use crate::traits::{IoHandler, Vcpu};
use crate::types::VcpuExit;

/// Run loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The guest is (or will be) executing.
    Running,
    /// The guest executed `hlt`.
    Halted,
    /// The run loop stopped on an error.
    Failed,
    /// The guest shut down (triple fault or equivalent).
    Shutdown,
}

impl RunState {
    /// Returns whether no further exits will be processed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Halted => "HALTED",
            Self::Failed => "FAILED",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A byte the guest wrote to an I/O port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub port: u16,
    pub value: u8,
}

/// [`IoHandler`] that records every port write.
#[derive(Debug, Default)]
pub struct IoRecorder {
    events: Vec<IoEvent>,
}

impl IoRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded writes in guest order.
    #[must_use]
    pub fn events(&self) -> &[IoEvent] {
        &self.events
    }
}

impl IoHandler for IoRecorder {
    fn io_write(&mut self, port: u16, value: u8) {
        self.events.push(IoEvent { port, value });
    }
}

/// Outcome of a run loop that ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSummary {
    /// Terminal state, either [`RunState::Halted`] or [`RunState::Shutdown`].
    pub state: RunState,
    /// The exit that ended the loop.
    pub terminal: VcpuExit,
    /// Number of `KVM_RUN` calls that returned an exit.
    pub exits: u64,
    /// Number of port writes delivered to the handler.
    pub io_events: u64,
}

/// Drives the run/exit loop of one vCPU.
pub struct ExitDispatcher<H> {
    handler: H,
    state: RunState,
    exits: u64,
    io_events: u64,
}

impl<H: IoHandler> ExitDispatcher<H> {
    /// Creates a dispatcher in the [`RunState::Running`] state.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            state: RunState::Running,
            exits: 0,
            io_events: 0,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Returns the I/O handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Consumes the dispatcher and returns the I/O handler.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Runs `vcpu` until a terminal exit.
    ///
    /// Returns the summary on `hlt` or shutdown. Any failure moves the
    /// dispatcher to [`RunState::Failed`] and is returned as the error.
    pub fn run<V: Vcpu + ?Sized>(&mut self, vcpu: &mut V) -> Result<ExitSummary> {
        if self.state.is_terminal() {
            return Err(HypervisorError::InvalidState {
                expected: RunState::Running.to_string(),
                actual: self.state.to_string(),
            });
        }

        let id = vcpu.id();
        tracing::debug!("vCPU {} entering run loop", id);

        loop {
            let exit = match vcpu.run() {
                Ok(exit) => exit,
                Err(e) => return Err(self.fail(id, e)),
            };
            self.exits += 1;
            tracing::trace!("vCPU {} exit #{}: {:?}", id, self.exits, exit);

            match self.dispatch(vcpu, exit) {
                Ok(None) => {}
                Ok(Some(summary)) => {
                    tracing::info!(
                        "vCPU {} {} after {} exits ({} I/O writes)",
                        id,
                        summary.state,
                        summary.exits,
                        summary.io_events
                    );
                    return Ok(summary);
                }
                Err(e) => return Err(self.fail(id, e)),
            }
        }
    }

    fn fail(&mut self, id: u32, err: HypervisorError) -> HypervisorError {
        self.state = RunState::Failed;
        tracing::error!("vCPU {} {}: {}", id, self.state, err);
        err
    }

    fn finish(&mut self, state: RunState, terminal: VcpuExit) -> Option<ExitSummary> {
        self.state = state;
        Some(ExitSummary {
            state,
            terminal,
            exits: self.exits,
            io_events: self.io_events,
        })
    }

    /// Handles one exit. `Ok(None)` resumes the guest.
    fn dispatch<V: Vcpu + ?Sized>(
        &mut self,
        vcpu: &mut V,
        exit: VcpuExit,
    ) -> Result<Option<ExitSummary>> {
        match exit {
            VcpuExit::IoOut {
                port, size, data, ..
            } => {
                if size == 1 {
                    for &value in &data {
                        self.handler.io_write(port, value);
                        self.io_events += 1;
                    }
                } else {
                    tracing::warn!(
                        "KVM_EXIT_IO: unsupported size {} on port {:#x}, ignoring",
                        size,
                        port
                    );
                }
                Ok(None)
            }

            VcpuExit::IoIn { port, size, count } => {
                let mut data = vec![0u8; usize::from(size) * count as usize];
                self.handler.io_read(port, &mut data);
                vcpu.complete_io_in(&data)?;
                Ok(None)
            }

            VcpuExit::Halt => Ok(self.finish(RunState::Halted, exit)),

            VcpuExit::Shutdown => Ok(self.finish(RunState::Shutdown, exit)),

            VcpuExit::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            } => Err(HypervisorError::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            }),

            VcpuExit::InternalError { suberror, .. } => {
                Err(HypervisorError::InternalError { suberror })
            }

            VcpuExit::Unknown(reason) => Err(HypervisorError::UnhandledExit { reason }),
        }
    }
}
