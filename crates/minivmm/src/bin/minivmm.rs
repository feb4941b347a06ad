//! Runs the built-in port I/O demo guest under KVM.
//!
//! Prints one `VMexit:` line per port write and one for the exit that ended
//! the run, fatal exits included. Exits successfully only if the guest halted.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use minivmm::{config::DEFAULT_DEVICE_PATH, memory::PAGE_SIZE};

/// Minimal KVM harness
#[derive(Parser, Debug)]
#[command(name = "minivmm")]
#[command(about = "Run a tiny real-mode guest under KVM and report its VM exits")]
#[command(version)]
struct Args {
    /// Path to the KVM device
    #[arg(long, value_name = "PATH", default_value = DEFAULT_DEVICE_PATH)]
    device: String,

    /// Guest RAM size in bytes (multiple of 4096)
    #[arg(long, value_name = "BYTES", default_value_t = PAGE_SIZE)]
    memory: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.debug {
        "minivmm=debug"
    } else {
        "minivmm=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run(args: &Args) -> anyhow::Result<bool> {
    use anyhow::Context;
    use minivmm::{linux::Machine, IoHandler, MachineConfig, RunState};

    /// Prints every port write to stdout.
    struct StdoutIo;

    impl IoHandler for StdoutIo {
        fn io_write(&mut self, port: u16, value: u8) {
            println!("VMexit: PMIO port={:#x} value={}", port, value);
        }
    }

    let config = MachineConfig::builder()
        .device_path(args.device.clone())
        .memory_size(args.memory)
        .build();

    let mut machine = Machine::new(&config).context("failed to set up machine")?;
    let summary = match machine.run(StdoutIo) {
        Ok(summary) => summary,
        Err(e) => {
            if e.is_fatal_exit() {
                println!("VMexit: {}", e);
            }
            return Err(e).context("guest run failed");
        }
    };

    println!("VMexit: {}", summary.terminal.name());
    tracing::info!(
        "Guest stopped in state {} after {} exits",
        summary.state,
        summary.exits
    );

    Ok(summary.state == RunState::Halted)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run(_args: &Args) -> anyhow::Result<bool> {
    anyhow::bail!("KVM is only available on x86_64 Linux")
}
