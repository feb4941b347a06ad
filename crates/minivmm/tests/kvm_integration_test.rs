//! Integration tests for the run loop and the KVM backend.
//!
//! Tests driving a scripted vCPU run everywhere. Tests touching `/dev/kvm`
//! are ignored by default; run them with `cargo test -- --ignored`.

use std::collections::VecDeque;

use minivmm::{
    ErrorClass, ExitDispatcher, HypervisorError, IoEvent, IoHandler, IoRecorder, RunState, Vcpu,
    VcpuExit,
};

// ============================================================================
// Scripted vCPU
// ============================================================================

/// Replays a fixed sequence of exits and records completed port reads.
struct ScriptedVcpu {
    exits: VecDeque<Result<VcpuExit, HypervisorError>>,
    completed_reads: Vec<Vec<u8>>,
}

impl ScriptedVcpu {
    fn new(exits: impl IntoIterator<Item = Result<VcpuExit, HypervisorError>>) -> Self {
        Self {
            exits: exits.into_iter().collect(),
            completed_reads: Vec::new(),
        }
    }
}

impl Vcpu for ScriptedVcpu {
    fn id(&self) -> u32 {
        0
    }

    fn run(&mut self) -> Result<VcpuExit, HypervisorError> {
        self.exits
            .pop_front()
            .expect("guest ran past the end of its script")
    }

    fn complete_io_in(&mut self, data: &[u8]) -> Result<(), HypervisorError> {
        self.completed_reads.push(data.to_vec());
        Ok(())
    }
}

fn out(port: u16, data: &[u8]) -> Result<VcpuExit, HypervisorError> {
    Ok(VcpuExit::IoOut {
        port,
        size: 1,
        count: data.len() as u32,
        data: data.to_vec(),
    })
}

// ============================================================================
// Run Loop Tests
// ============================================================================

#[test]
fn test_demo_exit_sequence() {
    let mut vcpu = ScriptedVcpu::new([out(0x3f8, &[42]), Ok(VcpuExit::Halt)]);
    let mut recorder = IoRecorder::new();

    let summary = ExitDispatcher::new(&mut recorder).run(&mut vcpu).unwrap();

    assert_eq!(summary.state, RunState::Halted);
    assert_eq!(summary.terminal.name(), "KVM_EXIT_HLT");
    assert_eq!(summary.exits, 2);
    assert_eq!(
        recorder.events(),
        &[IoEvent {
            port: 0x3f8,
            value: 42
        }]
    );
}

#[test]
fn test_string_write_is_delivered_byte_by_byte() {
    let mut vcpu = ScriptedVcpu::new([out(0x3f8, b"hi\n"), Ok(VcpuExit::Halt)]);
    let mut dispatcher = ExitDispatcher::new(IoRecorder::new());

    let summary = dispatcher.run(&mut vcpu).unwrap();
    assert_eq!(summary.io_events, 3);

    let recorder = dispatcher.into_handler();
    let bytes: Vec<u8> = recorder.events().iter().map(|e| e.value).collect();
    assert_eq!(bytes, b"hi\n");
}

#[test]
fn test_port_read_answered_by_handler() {
    struct Keyboard;

    impl IoHandler for Keyboard {
        fn io_write(&mut self, _port: u16, _value: u8) {}

        fn io_read(&mut self, port: u16, data: &mut [u8]) {
            assert_eq!(port, 0x60);
            data.fill(0x1c);
        }
    }

    let mut vcpu = ScriptedVcpu::new([
        Ok(VcpuExit::IoIn {
            port: 0x60,
            size: 2,
            count: 1,
        }),
        Ok(VcpuExit::Halt),
    ]);

    ExitDispatcher::new(Keyboard).run(&mut vcpu).unwrap();
    assert_eq!(vcpu.completed_reads, vec![vec![0x1c, 0x1c]]);
}

#[test]
fn test_shutdown_is_not_a_halt() {
    let mut vcpu = ScriptedVcpu::new([Ok(VcpuExit::Shutdown)]);
    let summary = ExitDispatcher::new(IoRecorder::new())
        .run(&mut vcpu)
        .unwrap();

    assert_eq!(summary.state, RunState::Shutdown);
    assert_eq!(summary.terminal.name(), "KVM_EXIT_SHUTDOWN");
}

#[test]
fn test_unknown_exit_fails_the_loop() {
    let mut vcpu = ScriptedVcpu::new([out(0x3f8, &[1]), Ok(VcpuExit::Unknown(42))]);
    let mut dispatcher = ExitDispatcher::new(IoRecorder::new());

    let err = dispatcher.run(&mut vcpu).unwrap_err();

    assert!(matches!(err, HypervisorError::UnhandledExit { reason: 42 }));
    assert_eq!(err.class(), ErrorClass::Runtime);
    assert_eq!(dispatcher.state(), RunState::Failed);
    // Writes made before the failure were still delivered.
    assert_eq!(dispatcher.handler().events().len(), 1);
}

#[test]
fn test_failed_dispatcher_does_not_run_again() {
    let mut vcpu = ScriptedVcpu::new([
        Ok(VcpuExit::FailEntry {
            hardware_entry_failure_reason: 0x21,
            cpu: 0,
        }),
        Ok(VcpuExit::Halt),
    ]);
    let mut dispatcher = ExitDispatcher::new(IoRecorder::new());

    assert!(matches!(
        dispatcher.run(&mut vcpu),
        Err(HypervisorError::FailEntry {
            hardware_entry_failure_reason: 0x21,
            ..
        })
    ));
    assert!(matches!(
        dispatcher.run(&mut vcpu),
        Err(HypervisorError::InvalidState { .. })
    ));
    // The halt was never consumed.
    assert_eq!(vcpu.exits.len(), 1);
}

// ============================================================================
// KVM Tests
// ============================================================================

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod kvm {
    use minivmm::guest::{PMIO_DEMO, PMIO_DEMO_PORT, PMIO_DEMO_VALUE};
    use minivmm::linux::{KvmHypervisor, Machine, RAM_SLOT};
    use minivmm::{
        GuestAddress, GuestMemory, HypervisorError, IoEvent, IoRecorder, MachineConfig,
        MemoryRegion, RunState, PAGE_SIZE,
    };

    /// Returns whether `addr` falls inside any mapping of this process.
    fn is_mapped(addr: usize) -> bool {
        let maps = std::fs::read_to_string("/proc/self/maps").expect("Failed to read maps");
        maps.lines().any(|line| {
            let range = line.split_whitespace().next().unwrap_or_default();
            let Some((start, end)) = range.split_once('-') else {
                return false;
            };
            let start = usize::from_str_radix(start, 16).unwrap();
            let end = usize::from_str_radix(end, 16).unwrap();
            (start..end).contains(&addr)
        })
    }

    /// Host addresses of guest RAM and of the run area.
    fn host_mappings(machine: &Machine) -> [usize; 2] {
        let ram = machine
            .vm()
            .memory()
            .get(RAM_SLOT)
            .expect("RAM not registered")
            .memory()
            .host_address() as usize;
        let run = machine.vcpu().run_area().host_address() as usize;
        [ram, run]
    }

    fn machine_with(program: &[u8]) -> Machine {
        let config = MachineConfig::builder().program(program).build();
        Machine::new(&config).expect("Failed to build machine")
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_demo_guest_end_to_end() {
        let mut machine = Machine::new(&MachineConfig::default()).unwrap();
        assert_eq!(machine.capabilities().api_version, 12);

        let mut recorder = IoRecorder::new();
        let summary = machine.run(&mut recorder).unwrap();

        assert_eq!(summary.state, RunState::Halted);
        assert_eq!(
            recorder.events(),
            &[IoEvent {
                port: PMIO_DEMO_PORT,
                value: PMIO_DEMO_VALUE
            }]
        );
        // rip points just past the hlt.
        assert_eq!(machine.registers().unwrap().rip, PMIO_DEMO.len() as u64);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_rep_outsb() {
        // mov dx,0x3f8; mov si,0x10; mov cx,3; rep outsb; hlt; data at 0x10
        let mut program = vec![
            0xba, 0xf8, 0x03, 0xbe, 0x10, 0x00, 0xb9, 0x03, 0x00, 0xf3, 0x6e, 0xf4,
        ];
        program.resize(0x10, 0x90);
        program.extend_from_slice(b"abc");

        let mut machine = machine_with(&program);
        let mut recorder = IoRecorder::new();
        let summary = machine.run(&mut recorder).unwrap();

        assert_eq!(summary.state, RunState::Halted);
        let bytes: Vec<u8> = recorder.events().iter().map(|e| e.value).collect();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_port_read_resumes_guest() {
        // in al,0x60; out 0x61,al; hlt
        let mut machine = machine_with(&[0xe4, 0x60, 0xe6, 0x61, 0xf4]);
        let mut recorder = IoRecorder::new();

        let summary = machine.run(&mut recorder).unwrap();

        assert_eq!(summary.state, RunState::Halted);
        // The default handler answers reads with zeros.
        assert_eq!(recorder.events(), &[IoEvent { port: 0x61, value: 0 }]);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_wide_write_is_skipped() {
        // mov dx,0x3f8; mov ax,0x1234; out dx,ax; hlt
        let mut machine = machine_with(&[0xba, 0xf8, 0x03, 0xb8, 0x34, 0x12, 0xef, 0xf4]);
        let mut recorder = IoRecorder::new();

        let summary = machine.run(&mut recorder).unwrap();

        assert_eq!(summary.state, RunState::Halted);
        assert!(recorder.events().is_empty());
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_teardown_unmaps_in_every_terminal_state() {
        let cases: [(&[u8], RunState); 3] = [
            (&PMIO_DEMO[..], RunState::Halted),
            // lidt [0x10] (zero limit); int3: triple fault.
            (&[0x0f, 0x01, 0x1e, 0x10, 0x00, 0xcc][..], RunState::Shutdown),
            // mov al,[0x2000]: outside RAM, an unhandled MMIO exit.
            (&[0xa0, 0x00, 0x20, 0xf4][..], RunState::Failed),
        ];

        for (program, expected) in cases {
            let mut machine = machine_with(program);
            let mappings = host_mappings(&machine);
            assert!(mappings.iter().all(|&addr| is_mapped(addr)));

            let state = match machine.run(IoRecorder::new()) {
                Ok(summary) => summary.state,
                Err(e) => {
                    assert!(e.is_fatal_exit(), "unexpected error: {e}");
                    RunState::Failed
                }
            };
            assert_eq!(state, expected);

            drop(machine);
            for addr in mappings {
                assert!(!is_mapped(addr), "{addr:#x} still mapped after {expected}");
            }
        }
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_failed_setup_releases_parts() {
        let hypervisor = KvmHypervisor::negotiate().unwrap();
        let mut vm = hypervisor.create_vm().unwrap();

        // KVM rejects the address space encoded in the upper slot bits.
        let memory = GuestMemory::allocate(PAGE_SIZE).unwrap();
        let rejected = memory.host_address() as usize;
        let region = MemoryRegion::new(0xffff_0000, GuestAddress::new(0), memory);
        assert!(matches!(
            vm.register_memory_region(region),
            Err(HypervisorError::MemoryRegistrationFailed { .. })
        ));
        assert!(!is_mapped(rejected));

        // A vCPU whose initialization never happened still releases
        // its run area, and the VM its RAM.
        let memory = GuestMemory::allocate(PAGE_SIZE).unwrap();
        let ram = memory.host_address() as usize;
        vm.register_memory_region(MemoryRegion::new(0, GuestAddress::new(0), memory))
            .unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let run = vcpu.run_area().host_address() as usize;

        drop(vcpu);
        assert!(!is_mapped(run));
        assert!(is_mapped(ram));
        drop(vm);
        assert!(!is_mapped(ram));
    }

    #[test]
    fn test_bad_device_path() {
        let config = MachineConfig::builder().device_path("/dev/null").build();
        assert!(matches!(
            Machine::new(&config),
            Err(HypervisorError::SubsystemUnavailable { .. })
        ));
    }
}
