//! Built-in guest code.

/// Writes 42 to the COM1 port and halts. Runs in real mode at offset 0.
///
/// ```text
/// mov dx, 0x3f8
/// mov al, 42
/// out dx, al
/// hlt
/// ```
pub const PMIO_DEMO: [u8; 7] = [
    0xba, 0xf8, 0x03, // mov dx,0x3f8
    0xb0, 42, // mov al,42
    0xee, // out dx,al
    0xf4, // hlt
];

/// I/O port written by [`PMIO_DEMO`].
pub const PMIO_DEMO_PORT: u16 = 0x3f8;

/// Value written by [`PMIO_DEMO`].
pub const PMIO_DEMO_VALUE: u8 = 42;
