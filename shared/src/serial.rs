use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

pub struct SerialWriter {
    #[cfg(target_os = "none")]
    initialized: bool,
}

#[cfg(target_os = "none")]
mod port {
    use core::arch::asm;

    const IO_BASE: u16 = 0x3f8;
    pub const RBR: u16 = IO_BASE; // Receiver Buffer Reg (read-only)
    pub const THR: u16 = IO_BASE; // Transmitter Holding Reg (write-only)
    pub const IER: u16 = IO_BASE + 1; // Interrupt Enable Reg
    pub const FCR: u16 = IO_BASE + 2; // FIFO Control Reg (write-only)
    pub const LCR: u16 = IO_BASE + 3; // Line Control Register
    pub const MCR: u16 = IO_BASE + 4; // MODEM Control Register
    pub const LSR: u16 = IO_BASE + 5; // Line Status Register (read-only)

    pub unsafe fn outb(port: u16, byte: u8) {
        asm!("out dx, al", in("dx") port, in("al") byte)
    }

    pub unsafe fn inb(port: u16) -> u8 {
        let res: u8;
        asm!("in al, dx", in("dx") port, out("al") res);
        res
    }
}

#[cfg(target_os = "none")]
impl SerialWriter {
    const fn new() -> Self {
        Self { initialized: false }
    }

    fn ensure_initialized(&mut self) {
        use port::{inb, outb, FCR, IER, LCR, MCR, RBR, THR};

        if self.initialized {
            return;
        }

        // SAFETY: Follows the correct proceedure for initializing serial ports.
        unsafe {
            // https://wiki.osdev.org/Serial_Ports#Initialization

            outb(IER, 0x00);
            outb(LCR, 0x80);
            outb(THR, 0x03);
            outb(IER, 0x00);
            outb(LCR, 0x03);
            outb(FCR, 0xC7);
            outb(MCR, 0x0B);

            outb(MCR, 0x1E); // Enable loopback.

            const EXPECTED: u8 = 0xAE;
            outb(THR, EXPECTED);
            let actual = inb(RBR);
            assert!(
                actual == EXPECTED,
                "faulty serial, expected {EXPECTED:#X}, got {actual:#X}"
            );

            outb(MCR, 0x0F); // Disable loopback.

            self.initialized = true;
        }
    }
}

#[cfg(target_os = "none")]
impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use port::{inb, outb, LSR, THR};

        self.ensure_initialized();

        for b in s.bytes() {
            // SAFETY: Correctly waits before outputting byte to serial port.
            unsafe {
                while inb(LSR) & 0x20 == 0 {}
                outb(THR, b);
            }
        }

        Ok(())
    }
}

// Hosted builds (unit tests, tools) have no COM1; the console is stderr.
#[cfg(not(target_os = "none"))]
impl SerialWriter {
    const fn new() -> Self {
        Self {}
    }
}

#[cfg(not(target_os = "none"))]
impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use std::io::Write;

        std::io::stderr()
            .write_all(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}

lazy_static! {
    pub static ref SERIAL_WRITER: Mutex<SerialWriter> = Mutex::new(SerialWriter::new());
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    // Logging must never take the kernel down.
    let _ = SERIAL_WRITER.lock().write_fmt(args);
}

#[doc(hidden)]
pub fn _eprint(args: fmt::Arguments) {
    use fmt::Write;

    let mut writer = SERIAL_WRITER.lock();
    let _ = writer.write_str("\x1b[31m");
    let _ = writer.write_fmt(args);
    let _ = writer.write_str("\x1b[0m");
}
