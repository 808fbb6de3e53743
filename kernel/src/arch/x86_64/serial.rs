//! COM1 serial output.
//!
//! Used by the bare-metal test harness and the `log` backend. Host builds
//! get a no-op `_print` so shared code compiles without touching ports.

use core::fmt;

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;
#[cfg(target_os = "none")]
use uart_16550::SerialPort;

#[cfg(target_os = "none")]
lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is initialized
        // immediately after construction and only accessed through this
        // Mutex.
        let mut serial_port = unsafe { SerialPort::new(0x3f8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Printing to serial failed");
    });
}

#[cfg(not(target_os = "none"))]
pub fn _print(_args: fmt::Arguments) {}
