//! x86_64 architecture support.
//!
//! Provides hardware initialization (GDT, IDT, PIC), interrupt control,
//! serial I/O (COM1 at 0x3F8), VGA text output, and I/O port primitives
//! for the x86_64 platform.

pub mod gdt;
pub mod idt;
pub mod serial;
pub mod vga;

/// Bring up the trap/interrupt substrate. Called once from `kernel_main`
/// with interrupts disabled; `enable_interrupts` stays with the caller so
/// drivers can register their handlers first.
pub fn init() {
    x86_64::instructions::interrupts::disable();

    println!("[ARCH] Starting GDT init...");
    gdt::init();
    println!("[ARCH] GDT initialized");

    println!("[ARCH] Starting IDT init...");
    idt::init();
    println!("[ARCH] IDT loaded, PIC remapped to vectors 32..48");
}

/// Halt the CPU. Used by panic/shutdown paths.
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Enable hardware interrupts once handlers are registered.
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Suspend until the next interrupt. The blocking keyboard getter and the
/// shell idle loop sit in this.
#[cfg(target_os = "none")]
pub fn idle() {
    x86_64::instructions::hlt();
}

/// Host builds (unit tests) must not execute privileged instructions.
#[cfg(not(target_os = "none"))]
pub fn idle() {
    core::hint::spin_loop();
}

// ---------------------------------------------------------------------------
// I/O port substrate -- used by PCI, ATA, keyboard, NIC, and console code.
// The x86_64 crate emits the in/out instructions with memory clobbers, so
// accesses are not reordered across each other by the compiler.
// ---------------------------------------------------------------------------

/// # Safety
///
/// Writing to an I/O port has device-defined effects; the caller must own
/// the port.
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// # Safety
///
/// Reading an I/O port can have device-defined side effects; the caller
/// must own the port.
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// # Safety
///
/// See [`outb`].
pub unsafe fn outw(port: u16, value: u16) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// # Safety
///
/// See [`inb`].
pub unsafe fn inw(port: u16) -> u16 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// # Safety
///
/// See [`outb`].
pub unsafe fn outl(port: u16, value: u32) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// # Safety
///
/// See [`inb`].
pub unsafe fn inl(port: u16) -> u32 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// Short delay between PIC/device port accesses: a write to port 0x80,
/// which is unused on effectively all hardware.
pub fn io_wait() {
    // SAFETY: Port 0x80 is the POST diagnostic port; writing to it has no
    // observable effect beyond consuming one I/O bus cycle.
    unsafe { outb(0x80, 0) }
}
