//! PS/2 keyboard driver.
//!
//! IRQ1 reads a scancode from port 0x60 and feeds it through the
//! `pc_keyboard` decoder (scancode set 1, US layout, Ctrl-letters mapped
//! to C0 control codes, so Ctrl+C yields 0x03). Decoded ASCII bytes land
//! in a lock-free single-producer/single-consumer ring buffer; consumers
//! drain it through [`has_char`], [`get_char`], and [`read_line`]. When
//! the ring is full, bytes are dropped without signal.
//!
//! Modifier and caps-lock state is mirrored into an atomic bitmask purely
//! for observation; the decoder owns the state that affects translation.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::arch::x86_64::idt;

/// Bitmask: Shift is held.
pub const MOD_SHIFT: u8 = 0x01;
/// Bitmask: Ctrl is held.
pub const MOD_CTRL: u8 = 0x02;
/// Bitmask: Alt is held.
pub const MOD_ALT: u8 = 0x04;
/// Bitmask: Caps lock is engaged (toggles on press only).
pub const MOD_CAPS_LOCK: u8 = 0x08;

static MODIFIER_STATE: AtomicU8 = AtomicU8::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Get the current modifier bitmask.
pub fn modifiers() -> u8 {
    MODIFIER_STATE.load(Ordering::Relaxed)
}

/// Check if the keyboard driver has been initialized.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Ring buffer size for decoded key bytes (must be power of 2).
const KEY_BUFFER_SIZE: usize = 256;

/// Lock-free single-producer single-consumer ring buffer for decoded keys.
struct KeyBuffer {
    buf: [u8; KEY_BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; KEY_BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a byte (called from the interrupt handler -- single producer).
    /// The head advances only after the cell is written; a full buffer
    /// drops the byte.
    fn push(&mut self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (KEY_BUFFER_SIZE - 1);
        let tail = self.tail.load(Ordering::Acquire);
        if next == tail {
            return; // Buffer full, drop key
        }
        self.buf[head] = byte;
        self.head.store(next, Ordering::Release);
    }

    /// Pop a byte (called from the main flow -- single consumer). The tail
    /// advances only after the cell is read.
    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let byte = self.buf[tail];
        self.tail
            .store((tail + 1) & (KEY_BUFFER_SIZE - 1), Ordering::Release);
        Some(byte)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

// SAFETY: KeyBuffer uses atomic operations for head/tail synchronization.
// The push side (interrupt handler) is single-producer and the pop side
// (main flow) is single-consumer; both indices are single-writer.
unsafe impl Send for KeyBuffer {}
unsafe impl Sync for KeyBuffer {}

static mut KEY_BUFFER: KeyBuffer = KeyBuffer::new();

static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

/// Initialize the decoder state and hook IRQ1's vector.
pub fn init() {
    let kb = Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::MapLettersToUnicode,
    );
    *KEYBOARD.lock() = Some(kb);
    idt::register_handler(idt::KEYBOARD_VECTOR, irq_handler);
    INITIALIZED.store(true, Ordering::Release);
}

/// IRQ1 callback: fetch the scancode and run it through the pipeline.
/// Must not print or take any lock shared with the output path.
fn irq_handler(_vector: u8) {
    // SAFETY: Port 0x60 is the PS/2 controller's data port; reading it
    // consumes the pending scancode.
    let scancode = unsafe { crate::arch::x86_64::inb(0x60) };
    handle_scancode(scancode);
}

/// Decode one scancode byte. Split from the IRQ path so the pipeline can
/// be driven directly in tests.
pub fn handle_scancode(scancode: u8) {
    let mut kb_guard = KEYBOARD.lock();
    let Some(keyboard) = kb_guard.as_mut() else {
        return;
    };

    if let Ok(Some(key_event)) = keyboard.add_byte(scancode) {
        // Mirror modifier state from the raw key event BEFORE
        // process_keyevent consumes it. Shift/Ctrl/Alt track press and
        // release; caps lock toggles on press only.
        let is_down = key_event.state == KeyState::Down;
        match key_event.code {
            KeyCode::LShift | KeyCode::RShift => update_modifier(MOD_SHIFT, is_down),
            KeyCode::LControl | KeyCode::RControl => update_modifier(MOD_CTRL, is_down),
            KeyCode::LAlt | KeyCode::RAltGr => update_modifier(MOD_ALT, is_down),
            KeyCode::CapsLock => {
                if is_down {
                    MODIFIER_STATE.fetch_xor(MOD_CAPS_LOCK, Ordering::Relaxed);
                }
            }
            _ => {}
        }

        if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(key_event) {
            if ch.is_ascii() && ch != '\0' {
                // SAFETY: handle_scancode is the sole producer (called from
                // IRQ1 with interrupts disabled, or serially in tests).
                #[allow(static_mut_refs)]
                unsafe {
                    KEY_BUFFER.push(ch as u8);
                }
            }
        }
    }
}

/// Update a modifier bit in the global modifier state.
fn update_modifier(bit: u8, down: bool) {
    if down {
        MODIFIER_STATE.fetch_or(bit, Ordering::Relaxed);
    } else {
        MODIFIER_STATE.fetch_and(!bit, Ordering::Relaxed);
    }
}

/// Whether a decoded byte is waiting in the ring.
pub fn has_char() -> bool {
    // SAFETY: Reading head/tail is atomic; this is the consumer side.
    #[allow(static_mut_refs)]
    unsafe {
        !KEY_BUFFER.is_empty()
    }
}

/// Pop the next decoded byte without blocking.
pub fn try_get_char() -> Option<u8> {
    // SAFETY: try_get_char callers are the sole consumer (main flow).
    #[allow(static_mut_refs)]
    unsafe {
        KEY_BUFFER.pop()
    }
}

/// Pop the next decoded byte, halting the CPU until an interrupt delivers
/// one.
pub fn get_char() -> u8 {
    loop {
        if let Some(byte) = try_get_char() {
            return byte;
        }
        crate::arch::idle();
    }
}

/// Read an edited line into `buf`.
///
/// Echoes printable bytes, handles backspace by decrementing (never past
/// the start), commits on `\n`/`\r`, and returns `None` when the read is
/// cancelled with Ctrl+C. The committed length never exceeds `buf.len()`;
/// further bytes are dropped.
pub fn read_line(buf: &mut [u8]) -> Option<usize> {
    let mut len = 0;
    loop {
        let byte = get_char();
        match byte {
            b'\n' | b'\r' => {
                println!();
                return Some(len);
            }
            0x03 => {
                println!("^C");
                return None;
            }
            0x08 | 0x7F => {
                if len > 0 {
                    len -= 1;
                    print!("\u{8}");
                }
            }
            0x20..=0x7E => {
                if len < buf.len() {
                    buf[len] = byte;
                    len += 1;
                    print!("{}", byte as char);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scancode set 1 make codes.
    const SC_H: u8 = 0x23;
    const SC_E: u8 = 0x12;
    const SC_L: u8 = 0x26;
    const SC_O: u8 = 0x18;
    const SC_P: u8 = 0x19;
    const SC_A: u8 = 0x1E;
    const SC_C: u8 = 0x2E;
    const SC_ENTER: u8 = 0x1C;
    const SC_BACKSPACE: u8 = 0x0E;
    const SC_LSHIFT: u8 = 0x2A;
    const SC_LCTRL: u8 = 0x1D;
    const SC_CAPS: u8 = 0x3A;
    const RELEASE: u8 = 0x80;

    #[test]
    fn ring_buffer_invariants() {
        let mut ring = KeyBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);

        // Fill to capacity - 1; the next push must be dropped.
        for i in 0..(KEY_BUFFER_SIZE - 1) {
            ring.push(i as u8);
        }
        ring.push(0xAA);
        assert_eq!(ring.pop(), Some(0));
        // The dropped byte must not have corrupted the order.
        for i in 1..(KEY_BUFFER_SIZE - 1) {
            assert_eq!(ring.pop(), Some(i as u8));
        }
        assert!(ring.is_empty());
    }

    // The decode pipeline shares module-level state, so everything that
    // touches it lives in one test.
    #[test]
    fn decode_pipeline() {
        init();

        // Plain keystroke.
        handle_scancode(SC_H);
        handle_scancode(SC_H | RELEASE);
        assert_eq!(try_get_char(), Some(b'h'));

        // Shift press/release toggles the flag and upcases; releasing
        // leaves all flags clear again.
        let before = modifiers();
        handle_scancode(SC_LSHIFT);
        assert_ne!(modifiers() & MOD_SHIFT, 0);
        handle_scancode(SC_A);
        handle_scancode(SC_A | RELEASE);
        handle_scancode(SC_LSHIFT | RELEASE);
        assert_eq!(try_get_char(), Some(b'A'));
        assert_eq!(modifiers(), before);

        // Caps lock inverts case for alphabetics and toggles back off.
        handle_scancode(SC_CAPS);
        handle_scancode(SC_CAPS | RELEASE);
        assert_ne!(modifiers() & MOD_CAPS_LOCK, 0);
        handle_scancode(SC_A);
        handle_scancode(SC_A | RELEASE);
        assert_eq!(try_get_char(), Some(b'A'));
        handle_scancode(SC_CAPS);
        handle_scancode(SC_CAPS | RELEASE);
        assert_eq!(modifiers() & MOD_CAPS_LOCK, 0);
        handle_scancode(SC_A);
        handle_scancode(SC_A | RELEASE);
        assert_eq!(try_get_char(), Some(b'a'));

        // Ctrl+C produces ASCII 3.
        handle_scancode(SC_LCTRL);
        handle_scancode(SC_C);
        handle_scancode(SC_C | RELEASE);
        handle_scancode(SC_LCTRL | RELEASE);
        assert_eq!(try_get_char(), Some(0x03));

        // Line editing: "hello" + 2x backspace + "p" + Enter -> "help".
        for sc in [SC_H, SC_E, SC_L, SC_L, SC_O, SC_BACKSPACE, SC_BACKSPACE, SC_P, SC_ENTER] {
            handle_scancode(sc);
            handle_scancode(sc | RELEASE);
        }
        let mut line = [0u8; 32];
        let len = read_line(&mut line).expect("enter commits the line");
        assert_eq!(&line[..len], b"help");

        // Ctrl+C cancels an in-progress read.
        handle_scancode(SC_LCTRL);
        handle_scancode(SC_C);
        handle_scancode(SC_C | RELEASE);
        handle_scancode(SC_LCTRL | RELEASE);
        assert_eq!(read_line(&mut line), None);
    }
}
