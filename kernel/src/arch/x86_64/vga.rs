//! VGA text-mode console.
//!
//! 80x25 cell writer over the memory-mapped buffer at 0xB8000, with the
//! hardware cursor driven through ports 0x3D4/0x3D5. The core touches this
//! only for boot narration and fatal diagnostics; the shell does the rest.

use core::fmt;

#[cfg(target_os = "none")]
mod writer {
    use core::fmt;
    use core::ptr::{read_volatile, write_volatile};

    use lazy_static::lazy_static;
    use spin::Mutex;

    /// VGA text-mode color palette. Not all variants are used but the full
    /// 16-color palette is defined per the VGA specification.
    #[allow(dead_code)] // Full VGA color palette per specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Color {
        Black = 0,
        Blue = 1,
        Green = 2,
        Cyan = 3,
        Red = 4,
        Magenta = 5,
        Brown = 6,
        LightGray = 7,
        DarkGray = 8,
        LightBlue = 9,
        LightGreen = 10,
        LightCyan = 11,
        LightRed = 12,
        Pink = 13,
        Yellow = 14,
        White = 15,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    struct ColorCode(u8);

    impl ColorCode {
        fn new(foreground: Color, background: Color) -> ColorCode {
            ColorCode(((background as u8) << 4) | (foreground as u8))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    struct ScreenChar {
        ascii_character: u8,
        color_code: ColorCode,
    }

    const BUFFER_HEIGHT: usize = 25;
    const BUFFER_WIDTH: usize = 80;

    #[repr(transparent)]
    struct Buffer {
        chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
    }

    pub struct Writer {
        column_position: usize,
        color_code: ColorCode,
        buffer: &'static mut Buffer,
    }

    impl Writer {
        pub fn write_byte(&mut self, byte: u8) {
            match byte {
                b'\n' => self.new_line(),
                0x08 => self.backspace(),
                byte => {
                    if self.column_position >= BUFFER_WIDTH {
                        self.new_line();
                    }

                    let row = BUFFER_HEIGHT - 1;
                    let col = self.column_position;
                    self.put_char(row, col, byte);
                    self.column_position += 1;
                }
            }
            self.update_cursor();
        }

        pub fn write_string(&mut self, s: &str) {
            for byte in s.bytes() {
                match byte {
                    // printable ASCII, newline, or backspace
                    0x20..=0x7e | b'\n' | 0x08 => self.write_byte(byte),
                    _ => self.write_byte(0xfe),
                }
            }
        }

        /// Erase the cell left of the cursor and step back. Stops at the
        /// start of the row.
        fn backspace(&mut self) {
            if self.column_position > 0 {
                self.column_position -= 1;
                self.put_char(BUFFER_HEIGHT - 1, self.column_position, b' ');
            }
        }

        fn put_char(&mut self, row: usize, col: usize, byte: u8) {
            let color_code = self.color_code;
            // SAFETY: The VGA buffer at 0xb8000 is memory-mapped I/O.
            // write_volatile ensures the write is not optimized away.
            // Row/col are within the 80x25 grid by construction.
            unsafe {
                write_volatile(
                    &mut self.buffer.chars[row][col],
                    ScreenChar {
                        ascii_character: byte,
                        color_code,
                    },
                );
            }
        }

        fn new_line(&mut self) {
            for row in 1..BUFFER_HEIGHT {
                for col in 0..BUFFER_WIDTH {
                    // SAFETY: Reads/writes stay inside the 80x25 MMIO grid;
                    // volatile keeps the scroll from being elided.
                    unsafe {
                        let character = read_volatile(&self.buffer.chars[row][col]);
                        write_volatile(&mut self.buffer.chars[row - 1][col], character);
                    }
                }
            }
            self.clear_row(BUFFER_HEIGHT - 1);
            self.column_position = 0;
        }

        fn clear_row(&mut self, row: usize) {
            for col in 0..BUFFER_WIDTH {
                self.put_char(row, col, b' ');
            }
        }

        pub fn clear(&mut self) {
            for row in 0..BUFFER_HEIGHT {
                self.clear_row(row);
            }
            self.column_position = 0;
            self.update_cursor();
        }

        /// Move the hardware cursor to the current write position.
        fn update_cursor(&mut self) {
            let pos = ((BUFFER_HEIGHT - 1) * BUFFER_WIDTH + self.column_position) as u16;
            // SAFETY: Ports 0x3D4/0x3D5 are the VGA CRT controller's
            // index/data pair; registers 0x0F/0x0E hold the cursor
            // location low/high bytes.
            unsafe {
                crate::arch::x86_64::outb(0x3d4, 0x0f);
                crate::arch::x86_64::outb(0x3d5, (pos & 0xff) as u8);
                crate::arch::x86_64::outb(0x3d4, 0x0e);
                crate::arch::x86_64::outb(0x3d5, (pos >> 8) as u8);
            }
        }
    }

    impl fmt::Write for Writer {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.write_string(s);
            Ok(())
        }
    }

    lazy_static! {
        pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
            column_position: 0,
            color_code: ColorCode::new(Color::LightGray, Color::Black),
            // SAFETY: 0xb8000 is the identity-mapped VGA text buffer; the
            // Writer behind this Mutex is its only accessor.
            buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
        });
    }
}

#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        writer::WRITER
            .lock()
            .write_fmt(args)
            .expect("Printing to VGA failed");
    });
}

/// Blank the screen and park the cursor at the top left.
#[cfg(target_os = "none")]
pub fn clear_screen() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        writer::WRITER.lock().clear();
    });
}

// Host builds compile the callers but must not touch the VGA aperture.
#[cfg(not(target_os = "none"))]
pub fn _print(_args: fmt::Arguments) {}

#[cfg(not(target_os = "none"))]
pub fn clear_screen() {}
