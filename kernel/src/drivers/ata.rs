//! ATA PIO disk driver
//!
//! IDENTIFY/read/write state machine over the primary or secondary
//! channel, LBA-28 addressing, 512-byte sectors. All waits are
//! counted-iteration polls on the status register; there is no wall-clock
//! source, so the counts are sized generously for emulated disks. When no
//! drive answers the probe the subsystem stays dormant and every operation
//! reports the device as absent.

use bitflags::bitflags;
use spin::RwLock;

use crate::arch::x86_64::{inb, inw, io_wait, outb, outw};
use crate::error::{KernelError, KernelResult};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Iterations for status polls. Host-speed-dependent by design.
const POLL_ITERATIONS: usize = 1_000_000;

const PRIMARY_IO_BASE: u16 = 0x1F0;
const PRIMARY_CTRL_BASE: u16 = 0x3F6;
const SECONDARY_IO_BASE: u16 = 0x170;
const SECONDARY_CTRL_BASE: u16 = 0x376;

// Task-file register offsets from the I/O base.
const REG_DATA: u16 = 0x00;
const REG_SECTOR_COUNT: u16 = 0x02;
const REG_LBA_LOW: u16 = 0x03;
const REG_LBA_MID: u16 = 0x04;
const REG_LBA_HIGH: u16 = 0x05;
const REG_DRIVE_SELECT: u16 = 0x06;
const REG_COMMAND: u16 = 0x07;
const REG_STATUS: u16 = 0x07;

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;

/// SRST bit in the device control register.
const CTRL_SRST: u8 = 1 << 2;

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaStatus: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const SRV = 1 << 4;
        const DF  = 1 << 5;
        const RDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

/// Drive-select byte for LBA-28: master, LBA mode, LBA bits 24..28.
fn drive_select_byte(lba: u32) -> u8 {
    0xE0 | 0x40 | ((lba >> 24) & 0x0F) as u8
}

/// The hardware treats a sector count of 0 as 256; normalize it to 1
/// instead.
fn effective_count(count: u8) -> usize {
    if count == 0 {
        1
    } else {
        count as usize
    }
}

/// One ATA drive on a probed channel.
pub struct AtaDrive {
    io_base: u16,
    ctrl_base: u16,
    /// LBA-28 addressable sectors, from IDENTIFY words 60..62.
    sectors: u32,
    /// Model string from IDENTIFY words 27..47, byte-swapped.
    model: [u8; 40],
}

impl AtaDrive {
    fn status(&self) -> AtaStatus {
        // SAFETY: Reading the status register of a probed channel has no
        // side effect beyond clearing a pending interrupt.
        AtaStatus::from_bits_truncate(unsafe { inb(self.io_base + REG_STATUS) })
    }

    /// Poll until BSY clears.
    fn wait_not_busy(&self) -> KernelResult<()> {
        for _ in 0..POLL_ITERATIONS {
            if !self.status().contains(AtaStatus::BSY) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout { device: "ata" })
    }

    /// Poll until DRQ sets; an asserted error bit fails the call.
    fn wait_data_request(&self) -> KernelResult<()> {
        for _ in 0..POLL_ITERATIONS {
            let status = self.status();
            if status.intersects(AtaStatus::ERR | AtaStatus::DF) {
                return Err(KernelError::HardwareError {
                    device: "ata",
                    code: status.bits() as u32,
                });
            }
            if !status.contains(AtaStatus::BSY) && status.contains(AtaStatus::DRQ) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout { device: "ata" })
    }

    /// Soft reset via SRST in the control register.
    fn soft_reset(&self) {
        // SAFETY: The control register is owned by this driver; pulsing
        // SRST resets both drives on the channel.
        unsafe {
            outb(self.ctrl_base, CTRL_SRST);
            io_wait();
            outb(self.ctrl_base, 0);
        }
        let _ = self.wait_not_busy();
    }

    /// IDENTIFY the master drive, capturing capacity and model.
    fn identify(&mut self) -> KernelResult<()> {
        // SAFETY: Standard IDENTIFY sequence on a probed channel: select
        // master, zero the task file, issue the command.
        unsafe {
            outb(self.io_base + REG_DRIVE_SELECT, 0xA0);
            outb(self.io_base + REG_SECTOR_COUNT, 0);
            outb(self.io_base + REG_LBA_LOW, 0);
            outb(self.io_base + REG_LBA_MID, 0);
            outb(self.io_base + REG_LBA_HIGH, 0);
            outb(self.io_base + REG_COMMAND, CMD_IDENTIFY);
        }

        // A status of zero means no device sits behind the select.
        if self.status().is_empty() {
            return Err(KernelError::DeviceAbsent { device: "ata" });
        }

        self.wait_not_busy()?;

        // Non-ATA devices (ATAPI, SATA bridges) set the LBA mid/high
        // signature registers.
        // SAFETY: Reading signature registers on the probed channel.
        let (mid, high) = unsafe {
            (
                inb(self.io_base + REG_LBA_MID),
                inb(self.io_base + REG_LBA_HIGH),
            )
        };
        if mid != 0 || high != 0 {
            return Err(KernelError::DeviceAbsent { device: "ata" });
        }

        self.wait_data_request()?;

        // Drain all 256 IDENTIFY words.
        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            // SAFETY: DRQ is set; the drive expects exactly 256 data reads.
            *word = unsafe { inw(self.io_base + REG_DATA) };
        }

        self.sectors = (identify[60] as u32) | ((identify[61] as u32) << 16);
        for (i, word) in identify[27..47].iter().enumerate() {
            self.model[i * 2] = (word >> 8) as u8;
            self.model[i * 2 + 1] = (word & 0xFF) as u8;
        }

        Ok(())
    }

    /// Program the task file for an LBA-28 transfer and issue `command`.
    fn start_transfer(&self, lba: u32, count: u8, command: u8) -> KernelResult<()> {
        self.wait_not_busy()?;
        // SAFETY: Standard LBA-28 task-file programming on a channel this
        // driver owns.
        unsafe {
            outb(self.io_base + REG_DRIVE_SELECT, drive_select_byte(lba));
            outb(self.io_base + REG_SECTOR_COUNT, count);
            outb(self.io_base + REG_LBA_LOW, (lba & 0xFF) as u8);
            outb(self.io_base + REG_LBA_MID, ((lba >> 8) & 0xFF) as u8);
            outb(self.io_base + REG_LBA_HIGH, ((lba >> 16) & 0xFF) as u8);
            outb(self.io_base + REG_COMMAND, command);
        }
        Ok(())
    }

    /// Read `count` sectors (0 reads one) starting at `lba` into `buf`.
    pub fn read_sectors(&self, lba: u32, count: u8, buf: &mut [u8]) -> KernelResult<()> {
        let sectors = effective_count(count);
        if buf.len() < sectors * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }

        self.start_transfer(lba, sectors as u8, CMD_READ_PIO)?;

        for sector in 0..sectors {
            self.wait_data_request()?;
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                // SAFETY: DRQ is set; the drive expects 256 data-port reads
                // per sector.
                let word = unsafe { inw(self.io_base + REG_DATA) };
                buf[base + i * 2] = (word & 0xFF) as u8;
                buf[base + i * 2 + 1] = (word >> 8) as u8;
            }
        }

        Ok(())
    }

    /// Write `count` sectors (0 writes one) starting at `lba` from `buf`.
    pub fn write_sectors(&self, lba: u32, count: u8, buf: &[u8]) -> KernelResult<()> {
        let sectors = effective_count(count);
        if buf.len() < sectors * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }

        self.start_transfer(lba, sectors as u8, CMD_WRITE_PIO)?;

        for sector in 0..sectors {
            self.wait_data_request()?;
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word =
                    (buf[base + i * 2] as u16) | ((buf[base + i * 2 + 1] as u16) << 8);
                // SAFETY: DRQ is set; the drive expects 256 data-port
                // writes per sector.
                unsafe { outw(self.io_base + REG_DATA, word) };
            }
        }

        self.wait_not_busy()?;
        let status = self.status();
        if status.intersects(AtaStatus::ERR | AtaStatus::DF) {
            return Err(KernelError::HardwareError {
                device: "ata",
                code: status.bits() as u32,
            });
        }

        Ok(())
    }

    /// Addressable LBA-28 sectors.
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    /// IDENTIFY model string, trimmed.
    pub fn model(&self) -> &str {
        core::str::from_utf8(&self.model).unwrap_or("").trim_end()
    }
}

/// The probed drive, if any. Dormant (None) when both channels float.
static ATA: RwLock<Option<AtaDrive>> = RwLock::new(None);

/// Probe the primary channel, falling back to the secondary; a floating
/// bus (status 0xFF) on both leaves the driver absent.
pub fn init() {
    for (io_base, ctrl_base) in [
        (PRIMARY_IO_BASE, PRIMARY_CTRL_BASE),
        (SECONDARY_IO_BASE, SECONDARY_CTRL_BASE),
    ] {
        // SAFETY: Reading the status register of a possibly-absent channel
        // is harmless; a floating bus reads 0xFF.
        let probe = unsafe { inb(io_base + REG_STATUS) };
        if probe == 0xFF {
            continue;
        }

        let mut drive = AtaDrive {
            io_base,
            ctrl_base,
            sectors: 0,
            model: [b' '; 40],
        };
        drive.soft_reset();
        match drive.identify() {
            Ok(()) => {
                println!(
                    "[ATA] {} channel: {} ({} sectors)",
                    if io_base == PRIMARY_IO_BASE { "primary" } else { "secondary" },
                    drive.model(),
                    drive.sectors()
                );
                *ATA.write() = Some(drive);
                return;
            }
            Err(e) => {
                log::warn!("ata identify failed on {:#x}: {}", io_base, e);
            }
        }
    }

    println!("[ATA] no drive present");
}

/// Whether a drive answered IDENTIFY at boot.
pub fn is_present() -> bool {
    ATA.read().is_some()
}

pub fn read_sectors(lba: u32, count: u8, buf: &mut [u8]) -> KernelResult<()> {
    match &*ATA.read() {
        Some(drive) => drive.read_sectors(lba, count, buf),
        None => Err(KernelError::DeviceAbsent { device: "ata" }),
    }
}

pub fn write_sectors(lba: u32, count: u8, buf: &[u8]) -> KernelResult<()> {
    match &*ATA.read() {
        Some(drive) => drive.write_sectors(lba, count, buf),
        None => Err(KernelError::DeviceAbsent { device: "ata" }),
    }
}

/// `(model, sectors)` of the probed drive, for the shell.
pub fn info() -> Option<(alloc::string::String, u32)> {
    ATA.read()
        .as_ref()
        .map(|d| (alloc::string::String::from(d.model()), d.sectors()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_select_places_high_lba_bits() {
        assert_eq!(drive_select_byte(0), 0xE0);
        assert_eq!(drive_select_byte(0x0F00_0000), 0xEF);
        // Bits above 27 never leak into the select byte.
        assert_eq!(drive_select_byte(0xF000_0000), 0xE0);
    }

    #[test]
    fn zero_count_means_one_sector() {
        assert_eq!(effective_count(0), 1);
        assert_eq!(effective_count(1), 1);
        assert_eq!(effective_count(255), 255);
    }

    #[test]
    fn absent_drive_fails_operations() {
        // The global starts dormant; operations must report device-absent.
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            read_sectors(0, 1, &mut buf),
            Err(KernelError::DeviceAbsent { device: "ata" })
        );
        assert_eq!(
            write_sectors(0, 1, &buf),
            Err(KernelError::DeviceAbsent { device: "ata" })
        );
        assert!(!is_present());
    }
}
