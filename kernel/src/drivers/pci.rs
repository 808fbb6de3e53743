//! PCI Bus Driver
//!
//! Configuration-space enumeration over the classical address/data port
//! pair at 0xCF8/0xCFC. Present functions are captured once at boot into a
//! fixed-capacity registry; lookups are linear over vendor/device or
//! class/subclass.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;

/// PCI configuration space registers
#[repr(u16)]
#[allow(dead_code)]
pub enum PciConfigRegister {
    VendorId = 0x00,
    DeviceId = 0x02,
    Command = 0x04,
    Status = 0x06,
    RevisionId = 0x08,
    ProgIf = 0x09,
    Subclass = 0x0A,
    ClassCode = 0x0B,
    HeaderType = 0x0E,
    Bar0 = 0x10,
    InterruptLine = 0x3C,
    InterruptPin = 0x3D,
}

/// PCI class codes
#[allow(dead_code)]
pub mod class_codes {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const BRIDGE: u8 = 0x06;
    pub const SERIAL_BUS: u8 = 0x0C;
}

/// PCI command register flags
#[allow(dead_code)]
pub mod command_flags {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// Registry capacity; enumeration stops capturing past this many functions.
const MAX_DEVICES: usize = 32;

/// PCI device location
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciLocation {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Convert to a configuration address for port 0xCF8 (enable bit set,
    /// register offset still zero).
    pub fn to_config_address(&self) -> u32 {
        0x8000_0000 | ((self.bus as u32) << 16) | ((self.device as u32) << 11) | ((self.function as u32) << 8)
    }
}

/// PCI Base Address Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    Memory {
        address: u64,
        size: u64,
        prefetchable: bool,
        is_64bit: bool,
    },
    Io {
        address: u32,
        size: u32,
    },
    None,
}

impl PciBar {
    /// Get the I/O port base if this is an I/O BAR (space bit already
    /// masked off).
    pub fn io_address(&self) -> Option<u32> {
        match self {
            PciBar::Io { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub fn memory_address(&self) -> Option<u64> {
        match self {
            PciBar::Memory { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// PCI device record captured at enumeration
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub bars: [PciBar; 6],
}

impl PciDevice {
    fn new(location: PciLocation) -> Self {
        Self {
            location,
            vendor_id: 0,
            device_id: 0,
            class_code: 0,
            subclass: 0,
            prog_if: 0,
            revision: 0,
            header_type: 0,
            interrupt_line: 0,
            interrupt_pin: 0,
            bars: [PciBar::None; 6],
        }
    }

    /// Check if device is multifunction
    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }
}

/// PCI bus with its device registry
pub struct PciBus {
    /// Discovered PCI functions, populated once
    devices: RwLock<Vec<PciDevice>>,
    /// Device enumeration complete
    enumerated: AtomicBool,
}

impl PciBus {
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            enumerated: AtomicBool::new(false),
        }
    }

    /// Enumerate all PCI functions into the registry.
    pub fn enumerate(&self) {
        if self.enumerated.load(Ordering::Acquire) {
            return;
        }

        let mut count = 0;
        for bus in 0..=255u8 {
            for device in 0..32u8 {
                let location = PciLocation::new(bus, device, 0);
                let Some(mut pci_device) = self.probe_device(location) else {
                    continue;
                };
                self.read_device_config(&mut pci_device);
                let multifunction = pci_device.is_multifunction();

                println!(
                    "[PCI] {:02x}:{:02x}.{} {:04x}:{:04x} (class {:02x}.{:02x})",
                    bus, device, 0, pci_device.vendor_id, pci_device.device_id,
                    pci_device.class_code, pci_device.subclass
                );
                if self.capture(pci_device) {
                    count += 1;
                }

                if multifunction {
                    for function in 1..8u8 {
                        let location = PciLocation::new(bus, device, function);
                        let Some(mut func_device) = self.probe_device(location) else {
                            continue;
                        };
                        self.read_device_config(&mut func_device);
                        println!(
                            "[PCI] {:02x}:{:02x}.{} {:04x}:{:04x} (class {:02x}.{:02x})",
                            bus, device, function, func_device.vendor_id, func_device.device_id,
                            func_device.class_code, func_device.subclass
                        );
                        if self.capture(func_device) {
                            count += 1;
                        }
                    }
                }
            }
        }

        self.enumerated.store(true, Ordering::Release);
        println!("[PCI] Enumeration complete: {} devices", count);
    }

    fn capture(&self, device: PciDevice) -> bool {
        let mut devices = self.devices.write();
        if devices.len() >= MAX_DEVICES {
            log::warn!("pci registry full, dropping {:04x}:{:04x}", device.vendor_id, device.device_id);
            return false;
        }
        devices.push(device);
        true
    }

    /// Probe for a function at `location`; a vendor ID of 0xFFFF means
    /// nothing answered.
    fn probe_device(&self, location: PciLocation) -> Option<PciDevice> {
        let vendor_id = self.read_config_word(location, PciConfigRegister::VendorId as u16);
        if vendor_id == 0xFFFF {
            return None;
        }

        let mut device = PciDevice::new(location);
        device.vendor_id = vendor_id;
        device.device_id = self.read_config_word(location, PciConfigRegister::DeviceId as u16);
        Some(device)
    }

    /// Read the remaining configuration fields of a probed function.
    fn read_device_config(&self, device: &mut PciDevice) {
        let location = device.location;

        device.class_code = self.read_config_byte(location, PciConfigRegister::ClassCode as u16);
        device.subclass = self.read_config_byte(location, PciConfigRegister::Subclass as u16);
        device.prog_if = self.read_config_byte(location, PciConfigRegister::ProgIf as u16);
        device.revision = self.read_config_byte(location, PciConfigRegister::RevisionId as u16);
        device.header_type = self.read_config_byte(location, PciConfigRegister::HeaderType as u16);
        device.interrupt_line =
            self.read_config_byte(location, PciConfigRegister::InterruptLine as u16);
        device.interrupt_pin =
            self.read_config_byte(location, PciConfigRegister::InterruptPin as u16);

        // Only standard (type 0) headers carry 6 BARs.
        if device.header_type & 0x7F == 0 {
            self.read_bars(location, &mut device.bars);
        }
    }

    /// Decode the six Base Address Registers, sizing each by the
    /// write-all-ones probe.
    fn read_bars(&self, location: PciLocation, bars: &mut [PciBar; 6]) {
        let mut bar_index = 0;
        while bar_index < 6 {
            let bar_offset = PciConfigRegister::Bar0 as u16 + (bar_index * 4) as u16;
            let bar_value = self.read_config_dword(location, bar_offset);

            if bar_value == 0 {
                bars[bar_index] = PciBar::None;
                bar_index += 1;
                continue;
            }

            if bar_value & 1 == 0 {
                // Memory BAR
                let is_64bit = (bar_value >> 1) & 3 == 2;
                let prefetchable = (bar_value >> 3) & 1 != 0;

                self.write_config_dword(location, bar_offset, 0xFFFF_FFFF);
                let size_mask = self.read_config_dword(location, bar_offset);
                self.write_config_dword(location, bar_offset, bar_value);

                let size = (!(size_mask & 0xFFFF_FFF0)).wrapping_add(1);
                let mut address = (bar_value & 0xFFFF_FFF0) as u64;

                if is_64bit && bar_index + 1 < 6 {
                    let upper = self.read_config_dword(location, bar_offset + 4);
                    address |= (upper as u64) << 32;

                    bars[bar_index] = PciBar::Memory {
                        address,
                        size: size as u64,
                        prefetchable,
                        is_64bit: true,
                    };
                    bars[bar_index + 1] = PciBar::None; // upper half
                    bar_index += 2;
                } else {
                    bars[bar_index] = PciBar::Memory {
                        address,
                        size: size as u64,
                        prefetchable,
                        is_64bit: false,
                    };
                    bar_index += 1;
                }
            } else {
                // I/O BAR: mask off the space bit
                self.write_config_dword(location, bar_offset, 0xFFFF_FFFF);
                let size_mask = self.read_config_dword(location, bar_offset);
                self.write_config_dword(location, bar_offset, bar_value);

                bars[bar_index] = PciBar::Io {
                    address: bar_value & 0xFFFF_FFFC,
                    size: (!(size_mask & 0xFFFF_FFFC)).wrapping_add(1),
                };
                bar_index += 1;
            }
        }
    }

    /// Read configuration byte
    fn read_config_byte(&self, location: PciLocation, offset: u16) -> u8 {
        let dword = self.read_config_dword(location, offset & !3);
        ((dword >> ((offset & 3) * 8)) & 0xFF) as u8
    }

    /// Read configuration word
    fn read_config_word(&self, location: PciLocation, offset: u16) -> u16 {
        let dword = self.read_config_dword(location, offset & !3);
        ((dword >> ((offset & 3) * 8)) & 0xFFFF) as u16
    }

    /// Read configuration dword
    fn read_config_dword(&self, location: PciLocation, offset: u16) -> u32 {
        let address = location.to_config_address() | (offset as u32 & 0xFC);

        // SAFETY: The 0xCF8/0xCFC pair is the architected configuration
        // access mechanism; the address always has the enable bit set and
        // a dword-aligned offset.
        unsafe {
            crate::arch::x86_64::outl(0xCF8, address);
            crate::arch::x86_64::inl(0xCFC)
        }
    }

    /// Write configuration dword
    fn write_config_dword(&self, location: PciLocation, offset: u16, value: u32) {
        let address = location.to_config_address() | (offset as u32 & 0xFC);

        // SAFETY: Same mechanism as read_config_dword; writes target
        // registers owned by this driver (BAR sizing, command register).
        unsafe {
            crate::arch::x86_64::outl(0xCF8, address);
            crate::arch::x86_64::outl(0xCFC, value);
        }
    }

    /// First function matching `(vendor_id, device_id)`.
    pub fn find_by_id(&self, vendor_id: u16, device_id: u16) -> Option<PciDevice> {
        self.devices
            .read()
            .iter()
            .find(|dev| dev.vendor_id == vendor_id && dev.device_id == device_id)
            .copied()
    }

    /// First function matching `(class_code, subclass)`.
    pub fn find_by_class(&self, class_code: u8, subclass: u8) -> Option<PciDevice> {
        self.devices
            .read()
            .iter()
            .find(|dev| dev.class_code == class_code && dev.subclass == subclass)
            .copied()
    }

    /// Snapshot of the whole registry.
    pub fn devices(&self) -> Vec<PciDevice> {
        self.devices.read().clone()
    }

    /// Set the bus-master bit in the function's command register so it can
    /// DMA.
    pub fn enable_bus_master(&self, location: PciLocation) {
        let current = self.read_config_dword(location, PciConfigRegister::Command as u16);
        // Keep the command half only: the status half is write-1-to-clear.
        let new = (current & 0x0000_FFFF) | command_flags::BUS_MASTER as u32;
        self.write_config_dword(location, PciConfigRegister::Command as u16, new);
    }
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Global PCI bus instance
static PCI_BUS: PciBus = PciBus::new();

/// Enumerate the bus. Called once at boot, after the heap is up.
pub fn init() {
    PCI_BUS.enumerate();
}

pub fn find_by_id(vendor_id: u16, device_id: u16) -> Option<PciDevice> {
    PCI_BUS.find_by_id(vendor_id, device_id)
}

pub fn find_by_class(class_code: u8, subclass: u8) -> Option<PciDevice> {
    PCI_BUS.find_by_class(class_code, subclass)
}

pub fn devices() -> Vec<PciDevice> {
    PCI_BUS.devices()
}

pub fn enable_bus_master(device: &PciDevice) {
    PCI_BUS.enable_bus_master(device.location);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_layout() {
        let location = PciLocation::new(1, 2, 3);
        assert_eq!(location.to_config_address(), 0x8001_1300);
        // Offsets are dword-aligned into bits 2..8 by the accessors.
        assert_eq!(location.to_config_address() | (0x3D & 0xFC), 0x8001_133C);
    }

    #[test]
    fn registry_lookups_are_stable() {
        let bus = PciBus::new();
        let mut nic = PciDevice::new(PciLocation::new(0, 3, 0));
        nic.vendor_id = 0x1AF4;
        nic.device_id = 0x1000;
        nic.class_code = class_codes::NETWORK;
        let mut disk = PciDevice::new(PciLocation::new(0, 4, 0));
        disk.vendor_id = 0x8086;
        disk.device_id = 0x7010;
        disk.class_code = class_codes::MASS_STORAGE;
        disk.subclass = 0x01;
        assert!(bus.capture(nic));
        assert!(bus.capture(disk));

        let a = bus.find_by_id(0x1AF4, 0x1000).unwrap();
        let b = bus.find_by_id(0x1AF4, 0x1000).unwrap();
        assert_eq!(a.location, b.location);
        assert_eq!(a.vendor_id, b.vendor_id);

        let c = bus.find_by_class(class_codes::MASS_STORAGE, 0x01).unwrap();
        assert_eq!(c.device_id, 0x7010);
        assert!(bus.find_by_id(0xDEAD, 0xBEEF).is_none());
    }

    #[test]
    fn registry_capacity_is_bounded() {
        let bus = PciBus::new();
        for i in 0..40u8 {
            let dev = PciDevice::new(PciLocation::new(0, i % 32, 0));
            bus.capture(dev);
        }
        assert_eq!(bus.devices().len(), MAX_DEVICES);
    }
}
