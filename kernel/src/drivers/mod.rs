//! Platform device drivers
//!
//! PCI enumeration feeds the virtio NIC; the ATA and keyboard drivers sit
//! directly on their legacy ports. Probe failures leave the affected
//! subsystem dormant rather than failing the boot.

pub mod ata;
pub mod keyboard;
pub mod pci;
pub mod virtio;

/// Bring up the device layer. Requires the heap (registries allocate) and
/// the IDT (the keyboard registers its vector); interrupts stay disabled
/// until the caller enables them.
pub fn init() {
    pci::init();
    ata::init();
    keyboard::init();
    virtio::net::init();
}
