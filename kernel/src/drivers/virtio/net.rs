//! Virtio legacy network driver
//!
//! Transitional virtio-pci NIC bring-up over the legacy I/O-port transport:
//! two virtqueues (RX = 0, TX = 1) published to the device as page frame
//! numbers, pre-allocated per-slot DMA buffers, and a 10-byte virtio-net
//! header in front of every frame. The device is located via PCI and the
//! subsystem stays dormant when it is absent.
//!
//! Frames cross this layer raw; byte-order conversion above the link layer
//! is the caller's business.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use super::queue::{VirtQueue, VIRTQ_DESC_F_WRITE};
use crate::drivers::pci;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{FRAME_ALLOCATOR, FRAME_SIZE};

/// PCI identity of a transitional virtio network card.
const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
const VIRTIO_NET_DEVICE_ID: u16 = 0x1000;

// Legacy transport register offsets from the BAR0 I/O base.
const REG_HOST_FEATURES: u16 = 0x00;
const REG_GUEST_FEATURES: u16 = 0x04;
const REG_QUEUE_PFN: u16 = 0x08;
const REG_QUEUE_SIZE: u16 = 0x0C;
const REG_QUEUE_SELECT: u16 = 0x0E;
const REG_QUEUE_NOTIFY: u16 = 0x10;
const REG_DEVICE_STATUS: u16 = 0x12;
const REG_CONFIG_MAC: u16 = 0x14;

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;

bitflags! {
    /// Device-status register bits, driven through the bring-up sequence.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const FAILED = 0x80;
    }
}

/// Length of the virtio-net header prepended to every frame.
pub const NET_HDR_LEN: usize = 10;

/// Per-slot DMA buffer size: header + a full Ethernet frame, sized so two
/// buffers tile a page.
const PACKET_BUF_SIZE: usize = 2048;

/// Largest frame a caller may hand to `send`.
pub const MAX_FRAME_LEN: usize = PACKET_BUF_SIZE - NET_HDR_LEN;

/// Virtio-net header. Sent zeroed: no checksum offload or GSO is
/// negotiated.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VirtioNetHeader {
    flags: u8,
    gso_type: u8,
    hdr_len: u16,
    gso_size: u16,
    csum_start: u16,
    csum_offset: u16,
}

const _: () = assert!(core::mem::size_of::<VirtioNetHeader>() == NET_HDR_LEN);

/// A MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// The legacy register file on BAR0.
struct Transport {
    io_base: u16,
}

impl Transport {
    fn read_status(&self) -> DeviceStatus {
        // SAFETY: The status register on BAR0 belongs to this driver.
        DeviceStatus::from_bits_truncate(unsafe {
            crate::arch::x86_64::inb(self.io_base + REG_DEVICE_STATUS)
        })
    }

    fn write_status(&self, status: DeviceStatus) {
        // SAFETY: The status register on BAR0 belongs to this driver.
        unsafe { crate::arch::x86_64::outb(self.io_base + REG_DEVICE_STATUS, status.bits()) }
    }

    fn read_reg16(&self, reg: u16) -> u16 {
        // SAFETY: BAR0 registers belong to this driver.
        unsafe { crate::arch::x86_64::inw(self.io_base + reg) }
    }

    fn write_reg16(&self, reg: u16, value: u16) {
        // SAFETY: BAR0 registers belong to this driver.
        unsafe { crate::arch::x86_64::outw(self.io_base + reg, value) }
    }

    fn read_reg32(&self, reg: u16) -> u32 {
        // SAFETY: BAR0 registers belong to this driver.
        unsafe { crate::arch::x86_64::inl(self.io_base + reg) }
    }

    fn write_reg32(&self, reg: u16, value: u32) {
        // SAFETY: BAR0 registers belong to this driver.
        unsafe { crate::arch::x86_64::outl(self.io_base + reg, value) }
    }

    /// Ring the doorbell for `queue`.
    fn notify(&self, queue: u16) {
        self.write_reg16(REG_QUEUE_NOTIFY, queue);
    }

    /// Select `index`, read its size hint, and hand the device the ring's
    /// page frame number.
    fn setup_queue(&self, index: u16) -> KernelResult<VirtQueue> {
        self.write_reg16(REG_QUEUE_SELECT, index);
        let size_hint = self.read_reg16(REG_QUEUE_SIZE);
        let queue = VirtQueue::new(size_hint)?;
        self.write_reg32(REG_QUEUE_PFN, queue.pfn());
        Ok(queue)
    }

    /// The MAC sits at the start of the device-specific config region.
    fn read_mac(&self) -> MacAddress {
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            // SAFETY: The config region on BAR0 belongs to this driver.
            *byte = unsafe { crate::arch::x86_64::inb(self.io_base + REG_CONFIG_MAC + i as u16) };
        }
        MacAddress(mac)
    }
}

/// Per-queue slot buffers: one contiguous, identity-mapped allocation
/// carved into `PACKET_BUF_SIZE` pieces.
struct SlotBuffers {
    base: u64,
    count: u16,
}

impl SlotBuffers {
    fn new(count: u16) -> KernelResult<Self> {
        let bytes = count as usize * PACKET_BUF_SIZE;
        let frames = bytes.div_ceil(FRAME_SIZE);
        let base = FRAME_ALLOCATOR
            .alloc_pages(frames)
            .ok_or(KernelError::OutOfMemory { requested: bytes })?;
        Ok(Self {
            base: base.as_u64(),
            count,
        })
    }

    /// Device-visible physical address of a slot's buffer.
    fn phys(&self, slot: u16) -> u64 {
        debug_assert!(slot < self.count);
        self.base + (slot as usize * PACKET_BUF_SIZE) as u64
    }

    /// CPU pointer to a slot's buffer (identity mapping).
    fn ptr(&self, slot: u16) -> *mut u8 {
        self.phys(slot) as *mut u8
    }
}

/// The NIC once brought up.
pub struct VirtioNet {
    transport: Transport,
    mac: MacAddress,
    rx: VirtQueue,
    tx: VirtQueue,
    rx_buffers: SlotBuffers,
    tx_buffers: SlotBuffers,
    /// TX slots not currently owned by the device. Refilled from the TX
    /// used ring before each send so a slot is never reused in flight.
    tx_free: Vec<u16>,
    tx_packets: u64,
    rx_packets: u64,
}

// SAFETY: The raw DMA buffer pointers target memory owned by this driver;
// the global handle serializes access behind a Mutex.
unsafe impl Send for VirtioNet {}

impl VirtioNet {
    /// Legacy bring-up: reset, acknowledge, negotiate no features, build
    /// and publish both queues, seed RX, read the MAC, set DRIVER_OK.
    fn bring_up(io_base: u16) -> KernelResult<Self> {
        let transport = Transport { io_base };

        transport.write_status(DeviceStatus::empty());
        transport.write_status(DeviceStatus::ACKNOWLEDGE);
        transport.write_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);

        // Read the host feature bitmap for the record; this driver
        // negotiates no optional features.
        let host_features = transport.read_reg32(REG_HOST_FEATURES);
        log::info!("virtio-net host features {:#010x}", host_features);
        transport.write_reg32(REG_GUEST_FEATURES, 0);

        let mut rx = transport.setup_queue(QUEUE_RX)?;
        let tx = transport.setup_queue(QUEUE_TX)?;
        let rx_buffers = SlotBuffers::new(rx.size())?;
        let tx_buffers = SlotBuffers::new(tx.size())?;

        // Every TX slot starts host-owned; popping yields slot 0 first.
        let tx_free: Vec<u16> = (0..tx.size()).rev().collect();

        // Seed the whole RX ring with device-writable buffers.
        for slot in 0..rx.size() {
            let addr = rx_buffers.phys(slot);
            rx.write_desc(slot, addr, PACKET_BUF_SIZE as u32, VIRTQ_DESC_F_WRITE);
            rx.push_avail(slot);
        }
        transport.notify(QUEUE_RX);

        let mac = transport.read_mac();

        let status = transport.read_status() | DeviceStatus::DRIVER_OK;
        transport.write_status(status);

        Ok(Self {
            transport,
            mac,
            rx,
            tx,
            rx_buffers,
            tx_buffers,
            tx_free,
            tx_packets: 0,
            rx_packets: 0,
        })
    }

    /// Reclaim TX slots the device has finished with.
    fn reclaim_tx(&mut self) {
        while let Some(elem) = self.tx.pop_used() {
            let slot = elem.id as u16;
            if slot < self.tx.size() {
                self.tx_free.push(slot);
            }
        }
    }

    /// Queue one Ethernet frame for transmission.
    ///
    /// Fails with `WouldBlock` when every TX slot is still owned by the
    /// device.
    pub fn send(&mut self, frame: &[u8]) -> KernelResult<()> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            return Err(KernelError::InvalidArgument { name: "frame" });
        }

        self.reclaim_tx();
        let Some(slot) = self.tx_free.pop() else {
            return Err(KernelError::WouldBlock);
        };

        let buf = self.tx_buffers.ptr(slot);
        // SAFETY: The slot buffer is PACKET_BUF_SIZE bytes of driver-owned
        // DMA memory and frame.len() + NET_HDR_LEN fits (checked above).
        unsafe {
            core::ptr::write_bytes(buf, 0, NET_HDR_LEN);
            core::ptr::copy_nonoverlapping(frame.as_ptr(), buf.add(NET_HDR_LEN), frame.len());
        }

        self.tx.write_desc(
            slot,
            self.tx_buffers.phys(slot),
            (NET_HDR_LEN + frame.len()) as u32,
            0,
        );
        self.tx.push_avail(slot);
        self.transport.notify(QUEUE_TX);
        self.tx_packets += 1;

        #[cfg(feature = "net_debug")]
        log::debug!("virtio-net tx slot {} len {}", slot, frame.len());

        Ok(())
    }

    /// Poll the RX used ring for one frame.
    ///
    /// Returns `None` when nothing arrived. A slot shorter than the
    /// virtio-net header counts as zero bytes received; either way the
    /// slot goes straight back onto the RX available ring.
    pub fn receive(&mut self, buf: &mut [u8]) -> Option<usize> {
        let elem = self.rx.pop_used()?;
        let slot = elem.id as u16;
        if slot >= self.rx.size() {
            return Some(0);
        }

        let total = elem.len as usize;
        let copied = if total > NET_HDR_LEN {
            let payload = core::cmp::min(total - NET_HDR_LEN, buf.len());
            // SAFETY: The device wrote `total` bytes into this driver-owned
            // slot buffer; we copy at most what fits the caller's buffer.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.rx_buffers.ptr(slot).add(NET_HDR_LEN),
                    buf.as_mut_ptr(),
                    payload,
                );
            }
            self.rx_packets += 1;
            payload
        } else {
            0
        };

        // Hand the slot back to the device.
        self.rx.write_desc(
            slot,
            self.rx_buffers.phys(slot),
            PACKET_BUF_SIZE as u32,
            VIRTQ_DESC_F_WRITE,
        );
        self.rx.push_avail(slot);
        self.transport.notify(QUEUE_RX);

        #[cfg(feature = "net_debug")]
        log::debug!("virtio-net rx slot {} len {}", slot, copied);

        Some(copied)
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// `(tx_packets, rx_packets)` counters, for the shell.
    pub fn packet_counts(&self) -> (u64, u64) {
        (self.tx_packets, self.rx_packets)
    }
}

/// The NIC handle; dormant (None) when the device is absent or bring-up
/// failed.
static NET: Mutex<Option<VirtioNet>> = Mutex::new(None);

/// Locate the transitional NIC on PCI and bring it up.
pub fn init() {
    let Some(device) = pci::find_by_id(VIRTIO_VENDOR_ID, VIRTIO_NET_DEVICE_ID) else {
        println!("[NET] no virtio network card");
        return;
    };

    let Some(io_base) = device.bars[0].io_address() else {
        log::warn!("virtio-net BAR0 is not an I/O aperture");
        return;
    };

    pci::enable_bus_master(&device);

    match VirtioNet::bring_up(io_base as u16) {
        Ok(nic) => {
            println!(
                "[NET] virtio-net up, mac {} (rx {} / tx {} slots)",
                nic.mac(),
                nic.rx.size(),
                nic.tx.size()
            );
            *NET.lock() = Some(nic);
        }
        Err(e) => {
            log::warn!("virtio-net bring-up failed: {}", e);
        }
    }
}

/// Whether the NIC completed bring-up.
pub fn is_initialized() -> bool {
    NET.lock().is_some()
}

pub fn send(frame: &[u8]) -> KernelResult<()> {
    match &mut *NET.lock() {
        Some(nic) => nic.send(frame),
        None => Err(KernelError::DeviceAbsent {
            device: "virtio-net",
        }),
    }
}

/// Non-blocking receive; `None` when no frame is pending.
pub fn receive(buf: &mut [u8]) -> Option<usize> {
    NET.lock().as_mut().and_then(|nic| nic.receive(buf))
}

pub fn mac() -> Option<MacAddress> {
    NET.lock().as_ref().map(|nic| nic.mac())
}

pub fn packet_counts() -> Option<(u64, u64)> {
    NET.lock().as_ref().map(|nic| nic.packet_counts())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_header_is_ten_bytes() {
        assert_eq!(core::mem::size_of::<VirtioNetHeader>(), NET_HDR_LEN);
        let hdr = VirtioNetHeader::default();
        assert_eq!(hdr.flags, 0);
        assert_eq!(hdr.gso_type, 0);
    }

    #[test]
    fn slot_buffers_tile_pages() {
        assert_eq!(FRAME_SIZE % PACKET_BUF_SIZE, 0);
        assert!(MAX_FRAME_LEN >= 1514);
    }

    #[test]
    fn mac_formats_as_colon_hex() {
        let mac = MacAddress([0x52, 0x54, 0x00, 0xab, 0x0c, 0x01]);
        assert_eq!(alloc::format!("{}", mac), "52:54:00:ab:0c:01");
    }

    #[test]
    fn absent_device_reports_dormant() {
        assert!(!is_initialized());
        assert_eq!(
            send(&[0u8; 60]),
            Err(KernelError::DeviceAbsent {
                device: "virtio-net"
            })
        );
        let mut buf = [0u8; 64];
        assert_eq!(receive(&mut buf), None);
        assert_eq!(mac(), None);
    }
}
