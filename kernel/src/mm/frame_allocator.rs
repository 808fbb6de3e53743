//! Physical frame allocator
//!
//! Bitmap allocator over a fixed physical window in 4 KiB frames. Bit *i*
//! covers frame `WINDOW_BASE + i * 4096`; a set bit means allocated.
//! Frames outside the window are invisible to the allocator. Supports
//! single and contiguous multi-frame allocation; all scans are first-fit
//! and O(window), which is acceptable for boot-time allocations.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Base of the allocatable physical window (16 MiB). The kernel image,
/// boot page tables, and heap region all live below it; the identity map
/// built at boot covers the whole window.
pub const WINDOW_BASE: u64 = 16 * 1024 * 1024;

/// Size of the allocatable window (48 MiB), ending at the 64 MiB identity
/// map limit.
pub const WINDOW_SIZE: u64 = 48 * 1024 * 1024;

/// Number of frames the bitmap tracks.
pub const TOTAL_FRAMES: usize = (WINDOW_SIZE as usize) / FRAME_SIZE;

const BITMAP_WORDS: usize = TOTAL_FRAMES / 64;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }
}

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Statistics for the frame allocator
#[derive(Debug, Clone, Copy)]
pub struct FrameAllocatorStats {
    pub total_frames: usize,
    pub free_frames: usize,
}

/// Bitmap allocator over the fixed physical window.
pub struct BitmapFrameAllocator {
    /// Bitmap tracking frames (0 = free, 1 = allocated)
    bitmap: Mutex<[u64; BITMAP_WORDS]>,
    /// Base physical address of the window
    base: u64,
    /// Total frames managed
    total_frames: usize,
    /// Free frame count, kept equal to the number of cleared bits
    free_frames: AtomicUsize,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: Mutex::new([0; BITMAP_WORDS]),
            base: WINDOW_BASE,
            total_frames: TOTAL_FRAMES,
            free_frames: AtomicUsize::new(TOTAL_FRAMES),
        }
    }

    /// Allocate a single 4 KiB frame.
    pub fn alloc_page(&self) -> Option<PhysicalAddress> {
        self.alloc_pages(1)
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// Returns the address of the first frame, or `None` when `count` is 0
    /// or no run of `count` free frames exists. Never partially allocates.
    pub fn alloc_pages(&self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 || count > self.total_frames {
            return None;
        }

        let mut bitmap = self.bitmap.lock();

        let mut consecutive = 0;
        let mut start_bit = 0;

        for bit in 0..self.total_frames {
            if bitmap[bit / 64] & (1 << (bit % 64)) == 0 {
                if consecutive == 0 {
                    start_bit = bit;
                }
                consecutive += 1;
                if consecutive == count {
                    for i in start_bit..start_bit + count {
                        bitmap[i / 64] |= 1 << (i % 64);
                    }
                    self.free_frames.fetch_sub(count, Ordering::Release);
                    return Some(PhysicalAddress::new(
                        self.base + (start_bit * FRAME_SIZE) as u64,
                    ));
                }
            } else {
                consecutive = 0;
            }
        }

        None
    }

    /// Free a single frame.
    ///
    /// Out-of-window, misaligned, or already-free addresses are silently
    /// ignored.
    pub fn free_page(&self, addr: PhysicalAddress) {
        let a = addr.as_u64();
        if a % FRAME_SIZE as u64 != 0 {
            return;
        }
        if a < self.base || a >= self.base + (self.total_frames * FRAME_SIZE) as u64 {
            return;
        }

        let bit = ((a - self.base) / FRAME_SIZE as u64) as usize;
        let mut bitmap = self.bitmap.lock();
        if bitmap[bit / 64] & (1 << (bit % 64)) != 0 {
            bitmap[bit / 64] &= !(1 << (bit % 64));
            self.free_frames.fetch_add(1, Ordering::Release);
        }
    }

    /// Free `count` frames starting at `addr`.
    pub fn free_pages(&self, addr: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.free_page(PhysicalAddress::new(addr.as_u64() + (i * FRAME_SIZE) as u64));
        }
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        FrameAllocatorStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames.load(Ordering::Acquire),
        }
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator, covering `[WINDOW_BASE, WINDOW_BASE + WINDOW_SIZE)`.
pub static FRAME_ALLOCATOR: BitmapFrameAllocator = BitmapFrameAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_alloc_is_aligned_and_in_window() {
        let alloc = BitmapFrameAllocator::new();
        let addr = alloc.alloc_page().expect("fresh allocator must have frames");
        assert_eq!(addr.as_u64() % FRAME_SIZE as u64, 0);
        assert!(addr.as_u64() >= WINDOW_BASE);
        assert!(addr.as_u64() < WINDOW_BASE + WINDOW_SIZE);
        assert_eq!(alloc.stats().free_frames, TOTAL_FRAMES - 1);
    }

    #[test]
    fn free_restores_count() {
        let alloc = BitmapFrameAllocator::new();
        let before = alloc.stats().free_frames;
        let addr = alloc.alloc_page().unwrap();
        alloc.free_page(addr);
        assert_eq!(alloc.stats().free_frames, before);
    }

    #[test]
    fn contiguous_runs_are_first_fit() {
        let alloc = BitmapFrameAllocator::new();
        let a = alloc.alloc_pages(4).unwrap();
        assert_eq!(a.as_u64(), WINDOW_BASE);
        let b = alloc.alloc_pages(4).unwrap();
        assert_eq!(b.as_u64(), WINDOW_BASE + 4 * FRAME_SIZE as u64);
        alloc.free_pages(a, 4);
        let c = alloc.alloc_pages(4).unwrap();
        assert_eq!(c.as_u64(), WINDOW_BASE);
    }

    #[test]
    fn short_runs_are_skipped() {
        let alloc = BitmapFrameAllocator::new();
        // Allocate everything, then punch a 3-frame hole and a 4-frame hole.
        let base = alloc.alloc_pages(TOTAL_FRAMES).unwrap();
        assert!(alloc.alloc_page().is_none());
        let hole3 = PhysicalAddress::new(base.as_u64() + 10 * FRAME_SIZE as u64);
        let hole4 = PhysicalAddress::new(base.as_u64() + 100 * FRAME_SIZE as u64);
        alloc.free_pages(hole3, 3);
        alloc.free_pages(hole4, 4);
        // A 4-frame request must skip the 3-frame hole.
        let got = alloc.alloc_pages(4).unwrap();
        assert_eq!(got.as_u64(), hole4.as_u64());
        // And a 5-frame request cannot be satisfied at all.
        assert!(alloc.alloc_pages(5).is_none());
    }

    #[test]
    fn zero_and_oversize_requests_fail() {
        let alloc = BitmapFrameAllocator::new();
        assert!(alloc.alloc_pages(0).is_none());
        assert!(alloc.alloc_pages(TOTAL_FRAMES + 1).is_none());
        assert_eq!(alloc.stats().free_frames, TOTAL_FRAMES);
    }

    #[test]
    fn invalid_free_is_ignored() {
        let alloc = BitmapFrameAllocator::new();
        let before = alloc.stats().free_frames;
        // Out of window, misaligned, and not-allocated frees are all no-ops.
        alloc.free_page(PhysicalAddress::new(0x1000));
        alloc.free_page(PhysicalAddress::new(WINDOW_BASE + 1));
        alloc.free_page(PhysicalAddress::new(WINDOW_BASE));
        assert_eq!(alloc.stats().free_frames, before);
    }

    #[test]
    fn double_free_is_ignored() {
        let alloc = BitmapFrameAllocator::new();
        let addr = alloc.alloc_page().unwrap();
        alloc.free_page(addr);
        alloc.free_page(addr);
        assert_eq!(alloc.stats().free_frames, TOTAL_FRAMES);
    }
}
