//! Memory management
//!
//! Two boot-created singletons: the bitmap physical frame allocator over
//! the fixed 16..64 MiB window, and the first-fit kernel heap that also
//! serves as the global allocator.

pub mod frame_allocator;
pub mod heap;

pub use frame_allocator::{
    BitmapFrameAllocator, FrameNumber, PhysicalAddress, FRAME_ALLOCATOR, FRAME_SIZE,
};
pub use heap::{KernelHeap, KERNEL_HEAP};

/// Bring up the heap and report the memory layout. The frame allocator's
/// bitmap is const-initialized and needs no runtime setup.
pub fn init() {
    heap::init();

    let frames = FRAME_ALLOCATOR.stats();
    let heap_stats = KERNEL_HEAP.lock().stats();
    println!(
        "[MM] frame window {:#x}..{:#x}, {} frames free",
        frame_allocator::WINDOW_BASE,
        frame_allocator::WINDOW_BASE + frame_allocator::WINDOW_SIZE,
        frames.free_frames
    );
    println!(
        "[MM] heap {} KiB, {} bytes used",
        heap_stats.total_bytes / 1024,
        heap_stats.used_bytes
    );
}
