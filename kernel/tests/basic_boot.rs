//! Basic boot tests for the Cinder kernel
//!
//! Runs on the bare-metal target under QEMU; on the host this binary is a
//! no-op so `cargo test` stays green.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    use cinder_kernel::mm::{FRAME_ALLOCATOR, FRAME_SIZE, KERNEL_HEAP};
    use cinder_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        serial_println!("Starting basic boot tests...");

        cinder_kernel::mm::init();
        test_heap_roundtrip();
        test_frame_allocator();

        serial_println!("All tests passed!");
        exit_qemu(QemuExitCode::Success)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        test_panic_handler(info)
    }

    fn test_heap_roundtrip() {
        serial_println!("test_heap_roundtrip...");
        let used_before = KERNEL_HEAP.lock().stats().used_bytes;
        let p = KERNEL_HEAP.lock().alloc(128);
        assert!(!p.is_null());
        KERNEL_HEAP.lock().free(p);
        assert_eq!(KERNEL_HEAP.lock().stats().used_bytes, used_before);
        serial_println!("test_heap_roundtrip [ok]");
    }

    fn test_frame_allocator() {
        serial_println!("test_frame_allocator...");
        let before = FRAME_ALLOCATOR.stats().free_frames;
        let page = FRAME_ALLOCATOR.alloc_page().expect("frames available");
        assert_eq!(page.as_u64() % FRAME_SIZE as u64, 0);
        FRAME_ALLOCATOR.free_page(page);
        assert_eq!(FRAME_ALLOCATOR.stats().free_frames, before);
        serial_println!("test_frame_allocator [ok]");
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
