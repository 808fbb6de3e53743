//! Interrupt Descriptor Table, 8259 PIC remap, and vectored dispatch.
//!
//! All 256 gates are populated: the CPU exceptions (0..32) through the
//! typed slots, the remapped hardware IRQs (32..48) through per-vector
//! stubs that funnel into a common dispatcher, and the remainder through a
//! trap stub. High-level callbacks are registered per vector in a parallel
//! table and run in interrupt context with interrupts disabled.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::{Mutex, RwLock};
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

/// Vector where the master PIC's IRQs land after remapping.
pub const PIC_1_OFFSET: u8 = 32;
/// Vector where the slave PIC's IRQs land after remapping.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;
/// One past the last hardware IRQ vector.
const IRQ_LIMIT: u8 = PIC_2_OFFSET + 8;

/// Vector of the PS/2 keyboard interrupt (IRQ1).
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;

/// The remapped 8259 pair: master at 0x20/0x21, slave at 0xA0/0xA1,
/// cascaded on IRQ2.
pub static PICS: Mutex<ChainedPics> = Mutex::new(
    // SAFETY: Offsets 32 and 40 are outside the CPU exception range and
    // do not overlap each other.
    unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) },
);

/// High-level interrupt callback; receives the vector that fired.
pub type IrqHandler = fn(u8);

/// Parallel dispatch table, one nullable slot per IDT gate. Written only
/// during driver init, before interrupts are enabled.
static HANDLERS: RwLock<[Option<IrqHandler>; 256]> = RwLock::new([None; 256]);

/// Register `handler` for `vector`.
///
/// Callbacks run with interrupts disabled and must be short and
/// re-entrancy-safe with respect to their own state.
pub fn register_handler(vector: u8, handler: IrqHandler) {
    HANDLERS.write()[vector as usize] = Some(handler);
}

/// Common dispatch for hardware and software vectors: invoke the
/// registered callback, then acknowledge the PIC for hardware IRQs.
fn dispatch(vector: u8) {
    let handler = HANDLERS.read()[vector as usize];
    if let Some(handler) = handler {
        handler(vector);
    }
    if (PIC_1_OFFSET..IRQ_LIMIT).contains(&vector) {
        // SAFETY: `vector` is a remapped hardware IRQ; the PIC expects an
        // EOI for it. notify_end_of_interrupt signals the slave in addition
        // to the master when the source was a slave IRQ.
        unsafe { PICS.lock().notify_end_of_interrupt(vector) };
    }
}

/// Exception path shared by the non-resuming fault stubs: a registered
/// callback may claim the vector; otherwise print it and halt.
fn handle_exception(vector: u8, name: &str, error_code: u64, stack_frame: &InterruptStackFrame) {
    let handler = HANDLERS.read()[vector as usize];
    if let Some(handler) = handler {
        handler(vector);
        return;
    }
    println!("EXCEPTION: {} (vector {})", name, vector);
    println!("Error Code: {:#x}", error_code);
    println!("{:#?}", stack_frame);
    super::halt();
}

macro_rules! exception_stub {
    ($name:ident, $vector:expr, $desc:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            handle_exception($vector, $desc, 0, &stack_frame);
        }
    };
}

macro_rules! exception_stub_with_error {
    ($name:ident, $vector:expr, $desc:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, error_code: u64) {
            handle_exception($vector, $desc, error_code, &stack_frame);
        }
    };
}

exception_stub!(divide_error_handler, 0, "DIVIDE ERROR");
exception_stub!(debug_handler, 1, "DEBUG");
exception_stub!(nmi_handler, 2, "NON-MASKABLE INTERRUPT");
exception_stub!(overflow_handler, 4, "OVERFLOW");
exception_stub!(bound_range_handler, 5, "BOUND RANGE EXCEEDED");
exception_stub!(invalid_opcode_handler, 6, "INVALID OPCODE");
exception_stub!(device_not_available_handler, 7, "DEVICE NOT AVAILABLE");
exception_stub_with_error!(invalid_tss_handler, 10, "INVALID TSS");
exception_stub_with_error!(segment_not_present_handler, 11, "SEGMENT NOT PRESENT");
exception_stub_with_error!(stack_segment_handler, 12, "STACK SEGMENT FAULT");
exception_stub_with_error!(general_protection_fault_handler, 13, "GENERAL PROTECTION FAULT");
exception_stub!(x87_floating_point_handler, 16, "x87 FLOATING POINT");
exception_stub_with_error!(alignment_check_handler, 17, "ALIGNMENT CHECK");
exception_stub!(simd_floating_point_handler, 19, "SIMD FLOATING POINT");
exception_stub!(virtualization_handler, 20, "VIRTUALIZATION");

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", Cr2::read());
    println!("Error Code: {:?}", error_code);
    println!("{:#?}", stack_frame);
    super::halt();
}

macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            dispatch($vector);
        }
    };
}

irq_stub!(irq0_stub, 32);
irq_stub!(irq1_stub, 33);
irq_stub!(irq2_stub, 34);
irq_stub!(irq3_stub, 35);
irq_stub!(irq4_stub, 36);
irq_stub!(irq5_stub, 37);
irq_stub!(irq6_stub, 38);
irq_stub!(irq7_stub, 39);
irq_stub!(irq8_stub, 40);
irq_stub!(irq9_stub, 41);
irq_stub!(irq10_stub, 42);
irq_stub!(irq11_stub, 43);
irq_stub!(irq12_stub, 44);
irq_stub!(irq13_stub, 45);
irq_stub!(irq14_stub, 46);
irq_stub!(irq15_stub, 47);

/// Trap stub for vectors with no wired source (48..256).
extern "x86-interrupt" fn unexpected_interrupt_handler(_stack_frame: InterruptStackFrame) {}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        // SAFETY: DOUBLE_FAULT_IST_INDEX refers to a stack installed in the
        // TSS by gdt::init, which runs before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        // Remapped hardware IRQs 0..16 at vectors 32..48.
        idt[32].set_handler_fn(irq0_stub);
        idt[33].set_handler_fn(irq1_stub);
        idt[34].set_handler_fn(irq2_stub);
        idt[35].set_handler_fn(irq3_stub);
        idt[36].set_handler_fn(irq4_stub);
        idt[37].set_handler_fn(irq5_stub);
        idt[38].set_handler_fn(irq6_stub);
        idt[39].set_handler_fn(irq7_stub);
        idt[40].set_handler_fn(irq8_stub);
        idt[41].set_handler_fn(irq9_stub);
        idt[42].set_handler_fn(irq10_stub);
        idt[43].set_handler_fn(irq11_stub);
        idt[44].set_handler_fn(irq12_stub);
        idt[45].set_handler_fn(irq13_stub);
        idt[46].set_handler_fn(irq14_stub);
        idt[47].set_handler_fn(irq15_stub);

        for vector in 48..=255u8 {
            idt[vector].set_handler_fn(unexpected_interrupt_handler);
        }

        idt
    };
}

/// Remap the PIC pair, set the initial masks, and load the IDT. The caller
/// enables interrupts once drivers have registered their handlers.
pub fn init() {
    // SAFETY: The 8259 initialization sequence (ICW1..ICW4) is well-defined:
    // vector offsets 32/40, master cascading on IRQ2, slave identity 2,
    // 8086 mode. Everything except the keyboard (IRQ1) stays masked; the
    // ATA and NIC paths are polled.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0xfd, 0xff);
    }

    IDT.load();
}
