//! Multiboot2 entry and long-mode bring-up.
//!
//! The bootloader drops us in 32-bit protected mode with the Multiboot2
//! magic in EAX and the physical address of the boot information structure
//! in EBX. The assembly below checks that the CPU can reach long mode,
//! builds an identity-mapped page hierarchy covering the first 64 MiB with
//! 2 MiB pages, enables paging, and far-jumps into 64-bit code which calls
//! `kernel_main`.
//!
//! Failure writes a single letter to the top-left VGA cell and halts:
//! `C` = no CPUID, `L` = no long mode.

use core::arch::global_asm;

// Multiboot2 header
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                // magic number
    .long 0                         // architecture (0 = i386)
    .long multiboot_header_end - multiboot_header_start  // header length

    // checksum
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // End tag
    .word 0                         // type
    .word 0                         // flags
    .long 8                         // size
multiboot_header_end:
"#
);

// 32-bit entry, long-mode transition, and the bootstrap GDT, stack, and
// page tables backing it.
global_asm!(
    r#"
.section .boot.text, "ax"
.code32
.global _boot32

_boot32:
    cli
    cld
    mov esp, offset boot_stack_top

    // Preserve the Multiboot2 registers; CPUID clobbers EAX..EDX.
    mov [boot_magic], eax
    mov [boot_info], ebx

    // CPUID support: the ID bit in EFLAGS must be toggleable.
    pushfd
    pop eax
    mov ecx, eax
    xor eax, (1 << 21)
    push eax
    popfd
    pushfd
    pop eax
    push ecx
    popfd
    cmp eax, ecx
    jne 2f
    mov al, 0x43                    // 'C'
    jmp boot_fail
2:
    // Long mode: extended CPUID must reach 0x80000001 and set the LM bit.
    mov eax, 0x80000000
    cpuid
    cmp eax, 0x80000001
    jb 3f
    mov eax, 0x80000001
    cpuid
    test edx, (1 << 29)
    jnz 4f
3:
    mov al, 0x4c                    // 'L'
    jmp boot_fail
4:
    // Identity-map the first 64 MiB: PML4[0] -> PDPT[0] -> PD[0..32],
    // each PD entry a 2 MiB huge page marked present|writable|huge.
    mov edi, offset boot_pml4
    mov ecx, 3072                   // three 4 KiB tables, in dwords
    xor eax, eax
    rep stosd

    mov eax, offset boot_pdpt
    or eax, 0x3
    mov [boot_pml4], eax
    mov eax, offset boot_pd
    or eax, 0x3
    mov [boot_pdpt], eax

    mov edi, offset boot_pd
    mov eax, 0x83
    mov ecx, 32
5:
    mov [edi], eax
    mov dword ptr [edi + 4], 0
    add eax, 0x200000
    add edi, 8
    loop 5b

    // CR3 -> PML4, CR4.PAE, EFER.LME, CR0.PG: long mode becomes active
    // at the far jump below.
    mov eax, offset boot_pml4
    mov cr3, eax

    mov eax, cr4
    or eax, (1 << 5)
    mov cr4, eax

    mov ecx, 0xC0000080             // IA32_EFER
    rdmsr
    or eax, (1 << 8)
    wrmsr

    mov eax, cr0
    or eax, (1 << 31)
    mov cr0, eax

    lgdt [boot_gdt_ptr]

    // Far jump to the 64-bit code selector.
    push 0x08
    lea eax, [_boot64]
    push eax
    retf

boot_fail:
    // AL holds the diagnostic letter; white on red, top-left cell.
    mov ah, 0x4f
    mov word ptr [0xb8000], ax
6:
    hlt
    jmp 6b

.code64
_boot64:
    // Reload the data segment registers off the bootstrap GDT.
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax

    mov rsp, offset boot_stack_top
    xor rbp, rbp

    // kernel_main(magic, multiboot_info)
    mov edi, [boot_magic]
    mov esi, [boot_info]
    call kernel_main
7:
    hlt
    jmp 7b

.section .rodata
.align 16
boot_gdt:
    .quad 0                         // null descriptor
    .quad 0x00AF9A000000FFFF        // 64-bit ring-0 code (selector 0x08)
    .quad 0x00CF92000000FFFF        // ring-0 data, writable (selector 0x10)
boot_gdt_ptr:
    .word boot_gdt_ptr - boot_gdt - 1
    .quad boot_gdt

.section .data
boot_magic: .long 0
boot_info:  .long 0

.section .bss
.align 4096
boot_pml4: .skip 4096
boot_pdpt: .skip 4096
boot_pd:   .skip 4096
boot_stack_bottom:
    .skip 16384
boot_stack_top:
"#
);
