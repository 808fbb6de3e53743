//! Interactive command shell
//!
//! Thin front end over the subsystem APIs: reads edited lines from the
//! keyboard driver and surfaces memory statistics, the PCI registry, disk
//! sectors, and the NIC. Parsing is whitespace splitting, nothing more.

use core::str::SplitWhitespace;

use crate::arch::x86_64::vga;
use crate::drivers::{ata, keyboard, pci, virtio};
use crate::mm;

/// Command loop; never returns.
pub fn run() -> ! {
    println!("Type 'help' for commands.");
    let mut line = [0u8; 256];

    loop {
        print!("> ");
        let Some(len) = keyboard::read_line(&mut line) else {
            // Ctrl+C cancels the pending line only.
            continue;
        };
        let Ok(text) = core::str::from_utf8(&line[..len]) else {
            continue;
        };

        let mut parts = text.split_whitespace();
        match parts.next() {
            None => {}
            Some("help") => help(),
            Some("clear") => vga::clear_screen(),
            Some("mem") => mem_info(),
            Some("lspci") => lspci(),
            Some("disk") => disk(&mut parts),
            Some("net") => net(&mut parts),
            Some(other) => println!("unknown command: {}", other),
        }
    }
}

fn help() {
    println!("commands:");
    println!("  help                     this text");
    println!("  clear                    clear the screen");
    println!("  mem                      frame and heap statistics");
    println!("  lspci                    list PCI functions");
    println!("  disk read <lba>          dump the first bytes of a sector");
    println!("  disk write <lba> <text>  write text into a sector");
    println!("  net [send <text>|recv]   NIC status, test send, poll RX");
}

fn mem_info() {
    let frames = mm::FRAME_ALLOCATOR.stats();
    println!(
        "frames: {} free / {} total ({} KiB free)",
        frames.free_frames,
        frames.total_frames,
        frames.free_frames * mm::FRAME_SIZE / 1024
    );
    let heap = mm::KERNEL_HEAP.lock().stats();
    println!(
        "heap:   {} used / {} total bytes",
        heap.used_bytes, heap.total_bytes
    );
}

fn lspci() {
    for dev in pci::devices() {
        println!(
            "{:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x} irq {}",
            dev.location.bus,
            dev.location.device,
            dev.location.function,
            dev.vendor_id,
            dev.device_id,
            dev.class_code,
            dev.subclass,
            dev.interrupt_line
        );
    }
}

fn disk(args: &mut SplitWhitespace<'_>) {
    if !ata::is_present() {
        println!("no disk present");
        return;
    }

    match (args.next(), args.next()) {
        (Some("read"), Some(lba)) => {
            let Ok(lba) = lba.parse::<u32>() else {
                println!("bad lba");
                return;
            };
            let mut sector = [0u8; ata::SECTOR_SIZE];
            match ata::read_sectors(lba, 1, &mut sector) {
                Ok(()) => hexdump(&sector[..64]),
                Err(e) => println!("read failed: {}", e),
            }
        }
        (Some("write"), Some(lba)) => {
            let Ok(lba) = lba.parse::<u32>() else {
                println!("bad lba");
                return;
            };
            let mut sector = [0u8; ata::SECTOR_SIZE];
            let mut pos = 0;
            for (i, word) in args.enumerate() {
                if i > 0 && pos < sector.len() {
                    sector[pos] = b' ';
                    pos += 1;
                }
                for &b in word.as_bytes() {
                    if pos < sector.len() {
                        sector[pos] = b;
                        pos += 1;
                    }
                }
            }
            match ata::write_sectors(lba, 1, &sector) {
                Ok(()) => println!("wrote {} bytes to lba {}", pos, lba),
                Err(e) => println!("write failed: {}", e),
            }
        }
        _ => println!("usage: disk read <lba> | disk write <lba> <text>"),
    }
}

fn net(args: &mut SplitWhitespace<'_>) {
    match args.next() {
        None => {
            if let Some(mac) = virtio::net::mac() {
                let (tx, rx) = virtio::net::packet_counts().unwrap_or((0, 0));
                println!("virtio-net {} (tx {} rx {})", mac, tx, rx);
            } else {
                println!("no network card");
            }
        }
        Some("send") => {
            let Some(mac) = virtio::net::mac() else {
                println!("no network card");
                return;
            };
            // Broadcast frame with a local-experimental ethertype and the
            // remaining words as payload, padded to the Ethernet minimum.
            let mut frame = alloc::vec::Vec::with_capacity(64);
            frame.extend_from_slice(&[0xFF; 6]);
            frame.extend_from_slice(&mac.0);
            frame.extend_from_slice(&0x88B5u16.to_be_bytes());
            for (i, word) in args.enumerate() {
                if i > 0 {
                    frame.push(b' ');
                }
                frame.extend_from_slice(word.as_bytes());
            }
            while frame.len() < 60 {
                frame.push(0);
            }
            match virtio::net::send(&frame) {
                Ok(()) => println!("sent {} bytes", frame.len()),
                Err(e) => println!("send failed: {}", e),
            }
        }
        Some("recv") => {
            let mut buf = [0u8; virtio::net::MAX_FRAME_LEN];
            match virtio::net::receive(&mut buf) {
                Some(len) => {
                    println!("received {} bytes", len);
                    hexdump(&buf[..core::cmp::min(len, 64)]);
                }
                None => println!("nothing pending"),
            }
        }
        _ => println!("usage: net [send <text>|recv]"),
    }
}

fn hexdump(bytes: &[u8]) {
    for row in bytes.chunks(16) {
        for b in row {
            print!("{:02x} ", b);
        }
        print!(" |");
        for &b in row {
            let c = if (0x20..0x7F).contains(&b) { b as char } else { '.' };
            print!("{}", c);
        }
        println!("|");
    }
}
