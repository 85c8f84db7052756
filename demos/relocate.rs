//! Relocate a small 64-bit function and print the result.
//!
//! Run with `RUST_LOG=blockenc_rs=trace cargo run --example relocate` to see
//! every relaxation decision.

use blockenc_rs::{relocate_with, Bitness, BlockEncoderOptions, BlockError};
use tracing_subscriber::EnvFilter;

const ORIG_IP: u64 = 0x7FFF_0000_1000;
const NEW_IP: u64 = 0x40_0000;

// Targets outside the function stay at their original addresses, far
// from NEW_IP, so the call and the jmp need pointer slots.
const CODE: &[u8] = &[
    0x85, 0xC9, // test ecx, ecx
    0x74, 0x0C, // je ret
    0xE8, 0x00, 0x01, 0x00, 0x00, // call ORIG+0x109
    0xE2, 0xF5, // loop to the start
    0xE9, 0x00, 0x08, 0x00, 0x00, // jmp ORIG+0x810
    0xC3, // ret
];

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), BlockError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let result = relocate_with(
        CODE,
        Bitness::Bits64,
        ORIG_IP,
        NEW_IP,
        BlockEncoderOptions::RETURN_CONSTANT_OFFSETS,
    )?;

    println!("original  @ 0x{ORIG_IP:X}: {}", hex(CODE));
    println!("relocated @ 0x{:X}: {}", result.rip(), hex(result.code_buffer()));
    println!();
    for (i, (offset, co)) in result
        .new_instruction_offsets()
        .iter()
        .zip(result.constant_offsets())
        .enumerate()
    {
        let branch = if co.has_branch() {
            format!("rel{} at +{}", co.branch_size * 8, co.branch_offset)
        } else {
            String::from("-")
        };
        println!("  #{i:<2} +0x{offset:04X}  branch field: {branch}");
    }
    for reloc in result.reloc_infos() {
        println!("  reloc {:?} @ 0x{:X}", reloc.kind, reloc.address);
    }
    Ok(())
}
