#![no_main]
use blockenc_rs::{Bitness, BlockEncoderOptions};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the mode and options; the rest is code.
    let Some((&selector, code)) = data.split_first() else {
        return;
    };
    let bitness = match selector & 3 {
        0 => Bitness::Bits16,
        1 => Bitness::Bits32,
        _ => Bitness::Bits64,
    };
    let options = BlockEncoderOptions::from_bits_truncate(u32::from(selector >> 2));

    // Relocation must never panic, only return Ok/Err.
    let _ = blockenc_rs::relocate_with(code, bitness, 0x1000, 0x2000, options);

    // Far apart, forcing long forms in 64-bit mode.
    let _ = blockenc_rs::relocate(code, bitness, 0x7FFF_0000_0000, 0x1000);
});
