//! 32-bit relocation: prefixes, counter trampolines and mode checks.

use blockenc_rs::{
    relocate, relocate_with, Bitness, BlockEncoder, BlockEncoderOptions, BlockError, BranchForm,
    Code, InstructionBlock, Instruction, OpSize,
};
use pretty_assertions::assert_eq;

#[test]
fn call_retargeted() {
    // call 0x2000
    let code = relocate(&[0xE8, 0xFB, 0x0F, 0x00, 0x00], Bitness::Bits32, 0x1000, 0x3000).unwrap();
    assert_eq!(code, vec![0xE8, 0xFB, 0xEF, 0xFF, 0xFF]);
}

#[test]
fn branch_hint_prefix_is_kept() {
    // ds je short +0 (taken hint); nop
    let code = [0x3E, 0x74, 0x00, 0x90];
    let out = relocate(&code, Bitness::Bits32, 0x1000, 0x8000_0000).unwrap();
    assert_eq!(out, code.to_vec());
}

#[test]
fn jcxz_with_address_size_prefix() {
    // jcxz 0x8013
    let out = relocate(&[0x67, 0xE3, 0x10], Bitness::Bits32, 0x8000, 0x10_0000).unwrap();
    let disp = 0x8013u32.wrapping_sub(0x10_000A);
    let mut expected = vec![0x67, 0xE3, 0x02, 0xEB, 0x05, 0xE9];
    expected.extend_from_slice(&disp.to_le_bytes());
    assert_eq!(out, expected);
}

#[test]
fn operand_size_prefixed_jmp_in_32bit() {
    // o16 jmp short to the nop
    let code = [0x66, 0xEB, 0x00, 0x90];
    let out = relocate(&code, Bitness::Bits32, 0x1000, 0x2000).unwrap();
    assert_eq!(out, code.to_vec());
}

#[test]
fn dont_fix_keeps_out_of_range_short_branch() {
    // jmp short 0x1012: moved far away, the displacement no longer reaches
    let result = relocate_with(
        &[0xEB, 0x10],
        Bitness::Bits32,
        0x1000,
        0x10_0000,
        BlockEncoderOptions::DONT_FIX_BRANCHES,
    )
    .unwrap();
    assert_eq!(result.code_buffer(), &[0xEB, 0x10]);
}

#[test]
fn invalid_in_64bit_is_fine_in_32bit() {
    // push es; ret
    let out = relocate(&[0x06, 0xC3], Bitness::Bits32, 0x1000, 0x2000).unwrap();
    assert_eq!(out, vec![0x06, 0xC3]);
    let err = relocate(&[0x06, 0xC3], Bitness::Bits64, 0x1000, 0x2000).unwrap_err();
    assert!(matches!(err, BlockError::Decode { ip: 0x1000, .. }));
}

#[test]
fn sixty_four_bit_record_rejected() {
    let jmp = Instruction::branch(
        Code::Jmp {
            op_size: OpSize::W64,
            form: BranchForm::Near,
        },
        0x1000,
        0x1000,
    );
    let err = BlockEncoder::encode(
        Bitness::Bits32,
        &InstructionBlock::new(vec![jmp], 0x1000),
        BlockEncoderOptions::empty(),
    )
    .unwrap_err();
    assert!(err.to_string().starts_with("invalid block:"), "{err}");
}
