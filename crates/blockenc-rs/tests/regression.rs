//! Regression tests for bug fixes.
//!
//! Each test documents a specific bug that was found and fixed, ensuring the
//! fix is never accidentally reverted.

use blockenc_rs::{relocate, relocate_with, Bitness, BlockEncoderOptions};
use pretty_assertions::assert_eq;

/// Regression: a branch whose first evaluation (against the provisional,
/// all-maximum layout) needed a pointer slot must release it once an
/// earlier branch shrinks and the target comes into rel32 range.  A leaked
/// slot would add padding, an 8-byte cell and a bogus relocation.
#[test]
fn shrunk_long_branch_releases_its_slot() {
    let code = [
        0xEB, 0x05, // jmp short to the ret
        0xE9, 0x00, 0x00, 0x00, 0xF0, // jmp near 0x8000_0007
        0xC3,
    ];
    let result = relocate_with(
        &code,
        Bitness::Bits64,
        0x9000_0000,
        0x1_0000_0000,
        BlockEncoderOptions::empty(),
    )
    .unwrap();
    // rel32 = 0x8000_0007 - 0x1_0000_0007 = i32::MIN, exactly in range
    assert_eq!(
        result.code_buffer(),
        &[0xEB, 0x05, 0xE9, 0x00, 0x00, 0x00, 0x80, 0xC3]
    );
    assert!(result.reloc_infos().is_empty());
}

/// Regression: the branch target equal to the end of the block is not an
/// instruction of the block and must stay at its original address.
#[test]
fn target_at_block_end_is_external() {
    // jmp short to 0x1002, the address right after the block
    let code = relocate(&[0xEB, 0x00], Bitness::Bits32, 0x1000, 0x1010).unwrap();
    assert_eq!(code, vec![0xEB, 0xF0]);
}

/// Regression: in 64-bit mode branches always use a 64-bit operand size; a
/// `66` prefix is ignored by the CPU and must not turn the branch into a
/// 16-bit one that truncates the target.
#[test]
fn operand_size_prefix_ignored_for_64bit_branches() {
    let code = relocate(
        &[0x66, 0xEB, 0x00, 0x90],
        Bitness::Bits64,
        0x1_0000_1000,
        0x1_0000_1000,
    )
    .unwrap();
    assert_eq!(code, vec![0xEB, 0x00, 0x90]);
}

/// Regression: `67 E3` in 16-bit code tests ECX, and the native form in the
/// trampoline must keep the address-size prefix.
#[test]
fn jecxz_in_16bit_trampoline_keeps_address_size_prefix() {
    let code = relocate(&[0x67, 0xE3, 0x10], Bitness::Bits16, 0x8000, 0x1000).unwrap();
    // jecxz +2; jmp short +3; jmp near 0x8013
    assert_eq!(code, vec![0x67, 0xE3, 0x02, 0xEB, 0x03, 0xE9, 0x0B, 0x70]);
}

/// Regression: with DONT_FIX_BRANCHES the original form is kept even when
/// a shorter one would do.
#[test]
fn dont_fix_branches_keeps_near_form() {
    let code = [0xE9, 0x00, 0x00, 0x00, 0x00, 0x90];
    let result = relocate_with(
        &code,
        Bitness::Bits32,
        0x1000,
        0x2000,
        BlockEncoderOptions::DONT_FIX_BRANCHES,
    )
    .unwrap();
    assert_eq!(result.code_buffer(), &code);
    assert_eq!(result.new_instruction_offsets(), &[0, 5]);
}

/// Regression: the instruction-level error names the original address of
/// the instruction, not the address it was being moved to.
#[test]
fn encode_error_reports_original_address() {
    // lea rax, [rip+0]
    let err = relocate(
        &[0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00],
        Bitness::Bits64,
        0x4000,
        0x7FFF_0000_0000,
    )
    .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("0x4000"), "{msg}");
    assert!(!msg.contains("0x7FFF00000000"), "{msg}");
}

/// Regression: a branch must be measured from its address after the
/// instructions before it shrank in the same pass.  Here the first jump
/// shrinks to 2 bytes, which moves the second one down by a byte and puts
/// its external target at +128, one past rel8 range.
#[test]
fn branch_after_a_shrunk_branch_sees_its_new_address() {
    let code = [
        0xEB, 0x00, // jmp short to the next instruction
        0xE9, 0x7F, 0x70, // jmp near 0xF084
    ];
    let code = relocate(&code, Bitness::Bits16, 0x8000, 0xF000).unwrap();
    // jmp short +0; jmp near 0xF084 (rel16 from 0xF005)
    assert_eq!(code, vec![0xEB, 0x00, 0xE9, 0x7F, 0x00]);
}

/// Regression: a short form picked for an external target must still
/// reach once an earlier branch shrinks in a later pass.  The first jump
/// only fits rel8 after the second one shrinks, and that shrink would in
/// turn move the second one 1 byte down, out of range of its target.
#[test]
fn short_external_branch_survives_later_shrinking() {
    let mut code = vec![
        0xE9, 0x7F, 0x00, // jmp near to the ret
        0xE9, 0x7E, 0x70, // jmp near 0xF084
    ];
    code.extend(std::iter::repeat(0x90).take(124));
    code.push(0xC3);

    let out = relocate(&code, Bitness::Bits16, 0x8000, 0xF000).unwrap();
    assert_eq!(out.len(), code.len());
    // both stay near: ret at 0xF082, external target at 0xF084
    assert_eq!(&out[..6], &[0xE9, 0x7F, 0x00, 0xE9, 0x7E, 0x00]);
    assert_eq!(&out[6..], &code[6..]);
}
