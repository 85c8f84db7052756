//! 64-bit relocation: long forms through pointer slots, counter-branch
//! trampolines, RIP-relative operands and multi-block requests.

use blockenc_rs::{
    decode_block, relocate, relocate_with, Bitness, BlockEncoder, BlockEncoderOptions, BlockError,
    ConstantOffsets, InstructionBlock, RelocInfo, RelocKind,
};
use pretty_assertions::assert_eq;

/// Far away from any new base used below.
const HIGH: u64 = 0x7FFF_0000_0000;
const FAR_TARGET: u64 = HIGH + 0x1000;

fn with_target(mut code: Vec<u8>, target: u64) -> Vec<u8> {
    code.extend_from_slice(&target.to_le_bytes());
    code
}

#[test]
fn far_jmp_goes_through_pointer_slot() {
    // jmp near HIGH+0x1000
    let result = relocate_with(
        &[0xE9, 0xFB, 0x0F, 0x00, 0x00],
        Bitness::Bits64,
        HIGH,
        0x1000,
        BlockEncoderOptions::RETURN_CONSTANT_OFFSETS,
    )
    .unwrap();
    // jmp [rip+2]; int3 padding; slot
    assert_eq!(
        result.code_buffer(),
        &with_target(vec![0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0xCC, 0xCC], FAR_TARGET)[..]
    );
    assert_eq!(
        result.reloc_infos(),
        &[RelocInfo {
            kind: RelocKind::Offset64,
            address: 0x1008,
        }]
    );
    assert_eq!(result.new_instruction_offsets(), &[0]);
    assert_eq!(result.constant_offsets(), &[ConstantOffsets::default()]);
}

#[test]
fn far_call_goes_through_pointer_slot() {
    let code = relocate(&[0xE8, 0xFB, 0x0F, 0x00, 0x00], Bitness::Bits64, HIGH, 0x1000).unwrap();
    assert_eq!(
        code,
        with_target(vec![0xFF, 0x15, 0x02, 0x00, 0x00, 0x00, 0xCC, 0xCC], FAR_TARGET)
    );
}

#[test]
fn far_jcc_skips_over_indirect_jump() {
    // je near HIGH+0x1000
    let code = relocate(
        &[0x0F, 0x84, 0xFA, 0x0F, 0x00, 0x00],
        Bitness::Bits64,
        HIGH,
        0x1000,
    )
    .unwrap();
    // jne short +6; jmp [rip+0]; slot (already aligned)
    assert_eq!(
        code,
        with_target(vec![0x75, 0x06, 0xFF, 0x25, 0x00, 0x00, 0x00, 0x00], FAR_TARGET)
    );
}

#[test]
fn far_loop_uses_long_trampoline() {
    // loop HIGH+0x12
    let result = relocate_with(
        &[0xE2, 0x10],
        Bitness::Bits64,
        HIGH,
        0x1000,
        BlockEncoderOptions::empty(),
    )
    .unwrap();
    // loop +2; jmp short +6; jmp [rip+6]; padding to 0x1010; slot
    assert_eq!(
        result.code_buffer(),
        &with_target(
            vec![
                0xE2, 0x02, 0xEB, 0x06, 0xFF, 0x25, 0x06, 0x00, 0x00, 0x00, 0xCC, 0xCC, 0xCC,
                0xCC, 0xCC, 0xCC,
            ],
            HIGH + 0x12
        )[..]
    );
    assert_eq!(result.reloc_infos()[0].address, 0x1010);
}

#[test]
fn near_loop_trampoline_in_reach() {
    // jrcxz HIGH+0x12, moved 0x1000 down: reachable with rel32
    let code = relocate(&[0xE3, 0x10], Bitness::Bits64, HIGH, HIGH - 0x1000).unwrap();
    // jrcxz +2; jmp short +5; jmp near target
    let disp = ((HIGH + 0x12) - (HIGH - 0x1000 + 9)) as u32;
    let mut expected = vec![0xE3, 0x02, 0xEB, 0x05, 0xE9];
    expected.extend_from_slice(&disp.to_le_bytes());
    assert_eq!(code, expected);
}

#[test]
fn slots_shared_per_block_and_aligned() {
    // jmp far; call far; ret
    let code = [
        0xE9, 0xFB, 0x0F, 0x00, 0x00, // jmp HIGH+0x1000
        0xE8, 0xF6, 0x1F, 0x00, 0x00, // call HIGH+0x2000
        0xC3,
    ];
    let result =
        relocate_with(&code, Bitness::Bits64, HIGH, 0x1000, BlockEncoderOptions::empty()).unwrap();
    // 6 + 6 + 1 = 13 bytes of code, slots at 0x1010 and 0x1018
    let buf = result.code_buffer();
    assert_eq!(buf.len(), 0x10 + 16);
    assert_eq!(&buf[..2], &[0xFF, 0x25]);
    assert_eq!(&buf[6..8], &[0xFF, 0x15]);
    assert_eq!(buf[12], 0xC3);
    assert_eq!(&buf[13..16], &[0xCC, 0xCC, 0xCC]);
    assert_eq!(&buf[16..24], &(HIGH + 0x1000).to_le_bytes());
    assert_eq!(&buf[24..32], &(HIGH + 0x2000).to_le_bytes());
    let addrs: Vec<u64> = result.reloc_infos().iter().map(|r| r.address).collect();
    assert_eq!(addrs, vec![0x1010, 0x1018]);
    assert_eq!(result.new_instruction_offsets(), &[0, 6, 12]);
}

#[test]
fn in_range_target_stays_near() {
    let code = relocate(&[0xE9, 0x00, 0x00, 0x01, 0x00], Bitness::Bits64, 0x1000, 0x2000).unwrap();
    // target 0x11005 from 0x2005
    assert_eq!(code, vec![0xE9, 0x00, 0xF0, 0x00, 0x00]);
}

#[test]
fn rex_w_branch_is_normalized() {
    // REX.W jmp short +0 (REX carries nothing for a branch)
    let code = relocate(&[0x48, 0xEB, 0x00, 0x90], Bitness::Bits64, 0x1000, 0x1000).unwrap();
    assert_eq!(code, vec![0xEB, 0x00, 0x90]);
}

#[test]
fn rip_relative_operand_is_retargeted() {
    // mov rax, [rip+0x10]; lea rcx, [rip-7]
    let code = [
        0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, // reads 0x1017
        0x48, 0x8D, 0x0D, 0xF9, 0xFF, 0xFF, 0xFF, // points at 0x1007 (itself)
    ];
    let result = relocate_with(
        &code,
        Bitness::Bits64,
        0x1000,
        0x5000,
        BlockEncoderOptions::RETURN_CONSTANT_OFFSETS,
    )
    .unwrap();
    let buf = result.code_buffer();
    // 0x1017 is outside the block and stays put
    let disp = 0x1017i64 - 0x5007;
    assert_eq!(&buf[3..7], &(disp as i32).to_le_bytes());
    // the lea target moved with the block
    assert_eq!(&buf[7..], &code[7..]);
    assert_eq!(result.constant_offsets()[0].displacement_offset, 3);
    assert_eq!(result.constant_offsets()[0].displacement_size, 4);
}

#[test]
fn rip_relative_out_of_range_is_an_encode_error() {
    let code = [0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00];
    let err = relocate(&code, Bitness::Bits64, 0x1000, HIGH).unwrap_err();
    match &err {
        BlockError::Encode { ip, .. } => assert_eq!(*ip, 0x1000),
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains(" : 0x1000 "), "{err}");
}

#[test]
fn branches_between_blocks_follow_both_relocations() {
    // block 0: jmp into block 1's second instruction
    let first = decode_block(Bitness::Bits64, &[0xE9, 0xFC, 0x0F, 0x00, 0x00], 0x1000).unwrap();
    // block 1: nop at 0x2000, ret at 0x2001
    let second = decode_block(Bitness::Bits64, &[0x90, 0xC3], 0x2000).unwrap();
    assert_eq!(first[0].near_branch_target(), 0x2001);

    let mut encoder = BlockEncoder::new(Bitness::Bits64);
    encoder
        .add_block(InstructionBlock::new(first, 0x10_0000))
        .add_block(InstructionBlock::new(second, 0x10_0010));
    let results = encoder.finish().unwrap();

    // 0x100011 from 0x100002 fits rel8
    assert_eq!(results[0].code_buffer(), &[0xEB, 0x0F]);
    assert_eq!(results[1].code_buffer(), &[0x90, 0xC3]);
}

#[test]
fn cross_block_target_far_away_uses_slot() {
    let first = decode_block(Bitness::Bits64, &[0xE9, 0xFB, 0x0F, 0x00, 0x00], 0x1000).unwrap();
    let second = decode_block(Bitness::Bits64, &[0xC3], 0x2000).unwrap();
    let results = BlockEncoder::encode_blocks(
        Bitness::Bits64,
        &[
            InstructionBlock::new(first, 0x1000),
            InstructionBlock::new(second, HIGH),
        ],
        BlockEncoderOptions::empty(),
    )
    .unwrap();
    assert_eq!(
        results[0].code_buffer(),
        &with_target(vec![0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0xCC, 0xCC], HIGH)[..]
    );
    assert_eq!(results[0].reloc_infos().len(), 1);
    assert!(results[1].reloc_infos().is_empty());
}

#[test]
fn unsupported_encodings_are_rejected() {
    // vzeroupper (VEX)
    let err = relocate(&[0xC5, 0xF8, 0x77], Bitness::Bits64, 0, 0).unwrap_err();
    assert!(matches!(err, BlockError::Decode { .. }));
}
