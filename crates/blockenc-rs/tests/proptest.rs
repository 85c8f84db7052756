#![cfg(not(target_arch = "wasm32"))]
//! Property-based tests using proptest.
//!
//! These tests verify relocation invariants across randomly generated
//! blocks, complementing the targeted integration tests and the
//! libfuzzer-based fuzz target.

use blockenc_rs::{
    decode_block, relocate, relocate_with, Bitness, BlockEncoder, BlockEncoderOptions,
    BranchForm, Code, Condition, Instruction, InstructionBlock, OpSize,
};
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────

fn arb_bitness() -> impl Strategy<Value = Bitness> {
    prop::sample::select(vec![Bitness::Bits16, Bitness::Bits32, Bitness::Bits64])
}

fn arb_options() -> impl Strategy<Value = BlockEncoderOptions> {
    (0u32..4).prop_map(BlockEncoderOptions::from_bits_truncate)
}

/// Branch-free 64-bit instructions, some with RIP-relative operands.
fn branch_free_x86_64_insn() -> impl Strategy<Value = &'static [u8]> {
    prop::sample::select(vec![
        &[0x90][..],
        &[0xC3],
        &[0xCC],
        &[0x50],
        &[0x41, 0x5F],
        &[0x48, 0x89, 0xC8],
        &[0x48, 0x83, 0xC0, 0x01],
        &[0xB8, 0x78, 0x56, 0x34, 0x12],
        &[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8],
        &[0x8B, 0x44, 0x24, 0x08],
        &[0x0F, 0xAF, 0xC1],
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x66, 0x0F, 0x6F, 0xC1],
        &[0xF3, 0x0F, 0xB8, 0xC1],
        &[0x66, 0x0F, 0x3A, 0x0F, 0xC1, 0x08],
        &[0xF6, 0xC1, 0x01],
        &[0xF7, 0xC1, 0x01, 0x00, 0x00, 0x00],
        &[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00],
        &[0x48, 0x8D, 0x0D, 0xF0, 0xFF, 0xFF, 0xFF],
        &[0x80, 0x3D, 0x00, 0x01, 0x00, 0x00, 0x2A],
    ])
}

#[derive(Debug, Clone)]
enum Item {
    /// `mov eax, imm32` repeated.
    Filler(usize),
    Jmp(usize),
    Jcc(u8, usize),
    Call(usize),
}

fn arb_item() -> impl Strategy<Value = Item> {
    prop_oneof![
        (0usize..40).prop_map(Item::Filler),
        any::<usize>().prop_map(Item::Jmp),
        (0u8..16, any::<usize>()).prop_map(|(c, t)| Item::Jcc(c, t)),
        any::<usize>().prop_map(Item::Call),
    ]
}

/// Expand items into a 32-bit block at `orig` with branch targets picked
/// among the block's instructions.  Returns the instructions and the
/// target index of every branch.
fn build_block(items: &[Item], orig: u64) -> (Vec<Instruction>, Vec<Option<usize>>) {
    // first pass: sizes, to know every original address
    let mut sizes = Vec::new();
    for item in items {
        match item {
            Item::Filler(n) => sizes.extend(std::iter::repeat(5).take(*n)),
            Item::Jmp(_) | Item::Call(_) => sizes.push(5),
            Item::Jcc(..) => sizes.push(6),
        }
    }
    let ips: Vec<u64> = sizes
        .iter()
        .scan(orig, |ip, size| {
            let at = *ip;
            *ip += *size as u64;
            Some(at)
        })
        .collect();

    let mut instrs = Vec::new();
    let mut targets = Vec::new();
    for item in items {
        let (code, target) = match *item {
            Item::Filler(n) => {
                for _ in 0..n {
                    let at = ips[instrs.len()];
                    instrs.push(Instruction::other(at, &[0xB8, 0x01, 0x00, 0x00, 0x00]));
                    targets.push(None);
                }
                continue;
            }
            Item::Jmp(t) => (
                Code::Jmp {
                    op_size: OpSize::W32,
                    form: BranchForm::Near,
                },
                t,
            ),
            Item::Jcc(c, t) => (
                Code::Jcc {
                    cond: Condition::from_nibble(c),
                    op_size: OpSize::W32,
                    form: BranchForm::Near,
                },
                t,
            ),
            Item::Call(t) => (Code::Call { op_size: OpSize::W32 }, t),
        };
        let index = target % ips.len();
        instrs.push(Instruction::branch(code, ips[instrs.len()], ips[index]));
        targets.push(Some(index));
    }
    (instrs, targets)
}

// ── Property: No panics on arbitrary input ──────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    /// Relocation must NEVER panic on arbitrary bytes, only Ok/Err.
    #[test]
    fn no_panic_on_arbitrary_bytes(
        bytes in prop::collection::vec(any::<u8>(), 0..96),
        bitness in arb_bitness(),
        orig in any::<u32>(),
        new in any::<u32>(),
        options in arb_options(),
    ) {
        let _ = relocate_with(&bytes, bitness, u64::from(orig), u64::from(new), options);
    }

    /// Same with 64-bit addresses far apart, forcing long forms.
    #[test]
    fn no_panic_on_arbitrary_bytes_far(
        bytes in prop::collection::vec(any::<u8>(), 0..96),
        orig in any::<u64>(),
        new in any::<u64>(),
    ) {
        let _ = relocate(&bytes, Bitness::Bits64, orig, new);
    }
}

// ── Property: Relocation to the same address is the identity ────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn branch_free_code_is_unchanged_in_place(
        insns in prop::collection::vec(branch_free_x86_64_insn(), 1..32),
        orig in 0u64..0x7FFF_0000,
    ) {
        let code: Vec<u8> = insns.concat();
        let out = relocate(&code, Bitness::Bits64, orig, orig).unwrap();
        prop_assert_eq!(out, code);
    }

    #[test]
    fn branch_free_code_moves_verbatim_without_rip_relative_operands(
        insns in prop::collection::vec(branch_free_x86_64_insn(), 1..32),
        orig in 0u64..0x7FFF_0000,
        new in 0u64..0x7FFF_0000,
    ) {
        let code: Vec<u8> = insns
            .into_iter()
            .filter(|i| !matches!(i, [0x48, 0x8B, 0x05, ..] | [0x48, 0x8D, 0x0D, ..] | [0x80, 0x3D, ..]))
            .flatten()
            .copied()
            .collect();
        let out = relocate(&code, Bitness::Bits64, orig, new).unwrap();
        prop_assert_eq!(out, code);
    }
}

// ── Property: Layout consistency and correct targets ────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every branch lands on the new address of its target instruction and
    /// the reported offsets match the emitted instruction boundaries.
    #[test]
    fn branches_reach_their_targets(
        items in prop::collection::vec(arb_item(), 1..24),
        orig in 0u64..0x4000_0000,
        new in 0u64..0x4000_0000,
    ) {
        let (instrs, targets) = build_block(&items, orig);
        prop_assume!(!instrs.is_empty());

        let result = BlockEncoder::encode(
            Bitness::Bits32,
            &InstructionBlock::new(instrs.clone(), new),
            BlockEncoderOptions::empty(),
        )
        .unwrap();
        let offsets = result.new_instruction_offsets();
        prop_assert_eq!(offsets.len(), instrs.len());
        prop_assert_eq!(offsets[0], 0);
        prop_assert!(result.reloc_infos().is_empty());

        let decoded = decode_block(Bitness::Bits32, result.code_buffer(), new).unwrap();
        prop_assert_eq!(decoded.len(), instrs.len());
        for (i, instr) in decoded.iter().enumerate() {
            // address(i + 1) == address(i) + size(i)
            prop_assert_eq!(instr.ip(), new + u64::from(offsets[i]));
            if let Some(j) = targets[i] {
                prop_assert_eq!(instr.near_branch_target(), new + u64::from(offsets[j]));
            }
        }
    }

    /// Sizes only shrink: no relocated block is longer than its
    /// all-near original.
    #[test]
    fn relocated_block_never_grows(
        items in prop::collection::vec(arb_item(), 1..24),
        orig in 0u64..0x4000_0000,
        new in 0u64..0x4000_0000,
    ) {
        let (instrs, _) = build_block(&items, orig);
        prop_assume!(!instrs.is_empty());
        let original_size: u64 = items
            .iter()
            .map(|item| match item {
                Item::Filler(n) => 5 * *n as u64,
                Item::Jmp(_) | Item::Call(_) => 5,
                Item::Jcc(..) => 6,
            })
            .sum();

        let result = BlockEncoder::encode(
            Bitness::Bits32,
            &InstructionBlock::new(instrs, new),
            BlockEncoderOptions::empty(),
        )
        .unwrap();
        prop_assert!(result.code_buffer().len() as u64 <= original_size);
    }
}
