//! Block encoder: relocates decoded instruction blocks to new addresses.
//!
//! Encoding runs in three phases:
//!
//! 1. **Initialize**: every instruction starts at its largest form; a
//!    provisional layout is computed and each branch resolves its target and
//!    makes a first choice.
//! 2. **Relax**: every instruction re-evaluates its form at its current
//!    address, assigned in order during the pass, until a pass changes no
//!    size.  Sizes only shrink, which bounds the number of passes.
//! 3. **Emit**: pointer slots get their addresses after the final code,
//!    every instruction is encoded at its committed address, and the slots
//!    are appended after `0xCC` alignment padding.

use alloc::format;
use alloc::vec::Vec;

use crate::data::PointerData;
use crate::encoder::{ConstantOffsets, Encoder};
use crate::error::BlockError;
use crate::instr::{Context, Instr};
use crate::ir::{Bitness, Code, Instruction};
use crate::target::{Layout, TargetResolver};

bitflags::bitflags! {
    /// Options for [`BlockEncoder`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BlockEncoderOptions: u32 {
        /// Keep every branch's original form and displacement.  The branch
        /// moves with the block, so its effective target shifts too.
        const DONT_FIX_BRANCHES = 1 << 0;
        /// Report [`ConstantOffsets`] for every emitted instruction.
        const RETURN_CONSTANT_OFFSETS = 1 << 1;
    }
}

/// Kind of a relocation reported for emitted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocKind {
    /// 64-bit absolute address.
    Offset64,
}

/// A location in the output that holds an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelocInfo {
    /// What is stored there.
    pub kind: RelocKind,
    /// Address of the stored value.
    pub address: u64,
}

/// Instructions to relocate and the address they move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBlock {
    instructions: Vec<Instruction>,
    rip: u64,
}

impl InstructionBlock {
    /// A block whose first instruction will be placed at `rip`.
    pub fn new(instructions: impl Into<Vec<Instruction>>, rip: u64) -> Self {
        Self {
            instructions: instructions.into(),
            rip,
        }
    }

    /// The instructions, in their original order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// New base address.
    pub fn rip(&self) -> u64 {
        self.rip
    }
}

/// Output for one [`InstructionBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[must_use]
pub struct BlockEncoderResult {
    rip: u64,
    code_buffer: Vec<u8>,
    new_instruction_offsets: Vec<u32>,
    reloc_infos: Vec<RelocInfo>,
    constant_offsets: Vec<ConstantOffsets>,
}

impl BlockEncoderResult {
    /// Base address of the code.
    pub fn rip(&self) -> u64 {
        self.rip
    }

    /// Encoded code followed by the pointer-slot data, if any.
    pub fn code_buffer(&self) -> &[u8] {
        &self.code_buffer
    }

    /// Take the encoded bytes.
    pub fn into_code_buffer(self) -> Vec<u8> {
        self.code_buffer
    }

    /// Offset of every input instruction in [`code_buffer`](Self::code_buffer).
    pub fn new_instruction_offsets(&self) -> &[u32] {
        &self.new_instruction_offsets
    }

    /// One entry per emitted pointer slot.
    pub fn reloc_infos(&self) -> &[RelocInfo] {
        &self.reloc_infos
    }

    /// Per-instruction field positions; empty unless
    /// [`BlockEncoderOptions::RETURN_CONSTANT_OFFSETS`] was set.  Instructions
    /// replaced by a synthesized sequence report the default value.
    pub fn constant_offsets(&self) -> &[ConstantOffsets] {
        &self.constant_offsets
    }
}

/// Relocates instruction blocks, fixing every relative branch.
///
/// # Examples
///
/// ```rust
/// use blockenc_rs::{decode_block, Bitness, BlockEncoder, InstructionBlock};
///
/// // jmp short 0x8004; nop; nop
/// let instrs = decode_block(Bitness::Bits16, &[0xEB, 0x00, 0x90, 0x90], 0x8000)?;
///
/// let mut encoder = BlockEncoder::new(Bitness::Bits16);
/// encoder.add_block(InstructionBlock::new(instrs, 0xF000));
/// let results = encoder.finish()?;
/// assert_eq!(results[0].code_buffer(), &[0xEB, 0x00, 0x90, 0x90]);
/// # Ok::<(), blockenc_rs::BlockError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BlockEncoder {
    bitness: Bitness,
    options: BlockEncoderOptions,
    blocks: Vec<InstructionBlock>,
}

impl BlockEncoder {
    /// Create an encoder for `bitness` with default options.
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            options: BlockEncoderOptions::empty(),
            blocks: Vec::new(),
        }
    }

    /// Set the options.
    pub fn options(&mut self, options: BlockEncoderOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Add a block.  Branches in any block may target instructions of any
    /// other block.
    pub fn add_block(&mut self, block: InstructionBlock) -> &mut Self {
        self.blocks.push(block);
        self
    }

    /// Encode all added blocks; one result per block, in order.
    pub fn finish(self) -> Result<Vec<BlockEncoderResult>, BlockError> {
        Self::encode_blocks(self.bitness, &self.blocks, self.options)
    }

    /// Encode a single block.
    pub fn encode(
        bitness: Bitness,
        block: &InstructionBlock,
        options: BlockEncoderOptions,
    ) -> Result<BlockEncoderResult, BlockError> {
        let mut results = Self::encode_blocks(bitness, core::slice::from_ref(block), options)?;
        match results.pop() {
            Some(result) => Ok(result),
            None => unreachable!("one result per block"),
        }
    }

    /// Encode several blocks together.
    ///
    /// # Errors
    ///
    /// [`BlockError::InvalidBlock`] if there are no blocks or an instruction
    /// is not encodable in `bitness` mode; [`BlockError::Encode`] if the
    /// final encoding of an instruction fails.  No partial output is
    /// returned.
    #[tracing::instrument(level = "debug", skip_all, fields(%bitness, blocks = blocks.len()))]
    pub fn encode_blocks(
        bitness: Bitness,
        blocks: &[InstructionBlock],
        options: BlockEncoderOptions,
    ) -> Result<Vec<BlockEncoderResult>, BlockError> {
        validate(bitness, blocks)?;

        let fix_branches = !options.contains(BlockEncoderOptions::DONT_FIX_BRANCHES);
        let resolver = TargetResolver::new(blocks.iter().map(InstructionBlock::instructions));
        let mut state = State {
            bitness,
            resolver,
            layout: Layout::with_blocks(blocks.len()),
            blocks: blocks
                .iter()
                .map(|block| EncBlock {
                    rip: block.rip,
                    instrs: block
                        .instructions
                        .iter()
                        .map(|&instr| Instr::new(bitness, instr, fix_branches))
                        .collect(),
                    data: PointerData::default(),
                })
                .collect(),
        };

        state.initialize();
        state.relax();
        state.emit(options.contains(BlockEncoderOptions::RETURN_CONSTANT_OFFSETS))
    }
}

fn validate(bitness: Bitness, blocks: &[InstructionBlock]) -> Result<(), BlockError> {
    if blocks.is_empty() {
        return Err(BlockError::InvalidBlock {
            detail: "no instruction blocks".into(),
        });
    }
    for instr in blocks.iter().flat_map(|b| b.instructions.iter()) {
        let code = instr.code();
        let problem = if matches!(code, Code::JmpIndirectRip | Code::CallIndirectRip) {
            Some("pointer-slot branches are not accepted as input")
        } else if !code.is_valid_for(bitness) {
            Some("not encodable in this mode")
        } else if code == Code::Other && instr.bytes().is_empty() {
            Some("instruction has no bytes")
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(BlockError::InvalidBlock {
                detail: format!("{problem}: 0x{:X} {instr} ({bitness})", instr.ip()),
            });
        }
    }
    Ok(())
}

struct EncBlock {
    rip: u64,
    instrs: Vec<Instr>,
    data: PointerData,
}

/// Working state of one encode request.
struct State {
    bitness: Bitness,
    resolver: TargetResolver,
    layout: Layout,
    blocks: Vec<EncBlock>,
}

impl State {
    /// Recompute every address from the current sizes.
    fn compute_layout(&mut self) {
        for (b, block) in self.blocks.iter().enumerate() {
            self.layout
                .update(b, block.rip, block.instrs.iter().map(Instr::size));
        }
    }

    /// Visit every instruction in address order.  Each one is placed right
    /// after the previous one before it is visited, so it sees every size
    /// change made earlier in the same sweep.  Returns how many instructions
    /// reported a size change.
    fn sweep(&mut self, mut visit: impl FnMut(&mut Instr, &mut Context<'_>) -> bool) -> usize {
        let mut changed = 0usize;
        for (b, block) in self.blocks.iter_mut().enumerate() {
            let mut ip = block.rip;
            for (i, instr) in block.instrs.iter_mut().enumerate() {
                self.layout.set_address(b, i, ip);
                let old_size = instr.size();
                let mut ctx = Context {
                    resolver: &self.resolver,
                    layout: &self.layout,
                    data: &mut block.data,
                    block: b,
                    index: i,
                };
                if visit(instr, &mut ctx) {
                    changed += 1;
                }
                assert!(
                    instr.size() <= old_size,
                    "instruction {i} of block {b} grew from {old_size} to {} bytes",
                    instr.size()
                );
                ip = ip.wrapping_add(instr.size() as u64);
            }
            self.layout.set_end(b, ip);
        }
        changed
    }

    fn initialize(&mut self) {
        self.compute_layout();
        for (b, block) in self.blocks.iter().enumerate() {
            self.layout
                .update_min(b, block.rip, block.instrs.iter().map(Instr::min_size));
        }
        self.sweep(|instr, ctx| {
            instr.initialize(ctx);
            false
        });
    }

    /// Run optimize passes until one changes no size.
    fn relax(&mut self) {
        let branches = self
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| i.is_branch())
            .count();

        let mut pass = 0usize;
        loop {
            pass += 1;
            let changed = self.sweep(Instr::optimize);

            tracing::debug!(pass, changed, "relaxation pass");
            if changed == 0 {
                break;
            }
            debug_assert!(
                pass <= 2 * branches + 1,
                "relaxation did not converge after {pass} passes ({branches} branches)"
            );
        }
    }

    fn emit(&mut self, want_offsets: bool) -> Result<Vec<BlockEncoderResult>, BlockError> {
        self.compute_layout();
        let mut results = Vec::with_capacity(self.blocks.len());

        for (b, block) in self.blocks.iter_mut().enumerate() {
            let code_end = self.layout.end(b);
            let data_start = block.data.assign_addresses(code_end);
            let code_size = code_end.wrapping_sub(block.rip) as usize;

            let mut encoder = Encoder::with_capacity(
                self.bitness,
                code_size + block.data.len() * 16,
            );
            let mut new_offsets = Vec::with_capacity(block.instrs.len());
            let mut constant_offsets = Vec::new();

            for (i, instr) in block.instrs.iter_mut().enumerate() {
                let ip = self.layout.address(b, i);
                let before = encoder.position();
                let mut ctx = Context {
                    resolver: &self.resolver,
                    layout: &self.layout,
                    data: &mut block.data,
                    block: b,
                    index: i,
                };
                let info = instr.try_encode(&mut ctx, &mut encoder)?;
                assert_eq!(
                    encoder.position() - before,
                    instr.size(),
                    "instruction at 0x{ip:X} was emitted with a size other than planned"
                );

                new_offsets.push(ip.wrapping_sub(block.rip) as u32);
                if want_offsets {
                    constant_offsets.push(if info.own_form {
                        info.constant_offsets
                    } else {
                        ConstantOffsets::default()
                    });
                }
            }

            if block.data.len() != 0 {
                let padding = data_start.wrapping_sub(code_end) as usize;
                encoder.write_bytes(&[0xCC; 8][..padding]);
                let mut slots = Vec::with_capacity(block.data.len() * 8);
                block.data.write(&mut slots);
                encoder.write_bytes(&slots);
            }
            let code_buffer = encoder.take_buffer();
            let reloc_infos = block.data.reloc_infos();

            tracing::debug!(
                block = b,
                rip = block.rip,
                code_size,
                total = code_buffer.len(),
                slots = reloc_infos.len(),
                "block emitted"
            );
            results.push(BlockEncoderResult {
                rip: block.rip,
                code_buffer,
                new_instruction_offsets: new_offsets,
                reloc_infos,
                constant_offsets,
            });
        }
        Ok(results)
    }
}
