//! `jmp`, `call` and `jcc` relaxation.
//!
//! | family | short     | near           | long (64-bit)                  |
//! |--------|-----------|----------------|--------------------------------|
//! | `jmp`  | `EB rel8` | `E9 rel16/32`  | `FF 25 disp32` via a slot      |
//! | `call` | none      | `E8 rel16/32`  | `FF 15 disp32` via a slot      |
//! | `jcc`  | `7x rel8` | `0F 8x rel16/32` | `j!cc +6` then `FF 25 disp32` |

use crate::data::SlotId;
use crate::encoder::{Encoder, INDIRECT_RIP_SIZE};
use crate::error::{BlockError, EncoderError};
use crate::instr::*;
use crate::ir::*;
use crate::target::TargetRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Jmp,
    Call,
    Jcc,
}

/// A relative `jmp`, `call` or `jcc`.
#[derive(Debug, Clone)]
pub(crate) struct BranchInstr {
    bitness: Bitness,
    instruction: Instruction,
    family: Family,
    kind: BranchKind,
    size: usize,
    short_size: Option<usize>,
    near_size: usize,
    long_size: Option<usize>,
    target: Option<TargetRef>,
    slot: Option<SlotId>,
}

impl BranchInstr {
    pub(crate) fn new(bitness: Bitness, instruction: Instruction, fix_branches: bool) -> Self {
        let code = instruction.code();
        let family = match code {
            Code::Jmp { .. } => Family::Jmp,
            Code::Call { .. } => Family::Call,
            Code::Jcc { .. } => Family::Jcc,
            other => unreachable!("{other:?} is not a jmp/call/jcc"),
        };

        let mut instr = Self {
            bitness,
            instruction,
            family,
            kind: BranchKind::Uninitialized,
            size: 0,
            short_size: None,
            near_size: 0,
            long_size: None,
            target: None,
            slot: None,
        };

        if !fix_branches {
            instr.kind = BranchKind::Unchanged;
            instr.size = measure_original(bitness, &instruction);
            return instr;
        }

        if family != Family::Call {
            instr.short_size = Some(measure_form(bitness, &instruction, code.to_short_branch()));
        }
        instr.near_size = measure_form(bitness, &instruction, code.to_near_branch());
        if bitness == Bitness::Bits64 {
            instr.long_size = Some(match family {
                Family::Jcc => {
                    let skip = code.negate_condition().to_short_branch();
                    measure_form(bitness, &instruction, skip) + INDIRECT_RIP_SIZE
                }
                Family::Jmp | Family::Call => INDIRECT_RIP_SIZE,
            });
        }
        instr.size = instr
            .short_size
            .into_iter()
            .chain(instr.long_size)
            .fold(instr.near_size, usize::max);
        instr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn min_size(&self) -> usize {
        match self.kind {
            BranchKind::Unchanged => self.size,
            _ => self.short_size.unwrap_or(self.near_size),
        }
    }

    pub(crate) fn initialize(&mut self, ctx: &mut Context<'_>) {
        if self.kind == BranchKind::Unchanged {
            return;
        }
        self.target = Some(ctx.resolver.resolve(self.instruction.near_branch_target()));
        self.relax(ctx);
    }

    pub(crate) fn optimize(&mut self, ctx: &mut Context<'_>) -> bool {
        match self.kind {
            BranchKind::Unchanged | BranchKind::Short => false,
            BranchKind::Uninitialized => panic!("branch optimized before initialize"),
            BranchKind::Near | BranchKind::Long => self.relax(ctx),
        }
    }

    /// Pick the first form in short, near, long order that reaches the
    /// target and is not larger than the current size.
    fn relax(&mut self, ctx: &mut Context<'_>) -> bool {
        let old_size = self.size;
        let ip = ctx.ip();
        let target_ref = self.target_ref();
        let target = target_ref.address(ctx.layout);

        if let Some(short) = self.short_size {
            if short <= self.size && ctx.reaches(target_ref, short, fits_rel8) {
                self.select(ctx, BranchKind::Short, short);
                return self.size != old_size;
            }
        }
        if self.kind == BranchKind::Near {
            return false;
        }

        // Same-block targets are assumed to be within 2 GiB.
        let use_near = self.near_size <= self.size
            && (self.bitness != Bitness::Bits64
                || target_ref.is_in_block(ctx.block)
                || ctx.reaches(target_ref, self.near_size, fits_rel32));
        if use_near || self.long_size.is_none() {
            self.select(ctx, BranchKind::Near, self.near_size);
            return self.size != old_size;
        }

        if self.slot.is_none() {
            self.slot = Some(ctx.data.alloc());
        }
        self.kind = BranchKind::Long;
        self.size = self.long_size.unwrap_or(self.size);
        tracing::trace!(ip, target, size = self.size, "branch needs a pointer slot");
        self.size != old_size
    }

    fn select(&mut self, ctx: &mut Context<'_>, kind: BranchKind, size: usize) {
        if let Some(slot) = self.slot.take() {
            ctx.data.invalidate(slot);
        }
        tracing::trace!(ip = ctx.ip(), ?kind, size, "branch form selected");
        self.kind = kind;
        self.size = size;
    }

    fn target_ref(&self) -> TargetRef {
        match self.target {
            Some(target) => target,
            None => panic!("branch target read before initialize"),
        }
    }

    pub(crate) fn try_encode(
        &mut self,
        ctx: &mut Context<'_>,
        encoder: &mut Encoder,
    ) -> Result<EncodedInfo, BlockError> {
        let ip = ctx.ip();
        let err = |e: EncoderError| encode_error(&self.instruction, e);
        let mut instr = self.instruction;
        match self.kind {
            BranchKind::Uninitialized => panic!("branch emitted before initialize"),
            BranchKind::Unchanged => {
                instr.set_near_branch_target(preserved_target(&self.instruction, ip));
            }
            BranchKind::Short => {
                instr.set_code(instr.code().to_short_branch());
                instr.set_near_branch_target(self.target_ref().address(ctx.layout));
            }
            BranchKind::Near => {
                instr.set_code(instr.code().to_near_branch());
                instr.set_near_branch_target(self.target_ref().address(ctx.layout));
            }
            BranchKind::Long => {
                let Some(slot) = self.slot else {
                    panic!("long branch without a pointer slot");
                };
                ctx.data
                    .set_value(slot, self.target_ref().address(ctx.layout));
                let slot_addr = ctx.data.address(slot);

                let mut at = ip;
                if self.family == Family::Jcc {
                    // j!cc over the indirect jump
                    let long_size = self.long_size.unwrap_or(self.size);
                    instr.set_code(instr.code().negate_condition().to_short_branch());
                    instr.set_near_branch_target(ip.wrapping_add(long_size as u64));
                    at = at.wrapping_add(encoder.encode(&instr, ip).map_err(err)? as u64);
                }
                let indirect = Instruction::indirect_rip(self.family == Family::Call, slot_addr);
                encoder.encode(&indirect, at).map_err(err)?;
                return Ok(EncodedInfo::synthesized());
            }
        }
        encoder.encode(&instr, ip).map_err(err)?;
        Ok(EncodedInfo::own_form(encoder.constant_offsets()))
    }
}
