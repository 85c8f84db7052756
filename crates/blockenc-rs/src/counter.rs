//! `loop`, `loope`, `loopne` and `jcxz`/`jecxz`/`jrcxz`.
//!
//! These only exist with a rel8 displacement, so the near and long forms
//! are trampolines around the native instruction:
//!
//! ```text
//!         brins tmp           ; native size
//!         jmp short skip      ; 2
//! tmp:    jmp near target     ; 3 (16-bit) or 5     (near)
//!         jmp [rip+slot]      ; 6                   (long, 64-bit)
//! skip:
//! ```

use crate::data::SlotId;
use crate::encoder::{Encoder, INDIRECT_RIP_SIZE};
use crate::error::{BlockError, EncoderError};
use crate::instr::*;
use crate::ir::*;
use crate::target::TargetRef;

/// Size of `jmp rel8`.
const JMP_SHORT_SIZE: usize = 2;

/// A counter-testing branch.
#[derive(Debug, Clone)]
pub(crate) struct CounterBranchInstr {
    bitness: Bitness,
    instruction: Instruction,
    kind: BranchKind,
    size: usize,
    short_size: usize,
    native_code: Code,
    native_size: usize,
    near_size: usize,
    long_size: Option<usize>,
    target: Option<TargetRef>,
    slot: Option<SlotId>,
}

impl CounterBranchInstr {
    pub(crate) fn new(bitness: Bitness, instruction: Instruction, fix_branches: bool) -> Self {
        let code = instruction.code();
        let native_code = code.to_native_counter_branch(bitness);
        let mut instr = Self {
            bitness,
            instruction,
            kind: BranchKind::Uninitialized,
            size: 0,
            short_size: 0,
            native_code,
            native_size: 0,
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

        instr.short_size = measure_form(bitness, &instruction, code);
        instr.native_size = if native_code == code {
            instr.short_size
        } else {
            measure_form(bitness, &instruction, native_code)
        };
        let jmp_near_size = match bitness {
            Bitness::Bits16 => 3,
            Bitness::Bits32 | Bitness::Bits64 => 5,
        };
        instr.near_size = instr.native_size + JMP_SHORT_SIZE + jmp_near_size;
        if bitness == Bitness::Bits64 {
            instr.long_size = Some(instr.native_size + JMP_SHORT_SIZE + INDIRECT_RIP_SIZE);
        }
        instr.size = instr
            .long_size
            .unwrap_or(0)
            .max(instr.near_size)
            .max(instr.short_size);
        instr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn min_size(&self) -> usize {
        match self.kind {
            BranchKind::Unchanged => self.size,
            _ => self.short_size,
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
            BranchKind::Uninitialized => panic!("counter branch optimized before initialize"),
            BranchKind::Near | BranchKind::Long => self.relax(ctx),
        }
    }

    fn relax(&mut self, ctx: &mut Context<'_>) -> bool {
        let old_size = self.size;
        let ip = ctx.ip();
        let target_ref = self.target_ref();
        let target = target_ref.address(ctx.layout);

        if ctx.reaches(target_ref, self.short_size, fits_rel8) {
            self.select(ctx, BranchKind::Short, self.short_size);
            return self.size != old_size;
        }
        if self.kind == BranchKind::Near {
            return false;
        }

        // Same-block targets are assumed to be within 2 GiB.
        let use_near = self.bitness != Bitness::Bits64
            || target_ref.is_in_block(ctx.block)
            || ctx.reaches(target_ref, self.near_size, fits_rel32);
        if use_near {
            self.select(ctx, BranchKind::Near, self.near_size);
            return self.size != old_size;
        }

        if self.slot.is_none() {
            self.slot = Some(ctx.data.alloc());
        }
        self.kind = BranchKind::Long;
        self.size = self.long_size.unwrap_or(self.size);
        tracing::trace!(ip, target, size = self.size, "counter branch needs a pointer slot");
        self.size != old_size
    }

    fn select(&mut self, ctx: &mut Context<'_>, kind: BranchKind, size: usize) {
        if let Some(slot) = self.slot.take() {
            ctx.data.invalidate(slot);
        }
        tracing::trace!(ip = ctx.ip(), ?kind, size, "counter branch form selected");
        self.kind = kind;
        self.size = size;
    }

    fn target_ref(&self) -> TargetRef {
        match self.target {
            Some(target) => target,
            None => panic!("counter branch target read before initialize"),
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
        let skip_to = match self.kind {
            BranchKind::Uninitialized => panic!("counter branch emitted before initialize"),
            BranchKind::Unchanged | BranchKind::Short => {
                let target = if self.kind == BranchKind::Unchanged {
                    preserved_target(&self.instruction, ip)
                } else {
                    self.target_ref().address(ctx.layout)
                };
                instr.set_near_branch_target(target);
                encoder.encode(&instr, ip).map_err(err)?;
                return Ok(EncodedInfo::own_form(encoder.constant_offsets()));
            }
            BranchKind::Near => ip.wrapping_add(self.near_size as u64),
            BranchKind::Long => match self.long_size {
                Some(size) => ip.wrapping_add(size as u64),
                None => panic!("long counter branch outside 64-bit mode"),
            },
        };

        // brins tmp
        instr.set_code(self.native_code);
        let tmp = ip.wrapping_add((self.native_size + JMP_SHORT_SIZE) as u64);
        instr.set_near_branch_target(tmp);
        let mut at = ip.wrapping_add(encoder.encode(&instr, ip).map_err(err)? as u64);

        // jmp short skip
        let skip = helper_jmp(self.bitness, BranchForm::Short, skip_to);
        at = at.wrapping_add(encoder.encode(&skip, at).map_err(err)? as u64);

        // tmp: jmp near target / jmp [rip+slot]
        let target = self.target_ref().address(ctx.layout);
        if self.kind == BranchKind::Near {
            let near = helper_jmp(self.bitness, BranchForm::Near, target);
            encoder.encode(&near, at).map_err(err)?;
        } else {
            let Some(slot) = self.slot else {
                panic!("long counter branch without a pointer slot");
            };
            ctx.data.set_value(slot, target);
            let indirect = Instruction::indirect_rip(false, ctx.data.address(slot));
            encoder.encode(&indirect, at).map_err(err)?;
        }
        Ok(EncodedInfo::synthesized())
    }
}
