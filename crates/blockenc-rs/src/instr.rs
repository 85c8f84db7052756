//! Per-instruction relaxation state.
//!
//! Every input instruction becomes one [`Instr`].  The block encoder drives
//! each through `initialize`, one `optimize` call per relaxation pass, and a
//! final `try_encode`.  Sizes only ever shrink between passes.

use alloc::string::ToString;

use crate::counter::CounterBranchInstr;
use crate::data::PointerData;
use crate::encoder::{measure, ConstantOffsets, Encoder};
use crate::error::{BlockError, EncoderError};
use crate::ir::*;
use crate::jump::BranchInstr;
use crate::target::{Layout, TargetRef, TargetResolver};

/// What the block encoder lends a variant for one call.
pub(crate) struct Context<'a> {
    pub(crate) resolver: &'a TargetResolver,
    pub(crate) layout: &'a Layout,
    pub(crate) data: &'a mut PointerData,
    pub(crate) block: usize,
    pub(crate) index: usize,
}

impl Context<'_> {
    /// Current address of the instruction being visited.
    pub(crate) fn ip(&self) -> u64 {
        self.layout.address(self.block, self.index)
    }

    /// Lowest address the instruction being visited can still move down to.
    pub(crate) fn min_ip(&self) -> u64 {
        self.layout.min_address(self.block, self.index)
    }

    /// Whether a branch of `size` bytes at the current address reaches
    /// `target` under `fits`, both now and after any later shrinking.
    ///
    /// Within one block the distance to a target only shrinks as sizes do.
    /// Otherwise branch and target move independently, so both extremes of
    /// the distance are checked.
    pub(crate) fn reaches(
        &self,
        target: TargetRef,
        size: usize,
        fits: fn(u64, u64) -> bool,
    ) -> bool {
        let next_ip = self.ip().wrapping_add(size as u64);
        let now = target.address(self.layout);
        if target.is_in_block(self.block) {
            return fits(now, next_ip);
        }
        let min_next_ip = self.min_ip().wrapping_add(size as u64);
        fits(now, min_next_ip) && fits(target.min_address(self.layout), next_ip)
    }
}

/// Side outputs of emitting one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EncodedInfo {
    /// Field positions of the emitted instruction (default for synthesized
    /// sequences).
    pub(crate) constant_offsets: ConstantOffsets,
    /// The instruction was emitted as itself, possibly re-targeted or
    /// switched between its short and near form, rather than replaced by a
    /// synthesized sequence.  This is not "byte-identical to the input":
    /// only in this case do `constant_offsets` describe the instruction the
    /// caller passed in.
    pub(crate) own_form: bool,
}

impl EncodedInfo {
    pub(crate) fn own_form(constant_offsets: ConstantOffsets) -> Self {
        Self {
            constant_offsets,
            own_form: true,
        }
    }

    pub(crate) fn synthesized() -> Self {
        Self::default()
    }
}

/// Encoding form chosen for a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchKind {
    /// Branch fixing is off: the original displacement is kept.
    Unchanged,
    Short,
    Near,
    /// 64-bit only: through a pointer slot.
    Long,
    Uninitialized,
}

/// One instruction of a block being encoded.
#[derive(Debug, Clone)]
pub(crate) enum Instr {
    /// Re-emitted as is (IP-relative memory operands re-targeted).
    Simple(SimpleInstr),
    /// `jmp`, `call` and `jcc`.
    Branch(BranchInstr),
    /// `loop*` and `jcxz` family.
    Counter(CounterBranchInstr),
}

impl Instr {
    pub(crate) fn new(bitness: Bitness, instruction: Instruction, fix_branches: bool) -> Self {
        match instruction.code() {
            Code::Jmp { .. } | Code::Call { .. } | Code::Jcc { .. } => {
                Instr::Branch(BranchInstr::new(bitness, instruction, fix_branches))
            }
            Code::CounterBranch { .. } => {
                Instr::Counter(CounterBranchInstr::new(bitness, instruction, fix_branches))
            }
            _ => Instr::Simple(SimpleInstr::new(instruction)),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            Instr::Simple(i) => i.size(),
            Instr::Branch(i) => i.size(),
            Instr::Counter(i) => i.size(),
        }
    }

    /// Smallest size this instruction can still shrink to.
    pub(crate) fn min_size(&self) -> usize {
        match self {
            Instr::Simple(i) => i.size(),
            Instr::Branch(i) => i.min_size(),
            Instr::Counter(i) => i.min_size(),
        }
    }

    pub(crate) fn is_branch(&self) -> bool {
        !matches!(self, Instr::Simple(_))
    }

    pub(crate) fn initialize(&mut self, ctx: &mut Context<'_>) {
        match self {
            Instr::Simple(i) => i.initialize(ctx),
            Instr::Branch(i) => i.initialize(ctx),
            Instr::Counter(i) => i.initialize(ctx),
        }
    }

    /// Re-evaluate the encoding form; returns whether the size changed.
    pub(crate) fn optimize(&mut self, ctx: &mut Context<'_>) -> bool {
        match self {
            Instr::Simple(_) => false,
            Instr::Branch(i) => i.optimize(ctx),
            Instr::Counter(i) => i.optimize(ctx),
        }
    }

    pub(crate) fn try_encode(
        &mut self,
        ctx: &mut Context<'_>,
        encoder: &mut Encoder,
    ) -> Result<EncodedInfo, BlockError> {
        match self {
            Instr::Simple(i) => i.try_encode(ctx, encoder),
            Instr::Branch(i) => i.try_encode(ctx, encoder),
            Instr::Counter(i) => i.try_encode(ctx, encoder),
        }
    }
}

/// Wrap an encoder failure with the original instruction it came from.
pub(crate) fn encode_error(instruction: &Instruction, source: EncoderError) -> BlockError {
    BlockError::Encode {
        ip: instruction.ip(),
        instruction: instruction.to_string(),
        source,
    }
}

/// Size of `instruction` with `code` substituted, at address 0 branching
/// to 0.  Branch sizes do not depend on the target, so this is the size at
/// any address; unencodable forms measure as the maximum length.
pub(crate) fn measure_form(bitness: Bitness, instruction: &Instruction, code: Code) -> usize {
    let mut copy = *instruction;
    copy.set_code(code);
    copy.set_near_branch_target(0);
    measure(bitness, &copy, 0).unwrap_or(MAX_INSTRUCTION_LENGTH)
}

/// Size of the instruction exactly as decoded, at its original address.
pub(crate) fn measure_original(bitness: Bitness, instruction: &Instruction) -> usize {
    measure(bitness, instruction, instruction.ip()).unwrap_or(MAX_INSTRUCTION_LENGTH)
}

/// Target that keeps the original displacement when the branch moves to
/// `ip`.
pub(crate) fn preserved_target(instruction: &Instruction, ip: u64) -> u64 {
    let delta = instruction
        .near_branch_target()
        .wrapping_sub(instruction.ip());
    let mask = instruction.code().op_size().map_or(u64::MAX, OpSize::mask);
    ip.wrapping_add(delta) & mask
}

/// Whether `target` is reachable with a rel8 from `next_ip`.
pub(crate) fn fits_rel8(target: u64, next_ip: u64) -> bool {
    i8::try_from(target.wrapping_sub(next_ip) as i64).is_ok()
}

/// Whether `target` is reachable with a rel32 from `next_ip`.
pub(crate) fn fits_rel32(target: u64, next_ip: u64) -> bool {
    i32::try_from(target.wrapping_sub(next_ip) as i64).is_ok()
}

/// `jmp short` / `jmp near` with the mode's default operand size.
pub(crate) fn helper_jmp(bitness: Bitness, form: BranchForm, target: u64) -> Instruction {
    Instruction::branch(
        Code::Jmp {
            op_size: bitness.default_branch_op_size(),
            form,
        },
        0,
        target,
    )
}

// ─── Pass-through ──────────────────────────────────────────

/// A non-branch instruction.  Its size never changes.
#[derive(Debug, Clone)]
pub(crate) struct SimpleInstr {
    instruction: Instruction,
    ip_rel_target: Option<TargetRef>,
    initialized: bool,
}

impl SimpleInstr {
    fn new(instruction: Instruction) -> Self {
        Self {
            instruction,
            ip_rel_target: None,
            initialized: false,
        }
    }

    fn size(&self) -> usize {
        self.instruction.len()
    }

    fn initialize(&mut self, ctx: &mut Context<'_>) {
        self.ip_rel_target = self
            .instruction
            .ip_rel_target()
            .map(|target| ctx.resolver.resolve(target));
        self.initialized = true;
    }

    fn try_encode(
        &mut self,
        ctx: &mut Context<'_>,
        encoder: &mut Encoder,
    ) -> Result<EncodedInfo, BlockError> {
        assert!(self.initialized, "instruction emitted before initialize");
        let mut instr = self.instruction;
        if let Some(target) = self.ip_rel_target {
            instr.set_ip_rel_target(target.address(ctx.layout));
        }
        encoder
            .encode(&instr, ctx.ip())
            .map_err(|e| encode_error(&self.instruction, e))?;
        Ok(EncodedInfo::own_form(encoder.constant_offsets()))
    }
}
