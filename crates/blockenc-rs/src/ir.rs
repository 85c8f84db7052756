//! Instruction model consumed by the block encoder.
//!
//! These types describe already-decoded x86 instructions: only the fields the
//! block encoder reads or rewrites are modelled.  Anything that is not a
//! relative branch is carried as its original bytes ([`Code::Other`]).

use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::encoder::{ConstantOffsets, InstrBytes};

/// Maximum length of a single x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// x86 code width (default operand and address size mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bitness {
    /// 16-bit real mode: default operand size 16, address size 16.
    Bits16,
    /// 32-bit protected mode: default operand size 32, address size 32.
    Bits32,
    /// 64-bit long mode: branches use 64-bit operand size, address size 64.
    Bits64,
}

impl Bitness {
    /// Width in bits (16, 32, or 64).
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits16 => 16,
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }

    /// Operand size a relative branch uses without an operand-size prefix.
    #[must_use]
    pub fn default_branch_op_size(self) -> OpSize {
        match self {
            Bitness::Bits16 => OpSize::W16,
            Bitness::Bits32 => OpSize::W32,
            Bitness::Bits64 => OpSize::W64,
        }
    }

    /// Counter register selected without an address-size prefix.
    #[must_use]
    pub fn default_counter(self) -> CounterReg {
        match self {
            Bitness::Bits16 => CounterReg::Cx,
            Bitness::Bits32 => CounterReg::Ecx,
            Bitness::Bits64 => CounterReg::Rcx,
        }
    }

    /// Row index into the per-bitness mapping tables.
    pub(crate) fn index(self) -> usize {
        match self {
            Bitness::Bits16 => 0,
            Bitness::Bits32 => 1,
            Bitness::Bits64 => 2,
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

impl TryFrom<u32> for Bitness {
    type Error = crate::error::BlockError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Bitness::Bits16),
            32 => Ok(Bitness::Bits32),
            64 => Ok(Bitness::Bits64),
            other => Err(crate::error::BlockError::InvalidBlock {
                detail: format!("unsupported bitness {other} (expected 16, 32 or 64)"),
            }),
        }
    }
}

/// Operand size of a relative branch; it decides the width of the
/// instruction pointer after the branch and of a near displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    /// 16-bit IP, `rel16` near displacement.
    W16,
    /// 32-bit EIP, `rel32` near displacement.
    W32,
    /// 64-bit RIP, `rel32` near displacement.
    W64,
}

impl OpSize {
    /// Width in bits.
    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            OpSize::W16 => 16,
            OpSize::W32 => 32,
            OpSize::W64 => 64,
        }
    }

    /// Mask applied to branch targets computed with this operand size.
    #[must_use]
    pub fn mask(self) -> u64 {
        match self {
            OpSize::W16 => 0xFFFF,
            OpSize::W32 => 0xFFFF_FFFF,
            OpSize::W64 => u64::MAX,
        }
    }

    /// Whether a relative branch with this operand size is encodable in
    /// `bitness` mode.
    #[must_use]
    pub fn is_valid_for(self, bitness: Bitness) -> bool {
        let col = match self {
            OpSize::W16 => 0,
            OpSize::W32 => 1,
            OpSize::W64 => 2,
        };
        BRANCH_OP_SIZES[bitness.index()][col]
    }

    /// Size of a near displacement field in bytes.
    #[must_use]
    pub fn near_disp_size(self) -> usize {
        match self {
            OpSize::W16 => 2,
            OpSize::W32 | OpSize::W64 => 4,
        }
    }
}

/// Register implicitly tested by `loop*` / `jcxz`-family branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterReg {
    /// `cx`
    Cx,
    /// `ecx`
    Ecx,
    /// `rcx`
    Rcx,
}

/// Condition code of a `jcc` branch (low nibble of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// Overflow.
    O,
    /// No overflow.
    No,
    /// Below (carry).
    B,
    /// Above or equal (no carry).
    Ae,
    /// Equal (zero).
    E,
    /// Not equal (not zero).
    Ne,
    /// Below or equal.
    Be,
    /// Above.
    A,
    /// Sign.
    S,
    /// No sign.
    Ns,
    /// Parity even.
    P,
    /// Parity odd.
    Np,
    /// Less.
    L,
    /// Greater or equal.
    Ge,
    /// Less or equal.
    Le,
    /// Greater.
    G,
}

const CONDITIONS: [Condition; 16] = [
    Condition::O,
    Condition::No,
    Condition::B,
    Condition::Ae,
    Condition::E,
    Condition::Ne,
    Condition::Be,
    Condition::A,
    Condition::S,
    Condition::Ns,
    Condition::P,
    Condition::Np,
    Condition::L,
    Condition::Ge,
    Condition::Le,
    Condition::G,
];

const CONDITION_SUFFIXES: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

impl Condition {
    /// Condition encoded by the low nibble of a `7x` / `0F 8x` opcode.
    #[must_use]
    pub fn from_nibble(nibble: u8) -> Self {
        CONDITIONS[(nibble & 0x0F) as usize]
    }

    /// The opcode nibble of this condition.
    #[must_use]
    pub fn nibble(self) -> u8 {
        self as u8
    }

    /// The opposite condition (`je` ↔ `jne`, `jl` ↔ `jge`, ...).
    #[must_use]
    pub fn negate(self) -> Self {
        Self::from_nibble(self.nibble() ^ 1)
    }

    /// Mnemonic suffix (`"e"` for `je`).
    #[must_use]
    pub fn suffix(self) -> &'static str {
        CONDITION_SUFFIXES[self.nibble() as usize]
    }
}

/// Displacement width of a relative `jmp` / `jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchForm {
    /// `rel8`
    Short,
    /// `rel16` / `rel32`, depending on operand size.
    Near,
}

/// Counter-testing branch operation (`E0`..`E3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterOp {
    /// `loopne` / `loopnz`
    Loopne,
    /// `loope` / `loopz`
    Loope,
    /// `loop`
    Loop,
    /// `jcxz` / `jecxz` / `jrcxz`
    Jcxz,
}

impl CounterOp {
    /// The one-byte opcode.
    #[must_use]
    pub fn opcode(self) -> u8 {
        match self {
            CounterOp::Loopne => 0xE0,
            CounterOp::Loope => 0xE1,
            CounterOp::Loop => 0xE2,
            CounterOp::Jcxz => 0xE3,
        }
    }

    pub(crate) fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0xE0 => CounterOp::Loopne,
            0xE1 => CounterOp::Loope,
            0xE2 => CounterOp::Loop,
            _ => CounterOp::Jcxz,
        }
    }
}

/// Operation identity of an instruction, as far as the block encoder cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Anything that is not a relative branch; re-emitted from its original
    /// bytes (with an IP-relative displacement rewritten, if present).
    Other,
    /// `jmp rel8` / `jmp rel16/32`.
    Jmp {
        /// Operand size.
        op_size: OpSize,
        /// Short or near displacement.
        form: BranchForm,
    },
    /// `call rel16/32`.
    Call {
        /// Operand size.
        op_size: OpSize,
    },
    /// `jcc rel8` / `jcc rel16/32`.
    Jcc {
        /// Condition tested.
        cond: Condition,
        /// Operand size.
        op_size: OpSize,
        /// Short or near displacement.
        form: BranchForm,
    },
    /// `loop*` / `jcxz`-family: `rel8` only.
    CounterBranch {
        /// Which counter branch.
        op: CounterOp,
        /// Operand size.
        op_size: OpSize,
        /// Counter register tested (selected by address size).
        counter: CounterReg,
    },
    /// `jmp qword ptr [rip+disp32]`; the memory target is
    /// [`Instruction::ip_rel_target`].
    JmpIndirectRip,
    /// `call qword ptr [rip+disp32]`; the memory target is
    /// [`Instruction::ip_rel_target`].
    CallIndirectRip,
}

/// Operand size of the native counter-branch form for 16/32/64-bit mode,
/// keyed by counter register.  `None` means the counter register cannot be
/// selected in that mode.
const COUNTER_NATIVE_OP_SIZE: [(CounterReg, [Option<OpSize>; 3]); 3] = [
    (CounterReg::Cx, [Some(OpSize::W16), Some(OpSize::W32), None]),
    (
        CounterReg::Ecx,
        [Some(OpSize::W16), Some(OpSize::W32), Some(OpSize::W64)],
    ),
    (CounterReg::Rcx, [None, None, Some(OpSize::W64)]),
];

/// Branch operand sizes that are encodable per 16/32/64-bit mode.
const BRANCH_OP_SIZES: [[bool; 3]; 3] = [
    // W16, W32, W64
    [true, true, false],
    [true, true, false],
    [false, false, true],
];

impl Code {
    /// Whether this is a relative branch the block encoder re-targets.
    #[must_use]
    pub fn is_relative_branch(self) -> bool {
        matches!(
            self,
            Code::Jmp { .. } | Code::Call { .. } | Code::Jcc { .. } | Code::CounterBranch { .. }
        )
    }

    /// Branch operand size, if this is a relative branch.
    #[must_use]
    pub fn op_size(self) -> Option<OpSize> {
        match self {
            Code::Jmp { op_size, .. }
            | Code::Call { op_size }
            | Code::Jcc { op_size, .. }
            | Code::CounterBranch { op_size, .. } => Some(op_size),
            _ => None,
        }
    }

    /// The `rel8` form of a `jmp` / `jcc`; other codes are returned unchanged.
    #[must_use]
    pub fn to_short_branch(self) -> Code {
        match self {
            Code::Jmp { op_size, .. } => Code::Jmp {
                op_size,
                form: BranchForm::Short,
            },
            Code::Jcc { cond, op_size, .. } => Code::Jcc {
                cond,
                op_size,
                form: BranchForm::Short,
            },
            other => other,
        }
    }

    /// The `rel16/32` form of a `jmp` / `jcc`; other codes are returned unchanged.
    #[must_use]
    pub fn to_near_branch(self) -> Code {
        match self {
            Code::Jmp { op_size, .. } => Code::Jmp {
                op_size,
                form: BranchForm::Near,
            },
            Code::Jcc { cond, op_size, .. } => Code::Jcc {
                cond,
                op_size,
                form: BranchForm::Near,
            },
            other => other,
        }
    }

    /// The `jcc` with the opposite condition; other codes are returned unchanged.
    #[must_use]
    pub fn negate_condition(self) -> Code {
        match self {
            Code::Jcc {
                cond,
                op_size,
                form,
            } => Code::Jcc {
                cond: cond.negate(),
                op_size,
                form,
            },
            other => other,
        }
    }

    /// The counter branch re-expressed with the default operand size of
    /// `bitness`, keeping its counter register.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not a counter branch or if its counter register
    /// has no form in `bitness`; [`Code::is_valid_for`] rules both out before
    /// a block is built.
    pub(crate) fn to_native_counter_branch(self, bitness: Bitness) -> Code {
        let Code::CounterBranch { op, counter, .. } = self else {
            unreachable!("native counter form requested for {self:?}");
        };
        let native = COUNTER_NATIVE_OP_SIZE
            .iter()
            .find(|(reg, _)| *reg == counter)
            .and_then(|(_, sizes)| sizes[bitness.index()]);
        match native {
            Some(op_size) => Code::CounterBranch {
                op,
                op_size,
                counter,
            },
            None => panic!("{counter:?} counter branch has no native {bitness} form"),
        }
    }

    /// Whether this code can be encoded in `bitness` mode at all.
    #[must_use]
    pub fn is_valid_for(self, bitness: Bitness) -> bool {
        let op_size_ok = |op_size: OpSize| op_size.is_valid_for(bitness);
        match self {
            Code::Other => true,
            Code::Jmp { op_size, .. } | Code::Call { op_size } | Code::Jcc { op_size, .. } => {
                op_size_ok(op_size)
            }
            Code::CounterBranch {
                op_size, counter, ..
            } => {
                op_size_ok(op_size)
                    && COUNTER_NATIVE_OP_SIZE
                        .iter()
                        .any(|(reg, sizes)| *reg == counter && sizes[bitness.index()].is_some())
            }
            Code::JmpIndirectRip | Code::CallIndirectRip => bitness == Bitness::Bits64,
        }
    }

    /// Mnemonic used in diagnostics.
    #[must_use]
    pub fn mnemonic(self) -> String {
        match self {
            Code::Other => String::from("(other)"),
            Code::Jmp { .. } | Code::JmpIndirectRip => String::from("jmp"),
            Code::Call { .. } | Code::CallIndirectRip => String::from("call"),
            Code::Jcc { cond, .. } => format!("j{}", cond.suffix()),
            Code::CounterBranch { op, counter, .. } => String::from(match (op, counter) {
                (CounterOp::Loopne, _) => "loopne",
                (CounterOp::Loope, _) => "loope",
                (CounterOp::Loop, _) => "loop",
                (CounterOp::Jcxz, CounterReg::Cx) => "jcxz",
                (CounterOp::Jcxz, CounterReg::Ecx) => "jecxz",
                (CounterOp::Jcxz, CounterReg::Rcx) => "jrcxz",
            }),
        }
    }
}

bitflags::bitflags! {
    /// Legacy prefixes carried by a relative branch besides `66`/`67`
    /// (segment overrides double as branch hints: `2E` not taken, `3E` taken).
    ///
    /// Re-emitted in a canonical order: segment, `F0`, `F2`, `F3`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LegacyPrefixes: u16 {
        /// `26`
        const ES = 1 << 0;
        /// `2E` (branch not taken hint)
        const CS = 1 << 1;
        /// `36`
        const SS = 1 << 2;
        /// `3E` (branch taken hint)
        const DS = 1 << 3;
        /// `64`
        const FS = 1 << 4;
        /// `65`
        const GS = 1 << 5;
        /// `F0`
        const LOCK = 1 << 6;
        /// `F2` (`bnd`)
        const REPNE = 1 << 7;
        /// `F3`
        const REP = 1 << 8;
    }
}

const PREFIX_BYTES: [(LegacyPrefixes, u8); 9] = [
    (LegacyPrefixes::ES, 0x26),
    (LegacyPrefixes::CS, 0x2E),
    (LegacyPrefixes::SS, 0x36),
    (LegacyPrefixes::DS, 0x3E),
    (LegacyPrefixes::FS, 0x64),
    (LegacyPrefixes::GS, 0x65),
    (LegacyPrefixes::LOCK, 0xF0),
    (LegacyPrefixes::REPNE, 0xF2),
    (LegacyPrefixes::REP, 0xF3),
];

impl LegacyPrefixes {
    /// The flag for a legacy prefix byte, if it is one.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        PREFIX_BYTES
            .iter()
            .find(|(_, b)| *b == byte)
            .map(|(flag, _)| *flag)
    }

    /// Append the prefix bytes in canonical order.
    pub(crate) fn emit(self, buf: &mut InstrBytes) {
        for (flag, byte) in PREFIX_BYTES {
            if self.contains(flag) {
                buf.push(byte);
            }
        }
    }
}

/// A decoded instruction.
///
/// Immutable once decoded: the block encoder copies it whenever it needs a
/// different [`Code`] or target for measurement or emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    ip: u64,
    len: u8,
    code: Code,
    near_branch_target: u64,
    prefixes: LegacyPrefixes,
    bytes: InstrBytes,
    ip_rel_target: Option<u64>,
    offsets: ConstantOffsets,
}

impl Instruction {
    /// A relative branch at `ip` targeting `target`.
    ///
    /// The original length is unknown for hand-built records and reported
    /// as `0`.
    #[must_use]
    pub fn branch(code: Code, ip: u64, target: u64) -> Self {
        Self {
            ip,
            len: 0,
            code,
            near_branch_target: target,
            prefixes: LegacyPrefixes::empty(),
            bytes: InstrBytes::new(),
            ip_rel_target: None,
            offsets: ConstantOffsets::default(),
        }
    }

    /// A non-branch instruction at `ip`, re-emitted verbatim from `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is longer than [`MAX_INSTRUCTION_LENGTH`].
    #[must_use]
    pub fn other(ip: u64, bytes: &[u8]) -> Self {
        assert!(
            bytes.len() <= MAX_INSTRUCTION_LENGTH,
            "x86 instructions are at most {} bytes",
            MAX_INSTRUCTION_LENGTH
        );
        Self {
            ip,
            len: bytes.len() as u8,
            code: Code::Other,
            near_branch_target: 0,
            prefixes: LegacyPrefixes::empty(),
            bytes: InstrBytes::from_slice(bytes),
            ip_rel_target: None,
            offsets: ConstantOffsets::default(),
        }
    }

    /// An indirect `jmp`/`call` through a 64-bit pointer at `slot`
    /// (`FF 25` / `FF 15` with a RIP-relative disp32).
    #[must_use]
    pub(crate) fn indirect_rip(is_call: bool, slot: u64) -> Self {
        let mut instr = Self::branch(
            if is_call {
                Code::CallIndirectRip
            } else {
                Code::JmpIndirectRip
            },
            0,
            0,
        );
        instr.ip_rel_target = Some(slot);
        instr
    }

    pub(crate) fn with_len(mut self, len: usize) -> Self {
        self.len = len as u8;
        self
    }

    pub(crate) fn with_prefixes(mut self, prefixes: LegacyPrefixes) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub(crate) fn with_ip_rel_target(mut self, target: u64) -> Self {
        self.ip_rel_target = Some(target);
        self
    }

    pub(crate) fn with_constant_offsets(mut self, offsets: ConstantOffsets) -> Self {
        self.offsets = offsets;
        self
    }

    /// Original address.
    #[must_use]
    pub fn ip(&self) -> u64 {
        self.ip
    }

    /// Original length in bytes (`0` for hand-built branch records).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the original length is unknown.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the following instruction in the original layout.
    #[must_use]
    pub fn next_ip(&self) -> u64 {
        self.ip.wrapping_add(self.len as u64)
    }

    /// Operation identity.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Replace the operation identity.
    pub fn set_code(&mut self, code: Code) {
        self.code = code;
    }

    /// Branch target (meaningful for relative branches only).
    #[must_use]
    pub fn near_branch_target(&self) -> u64 {
        self.near_branch_target
    }

    /// Replace the branch target.
    pub fn set_near_branch_target(&mut self, target: u64) {
        self.near_branch_target = target;
    }

    /// Legacy prefixes of a relative branch.
    #[must_use]
    pub fn prefixes(&self) -> LegacyPrefixes {
        self.prefixes
    }

    /// Original encoding of a [`Code::Other`] instruction.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Absolute target of an IP-relative memory operand, if there is one.
    #[must_use]
    pub fn ip_rel_target(&self) -> Option<u64> {
        self.ip_rel_target
    }

    /// Replace the IP-relative memory target.
    ///
    /// Has no effect on instructions without an IP-relative operand.
    pub fn set_ip_rel_target(&mut self, target: u64) {
        if self.ip_rel_target.is_some() {
            self.ip_rel_target = Some(target);
        }
    }

    /// Field positions recorded by the decoder.
    #[must_use]
    pub fn constant_offsets(&self) -> ConstantOffsets {
        self.offsets
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Code::Other => {
                f.write_str("db")?;
                for (i, b) in self.bytes.iter().enumerate() {
                    let sep = if i == 0 { " " } else { "," };
                    write!(f, "{sep}{b:02X}h")?;
                }
                Ok(())
            }
            Code::JmpIndirectRip | Code::CallIndirectRip => write!(
                f,
                "{} qword ptr [0x{:X}]",
                self.code.mnemonic(),
                self.ip_rel_target.unwrap_or_default()
            ),
            code => write!(f, "{} 0x{:X}", code.mnemonic(), self.near_branch_target),
        }
    }
}
