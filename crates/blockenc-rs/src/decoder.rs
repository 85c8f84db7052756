//! Length decoder for legacy/integer x86 code.
//!
//! Turns raw bytes into [`Instruction`] records: relative branches get a
//! [`Code`] with their absolute target, everything else becomes
//! [`Code::Other`] carrying its original bytes and, for RIP-relative memory
//! operands, the absolute memory target plus the position of the disp32.
//!
//! The decoder only needs lengths and operand positions, so opcodes are
//! classified with small tables (ModRM present, immediate size) rather than
//! a full instruction database.  VEX/EVEX/XOP encoded instructions and
//! `xbegin` are rejected.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::encoder::ConstantOffsets;
use crate::error::BlockError;
use crate::ir::*;

// ─── Opcode tables ─────────────────────────────────────────

/// Whether a one-byte opcode takes a ModRM byte.
fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x62..=0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC4..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

/// One-byte opcodes that do not exist in 64-bit mode.
fn one_byte_invalid_in_64(opcode: u8) -> bool {
    matches!(
        opcode,
        0x06 | 0x07
            | 0x0E
            | 0x16
            | 0x17
            | 0x1E
            | 0x1F
            | 0x27
            | 0x2F
            | 0x37
            | 0x3F
            | 0x60
            | 0x61
            | 0x82
            | 0x9A
            | 0xCE
            | 0xD4
            | 0xD5
            | 0xD6
            | 0xEA
    )
}

/// Immediate size of a one-byte opcode (branches excluded).
///
/// `F6`/`F7` are handled separately since their immediate depends on the
/// ModRM reg field.
fn one_byte_imm_size(opcode: u8, op16: bool, rex_w: bool, addr_size: usize) -> usize {
    let iz = if op16 { 2 } else { 4 };
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => iz,
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => iz,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 => 1,
        0xA0..=0xA3 => addr_size,
        0xB0..=0xB7 => 1,
        0xB8..=0xBF if rex_w => 8,
        0xB8..=0xBF => iz,
        0xC0 | 0xC1 | 0xC6 => 1,
        0xC2 | 0xCA => 2,
        0xC8 => 3,
        0xCD => 1,
        0xD4 | 0xD5 => 1,
        0xE4..=0xE7 => 1,
        // far pointer: offset + selector
        0x9A | 0xEA => iz + 2,
        _ => 0,
    }
}

/// Whether a `0F xx` opcode takes a ModRM byte.
fn two_byte_has_modrm(opcode: u8) -> bool {
    !matches!(
        opcode,
        0x05..=0x09
            | 0x0B
            | 0x0E
            | 0x30..=0x37
            | 0x77
            | 0x80..=0x8F
            | 0xA0..=0xA2
            | 0xA8..=0xAA
            | 0xC8..=0xCF
    )
}

/// Immediate size of a `0F xx` opcode.
fn two_byte_imm_size(opcode: u8) -> usize {
    match opcode {
        // 3DNow! carries its real opcode as an imm8 suffix
        0x0F => 1,
        0x70..=0x73 => 1,
        0xA4 | 0xAC | 0xBA => 1,
        0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

// ─── Cursor ────────────────────────────────────────────────

/// Bounds-checked reader over one instruction.
struct Cursor<'a> {
    bytes: &'a [u8],
    start: usize,
    pos: usize,
    ip: u64,
}

impl<'a> Cursor<'a> {
    fn error(&self, detail: impl Into<String>) -> BlockError {
        BlockError::Decode {
            ip: self.ip,
            detail: detail.into(),
        }
    }

    fn len(&self) -> usize {
        self.pos - self.start
    }

    fn check_length(&self) -> Result<(), BlockError> {
        if self.len() > MAX_INSTRUCTION_LENGTH {
            return Err(self.error(format!(
                "instruction longer than {MAX_INSTRUCTION_LENGTH} bytes"
            )));
        }
        Ok(())
    }

    fn peek(&self) -> Result<u8, BlockError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("truncated instruction"))
    }

    fn byte(&mut self) -> Result<u8, BlockError> {
        let b = self.peek()?;
        self.pos += 1;
        self.check_length()?;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<(), BlockError> {
        if self.pos + n > self.bytes.len() {
            return Err(self.error("truncated instruction"));
        }
        self.pos += n;
        self.check_length()
    }

    /// Read a little-endian signed value of 1, 2 or 4 bytes.
    fn signed(&mut self, size: usize) -> Result<i64, BlockError> {
        let at = self.pos;
        self.skip(size)?;
        let b = &self.bytes[at..at + size];
        Ok(match size {
            1 => i64::from(b[0] as i8),
            2 => i64::from(i16::from_le_bytes([b[0], b[1]])),
            _ => i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        })
    }

    fn offset(&self) -> u8 {
        self.len() as u8
    }

    fn raw(&self) -> &'a [u8] {
        &self.bytes[self.start..self.pos]
    }

    fn next_ip(&self) -> u64 {
        self.ip.wrapping_add(self.len() as u64)
    }
}

// ─── Prefix state ──────────────────────────────────────────

#[derive(Debug, Default)]
struct Prefixes {
    legacy: LegacyPrefixes,
    operand_size: bool,
    address_size: bool,
    rex: Option<u8>,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex.is_some_and(|rex| rex & 0x08 != 0)
    }
}

// ─── Decoder ───────────────────────────────────────────────

/// Iterator over the instructions of a byte block.
///
/// Stops after the first error.
///
/// # Examples
///
/// ```rust
/// use blockenc_rs::{Bitness, Code, Decoder};
///
/// let code = [0x90, 0xEB, 0xFD];
/// let instrs: Vec<_> = Decoder::new(Bitness::Bits32, &code, 0x1000)
///     .collect::<Result<_, _>>()?;
/// assert_eq!(instrs.len(), 2);
/// assert_eq!(instrs[1].near_branch_target(), 0x1000);
/// assert!(matches!(instrs[1].code(), Code::Jmp { .. }));
/// # Ok::<(), blockenc_rs::BlockError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    bitness: Bitness,
    bytes: &'a [u8],
    ip: u64,
    pos: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    /// Decode `bytes` that were located at `ip`.
    pub fn new(bitness: Bitness, bytes: &'a [u8], ip: u64) -> Self {
        Self {
            bitness,
            bytes,
            ip,
            pos: 0,
            failed: false,
        }
    }

    /// Offset of the next instruction in the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn decode_one(&self) -> Result<Instruction, BlockError> {
        let mut cur = Cursor {
            bytes: self.bytes,
            start: self.pos,
            pos: self.pos,
            ip: self.ip.wrapping_add(self.pos as u64),
        };
        let bits64 = self.bitness == Bitness::Bits64;

        let mut pfx = Prefixes::default();
        let opcode = loop {
            let b = cur.byte()?;
            if let Some(flag) = LegacyPrefixes::from_byte(b) {
                pfx.legacy |= flag;
                pfx.rex = None;
            } else if b == 0x66 {
                pfx.operand_size = true;
                pfx.rex = None;
            } else if b == 0x67 {
                pfx.address_size = true;
                pfx.rex = None;
            } else if bits64 && (0x40..=0x4F).contains(&b) {
                pfx.rex = Some(b);
            } else {
                break b;
            }
        };

        let op16 = (self.bitness == Bitness::Bits16) != pfx.operand_size && !pfx.rex_w();
        let addr16 = !bits64 && ((self.bitness == Bitness::Bits16) != pfx.address_size);
        let addr_size = match (self.bitness, pfx.address_size) {
            (Bitness::Bits64, false) => 8,
            (Bitness::Bits64, true) => 4,
            _ if addr16 => 2,
            _ => 4,
        };

        match opcode {
            0x70..=0x7F => {
                let code = Code::Jcc {
                    cond: Condition::from_nibble(opcode),
                    op_size: self.branch_op_size(&pfx),
                    form: BranchForm::Short,
                };
                finish_branch(&mut cur, &pfx, code, 1)
            }
            0xEB => {
                let code = Code::Jmp {
                    op_size: self.branch_op_size(&pfx),
                    form: BranchForm::Short,
                };
                finish_branch(&mut cur, &pfx, code, 1)
            }
            0xE9 | 0xE8 => {
                let op_size = self.branch_op_size(&pfx);
                let code = if opcode == 0xE8 {
                    Code::Call { op_size }
                } else {
                    Code::Jmp {
                        op_size,
                        form: BranchForm::Near,
                    }
                };
                finish_branch(&mut cur, &pfx, code, op_size.near_disp_size())
            }
            0xE0..=0xE3 => {
                let counter = match (self.bitness, pfx.address_size) {
                    (Bitness::Bits16, false) | (Bitness::Bits32, true) => CounterReg::Cx,
                    (Bitness::Bits64, false) => CounterReg::Rcx,
                    _ => CounterReg::Ecx,
                };
                let code = Code::CounterBranch {
                    op: CounterOp::from_opcode(opcode),
                    op_size: self.branch_op_size(&pfx),
                    counter,
                };
                finish_branch(&mut cur, &pfx, code, 1)
            }
            0x0F => self.decode_0f(&mut cur, &pfx, addr16),
            _ => {
                if bits64 && one_byte_invalid_in_64(opcode) {
                    return Err(cur.error(format!(
                        "opcode 0x{opcode:02X} is invalid in 64-bit mode"
                    )));
                }
                match opcode {
                    0xC4 | 0xC5 if bits64 || cur.peek()? >= 0xC0 => {
                        return Err(cur.error("VEX-encoded instructions are not supported"));
                    }
                    0x62 if bits64 || cur.peek()? >= 0xC0 => {
                        return Err(cur.error("EVEX-encoded instructions are not supported"));
                    }
                    0x8F if cur.peek()? & 0x38 != 0 => {
                        return Err(cur.error("XOP-encoded instructions are not supported"));
                    }
                    0xC7 if cur.peek()? == 0xF8 => {
                        return Err(cur.error("xbegin is not supported"));
                    }
                    _ => {}
                }

                let mut offsets = ConstantOffsets::default();
                let mut ip_rel = None;
                let mut imm = one_byte_imm_size(opcode, op16, pfx.rex_w(), addr_size);
                if one_byte_has_modrm(opcode) {
                    let modrm = cur.peek()?;
                    ip_rel = self.modrm(&mut cur, &pfx, addr16, &mut offsets)?;
                    if matches!(opcode, 0xF6 | 0xF7) && (modrm >> 3) & 7 <= 1 {
                        imm = match (opcode, op16) {
                            (0xF6, _) => 1,
                            (_, true) => 2,
                            _ => 4,
                        };
                    }
                }
                finish_other(&mut cur, offsets, ip_rel, imm)
            }
        }
    }

    /// `0F`, `0F 38` and `0F 3A` maps.
    fn decode_0f(
        &self,
        cur: &mut Cursor<'_>,
        pfx: &Prefixes,
        addr16: bool,
    ) -> Result<Instruction, BlockError> {
        let opcode = cur.byte()?;
        let mut offsets = ConstantOffsets::default();
        match opcode {
            0x80..=0x8F => {
                let op_size = self.branch_op_size(pfx);
                let code = Code::Jcc {
                    cond: Condition::from_nibble(opcode),
                    op_size,
                    form: BranchForm::Near,
                };
                finish_branch(cur, pfx, code, op_size.near_disp_size())
            }
            0x38 | 0x3A => {
                cur.byte()?;
                let ip_rel = self.modrm(cur, pfx, addr16, &mut offsets)?;
                let imm = usize::from(opcode == 0x3A);
                finish_other(cur, offsets, ip_rel, imm)
            }
            _ => {
                let ip_rel = if two_byte_has_modrm(opcode) {
                    self.modrm(cur, pfx, addr16, &mut offsets)?
                } else {
                    None
                };
                finish_other(cur, offsets, ip_rel, two_byte_imm_size(opcode))
            }
        }
    }

    /// Consume ModRM, SIB and displacement.  Returns the disp32 of a
    /// RIP-relative operand; it is resolved once the full length is known.
    fn modrm(
        &self,
        cur: &mut Cursor<'_>,
        pfx: &Prefixes,
        addr16: bool,
        offsets: &mut ConstantOffsets,
    ) -> Result<Option<i64>, BlockError> {
        let modrm = cur.byte()?;
        let md = modrm >> 6;
        let rm = modrm & 7;
        if md == 3 {
            return Ok(None);
        }

        let disp_size = if addr16 {
            match (md, rm) {
                (0, 6) | (2, _) => 2,
                (1, _) => 1,
                _ => 0,
            }
        } else {
            let mut size = match md {
                1 => 1,
                2 => 4,
                _ => 0,
            };
            if rm == 4 {
                let sib = cur.byte()?;
                if md == 0 && sib & 7 == 5 {
                    size = 4;
                }
            } else if md == 0 && rm == 5 {
                size = 4;
                if self.bitness == Bitness::Bits64 {
                    if pfx.address_size {
                        return Err(cur.error("EIP-relative addressing is not supported"));
                    }
                    offsets.displacement_offset = cur.offset();
                    offsets.displacement_size = 4;
                    return cur.signed(4).map(Some);
                }
            }
            size
        };

        if disp_size != 0 {
            offsets.displacement_offset = cur.offset();
            offsets.displacement_size = disp_size as u8;
            cur.skip(disp_size)?;
        }
        Ok(None)
    }

    /// Operand size of a relative branch: `66` toggles it in 16/32-bit mode
    /// and is ignored in 64-bit mode.
    fn branch_op_size(&self, pfx: &Prefixes) -> OpSize {
        match (self.bitness, pfx.operand_size) {
            (Bitness::Bits64, _) => OpSize::W64,
            (Bitness::Bits16, false) | (Bitness::Bits32, true) => OpSize::W16,
            _ => OpSize::W32,
        }
    }
}

fn finish_other(
    cur: &mut Cursor<'_>,
    mut offsets: ConstantOffsets,
    rip_disp: Option<i64>,
    imm: usize,
) -> Result<Instruction, BlockError> {
    if imm != 0 {
        offsets.immediate_offset = cur.offset();
        offsets.immediate_size = imm as u8;
        cur.skip(imm)?;
    }
    let mut instr = Instruction::other(cur.ip, cur.raw()).with_constant_offsets(offsets);
    if let Some(disp) = rip_disp {
        instr = instr.with_ip_rel_target(cur.next_ip().wrapping_add(disp as u64));
    }
    Ok(instr)
}

fn finish_branch(
    cur: &mut Cursor<'_>,
    pfx: &Prefixes,
    code: Code,
    disp_size: usize,
) -> Result<Instruction, BlockError> {
    let disp = cur.signed(disp_size)?;
    let op_size = code.op_size().unwrap_or(OpSize::W64);
    let target = cur.next_ip().wrapping_add(disp as u64) & op_size.mask();
    Ok(Instruction::branch(code, cur.ip, target)
        .with_len(cur.len())
        .with_prefixes(pfx.legacy))
}

impl Iterator for Decoder<'_> {
    type Item = Result<Instruction, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        match self.decode_one() {
            Ok(instr) => {
                self.pos += instr.len();
                Some(Ok(instr))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Decode a whole block of code located at `ip`.
///
/// # Errors
///
/// Returns [`BlockError::Decode`] for truncated, over-long or unsupported
/// instructions.
pub fn decode_block(
    bitness: Bitness,
    bytes: &[u8],
    ip: u64,
) -> Result<Vec<Instruction>, BlockError> {
    Decoder::new(bitness, bytes, ip).collect()
}
