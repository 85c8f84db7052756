//! x86 encoder for the instruction records the block encoder emits.
//!
//! This is the "encode / measure" service: given an [`Instruction`] and the
//! address it will live at, produce its bytes or an [`EncoderError`].
//! Relative branches are encoded from their [`Code`]; everything else is
//! copied from its original bytes with an IP-relative disp32 rewritten.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::EncoderError;
use crate::ir::*;

// ─── InstrBytes: stack-allocated instruction buffer ────────────────────

/// Stack-allocated instruction byte buffer — no heap allocation per
/// measured or emitted instruction.
///
/// x86 instructions are at most 15 bytes; the buffer holds 32 so that an
/// over-long prefix sequence is caught by the encoder's length check rather
/// than by a panic.
#[derive(Clone, Copy)]
pub struct InstrBytes {
    data: [u8; 32],
    len: u8,
}

impl InstrBytes {
    /// Create an empty buffer.
    #[inline]
    pub const fn new() -> Self {
        Self {
            data: [0; 32],
            len: 0,
        }
    }

    /// Create a buffer pre-filled from a byte slice (max 32 bytes).
    #[inline]
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.extend_from_slice(src);
        buf
    }

    /// Append a single byte.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full (32 bytes).
    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!(
            (self.len as usize) < 32,
            "InstrBytes overflow: cannot push beyond 32 bytes"
        );
        self.data[self.len as usize] = byte;
        self.len += 1;
    }

    /// Append a slice of bytes.
    ///
    /// # Panics
    ///
    /// Panics if appending would exceed the 32-byte capacity.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.len as usize;
        let end = start + bytes.len();
        assert!(
            end <= 32,
            "InstrBytes overflow: {} + {} exceeds 32-byte capacity",
            start,
            bytes.len()
        );
        self.data[start..end].copy_from_slice(bytes);
        self.len = end as u8;
    }

    /// Number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Convert to a heap-allocated `Vec<u8>`.
    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

impl Default for InstrBytes {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for InstrBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl core::ops::DerefMut for InstrBytes {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }
}

impl AsRef<[u8]> for InstrBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl core::fmt::Debug for InstrBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for InstrBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for InstrBytes {}

impl PartialEq<[u8]> for InstrBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

// ─── ConstantOffsets ───────────────────────────────────────

/// Positions of the constant fields inside one encoded instruction.
///
/// A size of `0` means the field is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstantOffsets {
    /// Offset of the memory displacement.
    pub displacement_offset: u8,
    /// Size of the memory displacement (1, 2, 4 or 8).
    pub displacement_size: u8,
    /// Offset of the immediate.
    pub immediate_offset: u8,
    /// Size of the immediate (1, 2, 4 or 8).
    pub immediate_size: u8,
    /// Offset of the relative branch displacement.
    pub branch_offset: u8,
    /// Size of the relative branch displacement (1, 2 or 4).
    pub branch_size: u8,
}

impl ConstantOffsets {
    /// Whether a memory displacement is present.
    #[must_use]
    pub fn has_displacement(&self) -> bool {
        self.displacement_size != 0
    }

    /// Whether an immediate is present.
    #[must_use]
    pub fn has_immediate(&self) -> bool {
        self.immediate_size != 0
    }

    /// Whether a relative branch displacement is present.
    #[must_use]
    pub fn has_branch(&self) -> bool {
        self.branch_size != 0
    }
}

// ─── Encoder ───────────────────────────────────────────────

/// Size of `jmp/call qword ptr [rip+disp32]`.
pub const INDIRECT_RIP_SIZE: usize = 6;

/// Encodes instructions for one bitness into a growing byte buffer.
///
/// # Examples
///
/// ```rust
/// use blockenc_rs::{Bitness, Encoder, Instruction};
///
/// let mut enc = Encoder::new(Bitness::Bits32);
/// let nop = Instruction::other(0x1000, &[0x90]);
/// assert_eq!(enc.encode(&nop, 0x2000)?, 1);
/// assert_eq!(enc.take_buffer(), vec![0x90]);
/// # Ok::<(), blockenc_rs::EncoderError>(())
/// ```
#[derive(Debug)]
pub struct Encoder {
    bitness: Bitness,
    buffer: Vec<u8>,
    offsets: ConstantOffsets,
}

impl Encoder {
    /// Create an encoder with an empty buffer.
    pub fn new(bitness: Bitness) -> Self {
        Self::with_capacity(bitness, 0)
    }

    /// Create an encoder whose buffer has room for `capacity` bytes.
    pub fn with_capacity(bitness: Bitness, capacity: usize) -> Self {
        Self {
            bitness,
            buffer: Vec::with_capacity(capacity),
            offsets: ConstantOffsets::default(),
        }
    }

    /// The mode this encoder encodes for.
    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// Encode `instr` as if located at `ip` and append it to the buffer.
    ///
    /// Returns the number of bytes written.  Nothing is appended on error.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError`] if a displacement or target does not fit, or
    /// if the record is not encodable in this bitness.
    pub fn encode(&mut self, instr: &Instruction, ip: u64) -> Result<usize, EncoderError> {
        let mut buf = InstrBytes::new();
        self.offsets = encode_into(self.bitness, instr, ip, &mut buf)?;
        self.buffer.extend_from_slice(&buf);
        Ok(buf.len())
    }

    /// Field positions of the most recently encoded instruction.
    pub fn constant_offsets(&self) -> ConstantOffsets {
        self.offsets
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// Append raw bytes (alignment padding, pointer-slot data).
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the buffer out, leaving the encoder empty.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buffer)
    }
}

/// Size of `instr` encoded at `ip`, without writing anything.
///
/// # Errors
///
/// Same as [`Encoder::encode`].
pub fn measure(bitness: Bitness, instr: &Instruction, ip: u64) -> Result<usize, EncoderError> {
    let mut buf = InstrBytes::new();
    encode_into(bitness, instr, ip, &mut buf)?;
    Ok(buf.len())
}

fn encode_into(
    bitness: Bitness,
    instr: &Instruction,
    ip: u64,
    buf: &mut InstrBytes,
) -> Result<ConstantOffsets, EncoderError> {
    let code = instr.code();
    if !code.is_valid_for(bitness) {
        return Err(match code.op_size() {
            Some(op_size) if !op_size.is_valid_for(bitness) => {
                EncoderError::UnsupportedOperandSize {
                    bits: op_size.bits(),
                    bitness,
                }
            }
            _ => EncoderError::UnsupportedInstruction {
                detail: alloc::format!("{} is not encodable in {} mode", code.mnemonic(), bitness),
            },
        });
    }

    let offsets = match code {
        Code::Other => encode_other(instr, ip, buf)?,
        Code::JmpIndirectRip | Code::CallIndirectRip => encode_indirect_rip(instr, ip, buf)?,
        _ => encode_branch(bitness, instr, ip, buf)?,
    };

    if buf.len() > MAX_INSTRUCTION_LENGTH {
        return Err(EncoderError::UnsupportedInstruction {
            detail: alloc::format!(
                "encoding is {} bytes, longer than {} bytes",
                buf.len(),
                MAX_INSTRUCTION_LENGTH
            ),
        });
    }
    Ok(offsets)
}

/// Relative branch: `[legacy] [66] [67] opcode disp`.
fn encode_branch(
    bitness: Bitness,
    instr: &Instruction,
    ip: u64,
    buf: &mut InstrBytes,
) -> Result<ConstantOffsets, EncoderError> {
    let code = instr.code();
    let Some(op_size) = code.op_size() else {
        return Err(unsupported(instr));
    };

    instr.prefixes().emit(buf);
    if op_size != bitness.default_branch_op_size() {
        buf.push(0x66);
    }

    let disp_size = match code {
        Code::Jmp {
            form: BranchForm::Short,
            ..
        } => {
            buf.push(0xEB);
            1
        }
        Code::Jmp {
            form: BranchForm::Near,
            ..
        } => {
            buf.push(0xE9);
            op_size.near_disp_size()
        }
        Code::Call { .. } => {
            buf.push(0xE8);
            op_size.near_disp_size()
        }
        Code::Jcc {
            cond,
            form: BranchForm::Short,
            ..
        } => {
            buf.push(0x70 | cond.nibble());
            1
        }
        Code::Jcc {
            cond,
            form: BranchForm::Near,
            ..
        } => {
            buf.push(0x0F);
            buf.push(0x80 | cond.nibble());
            op_size.near_disp_size()
        }
        Code::CounterBranch { op, counter, .. } => {
            if counter != bitness.default_counter() {
                buf.push(0x67);
            }
            buf.push(op.opcode());
            1
        }
        _ => return Err(unsupported(instr)),
    };

    let target = instr.near_branch_target();
    if target & !op_size.mask() != 0 {
        return Err(EncoderError::TargetOutOfRange {
            target,
            bits: op_size.bits(),
        });
    }

    let branch_offset = buf.len();
    let next_ip = ip.wrapping_add((branch_offset + disp_size) as u64);
    let disp = match op_size {
        OpSize::W16 => (target as u16).wrapping_sub(next_ip as u16) as i16 as i64,
        OpSize::W32 => (target as u32).wrapping_sub(next_ip as u32) as i32 as i64,
        OpSize::W64 => target.wrapping_sub(next_ip) as i64,
    };

    match disp_size {
        1 => {
            let rel8 = i8::try_from(disp)
                .map_err(|_| EncoderError::DisplacementOutOfRange { disp, bits: 8 })?;
            buf.push(rel8 as u8);
        }
        2 => buf.extend_from_slice(&(disp as i16).to_le_bytes()),
        _ => {
            let rel32 = i32::try_from(disp)
                .map_err(|_| EncoderError::DisplacementOutOfRange { disp, bits: 32 })?;
            buf.extend_from_slice(&rel32.to_le_bytes());
        }
    }

    Ok(ConstantOffsets {
        branch_offset: branch_offset as u8,
        branch_size: disp_size as u8,
        ..ConstantOffsets::default()
    })
}

/// `FF 25 disp32` (`jmp`) / `FF 15 disp32` (`call`), RIP-relative.
fn encode_indirect_rip(
    instr: &Instruction,
    ip: u64,
    buf: &mut InstrBytes,
) -> Result<ConstantOffsets, EncoderError> {
    let Some(slot) = instr.ip_rel_target() else {
        return Err(unsupported(instr));
    };
    let modrm = if instr.code() == Code::CallIndirectRip {
        0x15
    } else {
        0x25
    };
    buf.push(0xFF);
    buf.push(modrm);
    let next_ip = ip.wrapping_add(INDIRECT_RIP_SIZE as u64);
    buf.extend_from_slice(&rip_disp32(slot, next_ip)?.to_le_bytes());
    Ok(ConstantOffsets {
        displacement_offset: 2,
        displacement_size: 4,
        ..ConstantOffsets::default()
    })
}

/// Original bytes, with the RIP-relative disp32 rewritten for `ip`.
fn encode_other(
    instr: &Instruction,
    ip: u64,
    buf: &mut InstrBytes,
) -> Result<ConstantOffsets, EncoderError> {
    if instr.bytes().is_empty() {
        return Err(unsupported(instr));
    }
    buf.extend_from_slice(instr.bytes());
    let offsets = instr.constant_offsets();
    if let Some(target) = instr.ip_rel_target() {
        let at = offsets.displacement_offset as usize;
        if offsets.displacement_size != 4 || at + 4 > buf.len() {
            return Err(EncoderError::UnsupportedInstruction {
                detail: String::from("IP-relative operand without a 32-bit displacement"),
            });
        }
        let next_ip = ip.wrapping_add(buf.len() as u64);
        let disp = rip_disp32(target, next_ip)?;
        buf[at..at + 4].copy_from_slice(&disp.to_le_bytes());
    }
    Ok(offsets)
}

fn rip_disp32(target: u64, next_ip: u64) -> Result<i32, EncoderError> {
    let disp = target.wrapping_sub(next_ip) as i64;
    i32::try_from(disp).map_err(|_| EncoderError::DisplacementOutOfRange { disp, bits: 32 })
}

fn unsupported(instr: &Instruction) -> EncoderError {
    EncoderError::UnsupportedInstruction {
        detail: alloc::format!("cannot encode {}", instr),
    }
}
