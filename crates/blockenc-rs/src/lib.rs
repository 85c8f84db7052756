//! # blockenc-rs — x86 Block Relocation with Branch Relaxation
//!
//! `blockenc-rs` moves already-assembled x86 code (16, 32 or 64-bit) to a new
//! address.  Relative branches are re-targeted and re-sized, IP-relative
//! memory operands are rewritten, and branches whose target is out of reach
//! are replaced by equivalent sequences.
//!
//! ## Quick Start
//!
//! ```rust
//! use blockenc_rs::{relocate, Bitness};
//!
//! // jmp short +0; nop   at 0x1000
//! let code = relocate(&[0xEB, 0x00, 0x90], Bitness::Bits32, 0x1000, 0x5000)?;
//! assert_eq!(code, vec![0xEB, 0x00, 0x90]);
//! # Ok::<(), blockenc_rs::BlockError>(())
//! ```
//!
//! ## Features
//!
//! - **Branch relaxation**: every branch takes the smallest form that
//!   reaches its target; passes repeat until no size changes.
//! - **Long branches** (64-bit): out-of-range `jmp`/`call`/`jcc` go through
//!   an 8-byte pointer slot emitted after the code and reported as a
//!   [`RelocInfo`].
//! - **Counter branches**: `loop*`/`jcxz` that cannot reach are rewritten
//!   into a short trampoline.
//! - **Multiple blocks**: branches between blocks follow both relocations.
//! - **`no_std` + `alloc`**.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// Address arithmetic wraps and narrows between u64, i64, i32 and u8 on
// purpose, and opcode tables use dense hex literals without separators.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::redundant_closure_for_method_calls,
    clippy::bool_to_int_with_if,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::redundant_else,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::needless_continue
)]

extern crate alloc;

/// Block encoder: options, blocks, relaxation driver and results.
pub mod block;
pub(crate) mod counter;
pub(crate) mod data;
/// Length decoder for legacy x86 code.
pub mod decoder;
/// Single-instruction encoder and constant-offset reporting.
pub mod encoder;
/// Error types.
pub mod error;
pub(crate) mod instr;
/// Instruction records: bitness, codes, prefixes.
pub mod ir;
pub(crate) mod jump;
pub(crate) mod target;

// Re-exports
pub use block::{
    BlockEncoder, BlockEncoderOptions, BlockEncoderResult, InstructionBlock, RelocInfo, RelocKind,
};
pub use decoder::{decode_block, Decoder};
pub use encoder::{measure, ConstantOffsets, Encoder};
pub use error::{BlockError, EncoderError};
pub use ir::{
    Bitness, BranchForm, Code, Condition, CounterOp, CounterReg, Instruction, LegacyPrefixes,
    OpSize, MAX_INSTRUCTION_LENGTH,
};

use alloc::vec::Vec;

/// Relocate raw code from `orig_ip` to `new_ip`.
///
/// Returns only the bytes; use [`relocate_with`] for instruction offsets and
/// relocations.
///
/// # Errors
///
/// Returns [`BlockError`] if the code cannot be decoded or an instruction
/// cannot be encoded at its new address.
///
/// # Examples
///
/// ```rust
/// use blockenc_rs::{relocate, Bitness};
///
/// // jmp short 0x8004 at 0x8000, moved 0x1000 up: becomes jmp near.
/// let code = relocate(&[0xEB, 0x02], Bitness::Bits16, 0x8000, 0x9000)?;
/// assert_eq!(code, vec![0xE9, 0x01, 0xF0]);
/// # Ok::<(), blockenc_rs::BlockError>(())
/// ```
pub fn relocate(
    bytes: &[u8],
    bitness: Bitness,
    orig_ip: u64,
    new_ip: u64,
) -> Result<Vec<u8>, BlockError> {
    let result = relocate_with(bytes, bitness, orig_ip, new_ip, BlockEncoderOptions::empty())?;
    Ok(result.into_code_buffer())
}

/// Relocate raw code from `orig_ip` to `new_ip` with explicit options.
///
/// # Errors
///
/// Returns [`BlockError`] on decode or encode failure (see [`relocate`]).
///
/// # Examples
///
/// ```rust
/// use blockenc_rs::{relocate_with, Bitness, BlockEncoderOptions};
///
/// let result = relocate_with(
///     &[0x90, 0xC3],
///     Bitness::Bits64,
///     0x1000,
///     0x2000,
///     BlockEncoderOptions::RETURN_CONSTANT_OFFSETS,
/// )?;
/// assert_eq!(result.code_buffer(), &[0x90, 0xC3]);
/// assert_eq!(result.new_instruction_offsets(), &[0, 1]);
/// # Ok::<(), blockenc_rs::BlockError>(())
/// ```
pub fn relocate_with(
    bytes: &[u8],
    bitness: Bitness,
    orig_ip: u64,
    new_ip: u64,
    options: BlockEncoderOptions,
) -> Result<BlockEncoderResult, BlockError> {
    let instructions = decode_block(bitness, bytes, orig_ip)?;
    tracing::debug!(
        %bitness,
        orig_ip,
        new_ip,
        instructions = instructions.len(),
        "relocating"
    );
    BlockEncoder::encode(bitness, &InstructionBlock::new(instructions, new_ip), options)
}
