//! Error types for decoding, encoding, and block relocation.

use alloc::string::String;

use crate::ir::Bitness;

/// Failure reported by the instruction encoder for a single instruction.
///
/// The block encoder never looks inside these beyond wrapping them into
/// [`BlockError::Encode`] together with the offending instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncoderError {
    /// A relative displacement does not fit its encoded field.
    #[error("displacement {disp} does not fit in a signed {bits}-bit field")]
    DisplacementOutOfRange {
        /// The displacement that was required.
        disp: i64,
        /// Width of the displacement field in bits.
        bits: u8,
    },

    /// A branch target cannot be represented by the instruction pointer width.
    #[error("target 0x{target:X} is not reachable with a {bits}-bit instruction pointer")]
    TargetOutOfRange {
        /// The absolute target address.
        target: u64,
        /// Operand (instruction pointer) width in bits.
        bits: u16,
    },

    /// The branch operand size cannot be encoded in the current mode.
    #[error("{bits}-bit branch operand size is not encodable in {bitness} mode")]
    UnsupportedOperandSize {
        /// Requested operand size in bits.
        bits: u16,
        /// The mode the encoder runs in.
        bitness: Bitness,
    },

    /// The instruction record cannot be encoded at all.
    #[error("{detail}")]
    UnsupportedInstruction {
        /// Why the record was rejected.
        detail: String,
    },
}

/// Error returned by block relocation.
///
/// Any error aborts the whole request: there is never partial output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockError {
    /// The input bytes could not be decoded into instructions.
    #[error("0x{ip:X}: cannot decode instruction: {detail}")]
    Decode {
        /// Address of the undecodable instruction.
        ip: u64,
        /// What went wrong.
        detail: String,
    },

    /// The encoder rejected the form chosen for an instruction.
    #[error("{source} : 0x{ip:X} {instruction}")]
    Encode {
        /// Original address of the offending instruction.
        ip: u64,
        /// Short rendering of the offending instruction.
        instruction: String,
        /// The encoder's reason.
        #[source]
        source: EncoderError,
    },

    /// The request itself is malformed (detected before any encoding).
    #[error("invalid block: {detail}")]
    InvalidBlock {
        /// Description of the problem.
        detail: String,
    },
}
