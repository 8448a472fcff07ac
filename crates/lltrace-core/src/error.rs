//! Error types for the lltrace core.
//!
//! Nothing here is fatal to a capture: the engine converts every error raised
//! while dissecting a frame into an [`Annotation`](crate::verdict::Annotation)
//! on that frame and moves on to the next one.

use serde::Serialize;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// PDU parsing error
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),

    /// Frame-indexed store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Fragment reassembly error
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Invalid engine configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Frame numbers start at 1; 0 marks an empty procedure slot
    #[error("frame number 0 is reserved")]
    ReservedFrameNumber,

    /// A replay pass asked for a frame the authoritative pass never saw
    #[error("frame {0} was not visited on the authoritative pass")]
    NotVisited(u32),
}

/// PDU-level errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum PduError {
    /// Frame too short to hold a fixed-size structure
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Header length field exceeds the captured bytes
    #[error("declared length {declared} exceeds the {available} captured bytes")]
    LengthOverflow {
        /// Length declared by the PDU header
        declared: usize,
        /// Bytes actually captured after the header
        available: usize,
    },

    /// Control PDU shorter than its opcode requires
    #[error("control opcode 0x{opcode:02X} needs {expected} bytes of CtrData, got {actual}")]
    ControlTooShort {
        /// Control opcode
        opcode: u8,
        /// CtrData length required by the opcode
        expected: usize,
        /// CtrData bytes present
        actual: usize,
    },

    /// Fewer than three bytes left for the trailing CRC
    #[error("checksum missing: {available} of 3 bytes present")]
    MissingChecksum {
        /// Bytes present after the payload
        available: usize,
    },

    /// Reserved LLID value in a data channel header
    #[error("reserved LLID")]
    ReservedLlid,

    /// Control opcode outside the known range
    #[error("unknown control opcode: 0x{0:02X}")]
    UnknownControlOpcode(u8),

    /// Payload does not fit the 8-bit length field
    #[error("payload of {0} bytes exceeds the 255-byte length field")]
    PayloadTooLong(usize),
}

/// Frame-indexed store errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    /// Insert with an effective frame older than the newest one for the key
    #[error("out-of-order insert: frame {attempted} precedes frame {last}")]
    OutOfOrderInsert {
        /// Last effective frame recorded for the key
        last: u32,
        /// Effective frame of the rejected insert
        attempted: u32,
    },
}

/// Fragment reassembly errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ReassemblyError {
    /// Declared size cannot be satisfied; the assembly is kept but incomplete
    #[error("fragment too large: declared {declared} bytes, {available} available")]
    FragmentTooLarge {
        /// Declared length (total message or fragment)
        declared: usize,
        /// Bytes that can actually be stored
        available: usize,
    },

    /// Fragment would overrun the declared total; the assembly is abandoned
    #[error("sequence gap: {incoming} bytes at offset {offset} overrun total {total}")]
    SequenceGap {
        /// Fill offset before this fragment
        offset: usize,
        /// Length of the rejected fragment
        incoming: usize,
        /// Declared (or maximum) total length
        total: usize,
    },

    /// Continuation fragment with no assembly in progress
    #[error("continuation fragment without a start fragment")]
    MissingStart,

    /// No assembly recorded under the given first-fragment frame
    #[error("unknown assembly: {0}")]
    UnknownAssembly(u32),
}

/// Engine configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A size limit is outside its allowed range
    #[error("{name} must be between {min} and {max}, got {value}")]
    LimitOutOfRange {
        /// Name of the offending setting
        name: &'static str,
        /// Configured value
        value: usize,
        /// Minimum allowed value
        min: usize,
        /// Maximum allowed value
        max: usize,
    },
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
