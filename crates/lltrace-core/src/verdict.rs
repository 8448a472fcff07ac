//! Per-frame verdicts, annotations and cross references.
//!
//! A [`FrameVerdict`] is decided once, on the authoritative pass, and cached;
//! replay passes hand back the cached value unchanged. Links that point forward
//! in the capture (a request's responses, the frame that completed a message)
//! are not part of the verdict: they are resolved from the stores on demand as
//! [`CrossReferences`], which keeps every pass's verdict identical.

use serde::Serialize;
use thiserror::Error;

use crate::checksum::ChecksumVerdict;
use crate::connection::{ConnectionId, StreamKey};
use crate::context::Direction;
use crate::error::{PduError, ReassemblyError, StoreError};
use crate::frame::{AdvPduType, ControlOpcode, Llid};
use crate::reassembly::MessageKind;
use crate::sequence::SequenceVerdict;

/// Error taxonomy of per-frame annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationClass {
    /// Declared length or offset exceeds the available bytes
    Malformed,
    /// The capture shows behaviour the protocol forbids
    ProtocolViolation,
    /// Transmitted CRC does not match
    ChecksumIncorrect,
    /// Missing context prevents a check; informational
    Indeterminate,
    /// A store insert arrived out of frame order and was dropped
    OutOfOrderInsert,
    /// A fragment could not be placed in its message
    SequenceGap,
}

/// Non-fatal finding attached to a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Annotation {
    /// Frame structure could not be parsed past this point
    #[error("malformed: {0}")]
    Malformed(PduError),

    /// Control opcode outside the known table
    #[error("unknown control opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Control PDU that continues no open procedure
    #[error("{opcode} does not continue any open procedure")]
    WrongSequence {
        /// Opcode of the stray PDU
        opcode: ControlOpcode,
    },

    /// Both ends are negotiating instant-bearing procedures at once
    #[error("procedure collides with the procedure initiated in frame {other_procedure}")]
    Collision {
        /// Slot 0 frame of the other direction's procedure
        other_procedure: u32,
    },

    /// New procedure while this direction still has one open
    #[error("procedure initiated in frame {open_since} is still open")]
    ProcedureOverlap {
        /// Slot 0 frame of the open procedure
        open_since: u32,
    },

    /// Instant not ahead of the current event counter
    #[error("instant {instant} is not after event counter {event_counter}")]
    InstantInPast {
        /// Announced instant
        instant: u16,
        /// Event counter of the announcing frame
        event_counter: u16,
    },

    /// Instant announced without an event counter to compare against
    #[error("event counter unavailable")]
    EventCounterUnavailable,

    /// Transmitted CRC does not match the computed one
    #[error("checksum incorrect: computed 0x{computed:06X}, transmitted 0x{declared:06X}")]
    ChecksumIncorrect {
        /// CRC computed over the PDU
        computed: u32,
        /// Transmitted CRC, bit order corrected
        declared: u32,
    },

    /// No CRC init is known for the stream
    #[error("checksum indeterminate")]
    ChecksumIndeterminate,

    /// Data on an access address whose connection request was not captured
    #[error("connection start not captured")]
    ConnectionStartNotCaptured,

    /// Encrypted payload that was not decrypted by the capture source
    #[error("encrypted payload")]
    EncryptedPayload,

    /// Frame on a connection after its termination
    #[error("connection was terminated in frame {terminated_in}")]
    DataAfterTermination {
        /// Frame of the LL_TERMINATE_IND
        terminated_in: u32,
    },

    /// A store insert was dropped
    #[error("{0}")]
    Store(StoreError),

    /// A fragment could not be reassembled
    #[error("{0}")]
    Reassembly(ReassemblyError),
}

impl Annotation {
    /// Taxonomy class
    #[must_use]
    pub fn class(&self) -> AnnotationClass {
        match self {
            Self::Malformed(_) | Self::Reassembly(ReassemblyError::FragmentTooLarge { .. }) => {
                AnnotationClass::Malformed
            }
            Self::UnknownOpcode(_)
            | Self::WrongSequence { .. }
            | Self::Collision { .. }
            | Self::ProcedureOverlap { .. }
            | Self::InstantInPast { .. } => AnnotationClass::ProtocolViolation,
            Self::ChecksumIncorrect { .. } => AnnotationClass::ChecksumIncorrect,
            Self::EventCounterUnavailable
            | Self::ChecksumIndeterminate
            | Self::ConnectionStartNotCaptured
            | Self::EncryptedPayload
            | Self::DataAfterTermination { .. } => AnnotationClass::Indeterminate,
            Self::Store(_) => AnnotationClass::OutOfOrderInsert,
            Self::Reassembly(_) => AnnotationClass::SequenceGap,
        }
    }
}

/// What layer a frame was dissected as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum PduKind {
    /// Advertising channel PDU (primary, auxiliary or periodic)
    Advertising {
        /// PDU type
        pdu_type: AdvPduType,
    },
    /// Data channel PDU carrying L2CAP or an empty PDU
    Data {
        /// Logical link identifier
        llid: Llid,
    },
    /// LL control PDU
    Control {
        /// Raw opcode
        opcode: u8,
    },
    /// Too short to tell
    Unparsed,
}

/// Role of a frame in a fragmented message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentRole {
    /// Whole message in one frame
    Single,
    /// First fragment
    Start,
    /// Middle fragment
    Continuation,
    /// Completing fragment
    End,
}

/// Link from a frame to the message it is part of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentLink {
    /// Message kind
    pub kind: MessageKind,
    /// Frame of the first fragment
    pub first_frame: u32,
    /// Role of this frame
    pub role: FragmentRole,
}

/// One control procedure instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcedureId {
    /// Connection the procedure runs on
    pub connection: ConnectionId,
    /// Direction that initiated it
    pub owner: Direction,
    /// Frame of slot 0
    pub initiated_in: u32,
}

/// Link from a control PDU to its procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlLink {
    /// Procedure the frame belongs to
    pub procedure: ProcedureId,
    /// Slot the frame occupies (0 = initiating)
    pub slot: u8,
    /// Opcode that initiated the procedure
    pub initiated_by: ControlOpcode,
}

/// State changes caused by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A connection record was created
    ConnectionCreated {
        /// The new connection
        connection: ConnectionId,
        /// Created from data rather than a connection request
        implicit: bool,
    },
    /// The connection's validity window was closed
    ConnectionTerminated {
        /// The closed connection
        connection: ConnectionId,
    },
    /// A procedure reached its instant
    ProcedureCompleted {
        /// The completed procedure
        procedure: ProcedureId,
    },
    /// New connection parameters took effect
    ParametersUpdated {
        /// Frame that carried the change
        requested_in: u32,
    },
    /// Link encryption started
    EncryptionStarted,
    /// Link encryption paused
    EncryptionPaused,
    /// A periodic advertising train was announced
    PeriodicTrainLearned {
        /// Stream of the train
        train: StreamKey,
    },
}

/// Payload handed to the next layer by this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    /// Nothing handed on
    #[default]
    None,
    /// A byte range of this frame, handed on as-is
    Direct {
        /// Message kind
        kind: MessageKind,
        /// Offset into the frame bytes
        offset: usize,
        /// Length in bytes
        len: usize,
    },
    /// A reassembled message completed by this frame
    Reassembled {
        /// Message kind
        kind: MessageKind,
        /// Frame of the first fragment
        first_frame: u32,
    },
}

/// Everything decided about one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameVerdict {
    /// Frame number
    pub frame: u32,
    /// Stream the frame belongs to
    pub stream: Option<StreamKey>,
    /// Connection instance the frame belongs to
    pub connection: Option<ConnectionId>,
    /// Transmission direction
    pub direction: Direction,
    /// Layer the frame was dissected as
    pub pdu: PduKind,
    /// Sequence verdict (data frames with a known direction)
    pub sequence: Option<SequenceVerdict>,
    /// Fragmentation link
    pub fragment: Option<FragmentLink>,
    /// Control procedure link
    pub control: Option<ControlLink>,
    /// Lifecycle events
    pub lifecycle: Vec<LifecycleEvent>,
    /// Checksum verdict
    pub checksum: ChecksumVerdict,
    /// Next-layer handoff
    pub delivery: Delivery,
    /// Non-fatal findings
    pub annotations: Vec<Annotation>,
}

impl FrameVerdict {
    /// Empty verdict for a frame
    #[must_use]
    pub fn new(frame: u32, direction: Direction) -> Self {
        Self {
            frame,
            stream: None,
            connection: None,
            direction,
            pdu: PduKind::Unparsed,
            sequence: None,
            fragment: None,
            control: None,
            lifecycle: Vec::new(),
            checksum: ChecksumVerdict::Unavailable,
            delivery: Delivery::None,
            annotations: Vec::new(),
        }
    }

    /// Attach an annotation
    pub fn annotate(&mut self, annotation: Annotation) {
        match annotation.class() {
            AnnotationClass::ProtocolViolation
            | AnnotationClass::OutOfOrderInsert
            | AnnotationClass::SequenceGap => {
                tracing::warn!(frame = self.frame, "{annotation}");
            }
            _ => tracing::debug!(frame = self.frame, "{annotation}"),
        }
        self.annotations.push(annotation);
    }

    /// Whether any annotation of `class` is attached
    #[must_use]
    pub fn has(&self, class: AnnotationClass) -> bool {
        self.annotations.iter().any(|a| a.class() == class)
    }

    /// Whether the frame was retransmitted
    #[must_use]
    pub fn is_retransmit(&self) -> bool {
        self.sequence.is_some_and(|s| s.retransmit)
    }
}

/// Links resolved from the stores at query time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrossReferences {
    /// Frame carrying the connection request
    pub connect_in: Option<u32>,
    /// Frame that closed the connection
    pub disconnect_in: Option<u32>,
    /// Most recent parameter update in force at this frame
    pub parameters_updated_in: Option<u32>,
    /// Initiating frame of this frame's procedure
    pub request_in: Option<u32>,
    /// Other frames of this frame's procedure
    pub responses_in: Vec<u32>,
    /// Frame that completed this frame's procedure
    pub procedure_completed_in: Option<u32>,
    /// First fragment of this frame's message
    pub first_fragment_in: Option<u32>,
    /// Frame that completed this frame's message
    pub reassembled_in: Option<u32>,
}

impl CrossReferences {
    /// Whether nothing was resolved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_classes() {
        assert_eq!(
            Annotation::Malformed(PduError::ReservedLlid).class(),
            AnnotationClass::Malformed
        );
        assert_eq!(
            Annotation::Collision { other_procedure: 3 }.class(),
            AnnotationClass::ProtocolViolation
        );
        assert_eq!(
            Annotation::ChecksumIndeterminate.class(),
            AnnotationClass::Indeterminate
        );
        assert_eq!(
            Annotation::Reassembly(ReassemblyError::MissingStart).class(),
            AnnotationClass::SequenceGap
        );
        assert_eq!(
            Annotation::Reassembly(ReassemblyError::FragmentTooLarge {
                declared: 10,
                available: 5
            })
            .class(),
            AnnotationClass::Malformed
        );
        assert_eq!(
            Annotation::Store(StoreError::OutOfOrderInsert {
                last: 2,
                attempted: 1
            })
            .class(),
            AnnotationClass::OutOfOrderInsert
        );
    }

    #[test]
    fn test_annotation_messages() {
        let a = Annotation::WrongSequence {
            opcode: ControlOpcode::EncRsp,
        };
        assert_eq!(a.to_string(), "LL_ENC_RSP does not continue any open procedure");
        let c = Annotation::ChecksumIncorrect {
            computed: 0x12_3456,
            declared: 0xAB_CDEF,
        };
        assert_eq!(
            c.to_string(),
            "checksum incorrect: computed 0x123456, transmitted 0xABCDEF"
        );
    }

    #[test]
    fn test_verdict_serializes() {
        let mut verdict = FrameVerdict::new(4, Direction::CentralToPeripheral);
        verdict.annotate(Annotation::UnknownOpcode(0x40));
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["frame"], 4);
        assert_eq!(json["direction"], "central_to_peripheral");
        assert_eq!(json["annotations"][0]["kind"], "unknown_opcode");
        assert_eq!(json["annotations"][0]["detail"], 0x40);
        assert!(verdict.has(AnnotationClass::ProtocolViolation));
    }

    #[test]
    fn test_cross_references_empty() {
        assert!(CrossReferences::default().is_empty());
        let refs = CrossReferences {
            request_in: Some(1),
            ..Default::default()
        };
        assert!(!refs.is_empty());
    }
}
