//! Sequence number and acknowledgement tracking.
//!
//! Every data channel PDU carries a 1-bit sequence number (SN) and a 1-bit
//! next expected sequence number (NESN). A frame repeating its direction's
//! previous SN is a retransmission; a frame whose NESN differs from the
//! opposite direction's previous SN acknowledges that frame.

use serde::Serialize;

use crate::context::Direction;

/// Retransmission and acknowledgement flags of one data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceVerdict {
    /// Same SN as the previous frame in this direction
    pub retransmit: bool,
    /// NESN acknowledges the opposite direction's last frame
    pub acknowledged: bool,
}

/// Per-connection SN state for the two known directions
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    first_data_frame_seen: bool,
    last_sn: [u8; 2],
}

impl SequenceTracker {
    /// Create a tracker that has not seen a data frame yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a data frame with a known direction has been observed
    #[must_use]
    pub fn first_data_frame_seen(&self) -> bool {
        self.first_data_frame_seen
    }

    /// Last SN recorded for a known direction
    #[must_use]
    pub fn last_sn(&self, direction: Direction) -> Option<u8> {
        let index = Self::slot(direction)?;
        self.first_data_frame_seen.then(|| self.last_sn[index])
    }

    fn slot(direction: Direction) -> Option<usize> {
        match direction {
            Direction::CentralToPeripheral => Some(0),
            Direction::PeripheralToCentral => Some(1),
            Direction::Unknown => None,
        }
    }

    /// Evaluate one data frame and record its SN.
    ///
    /// Frames with an unknown direction get no verdict and leave the state
    /// untouched.
    pub fn observe(&mut self, direction: Direction, sn: u8, nesn: u8) -> Option<SequenceVerdict> {
        let own = Self::slot(direction)?;
        let other = 1 - own;
        let (sn, nesn) = (sn & 1, nesn & 1);

        let verdict = if self.first_data_frame_seen {
            SequenceVerdict {
                retransmit: sn == self.last_sn[own],
                acknowledged: nesn != self.last_sn[other],
            }
        } else {
            self.first_data_frame_seen = true;
            self.last_sn[own] = 0;
            self.last_sn[other] = 1;
            SequenceVerdict {
                retransmit: false,
                acknowledged: true,
            }
        };

        self.last_sn[own] = sn;
        tracing::trace!(
            ?direction,
            sn,
            nesn,
            retransmit = verdict.retransmit,
            acknowledged = verdict.acknowledged,
            "sequence verdict"
        );
        Some(verdict)
    }
}
