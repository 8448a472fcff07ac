//! Fragment reassembly.
//!
//! Two fragmentation grammars share one accumulator:
//!
//! - data channel L2CAP: a start fragment carries the L2CAP length, so the
//!   total is known up front and the message completes when it is filled;
//! - extended advertising chains: AuxPtr announces that another fragment
//!   follows, so the total is unknown and the message completes on the first
//!   fragment without one.
//!
//! Assemblies are retained after completion, keyed by the frame of their first
//! fragment, so later frames can resolve "reassembled in" and "continuation of".

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ReassemblyError;

/// What kind of message an assembly carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// L2CAP basic frame from the data channel
    L2cap,
    /// Advertising data from legacy, extended or periodic advertising
    AdvertisingData,
}

/// Position of a stream in its fragmentation grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyCursor {
    /// No message in progress
    #[default]
    Idle,
    /// Message in progress, keyed by its first frame
    Active(u32),
    /// Message abandoned after a sequence gap; continuations have no start
    Abandoned(u32),
}

impl AssemblyCursor {
    /// First frame of the in-progress message
    #[must_use]
    pub fn active(self) -> Option<u32> {
        match self {
            Self::Active(first) => Some(first),
            _ => None,
        }
    }
}

/// One captured fragment
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    /// Captured fragment bytes
    pub bytes: &'a [u8],
    /// Fragment length declared by its header (may exceed `bytes.len()`)
    pub declared_len: usize,
    /// No further fragment is announced (chained grammar only)
    pub ends_chain: bool,
}

impl<'a> Fragment<'a> {
    /// Fragment whose declared length equals the captured bytes
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            declared_len: bytes.len(),
            ends_chain: false,
        }
    }

    /// Set the declared length
    #[must_use]
    pub fn declared(mut self, declared_len: usize) -> Self {
        self.declared_len = declared_len;
        self
    }

    /// Mark as the last fragment of a chain
    #[must_use]
    pub fn last(mut self, ends_chain: bool) -> Self {
        self.ends_chain = ends_chain;
        self
    }
}

/// Result of feeding a fragment into an assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// More fragments are needed
    More,
    /// This fragment completed the message
    Complete,
}

/// Accumulated fragments of one logical message
#[derive(Debug, Clone)]
pub struct FragmentAssembly {
    kind: MessageKind,
    buffer: Vec<u8>,
    total: Option<usize>,
    offset: usize,
    limit: usize,
    first_frame: u32,
    last_frame: Option<u32>,
    incomplete: bool,
    abandoned: bool,
}

impl FragmentAssembly {
    fn new(kind: MessageKind, first_frame: u32, total: Option<usize>, limit: usize) -> Self {
        Self {
            kind,
            buffer: Vec::with_capacity(total.unwrap_or(0).min(limit)),
            total,
            offset: 0,
            limit,
            first_frame,
            last_frame: None,
            incomplete: false,
            abandoned: false,
        }
    }

    fn store(&mut self, fragment: &Fragment<'_>) {
        let room = self.limit.saturating_sub(self.buffer.len());
        let take = fragment.bytes.len().min(room);
        self.buffer.extend_from_slice(&fragment.bytes[..take]);
        if take < fragment.declared_len {
            self.incomplete = true;
        }
        self.offset += fragment.declared_len;
    }

    fn is_filled(&self, fragment: &Fragment<'_>) -> bool {
        match self.total {
            Some(total) => self.offset >= total,
            None => fragment.ends_chain,
        }
    }

    /// Message kind
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Frame of the first fragment
    #[must_use]
    pub fn first_frame(&self) -> u32 {
        self.first_frame
    }

    /// Frame of the completing fragment
    #[must_use]
    pub fn last_frame(&self) -> Option<u32> {
        self.last_frame
    }

    /// Declared total length (unknown for advertising chains)
    #[must_use]
    pub fn total(&self) -> Option<usize> {
        self.total
    }

    /// Bytes accounted for so far, including any not captured
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Some fragment could not be stored in full
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Assembly was given up after a gap or a new start
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// The last fragment arrived
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.last_frame.is_some() && !self.abandoned
    }

    /// Reassembled bytes, available only for complete, intact assemblies
    #[must_use]
    pub fn message(&self) -> Option<&[u8]> {
        (self.is_complete() && !self.incomplete).then_some(self.buffer.as_slice())
    }
}

/// Arena of assemblies keyed by first-fragment frame
#[derive(Debug, Clone, Default)]
pub struct Reassembler {
    assemblies: BTreeMap<u32, FragmentAssembly>,
}

impl Reassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a message with its first fragment.
    ///
    /// The assembly is recorded even when this returns an error.
    ///
    /// # Errors
    ///
    /// Returns `ReassemblyError::FragmentTooLarge` when `total` exceeds `limit`
    /// or the fragment was not captured in full; the assembly is kept but
    /// flagged incomplete and will never be handed on.
    pub fn begin(
        &mut self,
        kind: MessageKind,
        frame: u32,
        total: Option<usize>,
        limit: usize,
        fragment: Fragment<'_>,
    ) -> Result<(), ReassemblyError> {
        let mut assembly = FragmentAssembly::new(kind, frame, total, limit);
        let declared = total.unwrap_or(fragment.declared_len);

        let result = if declared > limit {
            assembly.incomplete = true;
            Err(ReassemblyError::FragmentTooLarge {
                declared,
                available: limit,
            })
        } else if fragment.bytes.len() < fragment.declared_len {
            Err(ReassemblyError::FragmentTooLarge {
                declared: fragment.declared_len,
                available: fragment.bytes.len(),
            })
        } else {
            Ok(())
        };

        assembly.store(&fragment);
        tracing::debug!(?kind, frame, ?total, "assembly started");
        self.assemblies.insert(frame, assembly);
        result
    }

    /// Add a continuation fragment to the assembly started in `first_frame`.
    ///
    /// # Errors
    ///
    /// - `ReassemblyError::UnknownAssembly` if no such assembly exists
    /// - `ReassemblyError::MissingStart` if the assembly was abandoned
    /// - `ReassemblyError::SequenceGap` if the fragment overruns the declared
    ///   total (or `limit` for chains); the assembly is abandoned
    pub fn append(
        &mut self,
        first_frame: u32,
        frame: u32,
        fragment: Fragment<'_>,
    ) -> Result<AppendOutcome, ReassemblyError> {
        let assembly = self
            .assemblies
            .get_mut(&first_frame)
            .ok_or(ReassemblyError::UnknownAssembly(first_frame))?;
        if assembly.abandoned {
            return Err(ReassemblyError::MissingStart);
        }

        let bound = assembly.total.unwrap_or(assembly.limit);
        if assembly.offset + fragment.declared_len > bound {
            assembly.abandoned = true;
            tracing::debug!(first_frame, frame, "assembly abandoned on sequence gap");
            return Err(ReassemblyError::SequenceGap {
                offset: assembly.offset,
                incoming: fragment.declared_len,
                total: bound,
            });
        }

        assembly.store(&fragment);
        if assembly.is_filled(&fragment) {
            assembly.last_frame = Some(frame);
            tracing::debug!(first_frame, frame, "assembly complete");
            Ok(AppendOutcome::Complete)
        } else {
            Ok(AppendOutcome::More)
        }
    }

    /// Give up on an assembly superseded by a new start fragment
    pub fn abandon(&mut self, first_frame: u32) {
        if let Some(assembly) = self.assemblies.get_mut(&first_frame) {
            if assembly.last_frame.is_none() {
                assembly.abandoned = true;
            }
        }
    }

    /// Assembly started in `first_frame`
    #[must_use]
    pub fn get(&self, first_frame: u32) -> Option<&FragmentAssembly> {
        self.assemblies.get(&first_frame)
    }

    /// Reassembled message started in `first_frame`, once complete
    #[must_use]
    pub fn message(&self, first_frame: u32) -> Option<&[u8]> {
        self.get(first_frame)?.message()
    }

    /// All assemblies in first-frame order
    pub fn iter(&self) -> impl Iterator<Item = &FragmentAssembly> {
        self.assemblies.values()
    }

    /// Number of assemblies recorded
    #[must_use]
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    /// Whether no assembly was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_total_roundtrip() {
        let mut r = Reassembler::new();
        r.begin(MessageKind::L2cap, 1, Some(10), 64, Fragment::new(&[0, 1, 2, 3]))
            .unwrap();
        assert_eq!(
            r.append(1, 2, Fragment::new(&[4, 5, 6])).unwrap(),
            AppendOutcome::More
        );
        assert_eq!(
            r.append(1, 3, Fragment::new(&[7, 8, 9])).unwrap(),
            AppendOutcome::Complete
        );
        let assembly = r.get(1).unwrap();
        assert_eq!(assembly.last_frame(), Some(3));
        assert_eq!(r.message(1), Some(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9][..]));
    }

    #[test]
    fn test_chain_completes_without_aux_ptr() {
        let mut r = Reassembler::new();
        r.begin(MessageKind::AdvertisingData, 5, None, 1650, Fragment::new(b"abc"))
            .unwrap();
        assert_eq!(
            r.append(5, 6, Fragment::new(b"def")).unwrap(),
            AppendOutcome::More
        );
        assert_eq!(
            r.append(5, 7, Fragment::new(b"g").last(true)).unwrap(),
            AppendOutcome::Complete
        );
        assert_eq!(r.message(5), Some(&b"abcdefg"[..]));
    }

    #[test]
    fn test_total_over_limit_is_kept_incomplete() {
        let mut r = Reassembler::new();
        let err = r
            .begin(MessageKind::L2cap, 1, Some(100), 16, Fragment::new(&[0; 8]))
            .unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::FragmentTooLarge {
                declared: 100,
                available: 16
            }
        );
        let assembly = r.get(1).unwrap();
        assert!(assembly.is_incomplete());
        assert!(!assembly.is_abandoned());
    }

    #[test]
    fn test_truncated_start_fragment() {
        let mut r = Reassembler::new();
        let err = r
            .begin(
                MessageKind::L2cap,
                1,
                Some(40),
                64,
                Fragment::new(&[0; 10]).declared(27),
            )
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::FragmentTooLarge { declared: 27, available: 10 }));

        // The declared length still counts towards the total
        assert_eq!(r.get(1).unwrap().offset(), 27);
        assert_eq!(
            r.append(1, 2, Fragment::new(&[0; 13])).unwrap(),
            AppendOutcome::Complete
        );
        assert_eq!(r.message(1), None);
    }

    #[test]
    fn test_sequence_gap_abandons() {
        let mut r = Reassembler::new();
        r.begin(MessageKind::L2cap, 1, Some(6), 64, Fragment::new(&[0; 4]))
            .unwrap();
        let err = r.append(1, 2, Fragment::new(&[0; 4])).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::SequenceGap {
                offset: 4,
                incoming: 4,
                total: 6
            }
        );
        assert!(r.get(1).unwrap().is_abandoned());
        assert_eq!(
            r.append(1, 3, Fragment::new(&[0; 2])),
            Err(ReassemblyError::MissingStart)
        );
    }

    #[test]
    fn test_unknown_assembly() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.append(9, 10, Fragment::new(&[1])),
            Err(ReassemblyError::UnknownAssembly(9))
        );
    }

    #[test]
    fn test_abandon_keeps_completed() {
        let mut r = Reassembler::new();
        r.begin(MessageKind::L2cap, 1, Some(2), 64, Fragment::new(&[1]))
            .unwrap();
        r.append(1, 2, Fragment::new(&[2])).unwrap();
        r.abandon(1);
        assert!(r.get(1).unwrap().is_complete());

        r.begin(MessageKind::L2cap, 3, Some(4), 64, Fragment::new(&[1]))
            .unwrap();
        r.abandon(3);
        assert!(r.get(3).unwrap().is_abandoned());
        assert_eq!(r.len(), 2);
    }
}
