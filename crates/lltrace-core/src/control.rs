//! LL control procedure tracking.
//!
//! Each direction of a connection keeps the history of procedures it
//! initiated. A procedure occupies up to five frame slots: slot 0 is the
//! initiating PDU, slots 1-4 the following steps in a fixed, opcode-specific
//! order. A procedure closes immediately, on an explicit terminal step, or
//! when the connection event counter reaches a negotiated instant.
//!
//! Only the newest procedure of each direction is ever continued. A frame that
//! cannot be placed is annotated and changes nothing.

use serde::Serialize;

use crate::connection::{DirectionRecord, ParameterChange};
use crate::context::Direction;
use crate::frame::{ControlOpcode, ControlPdu};
use crate::verdict::Annotation;

/// Frame slots per procedure
pub const PROCEDURE_SLOTS: usize = 5;

/// Instant recorded for a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstantRecord {
    /// Event counter at which the change applies
    pub value: u16,
    /// Frame that announced it
    pub learned_in: u32,
}

/// State of a procedure as seen from a given frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureState {
    /// Waiting for further steps or an instant
    Open,
    /// Completed before the frame
    Closed,
}

/// One control procedure instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlProcedureRecord {
    /// Opcode of the initiating PDU
    pub opcode: ControlOpcode,
    /// Frames of each step, 0 where empty
    pub frames: [u32; PROCEDURE_SLOTS],
    /// Negotiated instant
    pub instant: Option<InstantRecord>,
    /// Frame that closed the procedure, 0 while open
    pub terminal: u32,
    /// Change applied when the instant is reached
    pub pending: Option<ParameterChange>,
}

impl ControlProcedureRecord {
    /// Procedure initiated by `opcode` in `frame`
    #[must_use]
    pub fn new(opcode: ControlOpcode, frame: u32) -> Self {
        let mut frames = [0; PROCEDURE_SLOTS];
        frames[0] = frame;
        Self {
            opcode,
            frames,
            instant: None,
            terminal: 0,
            pending: None,
        }
    }

    /// Frame of slot 0
    #[must_use]
    pub fn initiated_in(&self) -> u32 {
        self.frames[0]
    }

    /// No terminal frame recorded
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.terminal == 0
    }

    /// Closed strictly before `frame`.
    ///
    /// The terminal frame itself still sees the procedure open.
    #[must_use]
    pub fn is_closed_at(&self, frame: u32) -> bool {
        self.terminal != 0 && self.terminal < frame
    }

    /// State as seen from `frame`
    #[must_use]
    pub fn state_at(&self, frame: u32) -> ProcedureState {
        if self.is_closed_at(frame) {
            ProcedureState::Closed
        } else {
            ProcedureState::Open
        }
    }

    /// Negotiates, or will negotiate, an instant
    #[must_use]
    pub fn is_instant_relevant(&self) -> bool {
        self.instant.is_some() || self.opcode.carries_instant()
    }

    /// Frames of every step after slot 0
    pub fn responses(&self) -> impl Iterator<Item = u32> + '_ {
        self.frames[1..].iter().copied().filter(|&f| f != 0)
    }

    /// Whether `frame` may occupy `slot`.
    ///
    /// The previous slot must be filled, the target slot empty and the
    /// procedure not closed before `frame`.
    #[must_use]
    pub fn can_fill(&self, slot: usize, frame: u32) -> bool {
        if slot == 0 || slot >= PROCEDURE_SLOTS {
            return false;
        }
        self.frames[slot - 1] != 0 && self.frames[slot] == 0 && !self.is_closed_at(frame)
    }

    /// Whether an LL_UNKNOWN_RSP in `frame` may occupy slot 1.
    ///
    /// Besides the usual rule, a procedure that closed immediately with slot 1
    /// empty still accepts it.
    #[must_use]
    pub fn accepts_unknown_response(&self, frame: u32) -> bool {
        self.can_fill(1, frame)
            || (self.terminal != 0 && self.terminal == self.frames[0] && self.frames[1] == 0)
    }

    /// Place `frame` in `slot`
    pub fn fill(&mut self, slot: usize, frame: u32) {
        if slot < PROCEDURE_SLOTS {
            self.frames[slot] = frame;
        }
    }

    /// Record the terminal frame unless already closed
    pub fn close(&mut self, frame: u32) {
        if self.terminal == 0 {
            self.terminal = frame;
        }
    }

    /// Whether `event_counter` in `frame` is the recorded instant.
    ///
    /// A counter that skips past the instant leaves the procedure open.
    #[must_use]
    pub fn instant_reached(&self, frame: u32, event_counter: u16) -> bool {
        self.is_open()
            && self
                .instant
                .is_some_and(|instant| instant.learned_in < frame && event_counter == instant.value)
    }
}

/// Procedures initiated in one direction, oldest first
#[derive(Debug, Clone, Default)]
pub struct ControlProcedureTracker {
    records: Vec<ControlProcedureRecord>,
}

impl ControlProcedureTracker {
    /// Newest procedure
    #[must_use]
    pub fn latest(&self) -> Option<&ControlProcedureRecord> {
        self.records.last()
    }

    fn latest_mut(&mut self) -> Option<&mut ControlProcedureRecord> {
        self.records.last_mut()
    }

    /// Procedure initiated in `frame`
    #[must_use]
    pub fn find(&self, initiated_in: u32) -> Option<&ControlProcedureRecord> {
        self.records
            .binary_search_by_key(&initiated_in, ControlProcedureRecord::initiated_in)
            .ok()
            .map(|i| &self.records[i])
    }

    /// All procedures, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ControlProcedureRecord> {
        self.records.iter()
    }

    /// Number of procedures
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no procedure was initiated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Where a control PDU was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Direction owning the procedure
    pub owner: Direction,
    /// Slot 0 frame of the procedure
    pub initiated_in: u32,
    /// Slot the PDU occupies
    pub slot: usize,
    /// Opcode that initiated the procedure
    pub initiated_by: ControlOpcode,
}

/// Frame-level inputs of the tracker
#[derive(Debug, Clone, Copy)]
pub struct ProcedureFrame {
    /// Frame number
    pub frame: u32,
    /// Direction of the frame
    pub direction: Direction,
    /// Connection event counter
    pub event_counter: Option<u16>,
}

/// Result of tracking one control PDU
#[derive(Debug, Clone, Default)]
pub struct ControlOutcome {
    /// Procedure slot taken by the PDU
    pub placement: Option<Placement>,
    /// Violations and indeterminate findings
    pub annotations: Vec<Annotation>,
}

/// A procedure closed because its instant was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedProcedure {
    /// Direction owning the procedure
    pub owner: Direction,
    /// Slot 0 frame of the procedure
    pub initiated_in: u32,
    /// Frame that announced the instant
    pub requested_in: u32,
    /// Change that takes effect now
    pub change: Option<ParameterChange>,
}

/// Close every newest procedure whose instant `event_counter` reaches
pub fn complete_instants(
    directions: &mut [DirectionRecord; 3],
    frame: u32,
    event_counter: u16,
) -> Vec<CompletedProcedure> {
    let mut completed = Vec::new();
    for direction in Direction::ALL {
        let tracker = &mut directions[direction.index()].procedures;
        let Some(record) = tracker.latest_mut() else {
            continue;
        };
        if !record.instant_reached(frame, event_counter) {
            continue;
        }
        record.terminal = frame;
        let requested_in = record.instant.map_or(frame, |i| i.learned_in);
        tracing::debug!(
            ?direction,
            initiated_in = record.initiated_in(),
            frame,
            event_counter,
            "procedure reached its instant"
        );
        completed.push(CompletedProcedure {
            owner: direction,
            initiated_in: record.initiated_in(),
            requested_in,
            change: record.pending,
        });
    }
    completed
}

/// Place a control PDU into the procedure history of its connection
pub fn track(
    directions: &mut [DirectionRecord; 3],
    pdu: &ControlPdu<'_>,
    at: ProcedureFrame,
) -> ControlOutcome {
    let mut step = Step {
        directions,
        at,
        annotations: Vec::new(),
    };
    let placement = step.dispatch(pdu);
    ControlOutcome {
        placement,
        annotations: step.annotations,
    }
}

#[derive(Clone, Copy)]
enum Side {
    Own,
    Other,
}

type Alternative<'a> = (Side, &'a [ControlOpcode], usize);

struct Step<'a> {
    directions: &'a mut [DirectionRecord; 3],
    at: ProcedureFrame,
    annotations: Vec<Annotation>,
}

impl Step<'_> {
    fn tracker(&self, direction: Direction) -> &ControlProcedureTracker {
        &self.directions[direction.index()].procedures
    }

    fn tracker_mut(&mut self, direction: Direction) -> &mut ControlProcedureTracker {
        &mut self.directions[direction.index()].procedures
    }

    fn owner(&self, side: Side) -> Direction {
        match side {
            Side::Own => self.at.direction,
            Side::Other => self.at.direction.opposite(),
        }
    }

    fn dispatch(&mut self, pdu: &ControlPdu<'_>) -> Option<Placement> {
        use ControlOpcode as Op;

        let opcode = pdu.opcode();
        match opcode {
            Op::ConnectionUpdateInd => {
                let placement = self
                    .try_continue(&[
                        (Side::Other, &[Op::ConnectionParamReq], 1),
                        (Side::Own, &[Op::ConnectionParamReq], 2),
                    ])
                    .unwrap_or_else(|| self.initiate(opcode));
                if let Some(update) = pdu.connection_update() {
                    self.record_instant(placement, update.instant, ParameterChange::Timing(update));
                }
                Some(placement)
            }
            Op::ChannelMapInd => {
                let placement = self.initiate(opcode);
                if let (Some(map), Some(instant)) = (pdu.channel_map(), pdu.instant()) {
                    self.record_instant(placement, instant, ParameterChange::ChannelMap { map });
                }
                Some(placement)
            }
            Op::PhyUpdateInd => {
                let placement = self
                    .try_continue(&[
                        (Side::Other, &[Op::PhyReq], 1),
                        (Side::Own, &[Op::PhyReq], 2),
                    ])
                    .unwrap_or_else(|| self.initiate(opcode));
                if let Some(update) = pdu.phy_update() {
                    if update.is_no_change() {
                        self.close(placement);
                    } else {
                        self.record_instant(placement, update.instant, ParameterChange::Phy(update));
                    }
                }
                Some(placement)
            }

            Op::TerminateInd
            | Op::MinUsedChannelsInd
            | Op::PeriodicSyncInd
            | Op::CisTerminateInd
            | Op::PowerChangeInd => {
                let placement = self.initiate(opcode);
                self.close(placement);
                Some(placement)
            }

            Op::EncReq
            | Op::FeatureReq
            | Op::PeripheralFeatureReq
            | Op::PauseEncReq
            | Op::ConnectionParamReq
            | Op::PingReq
            | Op::LengthReq
            | Op::PhyReq
            | Op::CteReq
            | Op::ClockAccuracyReq
            | Op::CisReq
            | Op::PowerControlReq => Some(self.initiate(opcode)),

            Op::EncRsp => self.respond(opcode, &[(Side::Other, &[Op::EncReq], 1)]),
            Op::StartEncReq => self.respond(opcode, &[(Side::Other, &[Op::EncReq], 2)]),
            Op::StartEncRsp => {
                let placement = self.respond(
                    opcode,
                    &[
                        (Side::Own, &[Op::EncReq], 3),
                        (Side::Other, &[Op::EncReq], 4),
                    ],
                )?;
                if placement.slot == 4 {
                    self.close(placement);
                }
                Some(placement)
            }
            Op::PauseEncRsp => {
                let placement = self.respond(
                    opcode,
                    &[
                        (Side::Other, &[Op::PauseEncReq], 1),
                        (Side::Own, &[Op::PauseEncReq], 2),
                    ],
                )?;
                if placement.slot == 2 {
                    self.close(placement);
                }
                Some(placement)
            }
            Op::VersionInd => {
                match self.try_continue(&[(Side::Other, &[Op::VersionInd], 1)]) {
                    Some(placement) => {
                        self.close(placement);
                        Some(placement)
                    }
                    None => Some(self.initiate(opcode)),
                }
            }
            Op::CisInd => {
                let placement = self.respond(opcode, &[(Side::Own, &[Op::CisReq], 2)])?;
                self.close(placement);
                Some(placement)
            }
            Op::ConnectionParamRsp => {
                self.respond(opcode, &[(Side::Other, &[Op::ConnectionParamReq], 1)])
            }
            Op::PhyRsp => self.respond(opcode, &[(Side::Other, &[Op::PhyReq], 1)]),
            Op::CisRsp => self.respond(opcode, &[(Side::Other, &[Op::CisReq], 1)]),

            Op::FeatureRsp => self.respond_and_close(
                opcode,
                &[(Side::Other, &[Op::FeatureReq, Op::PeripheralFeatureReq], 1)],
            ),
            Op::PingRsp => self.respond_and_close(opcode, &[(Side::Other, &[Op::PingReq], 1)]),
            Op::LengthRsp => {
                self.respond_and_close(opcode, &[(Side::Other, &[Op::LengthReq], 1)])
            }
            Op::CteRsp => self.respond_and_close(opcode, &[(Side::Other, &[Op::CteReq], 1)]),
            Op::ClockAccuracyRsp => {
                self.respond_and_close(opcode, &[(Side::Other, &[Op::ClockAccuracyReq], 1)])
            }
            Op::PowerControlRsp => {
                self.respond_and_close(opcode, &[(Side::Other, &[Op::PowerControlReq], 1)])
            }
            Op::RejectInd => self.respond_and_close(
                opcode,
                &[
                    (Side::Other, &[Op::EncReq], 2),
                    (Side::Other, &[Op::EncReq], 1),
                    (Side::Other, &[Op::ConnectionParamReq], 1),
                ],
            ),
            Op::RejectExtInd => {
                let Some(rejected) = pdu
                    .reject_opcode()
                    .and_then(|op| ControlOpcode::try_from(op).ok())
                else {
                    self.wrong_sequence(opcode);
                    return None;
                };
                let rejected = [rejected];
                self.respond_and_close(
                    opcode,
                    &[
                        (Side::Other, &rejected, 1),
                        (Side::Other, &rejected, 2),
                        (Side::Own, &rejected, 2),
                    ],
                )
            }
            Op::UnknownRsp => self.unknown_response(pdu),
        }
    }

    /// Try each alternative in order; no annotation when none applies
    fn try_continue(&mut self, alternatives: &[Alternative<'_>]) -> Option<Placement> {
        alternatives
            .iter()
            .find_map(|&(side, opcodes, slot)| self.continue_latest(side, opcodes, slot))
    }

    /// Like `try_continue`, annotating a wrong sequence when nothing applies
    fn respond(
        &mut self,
        opcode: ControlOpcode,
        alternatives: &[Alternative<'_>],
    ) -> Option<Placement> {
        let placement = self.try_continue(alternatives);
        if placement.is_none() {
            self.wrong_sequence(opcode);
        }
        placement
    }

    fn respond_and_close(
        &mut self,
        opcode: ControlOpcode,
        alternatives: &[Alternative<'_>],
    ) -> Option<Placement> {
        let placement = self.respond(opcode, alternatives)?;
        self.close(placement);
        Some(placement)
    }

    fn continue_latest(
        &mut self,
        side: Side,
        opcodes: &[ControlOpcode],
        slot: usize,
    ) -> Option<Placement> {
        let owner = self.owner(side);
        let frame = self.at.frame;
        let record = self.tracker(owner).latest()?;
        if !opcodes.contains(&record.opcode) || !record.can_fill(slot, frame) {
            return None;
        }
        let placement = Placement {
            owner,
            initiated_in: record.initiated_in(),
            slot,
            initiated_by: record.opcode,
        };
        if record.is_instant_relevant() {
            self.check_collision(owner);
        }
        if let Some(record) = self.tracker_mut(owner).latest_mut() {
            record.fill(slot, frame);
        }
        Some(placement)
    }

    fn initiate(&mut self, opcode: ControlOpcode) -> Placement {
        let owner = self.at.direction;
        let frame = self.at.frame;

        if opcode != ControlOpcode::TerminateInd {
            let open = self
                .tracker(owner)
                .latest()
                .filter(|r| r.initiated_in() != frame && r.is_open() && r.instant.is_none())
                .map(ControlProcedureRecord::initiated_in);
            if let Some(open_since) = open {
                self.annotations
                    .push(Annotation::ProcedureOverlap { open_since });
            }
        }
        if opcode.carries_instant() {
            self.check_collision(owner);
        }
        self.tracker_mut(owner)
            .records
            .push(ControlProcedureRecord::new(opcode, frame));
        tracing::debug!(direction = ?owner, frame, %opcode, "procedure initiated");
        Placement {
            owner,
            initiated_in: frame,
            slot: 0,
            initiated_by: opcode,
        }
    }

    fn unknown_response(&mut self, pdu: &ControlPdu<'_>) -> Option<Placement> {
        let opcode = pdu.opcode();
        let owner = self.at.direction.opposite();
        let frame = self.at.frame;

        let unknown = pdu.unknown_type();
        let placement = self.tracker(owner).latest().and_then(|record| {
            (unknown == Some(record.opcode as u8) && record.accepts_unknown_response(frame))
                .then(|| Placement {
                    owner,
                    initiated_in: record.initiated_in(),
                    slot: 1,
                    initiated_by: record.opcode,
                })
        });
        let Some(placement) = placement else {
            self.wrong_sequence(opcode);
            return None;
        };
        if let Some(record) = self.tracker_mut(owner).latest_mut() {
            record.fill(1, frame);
        }
        self.close(placement);
        Some(placement)
    }

    /// Annotate when the direction opposite `owner` is mid-way through its own
    /// instant-bearing procedure
    fn check_collision(&mut self, owner: Direction) {
        if !owner.is_known() {
            return;
        }
        let frame = self.at.frame;
        let colliding = self
            .tracker(owner.opposite())
            .latest()
            .filter(|r| r.is_instant_relevant() && !r.is_closed_at(frame) && r.frames[1] != 0)
            .map(ControlProcedureRecord::initiated_in);
        if let Some(other_procedure) = colliding {
            self.annotations
                .push(Annotation::Collision { other_procedure });
        }
    }

    fn close(&mut self, placement: Placement) {
        let frame = self.at.frame;
        if let Some(record) = self.tracker_mut(placement.owner).latest_mut() {
            if record.initiated_in() == placement.initiated_in {
                record.close(frame);
            }
        }
    }

    fn record_instant(&mut self, placement: Placement, instant: u16, change: ParameterChange) {
        let ProcedureFrame {
            frame,
            event_counter,
            ..
        } = self.at;
        match event_counter {
            None => self.annotations.push(Annotation::EventCounterUnavailable),
            Some(event_counter) if event_counter.wrapping_sub(instant) as i16 >= 0 => {
                self.annotations.push(Annotation::InstantInPast {
                    instant,
                    event_counter,
                });
            }
            Some(_) => {}
        }
        if let Some(record) = self.tracker_mut(placement.owner).latest_mut() {
            if record.initiated_in() == placement.initiated_in {
                record.instant = Some(InstantRecord {
                    value: instant,
                    learned_in: frame,
                });
                record.pending = Some(change);
            }
        }
    }

    fn wrong_sequence(&mut self, opcode: ControlOpcode) {
        self.annotations.push(Annotation::WrongSequence { opcode });
    }
}
