//! Frame-by-frame dissection engine.
//!
//! The engine is fed every frame of a capture in order on the authoritative
//! pass. Each call decides the frame's [`FrameVerdict`], updates the connection,
//! procedure and reassembly stores, caches the verdict and hands any completed
//! message to the next layer. Later passes replay the cached verdict without
//! touching any store or the next layer, so a frame reports the same thing no
//! matter how many times it is visited and every message is delivered once.
//!
//! ## Pipeline
//!
//! ```text
//! bytes + FrameContext
//!        │
//!        ▼
//!   RawFrame::parse ──► stream resolution (capture scope, adapter, AA)
//!        │
//!        ├── advertising AA ──► CONNECT_IND / legacy AdvData / extended chains
//!        ├── periodic train ──► chained periodic AdvData
//!        └── data channel   ──► connection ─► instants ─► sequence
//!                                  ─► control procedures / L2CAP reassembly
//!        │
//!        ▼
//!   checksum verdict ──► cached FrameVerdict ──► NextLayer
//! ```

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::checksum::{self, ADVERTISING_CRC_INIT, ChecksumVerdict};
use crate::config::EngineConfig;
use crate::connection::{
    ConnectionId, ConnectionRecord, ConnectionRegistry, ParameterUpdate, PeriodicTrain, StreamKey,
};
use crate::context::{Direction, FrameContext, Pass};
use crate::control::{self, ControlProcedureRecord, ProcedureFrame};
use crate::error::{Error, PduError, ReassemblyError, StoreError};
use crate::frame::{
    ADVERTISING_ACCESS_ADDRESS, Adi, AdvPduType, AdvertisingHeader, ConnectRequest, ControlOpcode,
    ControlPdu, DataHeader, ExtendedAdvertising, LegacyAdvertising, Llid, MIC_SIZE, RawFrame,
};
use crate::reassembly::{AppendOutcome, AssemblyCursor, Fragment, MessageKind, Reassembler};
use crate::verdict::{
    Annotation, ControlLink, CrossReferences, Delivery, FragmentLink, FragmentRole, FrameVerdict,
    LifecycleEvent, PduKind, ProcedureId,
};

/// Lowest primary advertising channel index
const FIRST_PRIMARY_CHANNEL: u8 = 37;

/// L2CAP basic header: 16-bit length and 16-bit channel id
const L2CAP_HEADER_SIZE: usize = 4;

/// A payload handed to the next protocol layer
#[derive(Debug, Clone, Copy)]
pub struct ReassembledMessage<'a> {
    /// What the bytes are
    pub kind: MessageKind,
    /// Frame carrying the first byte
    pub first_frame: u32,
    /// Frame carrying the last byte
    pub completed_in: u32,
    /// Stream the message travelled on
    pub stream: Option<StreamKey>,
    /// Connection instance, for data channel messages
    pub connection: Option<ConnectionId>,
    /// Message bytes
    pub bytes: &'a [u8],
}

/// Consumer of L2CAP frames and advertising data sets
pub trait NextLayer {
    /// Handle one complete message; called once, on the authoritative pass
    fn deliver(&mut self, message: &ReassembledMessage<'_>, ctx: &FrameContext);
}

impl<F> NextLayer for F
where
    F: FnMut(&ReassembledMessage<'_>, &FrameContext),
{
    fn deliver(&mut self, message: &ReassembledMessage<'_>, ctx: &FrameContext) {
        self(message, ctx);
    }
}

/// Next layer that drops every message
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl NextLayer for Discard {
    fn deliver(&mut self, _message: &ReassembledMessage<'_>, _ctx: &FrameContext) {}
}

/// Identity of an extended advertising chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChainKey {
    stream: StreamKey,
    adi: Option<Adi>,
}

/// Link-layer dissection engine for one capture
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: ConnectionRegistry,
    reassembler: Reassembler,
    chains: HashMap<ChainKey, AssemblyCursor>,
    verdicts: BTreeMap<u32, FrameVerdict>,
    last_frame: Option<u32>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_valid_config(EngineConfig::default())
    }
}

impl Engine {
    /// Create an engine
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a size limit is out of range.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: EngineConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            reassembler: Reassembler::new(),
            chains: HashMap::new(),
            verdicts: BTreeMap::new(),
            last_frame: None,
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process one frame.
    ///
    /// On [`Pass::Authoritative`] frames must arrive in strictly increasing
    /// order; the verdict is decided and cached, and a message completed by
    /// the frame is handed to `next`. On [`Pass::Replay`] the cached verdict
    /// is returned unchanged and `next` is not called.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedFrameNumber` for frame 0
    /// - `Error::Store` if an authoritative frame is not newer than the last one
    /// - `Error::NotVisited` if a replayed frame was never processed
    pub fn process(
        &mut self,
        bytes: &[u8],
        ctx: &FrameContext,
        pass: Pass,
        next: &mut dyn NextLayer,
    ) -> Result<&FrameVerdict, Error> {
        if ctx.frame == 0 {
            return Err(Error::ReservedFrameNumber);
        }

        match pass {
            Pass::Replay => self
                .verdicts
                .get(&ctx.frame)
                .ok_or(Error::NotVisited(ctx.frame)),
            Pass::Authoritative => {
                if let Some(last) = self.last_frame {
                    if ctx.frame <= last {
                        return Err(StoreError::OutOfOrderInsert {
                            last,
                            attempted: ctx.frame,
                        }
                        .into());
                    }
                }
                let verdict = self.dissect(bytes, ctx);
                self.last_frame = Some(ctx.frame);
                let verdict: &FrameVerdict = self.verdicts.entry(ctx.frame).or_insert(verdict);
                deliver(&self.reassembler, verdict, bytes, ctx, next);
                Ok(verdict)
            }
        }
    }

    fn dissect(&mut self, bytes: &[u8], ctx: &FrameContext) -> FrameVerdict {
        let mut verdict = FrameVerdict::new(ctx.frame, ctx.direction);
        let raw = match RawFrame::parse(bytes, ctx.phy) {
            Ok(raw) => raw,
            Err(e) => {
                verdict.annotate(Annotation::Malformed(e));
                return verdict;
            }
        };

        let access_address = ctx.access_address.unwrap_or(raw.access_address());
        let key = StreamKey::new(ctx.capture_scope, ctx.adapter, access_address);
        verdict.stream = Some(key);
        if let Some(e) = raw.length_error() {
            verdict.annotate(Annotation::Malformed(e));
        }

        let crc_init = if access_address == ADVERTISING_ACCESS_ADDRESS {
            self.advertising(&raw, ctx, key, &mut verdict);
            Some(ADVERTISING_CRC_INIT)
        } else if let Some(train) = self.registry.periodic_train_at(&key, ctx.frame) {
            let crc_init = train.crc_init;
            self.periodic(&raw, ctx, key, &mut verdict);
            Some(crc_init)
        } else {
            self.data_channel(&raw, ctx, key, &mut verdict)
        };

        self.check(&raw, crc_init, &mut verdict);
        trace!(
            frame = ctx.frame,
            stream = %key,
            annotations = verdict.annotations.len(),
            "frame dissected"
        );
        verdict
    }

    fn check(&self, raw: &RawFrame<'_>, crc_init: Option<u32>, verdict: &mut FrameVerdict) {
        if !self.config.validate_checksums {
            verdict.checksum = ChecksumVerdict::Skipped;
            return;
        }
        let Some(declared) = raw.crc() else {
            verdict.checksum = ChecksumVerdict::Unavailable;
            if let Some(e) = raw.checksum_error() {
                verdict.annotate(Annotation::Malformed(e));
            }
            return;
        };
        let result = checksum::verify(raw.crc_region(), declared, crc_init);
        match result {
            ChecksumVerdict::Bad { computed, declared } => {
                verdict.annotate(Annotation::ChecksumIncorrect { computed, declared });
            }
            ChecksumVerdict::Indeterminate => verdict.annotate(Annotation::ChecksumIndeterminate),
            _ => {}
        }
        verdict.checksum = result;
    }

    // ------------------------------------------------------------------------
    // Advertising channels
    // ------------------------------------------------------------------------

    fn advertising(
        &mut self,
        raw: &RawFrame<'_>,
        ctx: &FrameContext,
        key: StreamKey,
        verdict: &mut FrameVerdict,
    ) {
        let header = AdvertisingHeader::parse(raw.header());
        verdict.pdu = PduKind::Advertising {
            pdu_type: header.pdu_type,
        };
        if raw.is_truncated() {
            return;
        }

        let payload = raw.payload();
        match header.pdu_type {
            AdvPduType::ConnectInd => self.connect_request(payload, ctx, verdict),
            AdvPduType::AdvExtInd => {
                let secondary = ctx.auxiliary
                    || ctx.channel.is_some_and(|c| c < FIRST_PRIMARY_CHANNEL);
                self.extended(raw, ctx, key, verdict, Chain::Auxiliary { secondary });
            }
            pdu_type => match LegacyAdvertising::parse(pdu_type, payload) {
                Ok(Some(adv)) if !adv.data.is_empty() => {
                    single(raw, adv.data, ctx.frame, verdict);
                }
                Ok(_) => {}
                Err(e) => verdict.annotate(Annotation::Malformed(e)),
            },
        }
    }

    fn periodic(
        &mut self,
        raw: &RawFrame<'_>,
        ctx: &FrameContext,
        key: StreamKey,
        verdict: &mut FrameVerdict,
    ) {
        let header = AdvertisingHeader::parse(raw.header());
        verdict.pdu = PduKind::Advertising {
            pdu_type: header.pdu_type,
        };
        if raw.is_truncated() {
            return;
        }
        if header.pdu_type == AdvPduType::AdvExtInd {
            self.extended(raw, ctx, key, verdict, Chain::Periodic);
        }
    }

    fn connect_request(&mut self, payload: &[u8], ctx: &FrameContext, verdict: &mut FrameVerdict) {
        let request = match ConnectRequest::parse(payload) {
            Ok(request) => request,
            Err(e) => {
                verdict.annotate(Annotation::Malformed(e));
                return;
            }
        };
        let record =
            ConnectionRecord::from_request(ctx.capture_scope, ctx.adapter, &request, ctx.frame);
        match self.registry.create(record) {
            Ok(connection) => {
                debug!(
                    stream = %connection.key,
                    frame = ctx.frame,
                    interval = request.interval,
                    "connection request"
                );
                verdict.connection = Some(connection);
                verdict.lifecycle.push(LifecycleEvent::ConnectionCreated {
                    connection,
                    implicit: false,
                });
            }
            Err(e) => verdict.annotate(Annotation::Store(e)),
        }
    }

    fn extended(
        &mut self,
        raw: &RawFrame<'_>,
        ctx: &FrameContext,
        key: StreamKey,
        verdict: &mut FrameVerdict,
        chain: Chain,
    ) {
        let ext = match ExtendedAdvertising::parse(raw.payload()) {
            Ok(ext) => ext,
            Err(e) => {
                verdict.annotate(Annotation::Malformed(e));
                return;
            }
        };

        if let Some(sync) = ext.sync_info {
            let train = PeriodicTrain::from_sync_info(
                ctx.capture_scope,
                ctx.adapter,
                &sync,
                ext.adv_address,
                ctx.frame,
            );
            match self.registry.learn_periodic_train(train) {
                Ok(()) => {
                    debug!(train = %train.key, frame = ctx.frame, "periodic train learned");
                    verdict
                        .lifecycle
                        .push(LifecycleEvent::PeriodicTrainLearned { train: train.key });
                }
                Err(e) => verdict.annotate(Annotation::Store(e)),
            }
        }

        // Primary channel PDUs only point at the auxiliary packet
        if chain == (Chain::Auxiliary { secondary: false }) {
            return;
        }
        if !self.config.reassemble_advertising {
            if !ext.adv_data.is_empty() {
                single(raw, ext.adv_data, ctx.frame, verdict);
            }
            return;
        }

        let chain_key = ChainKey {
            stream: key,
            adi: ext.adi,
        };
        let cursor = self.chains.get(&chain_key).copied().unwrap_or_default();
        let starts = match chain {
            Chain::Auxiliary { .. } => ext.adv_address.is_some(),
            Chain::Periodic => cursor == AssemblyCursor::Idle,
        };
        let ends_chain = ext.aux_ptr.is_none();
        let fragment = Fragment::new(ext.adv_data).last(ends_chain);
        let frame = ctx.frame;

        if starts {
            if let AssemblyCursor::Active(previous) = cursor {
                self.reassembler.abandon(previous);
            }
            if ends_chain {
                self.chains.insert(chain_key, AssemblyCursor::Idle);
                if !ext.adv_data.is_empty() {
                    single(raw, ext.adv_data, frame, verdict);
                }
                return;
            }
            if let Err(e) = self.reassembler.begin(
                MessageKind::AdvertisingData,
                frame,
                None,
                self.config.max_adv_data_len,
                fragment,
            ) {
                verdict.annotate(Annotation::Reassembly(e));
            }
            self.chains.insert(chain_key, AssemblyCursor::Active(frame));
            verdict.fragment = Some(FragmentLink {
                kind: MessageKind::AdvertisingData,
                first_frame: frame,
                role: FragmentRole::Start,
            });
            return;
        }

        let next_cursor = continue_assembly(
            &mut self.reassembler,
            cursor,
            MessageKind::AdvertisingData,
            frame,
            fragment,
            verdict,
        );
        let next_cursor = match next_cursor {
            AssemblyCursor::Abandoned(_) if ends_chain => AssemblyCursor::Idle,
            other => other,
        };
        self.chains.insert(chain_key, next_cursor);
    }

    // ------------------------------------------------------------------------
    // Data channel
    // ------------------------------------------------------------------------

    fn data_channel(
        &mut self,
        raw: &RawFrame<'_>,
        ctx: &FrameContext,
        key: StreamKey,
        verdict: &mut FrameVerdict,
    ) -> Option<u32> {
        let header = DataHeader::parse(raw.header());
        verdict.pdu = PduKind::Data { llid: header.llid };

        let connection = self.resolve_connection(key, ctx.frame, verdict)?;
        verdict.connection = Some(connection);
        if self.config.analyze_control_procedures {
            if let Some(event_counter) = ctx.event_counter {
                self.complete_instants(connection, ctx.frame, event_counter, verdict);
            }
        }

        let Self {
            config,
            registry,
            reassembler,
            ..
        } = self;
        let record = registry.get_mut(&connection)?;
        let crc_init = record.crc_init;
        if header.llid == Llid::Reserved {
            verdict.annotate(Annotation::Malformed(PduError::ReservedLlid));
            return crc_init;
        }

        let mut path = DataPath {
            config,
            record,
            reassembler,
            connection,
            ctx,
        };
        path.run(raw, header, verdict);
        crc_init
    }

    fn resolve_connection(
        &mut self,
        key: StreamKey,
        frame: u32,
        verdict: &mut FrameVerdict,
    ) -> Option<ConnectionId> {
        if let Some(record) = self.registry.at(&key, frame) {
            if let Some(terminated_in) = record.closed_in().filter(|&closed| closed < frame) {
                verdict.annotate(Annotation::DataAfterTermination { terminated_in });
            }
            return Some(record.id());
        }

        match self.registry.create(ConnectionRecord::implicit(key, frame)) {
            Ok(connection) => {
                verdict.annotate(Annotation::ConnectionStartNotCaptured);
                verdict.lifecycle.push(LifecycleEvent::ConnectionCreated {
                    connection,
                    implicit: true,
                });
                Some(connection)
            }
            Err(e) => {
                verdict.annotate(Annotation::Store(e));
                None
            }
        }
    }

    fn complete_instants(
        &mut self,
        connection: ConnectionId,
        frame: u32,
        event_counter: u16,
        verdict: &mut FrameVerdict,
    ) {
        let Some(record) = self.registry.get_mut(&connection) else {
            return;
        };
        let completed = control::complete_instants(record.directions_mut(), frame, event_counter);

        for done in completed {
            verdict.lifecycle.push(LifecycleEvent::ProcedureCompleted {
                procedure: ProcedureId {
                    connection,
                    owner: done.owner,
                    initiated_in: done.initiated_in,
                },
            });
            let Some(change) = done.change else {
                continue;
            };
            let update = ParameterUpdate {
                requested_in: done.requested_in,
                effective_in: frame,
                change,
            };
            match self.registry.record_parameter_update(connection, update) {
                Ok(()) => {
                    debug!(
                        stream = %connection.key,
                        requested_in = done.requested_in,
                        frame,
                        "connection parameters updated"
                    );
                    verdict.lifecycle.push(LifecycleEvent::ParametersUpdated {
                        requested_in: done.requested_in,
                    });
                }
                Err(e) => verdict.annotate(Annotation::Store(e)),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Cached verdict of a processed frame
    #[must_use]
    pub fn verdict(&self, frame: u32) -> Option<&FrameVerdict> {
        self.verdicts.get(&frame)
    }

    /// Every cached verdict, in frame order
    pub fn verdicts(&self) -> impl Iterator<Item = &FrameVerdict> {
        self.verdicts.values()
    }

    /// Connection, parameter and periodic train history
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Fragment assemblies
    #[must_use]
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Procedure record by identifier
    #[must_use]
    pub fn procedure(&self, id: &ProcedureId) -> Option<&ControlProcedureRecord> {
        self.registry
            .get(&id.connection)?
            .direction(id.owner)
            .procedures
            .find(id.initiated_in)
    }

    /// Every procedure of every connection, ordered by connection then initiation
    #[must_use]
    pub fn procedures(&self) -> Vec<(ProcedureId, &ControlProcedureRecord)> {
        let mut all = Vec::new();
        for record in self.registry.connections() {
            let connection = record.id();
            let mut of_connection: Vec<_> = Direction::ALL
                .into_iter()
                .flat_map(move |owner| {
                    record.direction(owner).procedures.iter().map(move |p| {
                        let id = ProcedureId {
                            connection,
                            owner,
                            initiated_in: p.initiated_in(),
                        };
                        (id, p)
                    })
                })
                .collect();
            of_connection.sort_by_key(|(id, _)| id.initiated_in);
            all.extend(of_connection);
        }
        all
    }

    /// Frames that answered the procedure initiated in `frame`
    #[must_use]
    pub fn responses_to(&self, frame: u32) -> Vec<u32> {
        let Some(link) = self.verdict(frame).and_then(|v| v.control) else {
            return Vec::new();
        };
        if link.slot != 0 {
            return Vec::new();
        }
        self.procedure(&link.procedure)
            .map(|p| p.responses().collect())
            .unwrap_or_default()
    }

    /// Frame that initiated the procedure `frame` answered
    #[must_use]
    pub fn request_of(&self, frame: u32) -> Option<u32> {
        let link = self.verdict(frame)?.control?;
        (link.slot > 0).then_some(link.procedure.initiated_in)
    }

    /// Links from `frame` to related frames, including later ones
    #[must_use]
    pub fn cross_references(&self, frame: u32) -> CrossReferences {
        let mut refs = CrossReferences::default();
        let Some(verdict) = self.verdict(frame) else {
            return refs;
        };

        if let Some(connection) = verdict.connection {
            if let Some(record) = self.registry.get(&connection) {
                refs.connect_in = record.start_captured().then_some(record.created_in());
                refs.disconnect_in = record.closed_in();
                refs.parameters_updated_in = self
                    .registry
                    .parameter_update_at(&connection, frame)
                    .map(|u| u.effective_in);
            }
        }

        if let Some(link) = verdict.control {
            if let Some(procedure) = self.procedure(&link.procedure) {
                if link.slot > 0 {
                    refs.request_in = Some(procedure.initiated_in());
                }
                refs.responses_in = procedure.responses().filter(|&f| f != frame).collect();
                refs.procedure_completed_in =
                    (procedure.terminal != 0).then_some(procedure.terminal);
            }
        }

        if let Some(link) = verdict.fragment.filter(|l| l.role != FragmentRole::Single) {
            refs.first_fragment_in = (link.first_frame != frame).then_some(link.first_frame);
            refs.reassembled_in = self
                .reassembler
                .get(link.first_frame)
                .filter(|a| a.message().is_some())
                .and_then(|a| a.last_frame());
        }
        refs
    }
}

/// Which advertising chain an extended PDU belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    /// Primary or secondary advertising channel
    Auxiliary { secondary: bool },
    /// Periodic advertising train
    Periodic,
}

/// Captured body of a data channel PDU after the CTEInfo byte and MIC
#[derive(Debug, Clone, Copy)]
struct Body<'a> {
    bytes: &'a [u8],
    declared: usize,
    offset: usize,
}

impl Body<'_> {
    fn is_truncated(&self) -> bool {
        self.bytes.len() < self.declared
    }

    fn direct(&self, kind: MessageKind, len: usize) -> Delivery {
        Delivery::Direct {
            kind,
            offset: self.offset,
            len,
        }
    }
}

/// Data channel dissection state borrowed from the engine for one frame
struct DataPath<'e> {
    config: &'e EngineConfig,
    record: &'e mut ConnectionRecord,
    reassembler: &'e mut Reassembler,
    connection: ConnectionId,
    ctx: &'e FrameContext,
}

impl DataPath<'_> {
    fn run(&mut self, raw: &RawFrame<'_>, header: DataHeader, verdict: &mut FrameVerdict) {
        if self.config.track_sequence {
            verdict.sequence =
                self.record
                    .sequence
                    .observe(self.ctx.direction, header.sn, header.nesn);
        }
        if verdict.is_retransmit() {
            trace!(frame = self.ctx.frame, "retransmission skipped");
            return;
        }

        let cte = usize::from(header.cte_present);
        let mut mic = 0;
        if self.record.encrypted && raw.declared_len() > cte {
            if !self.ctx.decrypted {
                verdict.annotate(Annotation::EncryptedPayload);
                return;
            }
            mic = MIC_SIZE;
        }

        let payload = raw.payload();
        let start = cte.min(payload.len());
        let declared = raw.declared_len().saturating_sub(cte + mic);
        let end = (start + declared).min(payload.len());
        let body = Body {
            bytes: &payload[start..end],
            declared,
            offset: raw.payload_offset() + start,
        };

        match header.llid {
            Llid::Control => self.control(body, verdict),
            Llid::Start => self.l2cap_start(body, verdict),
            Llid::Continuation if declared > 0 => self.l2cap_continuation(body, verdict),
            Llid::Continuation | Llid::Reserved => {}
        }
    }

    fn control(&mut self, body: Body<'_>, verdict: &mut FrameVerdict) {
        if let Some(&opcode) = body.bytes.first() {
            verdict.pdu = PduKind::Control { opcode };
        }
        if body.is_truncated() {
            return;
        }
        let pdu = match ControlPdu::parse(body.bytes) {
            Ok(pdu) => pdu,
            Err(PduError::UnknownControlOpcode(opcode)) => {
                verdict.annotate(Annotation::UnknownOpcode(opcode));
                return;
            }
            Err(e) => {
                verdict.annotate(Annotation::Malformed(e));
                return;
            }
        };

        let frame = self.ctx.frame;
        if self.config.analyze_control_procedures {
            let outcome = control::track(
                self.record.directions_mut(),
                &pdu,
                ProcedureFrame {
                    frame,
                    direction: self.ctx.direction,
                    event_counter: self.ctx.event_counter,
                },
            );
            for annotation in outcome.annotations {
                verdict.annotate(annotation);
            }
            verdict.control = outcome.placement.map(|p| ControlLink {
                procedure: ProcedureId {
                    connection: self.connection,
                    owner: p.owner,
                    initiated_in: p.initiated_in,
                },
                slot: p.slot as u8,
                initiated_by: p.initiated_by,
            });
        }

        match pdu.opcode() {
            ControlOpcode::TerminateInd => {
                if self.record.close(frame) {
                    debug!(stream = %self.connection.key, frame, "connection terminated");
                    verdict.lifecycle.push(LifecycleEvent::ConnectionTerminated {
                        connection: self.connection,
                    });
                }
            }
            ControlOpcode::StartEncReq if !self.record.encrypted => {
                self.record.encrypted = true;
                verdict.lifecycle.push(LifecycleEvent::EncryptionStarted);
            }
            ControlOpcode::PauseEncRsp if self.record.encrypted => {
                self.record.encrypted = false;
                verdict.lifecycle.push(LifecycleEvent::EncryptionPaused);
            }
            _ => {}
        }
    }

    fn l2cap_start(&mut self, body: Body<'_>, verdict: &mut FrameVerdict) {
        let frame = self.ctx.frame;
        if !self.config.reassemble_l2cap {
            deliver_single(body, body.bytes.len(), frame, verdict);
            return;
        }

        let cursor = &mut self.record.direction_mut(self.ctx.direction).reassembly;
        if let AssemblyCursor::Active(previous) = *cursor {
            self.reassembler.abandon(previous);
        }
        *cursor = AssemblyCursor::Idle;

        if body.bytes.len() < 2 {
            if !body.is_truncated() {
                verdict.annotate(Annotation::Malformed(PduError::TooShort {
                    expected: 2,
                    actual: body.bytes.len(),
                }));
            }
            return;
        }
        let total =
            usize::from(u16::from_le_bytes([body.bytes[0], body.bytes[1]])) + L2CAP_HEADER_SIZE;

        if body.declared >= total {
            if body.bytes.len() >= total {
                deliver_single(body, total, frame, verdict);
            } else {
                verdict.annotate(Annotation::Reassembly(ReassemblyError::FragmentTooLarge {
                    declared: total,
                    available: body.bytes.len(),
                }));
                verdict.fragment = Some(FragmentLink {
                    kind: MessageKind::L2cap,
                    first_frame: frame,
                    role: FragmentRole::Single,
                });
            }
            return;
        }

        if let Err(e) = self.reassembler.begin(
            MessageKind::L2cap,
            frame,
            Some(total),
            self.config.max_l2cap_len,
            Fragment::new(body.bytes).declared(body.declared),
        ) {
            verdict.annotate(Annotation::Reassembly(e));
        }
        *cursor = AssemblyCursor::Active(frame);
        verdict.fragment = Some(FragmentLink {
            kind: MessageKind::L2cap,
            first_frame: frame,
            role: FragmentRole::Start,
        });
    }

    fn l2cap_continuation(&mut self, body: Body<'_>, verdict: &mut FrameVerdict) {
        if !self.config.reassemble_l2cap {
            deliver_single(body, body.bytes.len(), self.ctx.frame, verdict);
            return;
        }
        let cursor = &mut self.record.direction_mut(self.ctx.direction).reassembly;
        *cursor = continue_assembly(
            self.reassembler,
            *cursor,
            MessageKind::L2cap,
            self.ctx.frame,
            Fragment::new(body.bytes).declared(body.declared),
            verdict,
        );
    }
}

/// Feed a continuation fragment to the assembly `cursor` points at and return
/// the cursor's next state
fn continue_assembly(
    reassembler: &mut Reassembler,
    cursor: AssemblyCursor,
    kind: MessageKind,
    frame: u32,
    fragment: Fragment<'_>,
    verdict: &mut FrameVerdict,
) -> AssemblyCursor {
    let first_frame = match cursor {
        AssemblyCursor::Idle => {
            verdict.annotate(Annotation::Reassembly(ReassemblyError::MissingStart));
            return cursor;
        }
        AssemblyCursor::Abandoned(first_frame) => {
            verdict.annotate(Annotation::Reassembly(ReassemblyError::MissingStart));
            verdict.fragment = Some(FragmentLink {
                kind,
                first_frame,
                role: FragmentRole::Continuation,
            });
            return cursor;
        }
        AssemblyCursor::Active(first_frame) => first_frame,
    };

    let (role, next) = match reassembler.append(first_frame, frame, fragment) {
        Ok(AppendOutcome::Complete) => {
            if reassembler.message(first_frame).is_some() {
                verdict.delivery = Delivery::Reassembled { kind, first_frame };
            }
            (FragmentRole::End, AssemblyCursor::Idle)
        }
        Ok(AppendOutcome::More) => (FragmentRole::Continuation, cursor),
        Err(e) => {
            verdict.annotate(Annotation::Reassembly(e));
            (
                FragmentRole::Continuation,
                AssemblyCursor::Abandoned(first_frame),
            )
        }
    };
    verdict.fragment = Some(FragmentLink {
        kind,
        first_frame,
        role,
    });
    next
}

/// Hand on an advertising data set carried whole by this frame
fn single(raw: &RawFrame<'_>, data: &[u8], frame: u32, verdict: &mut FrameVerdict) {
    let payload = raw.payload();
    verdict.delivery = Delivery::Direct {
        kind: MessageKind::AdvertisingData,
        offset: raw.payload_offset() + payload.len() - data.len(),
        len: data.len(),
    };
    verdict.fragment = Some(FragmentLink {
        kind: MessageKind::AdvertisingData,
        first_frame: frame,
        role: FragmentRole::Single,
    });
}

fn deliver_single(body: Body<'_>, len: usize, frame: u32, verdict: &mut FrameVerdict) {
    verdict.delivery = body.direct(MessageKind::L2cap, len);
    verdict.fragment = Some(FragmentLink {
        kind: MessageKind::L2cap,
        first_frame: frame,
        role: FragmentRole::Single,
    });
}

fn deliver(
    reassembler: &Reassembler,
    verdict: &FrameVerdict,
    bytes: &[u8],
    ctx: &FrameContext,
    next: &mut dyn NextLayer,
) {
    let (kind, first_frame, message) = match verdict.delivery {
        Delivery::None => return,
        Delivery::Direct { kind, offset, len } => {
            (kind, verdict.frame, bytes.get(offset..offset + len))
        }
        Delivery::Reassembled { kind, first_frame } => {
            (kind, first_frame, reassembler.message(first_frame))
        }
    };
    let Some(message) = message else {
        return;
    };
    next.deliver(
        &ReassembledMessage {
            kind,
            first_frame,
            completed_in: verdict.frame,
            stream: verdict.stream,
            connection: verdict.connection,
            bytes: message,
        },
        ctx,
    );
}
