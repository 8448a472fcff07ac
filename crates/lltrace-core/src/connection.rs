//! Connection registry.
//!
//! Connections are keyed by [`StreamKey`] and stored in a [`FrameIndexedStore`],
//! so successive connections reusing one access address stay distinct and the
//! connection owning any frame is "the newest one created at or before it".
//! Parameter updates and periodic advertising trains use the same store shape.

use std::fmt;

use serde::Serialize;

use crate::context::Direction;
use crate::control::ControlProcedureTracker;
use crate::error::StoreError;
use crate::frame::{BdAddr, ConnectRequest, ConnectionUpdate, PhyUpdate, SyncInfo};
use crate::reassembly::AssemblyCursor;
use crate::sequence::SequenceTracker;
use crate::store::FrameIndexedStore;

/// Sentinel for a validity window that has not been closed
pub const OPEN_WINDOW: u32 = u32::MAX;

/// Lookup key shared by every per-stream structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey {
    /// Capture scope (interface or file)
    pub capture_scope: u32,
    /// Sniffer adapter
    pub adapter: u32,
    /// Link-layer access address
    pub access_address: u32,
}

impl StreamKey {
    /// Build a key
    #[must_use]
    pub fn new(capture_scope: u32, adapter: u32, access_address: u32) -> Self {
        Self {
            capture_scope,
            adapter,
            access_address,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/0x{:08X}",
            self.capture_scope, self.adapter, self.access_address
        )
    }
}

/// One connection instance: its stream key plus the frame that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId {
    /// Stream the connection lives on
    pub key: StreamKey,
    /// Frame that created the record
    pub created_in: u32,
}

/// Timing and hopping parameters of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionParameters {
    /// Connection interval (1.25 ms units)
    pub interval: u16,
    /// Peripheral latency
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub timeout: u16,
    /// Data channel map
    pub channel_map: [u8; 5],
    /// Hop increment
    pub hop: u8,
    /// Sleep clock accuracy index
    pub sca: u8,
    /// Central to peripheral PHY bitmap
    pub tx_phy: u8,
    /// Peripheral to central PHY bitmap
    pub rx_phy: u8,
}

impl ConnectionParameters {
    /// Parameters announced in a connection request
    #[must_use]
    pub fn from_request(req: &ConnectRequest) -> Self {
        Self {
            interval: req.interval,
            latency: req.latency,
            timeout: req.timeout,
            channel_map: req.channel_map,
            hop: req.hop,
            sca: req.sca,
            tx_phy: 0,
            rx_phy: 0,
        }
    }

    fn apply(&mut self, change: &ParameterChange) {
        match *change {
            ParameterChange::Timing(update) => {
                self.interval = update.interval;
                self.latency = update.latency;
                self.timeout = update.timeout;
            }
            ParameterChange::ChannelMap { map } => self.channel_map = map,
            ParameterChange::Phy(update) => {
                if update.central_to_peripheral != 0 {
                    self.tx_phy = update.central_to_peripheral;
                }
                if update.peripheral_to_central != 0 {
                    self.rx_phy = update.peripheral_to_central;
                }
            }
        }
    }
}

/// A negotiated change that takes effect at an instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterChange {
    /// LL_CONNECTION_UPDATE_IND
    Timing(ConnectionUpdate),
    /// LL_CHANNEL_MAP_IND
    ChannelMap {
        /// New channel map
        map: [u8; 5],
    },
    /// LL_PHY_UPDATE_IND
    Phy(PhyUpdate),
}

/// A parameter change that reached its instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterUpdate {
    /// Frame that carried the change
    pub requested_in: u32,
    /// Frame in which the instant was reached
    pub effective_in: u32,
    /// The change itself
    pub change: ParameterChange,
}

/// Periodic advertising train learned from a SyncInfo field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodicTrain {
    /// Stream of the train
    pub key: StreamKey,
    /// CRC init used by the train
    pub crc_init: u32,
    /// Advertising interval (1.25 ms units)
    pub interval: u16,
    /// Advertiser that announced the train, when known
    pub advertiser: Option<BdAddr>,
    /// Frame carrying the SyncInfo
    pub learned_in: u32,
}

impl PeriodicTrain {
    /// Train announced by `sync` in `frame`
    #[must_use]
    pub fn from_sync_info(
        capture_scope: u32,
        adapter: u32,
        sync: &SyncInfo,
        advertiser: Option<BdAddr>,
        frame: u32,
    ) -> Self {
        Self {
            key: StreamKey::new(capture_scope, adapter, sync.access_address),
            crc_init: sync.crc_init,
            interval: sync.interval,
            advertiser,
            learned_in: frame,
        }
    }
}

/// Per-direction state of a connection
#[derive(Debug, Clone, Default)]
pub struct DirectionRecord {
    /// L2CAP reassembly position
    pub reassembly: AssemblyCursor,
    /// Control procedures initiated in this direction
    pub procedures: ControlProcedureTracker,
}

/// State of one connection instance
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    key: StreamKey,
    /// Central address (unknown when the connection start was not captured)
    pub central: Option<BdAddr>,
    /// Peripheral address (unknown when the connection start was not captured)
    pub peripheral: Option<BdAddr>,
    /// CRC init (unknown when the connection start was not captured)
    pub crc_init: Option<u32>,
    /// Parameters from the connection request
    pub parameters: Option<ConnectionParameters>,
    /// Link encryption is active
    pub encrypted: bool,
    /// SN/NESN state
    pub sequence: SequenceTracker,
    created_in: u32,
    valid_until: u32,
    directions: [DirectionRecord; 3],
}

impl ConnectionRecord {
    /// Record for a connection whose request was captured
    #[must_use]
    pub fn from_request(capture_scope: u32, adapter: u32, req: &ConnectRequest, frame: u32) -> Self {
        Self {
            central: Some(req.initiator),
            peripheral: Some(req.advertiser),
            crc_init: Some(req.crc_init),
            parameters: Some(ConnectionParameters::from_request(req)),
            ..Self::implicit(
                StreamKey::new(capture_scope, adapter, req.access_address),
                frame,
            )
        }
    }

    /// Record for data seen on an access address with no captured request
    #[must_use]
    pub fn implicit(key: StreamKey, frame: u32) -> Self {
        Self {
            key,
            central: None,
            peripheral: None,
            crc_init: None,
            parameters: None,
            encrypted: false,
            sequence: SequenceTracker::new(),
            created_in: frame,
            valid_until: OPEN_WINDOW,
            directions: Default::default(),
        }
    }

    /// Stream key
    #[must_use]
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Connection instance identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        ConnectionId {
            key: self.key,
            created_in: self.created_in,
        }
    }

    /// Frame that created the record
    #[must_use]
    pub fn created_in(&self) -> u32 {
        self.created_in
    }

    /// Last frame of the validity window ([`OPEN_WINDOW`] while open)
    #[must_use]
    pub fn valid_until(&self) -> u32 {
        self.valid_until
    }

    /// Frame that closed the connection
    #[must_use]
    pub fn closed_in(&self) -> Option<u32> {
        (self.valid_until != OPEN_WINDOW).then_some(self.valid_until)
    }

    /// Whether the connection request was captured
    #[must_use]
    pub fn start_captured(&self) -> bool {
        self.crc_init.is_some()
    }

    /// Whether `frame` is inside the validity window
    #[must_use]
    pub fn is_valid_at(&self, frame: u32) -> bool {
        self.created_in <= frame && frame <= self.valid_until
    }

    /// Per-direction state
    #[must_use]
    pub fn direction(&self, direction: Direction) -> &DirectionRecord {
        &self.directions[direction.index()]
    }

    /// Mutable per-direction state
    pub fn direction_mut(&mut self, direction: Direction) -> &mut DirectionRecord {
        &mut self.directions[direction.index()]
    }

    /// All per-direction state, indexed by [`Direction::index`]
    pub fn directions_mut(&mut self) -> &mut [DirectionRecord; 3] {
        &mut self.directions
    }

    /// Close the validity window at `frame`; a closed window is never reopened
    pub fn close(&mut self, frame: u32) -> bool {
        if self.valid_until != OPEN_WINDOW {
            return false;
        }
        self.valid_until = frame;
        true
    }
}

/// Every connection, parameter update and periodic train of one capture session
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: FrameIndexedStore<StreamKey, ConnectionRecord>,
    parameter_updates: FrameIndexedStore<ConnectionId, ParameterUpdate>,
    periodic_trains: FrameIndexedStore<StreamKey, PeriodicTrain>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection instance, closing any open predecessor on its key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfOrderInsert` if a newer record already exists
    /// for the key; the new record is dropped.
    pub fn create(&mut self, record: ConnectionRecord) -> Result<ConnectionId, StoreError> {
        let id = record.id();
        if let Some((last, _)) = self.connections.latest(&id.key) {
            if id.created_in < last {
                return Err(StoreError::OutOfOrderInsert {
                    last,
                    attempted: id.created_in,
                });
            }
        }
        if let Some((_, previous)) = self.connections.lookup_at_or_before_mut(&id.key, id.created_in) {
            if previous.close(id.created_in) {
                tracing::debug!(
                    stream = %id.key,
                    frame = id.created_in,
                    "previous connection superseded"
                );
            }
        }
        self.connections.upsert(id.key, id.created_in, record)?;
        tracing::debug!(
            stream = %id.key,
            frame = id.created_in,
            "connection created"
        );
        Ok(id)
    }

    /// Connection owning `frame` on `key`
    #[must_use]
    pub fn at(&self, key: &StreamKey, frame: u32) -> Option<&ConnectionRecord> {
        self.connections.lookup_at_or_before(key, frame).map(|(_, r)| r)
    }

    /// Mutable connection owning `frame` on `key`
    pub fn at_mut(&mut self, key: &StreamKey, frame: u32) -> Option<&mut ConnectionRecord> {
        self.connections
            .lookup_at_or_before_mut(key, frame)
            .map(|(_, r)| r)
    }

    /// Connection instance by identifier
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.at(&id.key, id.created_in)
            .filter(|r| r.created_in == id.created_in)
    }

    /// Mutable connection instance by identifier
    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionRecord> {
        self.at_mut(&id.key, id.created_in)
            .filter(|r| r.created_in == id.created_in)
    }

    /// Close a connection's validity window; returns false if already closed
    pub fn close(&mut self, id: &ConnectionId, frame: u32) -> bool {
        let closed = self.get_mut(id).is_some_and(|r| r.close(frame));
        if closed {
            tracing::debug!(
                stream = %id.key,
                frame,
                "connection closed"
            );
        }
        closed
    }

    /// Record a parameter change that reached its instant
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfOrderInsert` if an update with a later
    /// effective frame is already recorded.
    pub fn record_parameter_update(
        &mut self,
        id: ConnectionId,
        update: ParameterUpdate,
    ) -> Result<(), StoreError> {
        self.parameter_updates.upsert(id, update.effective_in, update)
    }

    /// Most recent parameter update effective at or before `frame`
    #[must_use]
    pub fn parameter_update_at(&self, id: &ConnectionId, frame: u32) -> Option<&ParameterUpdate> {
        self.parameter_updates
            .lookup_at_or_before(id, frame)
            .map(|(_, u)| u)
    }

    /// All parameter updates of a connection, in effective order
    pub fn parameter_updates(&self, id: &ConnectionId) -> impl Iterator<Item = &ParameterUpdate> {
        self.parameter_updates
            .series(id)
            .into_iter()
            .flat_map(|s| s.iter().map(|(_, u)| u))
    }

    /// Connection parameters in force at `frame`
    #[must_use]
    pub fn parameters_at(&self, id: &ConnectionId, frame: u32) -> Option<ConnectionParameters> {
        let mut params = self.get(id)?.parameters?;
        for update in self.parameter_updates(id) {
            if update.effective_in > frame {
                break;
            }
            params.apply(&update.change);
        }
        Some(params)
    }

    /// Record a periodic advertising train
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfOrderInsert` on a frame older than the last
    /// announcement of the same train.
    pub fn learn_periodic_train(&mut self, train: PeriodicTrain) -> Result<(), StoreError> {
        self.periodic_trains
            .upsert(train.key, train.learned_in, train)
    }

    /// Periodic train known on `key` at `frame`
    #[must_use]
    pub fn periodic_train_at(&self, key: &StreamKey, frame: u32) -> Option<&PeriodicTrain> {
        self.periodic_trains
            .lookup_at_or_before(key, frame)
            .map(|(_, t)| t)
    }

    /// Every connection instance, ordered by creation frame
    #[must_use]
    pub fn connections(&self) -> Vec<&ConnectionRecord> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .flat_map(|(_, series)| series.iter().map(|(_, r)| r))
            .collect();
        all.sort_by_key(|r| (r.created_in, r.key));
        all
    }

    /// Every periodic train announcement, ordered by frame
    #[must_use]
    pub fn periodic_trains(&self) -> Vec<&PeriodicTrain> {
        let mut all: Vec<_> = self
            .periodic_trains
            .iter()
            .flat_map(|(_, series)| series.iter().map(|(_, t)| t))
            .collect();
        all.sort_by_key(|t| (t.learned_in, t.key));
        all
    }
}
