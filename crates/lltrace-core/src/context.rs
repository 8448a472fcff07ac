//! Per-frame capture context supplied alongside the PDU bytes.

use serde::Serialize;

use crate::frame::Phy;

/// Transmission direction of a frame within a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the central
    CentralToPeripheral,
    /// Sent by the peripheral
    PeripheralToCentral,
    /// Not known from the capture
    #[default]
    Unknown,
}

impl Direction {
    /// Every direction, in index order
    pub const ALL: [Self; 3] = [
        Self::CentralToPeripheral,
        Self::PeripheralToCentral,
        Self::Unknown,
    ];

    /// The opposite direction (`Unknown` stays `Unknown`)
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::CentralToPeripheral => Self::PeripheralToCentral,
            Self::PeripheralToCentral => Self::CentralToPeripheral,
            Self::Unknown => Self::Unknown,
        }
    }

    /// Index into per-direction arrays
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::CentralToPeripheral => 0,
            Self::PeripheralToCentral => 1,
            Self::Unknown => 2,
        }
    }

    /// Whether the direction is known
    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

/// Which pass over the capture is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// First, in-order pass; the only pass that mutates state
    Authoritative,
    /// Any later pass; answers from per-frame caches and delivers nothing
    Replay,
}

/// Capture metadata for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Frame number, strictly increasing across the capture
    pub frame: u32,
    /// Capture scope (interface or file) the frame came from
    pub capture_scope: u32,
    /// Sniffer adapter within the capture scope
    pub adapter: u32,
    /// Access address override (when the capture format reports it separately)
    pub access_address: Option<u32>,
    /// Transmission direction
    pub direction: Direction,
    /// PHY the frame was received on
    pub phy: Phy,
    /// Connection or periodic event counter
    pub event_counter: Option<u16>,
    /// RF channel index
    pub channel: Option<u8>,
    /// Frame was received on a secondary (auxiliary) advertising channel
    pub auxiliary: bool,
    /// Payload was already decrypted by the capture source
    pub decrypted: bool,
}

impl FrameContext {
    /// Context with only the frame number set
    #[must_use]
    pub fn new(frame: u32) -> Self {
        Self {
            frame,
            capture_scope: 0,
            adapter: 0,
            access_address: None,
            direction: Direction::Unknown,
            phy: Phy::Le1M,
            event_counter: None,
            channel: None,
            auxiliary: false,
            decrypted: false,
        }
    }

    /// Set the capture scope and adapter
    #[must_use]
    pub fn with_source(mut self, capture_scope: u32, adapter: u32) -> Self {
        self.capture_scope = capture_scope;
        self.adapter = adapter;
        self
    }

    /// Set the direction
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the PHY
    #[must_use]
    pub fn with_phy(mut self, phy: Phy) -> Self {
        self.phy = phy;
        self
    }

    /// Set the event counter
    #[must_use]
    pub fn with_event_counter(mut self, event_counter: u16) -> Self {
        self.event_counter = Some(event_counter);
        self
    }

    /// Set the RF channel
    #[must_use]
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Override the access address
    #[must_use]
    pub fn with_access_address(mut self, access_address: u32) -> Self {
        self.access_address = Some(access_address);
        self
    }

    /// Mark the frame as received on a secondary advertising channel
    #[must_use]
    pub fn with_auxiliary(mut self, auxiliary: bool) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    /// Mark the payload as already decrypted
    #[must_use]
    pub fn with_decrypted(mut self, decrypted: bool) -> Self {
        self.decrypted = decrypted;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_opposite() {
        assert_eq!(
            Direction::CentralToPeripheral.opposite(),
            Direction::PeripheralToCentral
        );
        assert_eq!(
            Direction::PeripheralToCentral.opposite(),
            Direction::CentralToPeripheral
        );
        assert_eq!(Direction::Unknown.opposite(), Direction::Unknown);
    }

    #[test]
    fn test_direction_index_distinct() {
        let indices = [
            Direction::CentralToPeripheral.index(),
            Direction::PeripheralToCentral.index(),
            Direction::Unknown.index(),
        ];
        assert_eq!(indices, [0, 1, 2]);
    }

    #[test]
    fn test_context_builder() {
        let ctx = FrameContext::new(7)
            .with_source(1, 2)
            .with_direction(Direction::PeripheralToCentral)
            .with_event_counter(42)
            .with_channel(37);
        assert_eq!(ctx.frame, 7);
        assert_eq!(ctx.capture_scope, 1);
        assert_eq!(ctx.adapter, 2);
        assert_eq!(ctx.event_counter, Some(42));
        assert_eq!(ctx.channel, Some(37));
        assert!(!ctx.auxiliary);
    }
}
