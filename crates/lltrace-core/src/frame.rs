//! Link-layer PDU parsing.
//!
//! Every captured frame starts with the 32-bit access address, followed (on the
//! LE Coded PHY) by a coding indicator byte, the 2-byte PDU header, the payload
//! and the 24-bit CRC. All multi-byte fields are little-endian except the CRC,
//! which is kept in wire order. Parsing is zero-copy: payload views borrow from
//! the capture buffer.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::checksum::{self, ADVERTISING_CRC_INIT};
use crate::error::PduError;

/// Access address shared by all primary advertising channel PDUs
pub const ADVERTISING_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// Access address size in bytes
pub const ACCESS_ADDRESS_SIZE: usize = 4;

/// PDU header size in bytes
pub const PDU_HEADER_SIZE: usize = 2;

/// CRC size in bytes
pub const CRC_SIZE: usize = 3;

/// Message integrity check appended to encrypted payloads
pub const MIC_SIZE: usize = 4;

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn le24(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], 0])
}

fn le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn need(bytes: &[u8], expected: usize) -> Result<(), PduError> {
    if bytes.len() < expected {
        return Err(PduError::TooShort {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// 48-bit device address, stored in wire (little-endian) order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Read an address from the first six bytes of `bytes`
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[..6]);
        Self(addr)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({self})")
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Physical layer the frame was received on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phy {
    /// LE 1M
    #[default]
    Le1M,
    /// LE 2M
    Le2M,
    /// LE Coded (S=2 or S=8)
    LeCoded,
}

/// Zero-copy view of one captured link-layer frame
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    access_address: u32,
    coding_indicator: Option<u8>,
    header: [u8; 2],
    declared_len: usize,
    payload_offset: usize,
    payload: &'a [u8],
    crc_region: &'a [u8],
    crc: Option<u32>,
    trailer_len: usize,
}

impl<'a> RawFrame<'a> {
    /// Split a frame into access address, header, payload and CRC.
    ///
    /// A header length that overruns the captured bytes is not an error here:
    /// the payload is cut at the end of the capture and [`RawFrame::is_truncated`]
    /// reports it, so header-level fields stay usable.
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` when the access address or PDU header is
    /// incomplete.
    pub fn parse(data: &'a [u8], phy: Phy) -> Result<Self, PduError> {
        let header_offset = ACCESS_ADDRESS_SIZE + usize::from(phy == Phy::LeCoded);
        need(data, header_offset + PDU_HEADER_SIZE)?;

        let access_address = le32(data, 0);
        let coding_indicator = (phy == Phy::LeCoded).then(|| data[ACCESS_ADDRESS_SIZE] & 0x03);
        let header = [data[header_offset], data[header_offset + 1]];
        let declared_len = usize::from(header[1]);

        let payload_offset = header_offset + PDU_HEADER_SIZE;
        let payload_end = (payload_offset + declared_len).min(data.len());
        let crc = (data.len() >= payload_offset + declared_len + CRC_SIZE).then(|| {
            let at = payload_offset + declared_len;
            u32::from_be_bytes([0, data[at], data[at + 1], data[at + 2]])
        });

        Ok(Self {
            access_address,
            coding_indicator,
            header,
            declared_len,
            payload_offset,
            payload: &data[payload_offset..payload_end],
            crc_region: &data[header_offset..payload_end],
            crc,
            trailer_len: data.len() - payload_end,
        })
    }

    /// Access address carried by the frame
    #[must_use]
    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    /// Coding indicator (LE Coded PHY only)
    #[must_use]
    pub fn coding_indicator(&self) -> Option<u8> {
        self.coding_indicator
    }

    /// Raw PDU header bytes
    #[must_use]
    pub fn header(&self) -> [u8; 2] {
        self.header
    }

    /// Payload length declared by the header
    #[must_use]
    pub fn declared_len(&self) -> usize {
        self.declared_len
    }

    /// Offset of the payload within the frame bytes
    #[must_use]
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Captured payload (may be shorter than declared)
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Header plus payload, the region covered by the CRC
    #[must_use]
    pub fn crc_region(&self) -> &'a [u8] {
        self.crc_region
    }

    /// Transmitted CRC in wire order, if all three bytes were captured
    #[must_use]
    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    /// Whether the header declares more payload than was captured
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.payload.len() < self.declared_len
    }

    /// The length error for a truncated frame
    #[must_use]
    pub fn length_error(&self) -> Option<PduError> {
        self.is_truncated().then(|| PduError::LengthOverflow {
            declared: self.declared_len,
            available: self.payload.len(),
        })
    }

    /// The error for a complete payload followed by fewer than three CRC bytes
    #[must_use]
    pub fn checksum_error(&self) -> Option<PduError> {
        (self.crc.is_none() && !self.is_truncated()).then_some(PduError::MissingChecksum {
            available: self.trailer_len,
        })
    }
}

// ============================================================================
// Advertising channel
// ============================================================================

/// Advertising channel PDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvPduType {
    /// Connectable undirected advertising
    AdvInd,
    /// Connectable directed advertising
    AdvDirectInd,
    /// Non-connectable undirected advertising
    AdvNonconnInd,
    /// Scan request (AUX_SCAN_REQ on the secondary channel)
    ScanReq,
    /// Scan response
    ScanRsp,
    /// Connection request (AUX_CONNECT_REQ on the secondary channel)
    ConnectInd,
    /// Scannable undirected advertising
    AdvScanInd,
    /// Extended advertising (ADV_EXT_IND and all AUX_* carrying the common header)
    AdvExtInd,
    /// Auxiliary connection response
    AuxConnectRsp,
    /// Reserved type value
    Reserved(u8),
}

impl AdvPduType {
    /// Decode the 4-bit type field
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Self::AdvInd,
            0x1 => Self::AdvDirectInd,
            0x2 => Self::AdvNonconnInd,
            0x3 => Self::ScanReq,
            0x4 => Self::ScanRsp,
            0x5 => Self::ConnectInd,
            0x6 => Self::AdvScanInd,
            0x7 => Self::AdvExtInd,
            0x8 => Self::AuxConnectRsp,
            other => Self::Reserved(other),
        }
    }

    /// Encode as the 4-bit type field
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::AdvInd => 0x0,
            Self::AdvDirectInd => 0x1,
            Self::AdvNonconnInd => 0x2,
            Self::ScanReq => 0x3,
            Self::ScanRsp => 0x4,
            Self::ConnectInd => 0x5,
            Self::AdvScanInd => 0x6,
            Self::AdvExtInd => 0x7,
            Self::AuxConnectRsp => 0x8,
            Self::Reserved(bits) => bits & 0x0F,
        }
    }
}

/// Advertising channel PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingHeader {
    /// PDU type
    pub pdu_type: AdvPduType,
    /// Channel selection algorithm #2 supported
    pub ch_sel: bool,
    /// Advertiser address is random
    pub tx_add: bool,
    /// Target address is random
    pub rx_add: bool,
    /// Payload length
    pub length: u8,
}

impl AdvertisingHeader {
    /// Decode the two header bytes
    #[must_use]
    pub fn parse(header: [u8; 2]) -> Self {
        Self {
            pdu_type: AdvPduType::from_bits(header[0]),
            ch_sel: header[0] & 0x20 != 0,
            tx_add: header[0] & 0x40 != 0,
            rx_add: header[0] & 0x80 != 0,
            length: header[1],
        }
    }
}

/// CONNECT_IND / AUX_CONNECT_REQ payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectRequest {
    /// Initiator (future central) address
    pub initiator: BdAddr,
    /// Advertiser (future peripheral) address
    pub advertiser: BdAddr,
    /// Access address of the new connection
    pub access_address: u32,
    /// CRC init of the new connection
    pub crc_init: u32,
    /// Transmit window size (1.25 ms units)
    pub win_size: u8,
    /// Transmit window offset (1.25 ms units)
    pub win_offset: u16,
    /// Connection interval (1.25 ms units)
    pub interval: u16,
    /// Peripheral latency (events)
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub timeout: u16,
    /// Data channel map
    pub channel_map: [u8; 5],
    /// Hop increment
    pub hop: u8,
    /// Sleep clock accuracy index
    pub sca: u8,
}

impl ConnectRequest {
    /// Payload size in bytes
    pub const SIZE: usize = 34;

    /// Parse a CONNECT_IND payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` if fewer than [`Self::SIZE`] bytes are present.
    pub fn parse(payload: &[u8]) -> Result<Self, PduError> {
        need(payload, Self::SIZE)?;
        let mut channel_map = [0u8; 5];
        channel_map.copy_from_slice(&payload[28..33]);
        Ok(Self {
            initiator: BdAddr::from_slice(&payload[0..6]),
            advertiser: BdAddr::from_slice(&payload[6..12]),
            access_address: le32(payload, 12),
            crc_init: le24(payload, 16),
            win_size: payload[19],
            win_offset: le16(payload, 20),
            interval: le16(payload, 22),
            latency: le16(payload, 24),
            timeout: le16(payload, 26),
            channel_map,
            hop: payload[33] & 0x1F,
            sca: payload[33] >> 5,
        })
    }
}

/// Legacy advertising payload carrying an advertiser address and AdvData
#[derive(Debug, Clone, Copy)]
pub struct LegacyAdvertising<'a> {
    /// Advertiser address
    pub adv_address: BdAddr,
    /// Advertising or scan response data (empty for directed/scan PDUs)
    pub data: &'a [u8],
}

impl<'a> LegacyAdvertising<'a> {
    /// Parse the payload of a legacy advertising PDU type.
    ///
    /// Returns `Ok(None)` for types that carry no AdvA/AdvData pair.
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` when the fixed address fields are cut short.
    pub fn parse(pdu_type: AdvPduType, payload: &'a [u8]) -> Result<Option<Self>, PduError> {
        match pdu_type {
            AdvPduType::AdvInd
            | AdvPduType::AdvNonconnInd
            | AdvPduType::ScanRsp
            | AdvPduType::AdvScanInd => {
                need(payload, 6)?;
                Ok(Some(Self {
                    adv_address: BdAddr::from_slice(payload),
                    data: &payload[6..],
                }))
            }
            AdvPduType::AdvDirectInd => {
                need(payload, 12)?;
                Ok(Some(Self {
                    adv_address: BdAddr::from_slice(payload),
                    data: &[],
                }))
            }
            AdvPduType::ScanReq => {
                need(payload, 12)?;
                Ok(Some(Self {
                    adv_address: BdAddr::from_slice(&payload[6..]),
                    data: &[],
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Advertising data info: data set and set identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Adi {
    /// Advertising data ID
    pub did: u16,
    /// Advertising set ID
    pub sid: u8,
}

impl Adi {
    fn from_u16(raw: u16) -> Self {
        Self {
            did: raw & 0x0FFF,
            sid: (raw >> 12) as u8,
        }
    }
}

/// Pointer to the next auxiliary PDU of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxPtr {
    /// Secondary channel index
    pub channel: u8,
    /// Offset to the auxiliary packet in microseconds
    pub offset_usec: u32,
    /// PHY of the auxiliary packet
    pub phy: Phy,
}

impl AuxPtr {
    fn parse(bytes: &[u8]) -> Self {
        let raw = le24(bytes, 0);
        let units = if raw & 0x80 == 0 { 30 } else { 300 };
        let phy = match (raw >> 21) & 0x07 {
            1 => Phy::Le2M,
            2 => Phy::LeCoded,
            _ => Phy::Le1M,
        };
        Self {
            channel: (raw & 0x3F) as u8,
            offset_usec: ((raw >> 8) & 0x1FFF) * units,
            phy,
        }
    }
}

/// Periodic advertising train parameters announced in an extended header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncInfo {
    /// Periodic advertising interval (1.25 ms units)
    pub interval: u16,
    /// Secondary channel map
    pub channel_map: [u8; 5],
    /// Sleep clock accuracy flag
    pub sca: u8,
    /// Access address of the periodic train
    pub access_address: u32,
    /// CRC init of the periodic train
    pub crc_init: u32,
    /// Periodic event counter of the announced packet
    pub event_counter: u16,
}

impl SyncInfo {
    /// Field size in bytes
    pub const SIZE: usize = 18;

    fn parse(bytes: &[u8]) -> Self {
        let mut channel_map = [0u8; 5];
        channel_map.copy_from_slice(&bytes[4..9]);
        let sca = channel_map[4] >> 5;
        channel_map[4] &= 0x1F;
        Self {
            interval: le16(bytes, 2),
            channel_map,
            sca,
            access_address: le32(bytes, 9),
            crc_init: le24(bytes, 13),
            event_counter: le16(bytes, 16),
        }
    }
}

/// Common extended advertising payload
#[derive(Debug, Clone, Copy)]
pub struct ExtendedAdvertising<'a> {
    /// Advertising mode (0 = non-connectable non-scannable, 1 = connectable, 2 = scannable)
    pub adv_mode: u8,
    /// Advertiser address
    pub adv_address: Option<BdAddr>,
    /// Target address
    pub target_address: Option<BdAddr>,
    /// Constant tone extension info
    pub cte_info: Option<u8>,
    /// Advertising data info
    pub adi: Option<Adi>,
    /// Pointer to the next auxiliary packet
    pub aux_ptr: Option<AuxPtr>,
    /// Periodic advertising sync info
    pub sync_info: Option<SyncInfo>,
    /// Transmit power in dBm
    pub tx_power: Option<i8>,
    /// Additional controller advertising data
    pub acad: &'a [u8],
    /// Advertising data following the extended header
    pub adv_data: &'a [u8],
}

impl<'a> ExtendedAdvertising<'a> {
    /// Parse the common extended advertising payload format
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` if the extended header overruns the payload
    /// or a flagged field overruns the extended header.
    pub fn parse(payload: &'a [u8]) -> Result<Self, PduError> {
        need(payload, 1)?;
        let header_len = usize::from(payload[0] & 0x3F);
        let adv_mode = payload[0] >> 6;
        let end = 1 + header_len;
        need(payload, end)?;

        let mut ext = Self {
            adv_mode,
            adv_address: None,
            target_address: None,
            cte_info: None,
            adi: None,
            aux_ptr: None,
            sync_info: None,
            tx_power: None,
            acad: &[],
            adv_data: &payload[end..],
        };
        if header_len == 0 {
            return Ok(ext);
        }

        let header = &payload[..end];
        let flags = payload[1];
        let mut pos = 2;
        let mut field = |present: bool, size: usize| -> Result<Option<&'a [u8]>, PduError> {
            if !present {
                return Ok(None);
            }
            if pos + size > end {
                return Err(PduError::TooShort {
                    expected: pos + size,
                    actual: end,
                });
            }
            let bytes = &header[pos..pos + size];
            pos += size;
            Ok(Some(bytes))
        };

        ext.adv_address = field(flags & 0x01 != 0, 6)?.map(BdAddr::from_slice);
        ext.target_address = field(flags & 0x02 != 0, 6)?.map(BdAddr::from_slice);
        ext.cte_info = field(flags & 0x04 != 0, 1)?.map(|b| b[0]);
        ext.adi = field(flags & 0x08 != 0, 2)?.map(|b| Adi::from_u16(le16(b, 0)));
        ext.aux_ptr = field(flags & 0x10 != 0, 3)?.map(AuxPtr::parse);
        ext.sync_info = field(flags & 0x20 != 0, SyncInfo::SIZE)?.map(SyncInfo::parse);
        ext.tx_power = field(flags & 0x40 != 0, 1)?.map(|b| b[0] as i8);
        ext.acad = &header[pos.min(end)..];
        Ok(ext)
    }
}

// ============================================================================
// Data channel
// ============================================================================

/// Logical link identifier of a data channel PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Llid {
    /// Reserved value
    Reserved,
    /// Continuation fragment of an L2CAP message, or an empty PDU
    Continuation,
    /// Start of an L2CAP message (or a complete one)
    Start,
    /// LL control PDU
    Control,
}

impl Llid {
    /// Decode the 2-bit field
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Self::Continuation,
            2 => Self::Start,
            3 => Self::Control,
            _ => Self::Reserved,
        }
    }

    /// Encode as the 2-bit field
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Reserved => 0,
            Self::Continuation => 1,
            Self::Start => 2,
            Self::Control => 3,
        }
    }
}

/// Data channel PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Logical link identifier
    pub llid: Llid,
    /// Next expected sequence number
    pub nesn: u8,
    /// Sequence number
    pub sn: u8,
    /// More data
    pub more_data: bool,
    /// A CTEInfo byte precedes the payload
    pub cte_present: bool,
    /// Payload length (including any MIC)
    pub length: u8,
}

impl DataHeader {
    /// Decode the two header bytes
    #[must_use]
    pub fn parse(header: [u8; 2]) -> Self {
        Self {
            llid: Llid::from_bits(header[0]),
            nesn: (header[0] >> 2) & 1,
            sn: (header[0] >> 3) & 1,
            more_data: header[0] & 0x10 != 0,
            cte_present: header[0] & 0x20 != 0,
            length: header[1],
        }
    }
}

/// LL control opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ControlOpcode {
    ConnectionUpdateInd = 0x00,
    ChannelMapInd = 0x01,
    TerminateInd = 0x02,
    EncReq = 0x03,
    EncRsp = 0x04,
    StartEncReq = 0x05,
    StartEncRsp = 0x06,
    UnknownRsp = 0x07,
    FeatureReq = 0x08,
    FeatureRsp = 0x09,
    PauseEncReq = 0x0A,
    PauseEncRsp = 0x0B,
    VersionInd = 0x0C,
    RejectInd = 0x0D,
    PeripheralFeatureReq = 0x0E,
    ConnectionParamReq = 0x0F,
    ConnectionParamRsp = 0x10,
    RejectExtInd = 0x11,
    PingReq = 0x12,
    PingRsp = 0x13,
    LengthReq = 0x14,
    LengthRsp = 0x15,
    PhyReq = 0x16,
    PhyRsp = 0x17,
    PhyUpdateInd = 0x18,
    MinUsedChannelsInd = 0x19,
    CteReq = 0x1A,
    CteRsp = 0x1B,
    PeriodicSyncInd = 0x1C,
    ClockAccuracyReq = 0x1D,
    ClockAccuracyRsp = 0x1E,
    CisReq = 0x1F,
    CisRsp = 0x20,
    CisInd = 0x21,
    CisTerminateInd = 0x22,
    PowerControlReq = 0x23,
    PowerControlRsp = 0x24,
    PowerChangeInd = 0x25,
}

impl ControlOpcode {
    /// Every opcode, indexed by its value
    const ALL: [Self; 38] = [
        Self::ConnectionUpdateInd,
        Self::ChannelMapInd,
        Self::TerminateInd,
        Self::EncReq,
        Self::EncRsp,
        Self::StartEncReq,
        Self::StartEncRsp,
        Self::UnknownRsp,
        Self::FeatureReq,
        Self::FeatureRsp,
        Self::PauseEncReq,
        Self::PauseEncRsp,
        Self::VersionInd,
        Self::RejectInd,
        Self::PeripheralFeatureReq,
        Self::ConnectionParamReq,
        Self::ConnectionParamRsp,
        Self::RejectExtInd,
        Self::PingReq,
        Self::PingRsp,
        Self::LengthReq,
        Self::LengthRsp,
        Self::PhyReq,
        Self::PhyRsp,
        Self::PhyUpdateInd,
        Self::MinUsedChannelsInd,
        Self::CteReq,
        Self::CteRsp,
        Self::PeriodicSyncInd,
        Self::ClockAccuracyReq,
        Self::ClockAccuracyRsp,
        Self::CisReq,
        Self::CisRsp,
        Self::CisInd,
        Self::CisTerminateInd,
        Self::PowerControlReq,
        Self::PowerControlRsp,
        Self::PowerChangeInd,
    ];

    /// Minimum CtrData length for this opcode
    #[must_use]
    pub fn ctr_data_len(self) -> usize {
        match self {
            Self::ConnectionUpdateInd => 11,
            Self::ChannelMapInd => 7,
            Self::TerminateInd | Self::UnknownRsp | Self::RejectInd => 1,
            Self::EncReq => 22,
            Self::EncRsp => 12,
            Self::StartEncReq
            | Self::StartEncRsp
            | Self::PauseEncReq
            | Self::PauseEncRsp
            | Self::PingReq
            | Self::PingRsp
            | Self::CteRsp => 0,
            Self::FeatureReq | Self::FeatureRsp | Self::PeripheralFeatureReq => 8,
            Self::VersionInd => 5,
            Self::ConnectionParamReq | Self::ConnectionParamRsp => 23,
            Self::RejectExtInd | Self::PhyReq | Self::PhyRsp | Self::MinUsedChannelsInd => 2,
            Self::LengthReq | Self::LengthRsp => 8,
            Self::PhyUpdateInd => 4,
            Self::CteReq | Self::ClockAccuracyReq | Self::ClockAccuracyRsp => 1,
            Self::PeriodicSyncInd => 34,
            Self::CisReq => 35,
            Self::CisRsp => 8,
            Self::CisInd => 15,
            Self::CisTerminateInd | Self::PowerControlReq => 3,
            Self::PowerControlRsp | Self::PowerChangeInd => 4,
        }
    }

    /// Whether a procedure started by this opcode negotiates an instant
    #[must_use]
    pub fn carries_instant(self) -> bool {
        matches!(
            self,
            Self::ConnectionUpdateInd
                | Self::ChannelMapInd
                | Self::ConnectionParamReq
                | Self::PhyReq
                | Self::PhyUpdateInd
        )
    }

    /// `LL_*` name of the opcode
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionUpdateInd => "LL_CONNECTION_UPDATE_IND",
            Self::ChannelMapInd => "LL_CHANNEL_MAP_IND",
            Self::TerminateInd => "LL_TERMINATE_IND",
            Self::EncReq => "LL_ENC_REQ",
            Self::EncRsp => "LL_ENC_RSP",
            Self::StartEncReq => "LL_START_ENC_REQ",
            Self::StartEncRsp => "LL_START_ENC_RSP",
            Self::UnknownRsp => "LL_UNKNOWN_RSP",
            Self::FeatureReq => "LL_FEATURE_REQ",
            Self::FeatureRsp => "LL_FEATURE_RSP",
            Self::PauseEncReq => "LL_PAUSE_ENC_REQ",
            Self::PauseEncRsp => "LL_PAUSE_ENC_RSP",
            Self::VersionInd => "LL_VERSION_IND",
            Self::RejectInd => "LL_REJECT_IND",
            Self::PeripheralFeatureReq => "LL_PERIPHERAL_FEATURE_REQ",
            Self::ConnectionParamReq => "LL_CONNECTION_PARAM_REQ",
            Self::ConnectionParamRsp => "LL_CONNECTION_PARAM_RSP",
            Self::RejectExtInd => "LL_REJECT_EXT_IND",
            Self::PingReq => "LL_PING_REQ",
            Self::PingRsp => "LL_PING_RSP",
            Self::LengthReq => "LL_LENGTH_REQ",
            Self::LengthRsp => "LL_LENGTH_RSP",
            Self::PhyReq => "LL_PHY_REQ",
            Self::PhyRsp => "LL_PHY_RSP",
            Self::PhyUpdateInd => "LL_PHY_UPDATE_IND",
            Self::MinUsedChannelsInd => "LL_MIN_USED_CHANNELS_IND",
            Self::CteReq => "LL_CTE_REQ",
            Self::CteRsp => "LL_CTE_RSP",
            Self::PeriodicSyncInd => "LL_PERIODIC_SYNC_IND",
            Self::ClockAccuracyReq => "LL_CLOCK_ACCURACY_REQ",
            Self::ClockAccuracyRsp => "LL_CLOCK_ACCURACY_RSP",
            Self::CisReq => "LL_CIS_REQ",
            Self::CisRsp => "LL_CIS_RSP",
            Self::CisInd => "LL_CIS_IND",
            Self::CisTerminateInd => "LL_CIS_TERMINATE_IND",
            Self::PowerControlReq => "LL_POWER_CONTROL_REQ",
            Self::PowerControlRsp => "LL_POWER_CONTROL_RSP",
            Self::PowerChangeInd => "LL_POWER_CHANGE_IND",
        }
    }
}

impl TryFrom<u8> for ControlOpcode {
    type Error = PduError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(PduError::UnknownControlOpcode(value))
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters carried by LL_CONNECTION_UPDATE_IND
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionUpdate {
    /// Transmit window size (1.25 ms units)
    pub win_size: u8,
    /// Transmit window offset (1.25 ms units)
    pub win_offset: u16,
    /// New connection interval (1.25 ms units)
    pub interval: u16,
    /// New peripheral latency
    pub latency: u16,
    /// New supervision timeout (10 ms units)
    pub timeout: u16,
    /// Event counter at which the update applies
    pub instant: u16,
}

/// Parameters carried by LL_PHY_UPDATE_IND
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhyUpdate {
    /// Central to peripheral PHY bitmap (0 = unchanged)
    pub central_to_peripheral: u8,
    /// Peripheral to central PHY bitmap (0 = unchanged)
    pub peripheral_to_central: u8,
    /// Event counter at which the update applies
    pub instant: u16,
}

impl PhyUpdate {
    /// Neither direction changes PHY; the instant is meaningless
    #[must_use]
    pub fn is_no_change(&self) -> bool {
        self.central_to_peripheral == 0 && self.peripheral_to_central == 0
    }
}

/// Zero-copy view of an LL control PDU
#[derive(Debug, Clone, Copy)]
pub struct ControlPdu<'a> {
    opcode: ControlOpcode,
    ctr_data: &'a [u8],
}

impl<'a> ControlPdu<'a> {
    /// Parse an LL control payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for an empty payload,
    /// `PduError::UnknownControlOpcode` for an opcode outside the table, and
    /// `PduError::ControlTooShort` when the CtrData is shorter than the opcode needs.
    pub fn parse(payload: &'a [u8]) -> Result<Self, PduError> {
        need(payload, 1)?;
        let opcode = ControlOpcode::try_from(payload[0])?;
        let ctr_data = &payload[1..];
        if ctr_data.len() < opcode.ctr_data_len() {
            return Err(PduError::ControlTooShort {
                opcode: payload[0],
                expected: opcode.ctr_data_len(),
                actual: ctr_data.len(),
            });
        }
        Ok(Self { opcode, ctr_data })
    }

    /// Control opcode
    #[must_use]
    pub fn opcode(&self) -> ControlOpcode {
        self.opcode
    }

    /// CtrData bytes following the opcode
    #[must_use]
    pub fn ctr_data(&self) -> &'a [u8] {
        self.ctr_data
    }

    /// Instant carried by the PDU, if its opcode defines one
    #[must_use]
    pub fn instant(&self) -> Option<u16> {
        match self.opcode {
            ControlOpcode::ConnectionUpdateInd => Some(le16(self.ctr_data, 9)),
            ControlOpcode::ChannelMapInd => Some(le16(self.ctr_data, 5)),
            ControlOpcode::PhyUpdateInd => self.phy_update().map(|u| u.instant),
            _ => None,
        }
    }

    /// LL_CONNECTION_UPDATE_IND parameters
    #[must_use]
    pub fn connection_update(&self) -> Option<ConnectionUpdate> {
        (self.opcode == ControlOpcode::ConnectionUpdateInd).then(|| {
            let d = self.ctr_data;
            ConnectionUpdate {
                win_size: d[0],
                win_offset: le16(d, 1),
                interval: le16(d, 3),
                latency: le16(d, 5),
                timeout: le16(d, 7),
                instant: le16(d, 9),
            }
        })
    }

    /// LL_CHANNEL_MAP_IND channel map
    #[must_use]
    pub fn channel_map(&self) -> Option<[u8; 5]> {
        (self.opcode == ControlOpcode::ChannelMapInd).then(|| {
            let mut map = [0u8; 5];
            map.copy_from_slice(&self.ctr_data[..5]);
            map
        })
    }

    /// LL_PHY_UPDATE_IND parameters
    #[must_use]
    pub fn phy_update(&self) -> Option<PhyUpdate> {
        (self.opcode == ControlOpcode::PhyUpdateInd).then(|| PhyUpdate {
            central_to_peripheral: self.ctr_data[0],
            peripheral_to_central: self.ctr_data[1],
            instant: le16(self.ctr_data, 2),
        })
    }

    /// Opcode reported by LL_UNKNOWN_RSP
    #[must_use]
    pub fn unknown_type(&self) -> Option<u8> {
        (self.opcode == ControlOpcode::UnknownRsp).then(|| self.ctr_data[0])
    }

    /// Opcode rejected by LL_REJECT_EXT_IND
    #[must_use]
    pub fn reject_opcode(&self) -> Option<u8> {
        (self.opcode == ControlOpcode::RejectExtInd).then(|| self.ctr_data[0])
    }

    /// Error code of LL_TERMINATE_IND, LL_REJECT_IND or LL_REJECT_EXT_IND
    #[must_use]
    pub fn error_code(&self) -> Option<u8> {
        match self.opcode {
            ControlOpcode::TerminateInd | ControlOpcode::RejectInd => Some(self.ctr_data[0]),
            ControlOpcode::RejectExtInd => Some(self.ctr_data[1]),
            _ => None,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for complete captured frames (access address through CRC)
#[derive(Debug, Clone)]
pub struct PduBuilder {
    access_address: u32,
    coding_indicator: Option<u8>,
    header0: u8,
    payload: Vec<u8>,
    crc_init: u32,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self {
            access_address: ADVERTISING_ACCESS_ADDRESS,
            coding_indicator: None,
            header0: 0,
            payload: Vec::new(),
            crc_init: ADVERTISING_CRC_INIT,
        }
    }
}

impl PduBuilder {
    /// Create a new builder for an advertising channel frame
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the access address
    #[must_use]
    pub fn access_address(mut self, aa: u32) -> Self {
        self.access_address = aa;
        self
    }

    /// Insert a coding indicator byte (LE Coded PHY)
    #[must_use]
    pub fn coding_indicator(mut self, ci: u8) -> Self {
        self.coding_indicator = Some(ci);
        self
    }

    /// Advertising header with the given PDU type
    #[must_use]
    pub fn advertising(mut self, pdu_type: AdvPduType) -> Self {
        self.header0 = (self.header0 & 0xF0) | pdu_type.bits();
        self
    }

    /// Mark the advertiser address as random
    #[must_use]
    pub fn tx_add(mut self, random: bool) -> Self {
        self.header0 = (self.header0 & !0x40) | if random { 0x40 } else { 0 };
        self
    }

    /// Data channel header with the given LLID
    #[must_use]
    pub fn llid(mut self, llid: Llid) -> Self {
        self.header0 = (self.header0 & !0x03) | llid.bits();
        self
    }

    /// Set the sequence number bit
    #[must_use]
    pub fn sn(mut self, sn: u8) -> Self {
        self.header0 = (self.header0 & !0x08) | ((sn & 1) << 3);
        self
    }

    /// Set the next expected sequence number bit
    #[must_use]
    pub fn nesn(mut self, nesn: u8) -> Self {
        self.header0 = (self.header0 & !0x04) | ((nesn & 1) << 2);
        self
    }

    /// Set the more-data bit
    #[must_use]
    pub fn more_data(mut self, md: bool) -> Self {
        self.header0 = (self.header0 & !0x10) | if md { 0x10 } else { 0 };
        self
    }

    /// Set the payload
    #[must_use]
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Set the CRC init used to compute the trailing CRC
    #[must_use]
    pub fn crc_init(mut self, init: u32) -> Self {
        self.crc_init = init;
        self
    }

    /// Build the frame bytes
    ///
    /// # Errors
    ///
    /// Returns `PduError::PayloadTooLong` if the payload exceeds 255 bytes.
    pub fn build(self) -> Result<Vec<u8>, PduError> {
        let length =
            u8::try_from(self.payload.len()).map_err(|_| PduError::PayloadTooLong(self.payload.len()))?;

        let mut buf = Vec::with_capacity(
            ACCESS_ADDRESS_SIZE + 1 + PDU_HEADER_SIZE + self.payload.len() + CRC_SIZE,
        );
        buf.extend_from_slice(&self.access_address.to_le_bytes());
        if let Some(ci) = self.coding_indicator {
            buf.push(ci);
        }
        let crc_start = buf.len();
        buf.push(self.header0);
        buf.push(length);
        buf.extend_from_slice(&self.payload);

        let crc = checksum::compute(&buf[crc_start..], self.crc_init);
        let wire = checksum::reverse_bits_per_byte(crc).to_be_bytes();
        buf.extend_from_slice(&wire[1..]);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_ind_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]); // InitA
        p.extend_from_slice(&[0x11, 0x12, 0x13, 0x14, 0x15, 0x16]); // AdvA
        p.extend_from_slice(&0x5065_4321u32.to_le_bytes()); // AA
        p.extend_from_slice(&[0x56, 0x34, 0x12]); // CRCInit
        p.push(2); // WinSize
        p.extend_from_slice(&5u16.to_le_bytes());
        p.extend_from_slice(&24u16.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&72u16.to_le_bytes());
        p.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        p.push(0xA7); // hop 7, sca 5
        p
    }

    #[test]
    fn test_raw_frame_roundtrip() {
        let bytes = PduBuilder::new()
            .advertising(AdvPduType::AdvNonconnInd)
            .payload(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
            .build()
            .unwrap();
        assert_eq!(&bytes[bytes.len() - 3..], &[0x8B, 0xFA, 0x6E]);

        let raw = RawFrame::parse(&bytes, Phy::Le1M).unwrap();
        assert_eq!(raw.access_address(), ADVERTISING_ACCESS_ADDRESS);
        assert_eq!(raw.declared_len(), 12);
        assert!(!raw.is_truncated());
        assert_eq!(raw.crc(), Some(0x8B_FA6E));
        assert_eq!(raw.crc_region().len(), 14);
    }

    #[test]
    fn test_raw_frame_too_short() {
        assert!(matches!(
            RawFrame::parse(&[0xD6, 0xBE, 0x89], Phy::Le1M),
            Err(PduError::TooShort { expected: 6, actual: 3 })
        ));
    }

    #[test]
    fn test_raw_frame_truncated_payload() {
        let mut bytes = PduBuilder::new()
            .advertising(AdvPduType::AdvInd)
            .payload(&[0u8; 20])
            .build()
            .unwrap();
        bytes.truncate(4 + 2 + 10);
        let raw = RawFrame::parse(&bytes, Phy::Le1M).unwrap();
        assert!(raw.is_truncated());
        assert_eq!(raw.payload().len(), 10);
        assert_eq!(raw.crc(), None);
        assert_eq!(raw.checksum_error(), None);
        assert_eq!(
            raw.length_error(),
            Some(PduError::LengthOverflow {
                declared: 20,
                available: 10
            })
        );
    }

    #[test]
    fn test_missing_checksum() {
        let mut bytes = PduBuilder::new()
            .advertising(AdvPduType::AdvNonconnInd)
            .payload(&[0u8; 6])
            .build()
            .unwrap();
        bytes.truncate(bytes.len() - 2);
        let raw = RawFrame::parse(&bytes, Phy::Le1M).unwrap();
        assert_eq!(raw.payload_offset(), 6);
        assert_eq!(
            raw.checksum_error(),
            Some(PduError::MissingChecksum { available: 1 })
        );
    }

    #[test]
    fn test_coded_phy_skips_coding_indicator() {
        let bytes = PduBuilder::new()
            .coding_indicator(0x01)
            .advertising(AdvPduType::AdvNonconnInd)
            .payload(&[0u8; 6])
            .build()
            .unwrap();
        let raw = RawFrame::parse(&bytes, Phy::LeCoded).unwrap();
        assert_eq!(raw.coding_indicator(), Some(1));
        assert_eq!(raw.header(), [0x02, 6]);
        assert_eq!(raw.crc_region().len(), 8);
    }

    #[test]
    fn test_connect_request_parse() {
        let req = ConnectRequest::parse(&connect_ind_payload()).unwrap();
        assert_eq!(req.access_address, 0x5065_4321);
        assert_eq!(req.crc_init, 0x12_3456);
        assert_eq!(req.interval, 24);
        assert_eq!(req.timeout, 72);
        assert_eq!(req.hop, 7);
        assert_eq!(req.sca, 5);
        assert_eq!(req.initiator.to_string(), "06:05:04:03:02:01");
    }

    #[test]
    fn test_extended_header_parse() {
        // AdvA + ADI + AuxPtr, then two bytes of AdvData
        let mut payload = vec![1 + 6 + 2 + 3, 0x01 | 0x08 | 0x10];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.extend_from_slice(&0x3123u16.to_le_bytes()); // DID 0x123, SID 3
        payload.extend_from_slice(&[0x05, 0x10, 0x20]); // channel 5, 16 * 30us, 2M
        payload.extend_from_slice(&[0xAB, 0xCD]);

        let ext = ExtendedAdvertising::parse(&payload).unwrap();
        assert!(ext.adv_address.is_some());
        assert_eq!(ext.adi, Some(Adi { did: 0x123, sid: 3 }));
        let aux = ext.aux_ptr.unwrap();
        assert_eq!(aux.channel, 5);
        assert_eq!(aux.offset_usec, 16 * 30);
        assert_eq!(aux.phy, Phy::Le2M);
        assert_eq!(ext.adv_data, &[0xAB, 0xCD]);
    }

    #[test]
    fn test_extended_header_field_overrun() {
        // Header claims AdvA but is only 3 bytes long
        let payload = [3u8, 0x01, 0xAA, 0xBB];
        assert!(matches!(
            ExtendedAdvertising::parse(&payload),
            Err(PduError::TooShort { .. })
        ));
    }

    #[test]
    fn test_data_header_bits() {
        let header = DataHeader::parse([0b0001_1110, 27]);
        assert_eq!(header.llid, Llid::Start);
        assert_eq!(header.nesn, 1);
        assert_eq!(header.sn, 1);
        assert!(header.more_data);
        assert!(!header.cte_present);
        assert_eq!(header.length, 27);
    }

    #[test]
    fn test_control_opcode_table() {
        for value in 0u8..=0x25 {
            assert_eq!(ControlOpcode::try_from(value).unwrap() as u8, value);
        }
        assert_eq!(
            ControlOpcode::try_from(0x26),
            Err(PduError::UnknownControlOpcode(0x26))
        );
    }

    #[test]
    fn test_control_pdu_connection_update() {
        let mut payload = vec![0x00, 1];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&40u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&100u16.to_le_bytes());
        payload.extend_from_slice(&0x1234u16.to_le_bytes());

        let pdu = ControlPdu::parse(&payload).unwrap();
        let update = pdu.connection_update().unwrap();
        assert_eq!(update.interval, 40);
        assert_eq!(update.timeout, 100);
        assert_eq!(pdu.instant(), Some(0x1234));
    }

    #[test]
    fn test_control_pdu_too_short() {
        assert_eq!(
            ControlPdu::parse(&[0x01, 0xFF, 0xFF]).unwrap_err(),
            PduError::ControlTooShort {
                opcode: 0x01,
                expected: 7,
                actual: 2
            }
        );
    }

    #[test]
    fn test_builder_rejects_long_payload() {
        assert_eq!(
            PduBuilder::new().payload(&[0u8; 256]).build(),
            Err(PduError::PayloadTooLong(256))
        );
    }
}
