//! Shared capture builders for the lltrace integration tests.
//!
//! Frames are built with [`PduBuilder`] so every CRC is valid unless a test
//! corrupts it on purpose.

use lltrace_core::{
    AdvPduType, Direction, Engine, FrameContext, FrameVerdict, Llid, Pass, PduBuilder,
    ReassembledMessage,
};

/// Access address of the test connection
pub const ACCESS_ADDRESS: u32 = 0x5065_4321;

/// CRC init of the test connection
pub const CRC_INIT: u32 = 0x00AB_CDEF;

/// Central to peripheral
pub const C: Direction = Direction::CentralToPeripheral;

/// Peripheral to central
pub const P: Direction = Direction::PeripheralToCentral;

/// CONNECT_IND establishing the test connection (interval 24, timeout 72)
#[must_use]
pub fn connect_ind() -> Vec<u8> {
    let mut p = Vec::with_capacity(34);
    p.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]); // InitA
    p.extend_from_slice(&[0x11, 0x12, 0x13, 0x14, 0x15, 0x16]); // AdvA
    p.extend_from_slice(&ACCESS_ADDRESS.to_le_bytes());
    p.extend_from_slice(&CRC_INIT.to_le_bytes()[..3]);
    p.push(2); // WinSize
    p.extend_from_slice(&0u16.to_le_bytes()); // WinOffset
    p.extend_from_slice(&24u16.to_le_bytes()); // Interval
    p.extend_from_slice(&0u16.to_le_bytes()); // Latency
    p.extend_from_slice(&72u16.to_le_bytes()); // Timeout
    p.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]); // ChM
    p.push(0x25); // Hop, SCA
    PduBuilder::new()
        .advertising(AdvPduType::ConnectInd)
        .payload(&p)
        .build()
        .expect("CONNECT_IND fits in one PDU")
}

/// ADV_NONCONN_IND carrying `adv_data`
#[must_use]
pub fn adv_nonconn_ind(adv_data: &[u8]) -> Vec<u8> {
    let mut p = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    p.extend_from_slice(adv_data);
    PduBuilder::new()
        .advertising(AdvPduType::AdvNonconnInd)
        .payload(&p)
        .build()
        .expect("advertising payload fits in one PDU")
}

/// Data channel frame on the test connection
#[must_use]
pub fn data(llid: Llid, sn: u8, nesn: u8, payload: &[u8]) -> Vec<u8> {
    PduBuilder::new()
        .access_address(ACCESS_ADDRESS)
        .crc_init(CRC_INIT)
        .llid(llid)
        .sn(sn)
        .nesn(nesn)
        .payload(payload)
        .build()
        .expect("data payload fits in one PDU")
}

/// Empty data frame, the usual acknowledgement-only PDU
#[must_use]
pub fn empty(sn: u8, nesn: u8) -> Vec<u8> {
    data(Llid::Continuation, sn, nesn, &[])
}

/// LL_FEATURE_REQ (0x08) or LL_FEATURE_RSP (0x09)
#[must_use]
pub fn feature(opcode: u8) -> Vec<u8> {
    let mut p = vec![opcode];
    p.extend_from_slice(&[0u8; 8]);
    p
}

/// LL_CONNECTION_UPDATE_IND with a new interval taking effect at `instant`
#[must_use]
pub fn connection_update(interval: u16, instant: u16) -> Vec<u8> {
    let mut p = vec![0x00, 1];
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&interval.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&100u16.to_le_bytes());
    p.extend_from_slice(&instant.to_le_bytes());
    p
}

/// LL_CONNECTION_PARAM_REQ with zeroed fields
#[must_use]
pub fn connection_param_req() -> Vec<u8> {
    let mut p = vec![0x0F];
    p.extend_from_slice(&[0u8; 23]);
    p
}

/// LL_CONNECTION_PARAM_RSP with zeroed fields
#[must_use]
pub fn connection_param_rsp() -> Vec<u8> {
    let mut p = vec![0x10];
    p.extend_from_slice(&[0u8; 23]);
    p
}

/// L2CAP basic frame: length, channel ID, then `body`
#[must_use]
pub fn l2cap(cid: u16, body: &[u8]) -> Vec<u8> {
    let len = u16::try_from(body.len()).expect("L2CAP body length fits in u16");
    let mut message = Vec::with_capacity(body.len() + 4);
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&cid.to_le_bytes());
    message.extend_from_slice(body);
    message
}

/// One captured frame: bytes plus context
#[derive(Debug, Clone)]
pub struct Frame {
    /// Link-layer bytes, access address first
    pub bytes: Vec<u8>,
    /// Frame context
    pub ctx: FrameContext,
}

/// A capture assembled frame by frame, numbered from 1
#[derive(Debug, Clone, Default)]
pub struct Capture {
    frames: Vec<Frame>,
}

impl Capture {
    /// Empty capture
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture starting with the test connection's CONNECT_IND
    #[must_use]
    pub fn connected() -> Self {
        let mut capture = Self::new();
        capture.push(Direction::Unknown, None, connect_ind());
        capture
    }

    /// Append a frame and return its number
    pub fn push(&mut self, direction: Direction, event_counter: Option<u16>, bytes: Vec<u8>) -> u32 {
        let number = u32::try_from(self.frames.len() + 1).expect("capture fits in u32 frames");
        let mut ctx = FrameContext::new(number).with_direction(direction);
        if let Some(event_counter) = event_counter {
            ctx = ctx.with_event_counter(event_counter);
        }
        self.frames.push(Frame { bytes, ctx });
        number
    }

    /// Frames in capture order
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// Result of running a capture through one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutput {
    /// Verdict of every frame, in capture order
    pub verdicts: Vec<FrameVerdict>,
    /// Messages handed to the next layer: completing frame and bytes
    pub delivered: Vec<(u32, Vec<u8>)>,
}

/// Run every frame of `capture` through `engine` on `pass`
///
/// # Panics
///
/// Panics if the engine rejects a frame.
pub fn run(engine: &mut Engine, capture: &Capture, pass: Pass) -> PassOutput {
    let mut output = PassOutput {
        verdicts: Vec::with_capacity(capture.frames().len()),
        delivered: Vec::new(),
    };
    for frame in capture.frames() {
        let delivered = &mut output.delivered;
        let mut sink = |m: &ReassembledMessage<'_>, _: &FrameContext| {
            delivered.push((m.completed_in, m.bytes.to_vec()));
        };
        let verdict = engine
            .process(&frame.bytes, &frame.ctx, pass, &mut sink)
            .expect("frame accepted")
            .clone();
        output.verdicts.push(verdict);
    }
    output
}

/// Run the authoritative pass over `capture` with a default engine
#[must_use]
pub fn analyze(capture: &Capture) -> (Engine, PassOutput) {
    let mut engine = Engine::default();
    let output = run(&mut engine, capture, Pass::Authoritative);
    (engine, output)
}
