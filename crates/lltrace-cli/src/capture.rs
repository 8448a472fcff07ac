//! Classic pcap reader for Bluetooth LE link-layer captures.
//!
//! Two link types are understood:
//!
//! - `LINKTYPE_BLUETOOTH_LE_LL` (251): bare frames, access address first
//! - `LINKTYPE_BLUETOOTH_LE_LL_WITH_PHDR` (256): a 10-byte pseudo-header with
//!   RF channel, direction, PHY and decryption flags, then the frame

use anyhow::{Context, bail};
use lltrace_core::{Direction, FrameContext, Phy};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_MAGIC_NANOS: u32 = 0xA1B2_3C4D;
const PCAP_HEADER_SIZE: usize = 24;
const RECORD_HEADER_SIZE: usize = 16;

/// Record size limit when the header leaves snaplen unset
const DEFAULT_SNAPLEN: u32 = 65_535;

/// Pseudo-header size for link type 256
const PHDR_SIZE: usize = 10;

const FLAG_DECRYPTED: u16 = 0x0008;
const FLAG_REFERENCE_AA_VALID: u16 = 0x0010;
const PDU_TYPE_SHIFT: u16 = 7;
const PDU_TYPE_MASK: u16 = 0x0007;
const PHY_SHIFT: u16 = 14;

/// Supported link types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Bare link-layer frames
    LeLl,
    /// Link-layer frames behind the radio pseudo-header
    LeLlWithPhdr,
}

impl LinkType {
    fn from_code(code: u32) -> anyhow::Result<Self> {
        match code {
            251 => Ok(Self::LeLl),
            256 => Ok(Self::LeLlWithPhdr),
            other => bail!("Unsupported link type {other} (expected 251 or 256)"),
        }
    }
}

/// One captured frame and the context the engine needs for it
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Link-layer bytes, access address first
    pub bytes: Vec<u8>,
    /// Frame context derived from the capture
    pub ctx: FrameContext,
}

/// All frames of one capture file
#[derive(Debug)]
pub struct Capture {
    link_type: LinkType,
    frames: Vec<CapturedFrame>,
    skipped: usize,
}

impl Capture {
    /// Read a capture file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a classic pcap file,
    /// or uses an unsupported link type.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        Self::read(BufReader::new(file))
    }

    /// Read a capture from any byte source
    ///
    /// # Errors
    ///
    /// Returns an error on a bad global header or unsupported link type.
    pub fn read<R: Read>(mut reader: R) -> anyhow::Result<Self> {
        let mut header = [0u8; PCAP_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .context("Capture is shorter than a pcap header")?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let swapped = match magic {
            PCAP_MAGIC | PCAP_MAGIC_NANOS => false,
            m if m.swap_bytes() == PCAP_MAGIC || m.swap_bytes() == PCAP_MAGIC_NANOS => true,
            _ => bail!("Not a classic pcap file (magic {magic:#010x})"),
        };
        let read_u32 = |b: &[u8]| {
            let bytes = [b[0], b[1], b[2], b[3]];
            if swapped {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let link_type = LinkType::from_code(read_u32(&header[20..24]))?;
        let snaplen = match read_u32(&header[16..20]) {
            0 => DEFAULT_SNAPLEN,
            n => n,
        };

        let mut frames = Vec::new();
        let mut skipped = 0;
        let mut record = [0u8; RECORD_HEADER_SIZE];
        let mut number: u32 = 0;
        while reader.read_exact(&mut record).is_ok() {
            let incl_len = read_u32(&record[8..12]);
            if incl_len > snaplen {
                number += 1;
                skipped += 1;
                tracing::warn!(frame = number, incl_len, snaplen, "record longer than snaplen");
                let wanted = u64::from(incl_len);
                let consumed = io::copy(&mut (&mut reader).take(wanted), &mut io::sink())?;
                if consumed < wanted {
                    tracing::warn!(frame = number, "capture ends inside a record");
                    break;
                }
                continue;
            }
            let mut data = vec![0u8; incl_len as usize];
            if reader.read_exact(&mut data).is_err() {
                tracing::warn!(frame = number + 1, "capture ends inside a record");
                break;
            }
            number += 1;
            match decode(link_type, number, data) {
                Some(frame) => frames.push(frame),
                None => {
                    tracing::warn!(frame = number, "record shorter than its pseudo-header");
                    skipped += 1;
                }
            }
        }
        tracing::debug!(frames = frames.len(), skipped, ?link_type, "capture read");

        Ok(Self {
            link_type,
            frames,
            skipped,
        })
    }

    /// Link type of the capture
    #[must_use]
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Frames in capture order
    #[must_use]
    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    /// Records that could not be turned into frames
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

fn decode(link_type: LinkType, number: u32, data: Vec<u8>) -> Option<CapturedFrame> {
    let ctx = FrameContext::new(number);
    match link_type {
        LinkType::LeLl => Some(CapturedFrame { bytes: data, ctx }),
        LinkType::LeLlWithPhdr => {
            if data.len() < PHDR_SIZE {
                return None;
            }
            let ctx = pseudo_header_context(ctx, &data[..PHDR_SIZE]);
            Some(CapturedFrame {
                bytes: data[PHDR_SIZE..].to_vec(),
                ctx,
            })
        }
    }
}

/// Apply the radio pseudo-header to a frame context
fn pseudo_header_context(mut ctx: FrameContext, phdr: &[u8]) -> FrameContext {
    let rf_channel = phdr[0];
    let reference_aa = u32::from_le_bytes([phdr[4], phdr[5], phdr[6], phdr[7]]);
    let flags = u16::from_le_bytes([phdr[8], phdr[9]]);

    ctx = ctx.with_channel(channel_index(rf_channel));
    ctx = match (flags >> PDU_TYPE_SHIFT) & PDU_TYPE_MASK {
        1 => ctx.with_auxiliary(true),
        2 => ctx.with_direction(Direction::CentralToPeripheral),
        3 => ctx.with_direction(Direction::PeripheralToCentral),
        _ => ctx,
    };
    ctx = ctx.with_phy(match flags >> PHY_SHIFT {
        1 => Phy::Le2M,
        2 => Phy::LeCoded,
        _ => Phy::Le1M,
    });
    if flags & FLAG_DECRYPTED != 0 {
        ctx = ctx.with_decrypted(true);
    }
    if flags & FLAG_REFERENCE_AA_VALID != 0 {
        ctx = ctx.with_access_address(reference_aa);
    }
    ctx
}

/// Link-layer channel index of an RF channel (2402 + 2k MHz)
#[must_use]
pub fn channel_index(rf_channel: u8) -> u8 {
    match rf_channel {
        0 => 37,
        12 => 38,
        39 => 39,
        1..=11 => rf_channel - 1,
        _ => rf_channel.saturating_sub(2),
    }
}
