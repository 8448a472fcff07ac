//! # lltrace Core
//!
//! Bluetooth Low Energy link-layer tracking for packet captures.
//!
//! This crate provides:
//! - Zero-copy parsing of advertising, data and LL control PDUs
//! - CRC-24 validation per stream
//! - Connection instances with frame-indexed validity windows
//! - SN/NESN retransmission and acknowledgement tracking
//! - L2CAP and extended advertising reassembly
//! - LL control procedure state machines with instant tracking
//! - Per-frame verdicts that stay stable across dissection passes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine                                  │
//! │   (per-frame dispatch, verdict cache, next-layer delivery)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Connections   │   Procedures   │  Sequence   │  Reassembly    │
//! │   (registry)    │   (control)    │  (SN/NESN)  │  (fragments)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   Frame-indexed stores                           │
//! │   (history keyed by stream, looked up at-or-before a frame)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Frames                                  │
//! │   (access address, header, payload, CRC-24)                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use lltrace_core::{AdvPduType, Discard, Engine, FrameContext, Pass, PduBuilder};
//!
//! let bytes = PduBuilder::new()
//!     .advertising(AdvPduType::AdvNonconnInd)
//!     .payload(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x02, 0x01, 0x06])
//!     .build()
//!     .unwrap();
//!
//! let mut engine = Engine::default();
//! let verdict = engine
//!     .process(&bytes, &FrameContext::new(1), Pass::Authoritative, &mut Discard)
//!     .unwrap();
//! assert!(verdict.checksum.is_good());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod checksum;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod engine;
pub mod error;
pub mod frame;
pub mod reassembly;
pub mod sequence;
pub mod store;
pub mod verdict;

pub use checksum::ChecksumVerdict;
pub use config::EngineConfig;
pub use connection::{
    ConnectionId, ConnectionParameters, ConnectionRecord, ConnectionRegistry, ParameterChange,
    ParameterUpdate, PeriodicTrain, StreamKey,
};
pub use context::{Direction, FrameContext, Pass};
pub use control::{ControlProcedureRecord, ProcedureState};
pub use engine::{Discard, Engine, NextLayer, ReassembledMessage};
pub use error::{ConfigError, Error, PduError, ReassemblyError, StoreError};
pub use frame::{
    AdvPduType, BdAddr, ControlOpcode, ControlPdu, Llid, PduBuilder, Phy, RawFrame,
};
pub use reassembly::MessageKind;
pub use sequence::SequenceVerdict;
pub use verdict::{
    Annotation, AnnotationClass, CrossReferences, Delivery, FrameVerdict, LifecycleEvent,
    PduKind, ProcedureId,
};

/// Access address of every advertising channel PDU
pub const ADVERTISING_ACCESS_ADDRESS: u32 = frame::ADVERTISING_ACCESS_ADDRESS;
