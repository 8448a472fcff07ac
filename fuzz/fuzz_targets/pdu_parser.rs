//! Fuzz target for link-layer PDU parsing
//!
//! Tests that every PDU parser handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lltrace_core::frame::{
    AdvertisingHeader, ConnectRequest, ControlPdu, DataHeader, ExtendedAdvertising,
    LegacyAdvertising,
};
use lltrace_core::{Phy, RawFrame};

fuzz_target!(|data: &[u8]| {
    for phy in [Phy::Le1M, Phy::LeCoded] {
        let Ok(frame) = RawFrame::parse(data, phy) else {
            continue;
        };
        let _ = frame.length_error();
        let _ = frame.checksum_error();
        let _ = frame.crc();
        let payload = frame.payload();

        let adv = AdvertisingHeader::parse(frame.header());
        let _ = LegacyAdvertising::parse(adv.pdu_type, payload);
        let _ = ConnectRequest::parse(payload);
        let _ = ExtendedAdvertising::parse(payload);

        let _ = DataHeader::parse(frame.header());
        if let Ok(pdu) = ControlPdu::parse(payload) {
            let _ = pdu.instant();
            let _ = pdu.connection_update();
            let _ = pdu.channel_map();
            let _ = pdu.phy_update();
            let _ = pdu.unknown_type();
            let _ = pdu.reject_opcode();
            let _ = pdu.error_code();
        }
    }
});
