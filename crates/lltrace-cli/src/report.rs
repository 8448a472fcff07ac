//! Report lines for frames, connections and procedures.

use console::style;
use lltrace_core::verdict::FragmentRole as Role;
use lltrace_core::{
    AdvPduType, ChecksumVerdict, ConnectionRecord, ConnectionRegistry, ControlOpcode,
    ControlProcedureRecord, CrossReferences, Direction, FrameVerdict, LifecycleEvent, Llid,
    PduKind, ProcedureId,
};
use serde_json::json;

/// One text line for a frame
#[must_use]
pub fn frame_text(
    verdict: &FrameVerdict,
    refs: Option<&CrossReferences>,
    payloads: &[String],
) -> String {
    let mut line = format!(
        "{:>7}  {:<4}  {:<10}  {:<26}  {}",
        verdict.frame,
        direction_label(verdict.direction),
        verdict
            .stream
            .map_or_else(|| "-".to_string(), |s| format!("{:#010x}", s.access_address)),
        pdu_label(verdict.pdu),
        checksum_label(&verdict.checksum),
    );

    if let Some(sequence) = verdict.sequence {
        if sequence.retransmit {
            line.push_str(&format!("  {}", style("retransmit").yellow()));
        }
        if !sequence.acknowledged {
            line.push_str(&format!("  {}", style("nak").yellow()));
        }
    }
    if let Some(link) = verdict.control {
        line.push_str(&format!(
            "  proc {}@{}/{}",
            link.initiated_by, link.procedure.initiated_in, link.slot
        ));
    }
    if let Some(link) = verdict.fragment {
        let role = match link.role {
            Role::Single => "whole",
            Role::Start => "start",
            Role::Continuation => "cont",
            Role::End => "end",
        };
        line.push_str(&format!("  frag {role}@{}", link.first_frame));
    }
    for event in &verdict.lifecycle {
        line.push_str(&format!("  {}", style(lifecycle_label(event)).cyan()));
    }
    for annotation in &verdict.annotations {
        line.push_str(&format!("  {}", style(format!("[{annotation}]")).red()));
    }
    if let Some(refs) = refs.filter(|r| !r.is_empty()) {
        line.push_str(&format!("  {}", style(refs_label(refs)).dim()));
    }
    for payload in payloads {
        line.push_str(&format!("\n         {payload}"));
    }
    line
}

/// One JSON object for a frame
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn frame_json(
    verdict: &FrameVerdict,
    refs: Option<&CrossReferences>,
    payloads: &[String],
) -> anyhow::Result<String> {
    let value = json!({
        "verdict": verdict,
        "cross_references": refs,
        "payloads": payloads,
    });
    Ok(serde_json::to_string(&value)?)
}

/// One text line for a connection instance
#[must_use]
pub fn connection_text(registry: &ConnectionRegistry, record: &ConnectionRecord) -> String {
    let id = record.id();
    let updates = registry.parameter_updates(&id).count();
    let parameters = registry.parameters_at(&id, record.valid_until());
    format!(
        "{}  created {}  closed {}  {}  central {}  peripheral {}  interval {}  updates {}{}",
        record.key(),
        record.created_in(),
        record
            .closed_in()
            .map_or_else(|| "-".to_string(), |f| f.to_string()),
        if record.start_captured() {
            "start captured"
        } else {
            "start missing"
        },
        record
            .central
            .map_or_else(|| "?".to_string(), |a| a.to_string()),
        record
            .peripheral
            .map_or_else(|| "?".to_string(), |a| a.to_string()),
        parameters.map_or_else(|| "?".to_string(), |p| p.interval.to_string()),
        updates,
        if record.encrypted { "  encrypted" } else { "" },
    )
}

/// One JSON object for a connection instance
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn connection_json(
    registry: &ConnectionRegistry,
    record: &ConnectionRecord,
) -> anyhow::Result<String> {
    let id = record.id();
    let updates: Vec<_> = registry.parameter_updates(&id).collect();
    let value = json!({
        "stream": record.key(),
        "created_in": record.created_in(),
        "closed_in": record.closed_in(),
        "start_captured": record.start_captured(),
        "central": record.central,
        "peripheral": record.peripheral,
        "crc_init": record.crc_init,
        "parameters": record.parameters,
        "parameter_updates": updates,
        "encrypted": record.encrypted,
    });
    Ok(serde_json::to_string(&value)?)
}

/// One text line for a control procedure
#[must_use]
pub fn procedure_text(id: &ProcedureId, record: &ControlProcedureRecord) -> String {
    let frames: Vec<String> = record
        .frames
        .iter()
        .filter(|&&f| f != 0)
        .map(u32::to_string)
        .collect();
    let state = if record.is_open() {
        style("open").yellow().to_string()
    } else {
        format!("closed@{}", record.terminal)
    };
    let instant = record
        .instant
        .map(|i| format!("  instant {} (from {})", i.value, i.learned_in))
        .unwrap_or_default();
    format!(
        "{}  {:<4}  {:<30}  frames [{}]  {}{}",
        id.connection.key,
        direction_label(id.owner),
        record.opcode.name(),
        frames.join(", "),
        state,
        instant,
    )
}

/// One JSON object for a control procedure
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn procedure_json(id: &ProcedureId, record: &ControlProcedureRecord) -> anyhow::Result<String> {
    Ok(serde_json::to_string(&json!({ "id": id, "procedure": record }))?)
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::CentralToPeripheral => "C->P",
        Direction::PeripheralToCentral => "P->C",
        Direction::Unknown => "-",
    }
}

fn pdu_label(pdu: PduKind) -> String {
    match pdu {
        PduKind::Advertising { pdu_type } => adv_label(pdu_type).to_string(),
        PduKind::Data { llid } => match llid {
            Llid::Start => "L2CAP start".to_string(),
            Llid::Continuation => "L2CAP continuation".to_string(),
            Llid::Control | Llid::Reserved => "reserved LLID".to_string(),
        },
        PduKind::Control { opcode } => ControlOpcode::try_from(opcode)
            .map_or_else(|_| format!("LL_UNKNOWN {opcode:#04x}"), |op| op.name().to_string()),
        PduKind::Unparsed => "?".to_string(),
    }
}

fn adv_label(pdu_type: AdvPduType) -> &'static str {
    match pdu_type {
        AdvPduType::AdvInd => "ADV_IND",
        AdvPduType::AdvDirectInd => "ADV_DIRECT_IND",
        AdvPduType::AdvNonconnInd => "ADV_NONCONN_IND",
        AdvPduType::ScanReq => "SCAN_REQ",
        AdvPduType::ScanRsp => "SCAN_RSP",
        AdvPduType::ConnectInd => "CONNECT_IND",
        AdvPduType::AdvScanInd => "ADV_SCAN_IND",
        AdvPduType::AdvExtInd => "ADV_EXT_IND",
        AdvPduType::AuxConnectRsp => "AUX_CONNECT_RSP",
        AdvPduType::Reserved(_) => "ADV_RESERVED",
    }
}

fn checksum_label(checksum: &ChecksumVerdict) -> String {
    match checksum {
        ChecksumVerdict::Good => style("crc ok").green().to_string(),
        ChecksumVerdict::Bad { .. } => style("crc BAD").red().bold().to_string(),
        ChecksumVerdict::Indeterminate => "crc ?".to_string(),
        ChecksumVerdict::Unavailable => "crc -".to_string(),
        ChecksumVerdict::Skipped => String::new(),
    }
}

fn lifecycle_label(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::ConnectionCreated { implicit, .. } => {
            if *implicit {
                "connection (implicit)".to_string()
            } else {
                "connection".to_string()
            }
        }
        LifecycleEvent::ConnectionTerminated { .. } => "terminated".to_string(),
        LifecycleEvent::ProcedureCompleted { procedure } => {
            format!("instant reached @{}", procedure.initiated_in)
        }
        LifecycleEvent::ParametersUpdated { requested_in } => {
            format!("parameters from {requested_in}")
        }
        LifecycleEvent::EncryptionStarted => "encryption started".to_string(),
        LifecycleEvent::EncryptionPaused => "encryption paused".to_string(),
        LifecycleEvent::PeriodicTrainLearned { train } => {
            format!("periodic train {:#010x}", train.access_address)
        }
    }
}

fn refs_label(refs: &CrossReferences) -> String {
    let mut parts = Vec::new();
    let mut push = |name: &str, frame: Option<u32>| {
        if let Some(frame) = frame {
            parts.push(format!("{name}={frame}"));
        }
    };
    push("connect", refs.connect_in);
    push("disconnect", refs.disconnect_in);
    push("params", refs.parameters_updated_in);
    push("request", refs.request_in);
    push("completed", refs.procedure_completed_in);
    push("first", refs.first_fragment_in);
    push("reassembled", refs.reassembled_in);
    if !refs.responses_in.is_empty() {
        let responses: Vec<String> = refs.responses_in.iter().map(u32::to_string).collect();
        parts.push(format!("responses={}", responses.join(",")));
    }
    format!("-> {}", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lltrace_core::Annotation;

    #[test]
    fn test_frame_text_contains_fields() {
        console::set_colors_enabled(false);
        let mut verdict = FrameVerdict::new(42, Direction::CentralToPeripheral);
        verdict.pdu = PduKind::Control { opcode: 0x08 };
        verdict.checksum = ChecksumVerdict::Good;
        verdict.annotate(Annotation::EventCounterUnavailable);

        let refs = CrossReferences {
            responses_in: vec![43],
            ..Default::default()
        };
        let line = frame_text(&verdict, Some(&refs), &[]);
        assert!(line.contains("42"));
        assert!(line.contains("C->P"));
        assert!(line.contains("LL_FEATURE_REQ"));
        assert!(line.contains("crc ok"));
        assert!(line.contains("responses=43"));
    }

    #[test]
    fn test_frame_json_round_trips_through_serde() {
        let mut verdict = FrameVerdict::new(1, Direction::Unknown);
        verdict.pdu = PduKind::Advertising {
            pdu_type: AdvPduType::AdvInd,
        };
        let line = frame_json(&verdict, None, &["0201".to_string()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["verdict"]["frame"], 1);
        assert_eq!(value["payloads"][0], "0201");
        assert!(value["cross_references"].is_null());
    }

    #[test]
    fn test_unknown_opcode_label() {
        assert_eq!(pdu_label(PduKind::Control { opcode: 0x7F }), "LL_UNKNOWN 0x7f");
    }
}
