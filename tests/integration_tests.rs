//! End-to-end tests driving the engine with whole captures.
//!
//! Every capture starts from a CONNECT_IND (frame 1) unless the test is about
//! connections whose start was not captured.

use lltrace_core::{
    Annotation, AnnotationClass, ChecksumVerdict, Delivery, Direction, Engine, EngineConfig,
    Error, FrameContext, LifecycleEvent, Llid, MessageKind, Pass, PduBuilder,
};
use lltrace_integration_tests::{
    ACCESS_ADDRESS, C, CRC_INIT, Capture, P, adv_nonconn_ind, analyze, connect_ind,
    connection_param_req, connection_param_rsp, connection_update, data, empty, feature, l2cap,
    run,
};

// ============================================================================
// Two-pass behaviour
// ============================================================================

fn busy_capture() -> Capture {
    let mut capture = Capture::connected();
    let message = l2cap(0x0004, &[0x5A; 40]);
    capture.push(C, Some(0), data(Llid::Control, 0, 0, &feature(0x08)));
    capture.push(P, Some(0), data(Llid::Control, 0, 1, &feature(0x09)));
    capture.push(C, Some(1), data(Llid::Start, 1, 1, &message[..27]));
    capture.push(P, Some(1), empty(1, 0));
    capture.push(C, Some(2), data(Llid::Continuation, 0, 0, &message[27..]));
    capture.push(P, Some(2), empty(0, 1));
    capture.push(C, Some(3), data(Llid::Control, 1, 1, &connection_update(40, 6)));
    for (counter, sn) in [(4u16, 0u8), (5, 1), (6, 0)] {
        capture.push(C, Some(counter), empty(sn, 1));
    }
    capture
}

#[test]
fn test_replay_is_idempotent() {
    let capture = busy_capture();
    let (mut engine, first) = analyze(&capture);
    assert_eq!(first.delivered.len(), 1);
    let frames = 1..=capture.frames().len() as u32;
    let refs: Vec<_> = frames.clone().map(|f| engine.cross_references(f)).collect();

    for _ in 0..2 {
        let replay = run(&mut engine, &capture, Pass::Replay);
        assert_eq!(replay.verdicts, first.verdicts);
        assert!(replay.delivered.is_empty());
    }

    let replayed: Vec<_> = frames.map(|f| engine.cross_references(f)).collect();
    assert_eq!(replayed, refs);
}

#[test]
fn test_split_message_delivered_once_across_passes() {
    let mut capture = Capture::connected();
    let message = l2cap(0x0004, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    capture.push(C, Some(0), data(Llid::Start, 0, 0, &message[..8]));
    capture.push(P, Some(0), empty(0, 1));
    let end = capture.push(C, Some(1), data(Llid::Continuation, 1, 1, &message[8..]));

    let (mut engine, first) = analyze(&capture);
    let mut delivered = first.delivered;
    for _ in 0..2 {
        delivered.extend(run(&mut engine, &capture, Pass::Replay).delivered);
    }
    assert_eq!(delivered, vec![(end, message)]);
}

#[test]
fn test_independent_engines_agree() {
    let capture = busy_capture();
    let (_, first) = analyze(&capture);
    let (_, second) = analyze(&capture);
    assert_eq!(first, second);
}

#[test]
fn test_replay_of_unvisited_frame_fails() {
    let capture = busy_capture();
    let (mut engine, _) = analyze(&capture);
    let result = engine.process(
        &empty(0, 0),
        &FrameContext::new(500),
        Pass::Replay,
        &mut lltrace_core::Discard,
    );
    assert!(matches!(result, Err(Error::NotVisited(500))));
}

#[test]
fn test_verdicts_serialize_to_json() {
    let capture = busy_capture();
    let (engine, output) = analyze(&capture);
    for verdict in &output.verdicts {
        let value = serde_json::to_value(verdict).unwrap();
        assert_eq!(value["frame"], verdict.frame);
    }
    let refs = serde_json::to_value(engine.cross_references(2)).unwrap();
    assert_eq!(refs["responses_in"][0], 3);
}

// ============================================================================
// Sequence and acknowledgement
// ============================================================================

#[test]
fn test_sequence_pattern_flags_only_the_repeat() {
    let mut capture = Capture::connected();
    let central = [
        capture.push(C, None, empty(0, 0)),
        {
            capture.push(P, None, empty(0, 1));
            capture.push(C, None, empty(1, 1))
        },
        {
            capture.push(P, None, empty(1, 0));
            capture.push(C, None, empty(0, 0))
        },
        {
            // Peripheral does not acknowledge the central's SN 0
            capture.push(P, None, empty(1, 0));
            capture.push(C, None, empty(0, 0))
        },
        {
            capture.push(P, None, empty(0, 1));
            capture.push(C, None, empty(1, 1))
        },
    ];

    let (_, output) = analyze(&capture);
    let flags: Vec<bool> = central
        .iter()
        .map(|&f| output.verdicts[f as usize - 1].is_retransmit())
        .collect();
    assert_eq!(flags, [false, false, false, true, false]);

    let nak = &output.verdicts[6];
    assert_eq!(nak.direction, P);
    assert!(!nak.sequence.unwrap().acknowledged);
}

#[test]
fn test_unknown_direction_gets_no_sequence_verdict() {
    let mut capture = Capture::connected();
    capture.push(Direction::Unknown, None, empty(0, 0));
    let (_, output) = analyze(&capture);
    assert!(output.verdicts[1].sequence.is_none());
    assert!(output.verdicts[1].connection.is_some());
}

#[test]
fn test_sequence_tracking_disabled() {
    let mut capture = Capture::connected();
    capture.push(C, None, empty(0, 0));
    capture.push(C, None, empty(0, 0));
    let mut engine = Engine::new(EngineConfig {
        track_sequence: false,
        ..EngineConfig::default()
    })
    .unwrap();
    let output = run(&mut engine, &capture, Pass::Authoritative);
    assert!(output.verdicts.iter().all(|v| v.sequence.is_none()));
}

// ============================================================================
// Reassembly
// ============================================================================

#[test]
fn test_l2cap_round_trip() {
    let message = l2cap(0x0006, &(0u8..100).collect::<Vec<_>>());
    let mut capture = Capture::connected();
    let mut sn = 0;
    let mut last = 0;
    for (i, chunk) in message.chunks(27).enumerate() {
        let llid = if i == 0 { Llid::Start } else { Llid::Continuation };
        last = capture.push(C, None, data(llid, sn, 0, chunk));
        sn ^= 1;
    }

    let (engine, output) = analyze(&capture);
    assert_eq!(output.delivered, vec![(last, message.clone())]);
    assert_eq!(
        output.verdicts[last as usize - 1].delivery,
        Delivery::Reassembled {
            kind: MessageKind::L2cap,
            first_frame: 2
        }
    );
    assert_eq!(engine.reassembler().message(2), Some(&message[..]));
    assert_eq!(engine.cross_references(2).first_fragment_in, None);
    for frame in 3..=last {
        assert_eq!(engine.cross_references(frame).first_fragment_in, Some(2));
    }
    assert_eq!(engine.cross_references(2).reassembled_in, Some(last));
}

#[test]
fn test_retransmitted_fragment_is_not_appended_twice() {
    let message = l2cap(0x0004, &[0x33; 40]);
    let mut capture = Capture::connected();
    capture.push(C, None, data(Llid::Start, 0, 0, &message[..27]));
    capture.push(P, None, empty(0, 1));
    capture.push(C, None, data(Llid::Continuation, 1, 1, &message[27..]));
    capture.push(P, None, empty(1, 1));
    let resent = capture.push(C, None, data(Llid::Continuation, 1, 1, &message[27..]));

    let (_, output) = analyze(&capture);
    assert_eq!(output.delivered, vec![(4, message)]);
    let verdict = &output.verdicts[resent as usize - 1];
    assert!(verdict.is_retransmit());
    assert_eq!(verdict.delivery, Delivery::None);
    assert!(verdict.annotations.is_empty());
}

#[test]
fn test_overlong_fragment_abandons_message() {
    let message = l2cap(0x0004, &[0x44; 30]);
    let mut capture = Capture::connected();
    capture.push(C, None, data(Llid::Start, 0, 0, &message[..27]));
    // Three bytes past the announced total
    let mut tail = message[27..].to_vec();
    tail.extend_from_slice(&[0, 0, 0]);
    let overflow = capture.push(C, None, data(Llid::Continuation, 1, 0, &tail));
    let stray = capture.push(C, None, data(Llid::Continuation, 0, 0, &[1, 2]));

    let (_, output) = analyze(&capture);
    assert!(output.delivered.is_empty());
    assert!(output.verdicts[overflow as usize - 1].has(AnnotationClass::SequenceGap));
    assert!(output.verdicts[stray as usize - 1].has(AnnotationClass::SequenceGap));
}

#[test]
fn test_advertising_data_delivered_directly() {
    let mut capture = Capture::new();
    capture.push(Direction::Unknown, None, adv_nonconn_ind(&[0x02, 0x01, 0x06]));
    let (_, output) = analyze(&capture);
    assert_eq!(output.delivered, vec![(1, vec![0x02, 0x01, 0x06])]);
    assert!(matches!(
        output.verdicts[0].delivery,
        Delivery::Direct {
            kind: MessageKind::AdvertisingData,
            ..
        }
    ));
}

// ============================================================================
// Control procedures
// ============================================================================

#[test]
fn test_control_happy_path() {
    let mut capture = Capture::connected();
    let req = capture.push(C, Some(0), data(Llid::Control, 0, 0, &feature(0x08)));
    let rsp = capture.push(P, Some(0), data(Llid::Control, 0, 1, &feature(0x09)));
    let ping = capture.push(P, Some(1), data(Llid::Control, 1, 1, &[0x12]));
    let pong = capture.push(C, Some(1), data(Llid::Control, 1, 0, &[0x13]));

    let (engine, output) = analyze(&capture);
    assert!(output.verdicts.iter().all(|v| v.annotations.is_empty()));

    assert_eq!(engine.responses_to(req), vec![rsp]);
    assert_eq!(engine.request_of(rsp), Some(req));
    assert_eq!(engine.responses_to(ping), vec![pong]);
    assert_eq!(engine.cross_references(pong).request_in, Some(ping));

    let procedures = engine.procedures();
    assert_eq!(procedures.len(), 2);
    assert!(procedures.iter().all(|(_, record)| !record.is_open()));
    assert_eq!(output.verdicts[rsp as usize - 1].control.unwrap().slot, 1);
}

#[test]
fn test_response_from_wrong_direction() {
    let mut capture = Capture::connected();
    capture.push(C, Some(0), data(Llid::Control, 0, 0, &feature(0x08)));
    let wrong = capture.push(C, Some(1), data(Llid::Control, 1, 0, &feature(0x09)));
    let (engine, output) = analyze(&capture);
    let verdict = &output.verdicts[wrong as usize - 1];
    assert!(verdict.has(AnnotationClass::ProtocolViolation));
    assert!(verdict.control.is_none());
    assert!(engine.responses_to(2).is_empty());
}

#[test]
fn test_collision_detected() {
    let mut capture = Capture::connected();
    let phy_req = capture.push(C, Some(0), data(Llid::Control, 0, 0, &[0x16, 0x02, 0x02]));
    capture.push(P, Some(0), data(Llid::Control, 0, 1, &[0x17, 0x02, 0x02]));
    let param_req = capture.push(P, Some(1), data(Llid::Control, 1, 1, &connection_param_req()));

    let (engine, output) = analyze(&capture);
    let verdict = &output.verdicts[param_req as usize - 1];
    assert!(verdict.annotations.contains(&Annotation::Collision {
        other_procedure: phy_req
    }));
    // The colliding request still opens its procedure
    assert_eq!(verdict.control.unwrap().slot, 0);
    assert_eq!(engine.procedures().len(), 2);
}

#[test]
fn test_collision_on_continuation() {
    let mut capture = Capture::connected();
    let phy_req = capture.push(C, Some(0), data(Llid::Control, 0, 0, &[0x16, 0x02, 0x02]));
    let param_req = capture.push(P, Some(0), data(Llid::Control, 0, 1, &connection_param_req()));
    capture.push(C, Some(1), data(Llid::Control, 1, 1, &connection_param_rsp()));
    let phy_rsp = capture.push(P, Some(1), data(Llid::Control, 1, 0, &[0x17, 0x02, 0x02]));

    let (engine, output) = analyze(&capture);
    let verdict = &output.verdicts[phy_rsp as usize - 1];
    assert!(verdict.annotations.contains(&Annotation::Collision {
        other_procedure: param_req
    }));
    // The response still continues the central's PHY procedure
    assert_eq!(verdict.control.unwrap().slot, 1);
    assert_eq!(engine.responses_to(phy_req), vec![phy_rsp]);
}

#[test]
fn test_skipped_instant_leaves_procedure_open() {
    let mut capture = Capture::connected();
    let ind = capture.push(C, Some(90), data(Llid::Control, 0, 0, &connection_update(40, 100)));
    let mut frames = Vec::new();
    for (counter, sn) in [(99u16, 1u8), (101, 0), (100, 1)] {
        frames.push(capture.push(C, Some(counter), empty(sn, 0)));
    }

    let (engine, output) = analyze(&capture);
    let updated: Vec<u32> = output
        .verdicts
        .iter()
        .filter(|v| {
            v.lifecycle
                .contains(&LifecycleEvent::ParametersUpdated { requested_in: ind })
        })
        .map(|v| v.frame)
        .collect();
    assert_eq!(updated, vec![frames[2]]);
    assert_eq!(engine.cross_references(ind).procedure_completed_in, Some(frames[2]));
}

#[test]
fn test_instant_completion_with_wraparound() {
    let mut capture = Capture::connected();
    let ind = capture.push(C, Some(65530), data(Llid::Control, 0, 0, &connection_update(40, 0)));
    let mut frames = Vec::new();
    for (counter, sn) in [(65533u16, 1u8), (65535, 0), (0, 1), (1, 0)] {
        frames.push(capture.push(C, Some(counter), empty(sn, 0)));
    }

    let (engine, output) = analyze(&capture);
    assert!(output.verdicts[ind as usize - 1].annotations.is_empty());

    let updated: Vec<u32> = output
        .verdicts
        .iter()
        .filter(|v| {
            v.lifecycle
                .contains(&LifecycleEvent::ParametersUpdated { requested_in: ind })
        })
        .map(|v| v.frame)
        .collect();
    assert_eq!(updated, vec![frames[2]]);

    let id = output.verdicts[ind as usize - 1].connection.unwrap();
    let registry = engine.registry();
    assert_eq!(registry.parameters_at(&id, frames[1]).unwrap().interval, 24);
    assert_eq!(registry.parameters_at(&id, frames[3]).unwrap().interval, 40);
    assert_eq!(engine.cross_references(ind).procedure_completed_in, Some(frames[2]));
}

#[test]
fn test_instant_without_event_counter() {
    let mut capture = Capture::connected();
    let ind = capture.push(C, None, data(Llid::Control, 0, 0, &connection_update(40, 9)));
    let (_, output) = analyze(&capture);
    assert!(output.verdicts[ind as usize - 1]
        .annotations
        .contains(&Annotation::EventCounterUnavailable));
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[test]
fn test_termination_and_reconnection() {
    let mut capture = Capture::connected();
    let terminate = capture.push(C, None, data(Llid::Control, 0, 0, &[0x02, 0x13]));
    let late = capture.push(P, None, empty(0, 1));
    let reconnect = capture.push(Direction::Unknown, None, connect_ind());
    let fresh = capture.push(C, None, empty(0, 0));

    let (engine, output) = analyze(&capture);
    assert!(output.verdicts[late as usize - 1]
        .annotations
        .contains(&Annotation::DataAfterTermination {
            terminated_in: terminate
        }));

    let connections = engine.registry().connections();
    assert_eq!(connections.len(), 2);
    assert_eq!(connections[0].closed_in(), Some(terminate));
    assert_eq!(connections[1].created_in(), reconnect);

    let verdict = &output.verdicts[fresh as usize - 1];
    assert_eq!(verdict.connection.unwrap().created_in, reconnect);
    assert!(verdict.annotations.is_empty());
    assert_eq!(engine.cross_references(fresh).connect_in, Some(reconnect));
}

#[test]
fn test_adapters_are_separate_streams() {
    let mut engine = Engine::default();
    let mut feed = |frame: u32, adapter: u32, bytes: &[u8]| {
        let ctx = FrameContext::new(frame)
            .with_source(0, adapter)
            .with_direction(C);
        engine
            .process(bytes, &ctx, Pass::Authoritative, &mut lltrace_core::Discard)
            .unwrap()
            .clone()
    };

    feed(1, 0, &connect_ind());
    let known = feed(2, 0, &empty(0, 0));
    let other = feed(3, 1, &empty(0, 0));

    assert_eq!(known.checksum, ChecksumVerdict::Good);
    assert_eq!(other.checksum, ChecksumVerdict::Indeterminate);
    assert!(other
        .annotations
        .contains(&Annotation::ConnectionStartNotCaptured));
    assert_ne!(known.stream, other.stream);
    assert_eq!(engine.registry().connections().len(), 2);
}

// ============================================================================
// Checksums
// ============================================================================

#[test]
fn test_checksum_known_vector() {
    let frame = adv_nonconn_ind(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    assert_eq!(&frame[frame.len() - 3..], &[0x8B, 0xFA, 0x6E]);

    let mut capture = Capture::new();
    capture.push(Direction::Unknown, None, frame);
    let (_, output) = analyze(&capture);
    assert_eq!(output.verdicts[0].checksum, ChecksumVerdict::Good);
}

#[test]
fn test_checksum_bit_flip() {
    let mut capture = Capture::connected();
    let mut bytes = data(Llid::Start, 0, 0, &l2cap(4, &[1, 2, 3]));
    bytes[8] ^= 0x10;
    capture.push(C, None, bytes);
    let (_, output) = analyze(&capture);
    assert!(matches!(output.verdicts[1].checksum, ChecksumVerdict::Bad { .. }));
    assert!(output.verdicts[1].has(AnnotationClass::ChecksumIncorrect));
}

#[test]
fn test_checksum_indeterminate_without_connect_request() {
    let frame = PduBuilder::new()
        .access_address(ACCESS_ADDRESS)
        .crc_init(CRC_INIT)
        .llid(Llid::Continuation)
        .build()
        .unwrap();
    let mut capture = Capture::new();
    capture.push(C, None, frame);
    let (_, output) = analyze(&capture);
    let verdict = &output.verdicts[0];
    assert_eq!(verdict.checksum, ChecksumVerdict::Indeterminate);
    assert!(verdict
        .annotations
        .contains(&Annotation::ConnectionStartNotCaptured));
}

#[test]
fn test_checksum_validation_disabled() {
    let mut bytes = empty(0, 0);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let mut capture = Capture::connected();
    capture.push(C, None, bytes);

    let mut engine = Engine::new(EngineConfig {
        validate_checksums: false,
        ..EngineConfig::default()
    })
    .unwrap();
    let output = run(&mut engine, &capture, Pass::Authoritative);
    assert_eq!(output.verdicts[1].checksum, ChecksumVerdict::Skipped);
    assert!(!output.verdicts[1].has(AnnotationClass::ChecksumIncorrect));
}
