//! Fuzz target for the tracking engine
//!
//! Feeds a sequence of arbitrary frames through both passes. Neither pass may
//! panic, and replay must return the authoritative verdicts.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use lltrace_core::{Direction, Discard, Engine, FrameContext, Pass, Phy};

#[derive(Debug, Arbitrary)]
struct FuzzFrame {
    bytes: Vec<u8>,
    direction: u8,
    coded: bool,
    event_counter: Option<u16>,
    channel: Option<u8>,
    auxiliary: bool,
}

impl FuzzFrame {
    fn context(&self, frame: u32) -> FrameContext {
        let direction = match self.direction % 3 {
            0 => Direction::CentralToPeripheral,
            1 => Direction::PeripheralToCentral,
            _ => Direction::Unknown,
        };
        let mut ctx = FrameContext::new(frame)
            .with_direction(direction)
            .with_phy(if self.coded { Phy::LeCoded } else { Phy::Le1M })
            .with_auxiliary(self.auxiliary);
        if let Some(event_counter) = self.event_counter {
            ctx = ctx.with_event_counter(event_counter);
        }
        if let Some(channel) = self.channel {
            ctx = ctx.with_channel(channel % 40);
        }
        ctx
    }
}

fuzz_target!(|frames: Vec<FuzzFrame>| {
    let mut engine = Engine::default();
    let mut verdicts = Vec::with_capacity(frames.len());

    for (i, frame) in frames.iter().enumerate() {
        let ctx = frame.context(i as u32 + 1);
        let verdict = engine
            .process(&frame.bytes, &ctx, Pass::Authoritative, &mut Discard)
            .expect("authoritative pass accepts frames in order");
        verdicts.push(verdict.clone());
    }

    for (i, frame) in frames.iter().enumerate() {
        let number = i as u32 + 1;
        let ctx = frame.context(number);
        let verdict = engine
            .process(&frame.bytes, &ctx, Pass::Replay, &mut Discard)
            .expect("replay of a visited frame");
        assert_eq!(verdict, &verdicts[i]);
        let _ = engine.cross_references(number);
    }
});
