//! Static DMR priority model. Pure lookups, no state: every recomputation in
//! the ducking engine consults these tables.

use std::time::Duration;

use lib_common_dmroxide::types::TalkgroupKind;

/// Fixed ducking profile for one talkgroup kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindProfile {
    /// Base priority; higher preempts lower.
    pub priority: u32,
    /// How quickly victims must react when this kind starts speaking.
    pub response: Duration,
    /// Multiplier applied to the effective volume of every ducked channel
    /// while this kind is the dominant speaker.
    pub duck_level: f32,
    /// Post-speech interval during which ducking is maintained.
    pub default_hold: Duration,
}

pub const fn profile(kind: TalkgroupKind) -> KindProfile {
    match kind {
        TalkgroupKind::PriorityStatic => KindProfile {
            priority: 100,
            response: Duration::from_millis(50),
            duck_level: 0.0,
            default_hold: Duration::ZERO,
        },
        TalkgroupKind::SecondaryStatic => KindProfile {
            priority: 80,
            response: Duration::from_millis(100),
            duck_level: 0.1,
            default_hold: Duration::from_millis(2000),
        },
        TalkgroupKind::Dynamic => KindProfile {
            priority: 50,
            response: Duration::from_millis(150),
            duck_level: 0.6,
            default_hold: Duration::from_millis(3000),
        },
        TalkgroupKind::Adhoc => KindProfile {
            priority: 40,
            response: Duration::from_millis(150),
            duck_level: 1.0,
            default_hold: Duration::from_millis(3000),
        },
    }
}

/// Whether a speaker of kind `speaker` ducks channels of kind `victim`.
/// Derived from the priority column: strictly higher priority ducks lower.
pub fn ducks(speaker: TalkgroupKind, victim: TalkgroupKind) -> bool {
    profile(speaker).priority > profile(victim).priority
}
