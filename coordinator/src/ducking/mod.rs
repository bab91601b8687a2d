//! Priority-based audio ducking: one gain stage per talkgroup, driven by
//! speaker events, user settings and the emergency override.

pub mod engine;
pub mod gain;

use std::time::Duration;

use lib_common_dmroxide::types::{RoomDescriptor, TalkgroupKind};

pub use engine::{ChannelPhase, DuckingEngine, HoldDirective};
pub use gain::{AudioClock, GainController, ManualClock, MonotonicClock};

use crate::priority;

pub type TalkgroupId = String;
pub type ParticipantId = String;

/// A logical voice channel. Immutable once admitted at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct Talkgroup {
    pub id: TalkgroupId,
    pub name: String,
    pub kind: TalkgroupKind,
    pub priority: u32,
    pub hold_time: Duration,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

impl Talkgroup {
    /// Admits a wire-format room grant, falling back to the kind's defaults
    /// where the descriptor leaves fields at zero.
    pub fn from_room(room: &RoomDescriptor) -> Self {
        let profile = priority::profile(room.kind);
        let hold_time = if room.hold_time_seconds >= 0.0 {
            Duration::from_secs_f64(room.hold_time_seconds)
        } else {
            profile.default_hold
        };
        Self {
            id: room.talkgroup_id.clone(),
            name: room.talkgroup_name.clone(),
            kind: room.kind,
            priority: if room.priority > 0 { room.priority } else { profile.priority },
            hold_time,
            can_publish: room.can_publish,
            can_subscribe: room.can_subscribe,
        }
    }
}

/// Mutable per-talkgroup listening preferences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserTalkgroupSettings {
    pub muted: bool,
    pub volume: f32,
}

impl Default for UserTalkgroupSettings {
    fn default() -> Self {
        Self { muted: false, volume: 1.0 }
    }
}

/// One talkgroup carries at most one of these at a time; the session layer
/// collapses multi-speaker bursts before they reach the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSpeaker {
    pub talkgroup: TalkgroupId,
    pub participant: ParticipantId,
    pub started_secs: f64,
    pub priority: u32,
}

/// Inbound audio attached to a talkgroup's gain stage. Opaque to the engine;
/// the session layer owns the actual media plumbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub participant: ParticipantId,
    pub track_id: String,
}

/// Engine tunables. Defaults reproduce the DMR response profile.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub enabled: bool,
    pub emergency_response: Duration,
    pub secondary_response: Duration,
    pub dynamic_response: Duration,
    pub default_hold: Duration,
    pub max_simultaneous_speakers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emergency_response: Duration::from_millis(50),
            secondary_response: Duration::from_millis(100),
            dynamic_response: Duration::from_millis(150),
            default_hold: Duration::from_millis(3000),
            max_simultaneous_speakers: 3,
        }
    }
}

impl EngineConfig {
    pub fn response_for(&self, kind: TalkgroupKind) -> Duration {
        match kind {
            TalkgroupKind::PriorityStatic => self.emergency_response,
            TalkgroupKind::SecondaryStatic => self.secondary_response,
            TalkgroupKind::Dynamic | TalkgroupKind::Adhoc => self.dynamic_response,
        }
    }
}
