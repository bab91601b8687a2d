//! The ducking engine proper: active speakers in, gain schedules out.
//!
//! Everything here is synchronous and bounded; hold timers live in the event
//! loop driving the engine, which arms and disarms them from the
//! [`HoldDirective`]s returned by speaker events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lib_common_dmroxide::types::TalkgroupKind;

use crate::error::CoordinatorError;
use crate::priority;

use super::gain::{AudioClock, GainController, clamp_volume};
use super::{
    ActiveSpeaker, EngineConfig, ParticipantId, RemoteTrack, Talkgroup, TalkgroupId,
    UserTalkgroupSettings,
};

/// Participant id synthesized for an imperative emergency override.
pub const OVERRIDE_PARTICIPANT: &str = "override";

/// Emergency channels never drop below this while unmuted.
pub const EMERGENCY_FLOOR: f32 = 0.8;

/// Ramp used when user settings change directly.
const SETTINGS_RAMP: Duration = Duration::from_millis(100);

/// Ramp used when the last speaker's hold expires and everything releases.
const RELEASE_RAMP: Duration = Duration::from_millis(200);

/// Per-talkgroup speech lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Speaking,
    Holding,
}

/// Timer bookkeeping for the event loop driving this engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldDirective {
    /// Schedule a deferred recomputation for the talkgroup. A zero hold means
    /// "next tick".
    Arm { talkgroup: TalkgroupId, hold: Duration },
    /// The pending hold is superseded and must not fire.
    Disarm { talkgroup: TalkgroupId },
}

#[derive(Debug)]
struct Channel {
    talkgroup: Talkgroup,
    settings: UserTalkgroupSettings,
    gain: GainController,
    phase: ChannelPhase,
    tracks: Vec<RemoteTrack>,
}

pub struct DuckingEngine {
    config: EngineConfig,
    clock: Arc<dyn AudioClock>,
    channels: HashMap<TalkgroupId, Channel>,
    active: HashMap<TalkgroupId, ActiveSpeaker>,
    override_target: Option<TalkgroupId>,
    master_volume: f32,
    ducking_enabled: bool,
    initialized: bool,
}

impl DuckingEngine {
    pub fn new(config: EngineConfig, clock: Arc<dyn AudioClock>) -> Self {
        let ducking_enabled = config.enabled;
        Self {
            config,
            clock,
            channels: HashMap::new(),
            active: HashMap::new(),
            override_target: None,
            master_volume: 1.0,
            ducking_enabled,
            initialized: false,
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.clock.now_secs()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocates one gain controller per talkgroup at the user's configured
    /// volume. Idempotent for the same set; a different set is refused.
    pub fn initialize(
        &mut self,
        talkgroups: &[Talkgroup],
        defaults: UserTalkgroupSettings,
    ) -> Result<(), CoordinatorError> {
        if self.initialized {
            let same = talkgroups.len() == self.channels.len()
                && talkgroups.iter().all(|t| self.channels.contains_key(&t.id));
            return if same { Ok(()) } else { Err(CoordinatorError::KindMismatch) };
        }
        let defaults = UserTalkgroupSettings {
            muted: defaults.muted,
            volume: clamp_volume(defaults.volume),
        };
        for talkgroup in talkgroups {
            let initial = if defaults.muted {
                0.0
            } else {
                defaults.volume * clamp_volume(self.master_volume)
            };
            self.channels.insert(
                talkgroup.id.clone(),
                Channel {
                    talkgroup: talkgroup.clone(),
                    settings: defaults,
                    gain: GainController::new(initial),
                    phase: ChannelPhase::Idle,
                    tracks: Vec::new(),
                },
            );
        }
        self.initialized = true;
        tracing::debug!(talkgroups = talkgroups.len(), "ducking engine initialized");
        Ok(())
    }

    /// Cancels everything and zeroes the gain schedules. The caller is
    /// responsible for disarming any timers it still has pending.
    pub fn destroy(&mut self) {
        let now = self.clock.now_secs();
        for channel in self.channels.values_mut() {
            channel.gain.schedule(0.0, Duration::ZERO, now);
        }
        self.channels.clear();
        self.active.clear();
        self.override_target = None;
        self.initialized = false;
    }

    /// Adds or removes the talkgroup's active speaker. Starts recompute
    /// immediately; stops defer recomputation behind the hold timer the
    /// returned directive arms.
    pub fn on_speaker_event(
        &mut self,
        talkgroup: &TalkgroupId,
        participant: ParticipantId,
        speaking: bool,
        timestamp_secs: f64,
    ) -> Vec<HoldDirective> {
        let Some(channel) = self.channels.get(talkgroup) else {
            tracing::warn!(%talkgroup, "speaker event for unknown talkgroup ignored");
            return Vec::new();
        };
        if self.override_target.as_ref() == Some(talkgroup) {
            // The synthesized override speaker pins this channel until the
            // override is cleared.
            return Vec::new();
        }
        let priority = channel.talkgroup.priority;
        let hold = channel.talkgroup.hold_time;

        if speaking {
            let was_holding = channel.phase == ChannelPhase::Holding;
            self.active.insert(
                talkgroup.clone(),
                ActiveSpeaker {
                    talkgroup: talkgroup.clone(),
                    participant,
                    started_secs: timestamp_secs,
                    priority,
                },
            );
            self.set_phase(talkgroup, ChannelPhase::Speaking);
            let dropped = self.enforce_speaker_cap();
            self.recompute();
            let mut directives = Vec::new();
            if was_holding {
                directives.push(HoldDirective::Disarm { talkgroup: talkgroup.clone() });
            }
            directives.extend(dropped);
            directives
        } else {
            if self.active.remove(talkgroup).is_none() {
                // Stop for a speaker we never saw; nothing to do.
                return Vec::new();
            }
            self.set_phase(talkgroup, ChannelPhase::Holding);
            vec![HoldDirective::Arm { talkgroup: talkgroup.clone(), hold }]
        }
    }

    /// The hold for a talkgroup elapsed: release it and recompute against the
    /// current speaker set.
    pub fn on_hold_expired(&mut self, talkgroup: &TalkgroupId) {
        let Some(channel) = self.channels.get(talkgroup) else {
            return;
        };
        if channel.phase != ChannelPhase::Holding {
            return;
        }
        self.set_phase(talkgroup, ChannelPhase::Idle);
        self.recompute();
    }

    /// Immediate removal from the speaker set (user left the talkgroup).
    /// Unlike a stop event this does not linger in hold.
    pub fn release_speaker(&mut self, talkgroup: &TalkgroupId) -> Vec<HoldDirective> {
        let Some(channel) = self.channels.get(talkgroup) else {
            return Vec::new();
        };
        let was_holding = channel.phase == ChannelPhase::Holding;
        let was_active = self.active.remove(talkgroup).is_some();
        self.set_phase(talkgroup, ChannelPhase::Idle);
        if was_active || was_holding {
            self.recompute();
        }
        if was_holding {
            vec![HoldDirective::Disarm { talkgroup: talkgroup.clone() }]
        } else {
            Vec::new()
        }
    }

    /// The transport under a talkgroup dropped: synthesize a stop for any
    /// speaker we believed active so ducking cannot wedge on a dead session.
    pub fn on_session_lost(&mut self, talkgroup: &TalkgroupId) -> Vec<HoldDirective> {
        if !self.active.contains_key(talkgroup) {
            return Vec::new();
        }
        let participant = self
            .active
            .get(talkgroup)
            .map(|s| s.participant.clone())
            .unwrap_or_default();
        let now = self.clock.now_secs();
        self.on_speaker_event(talkgroup, participant, false, now)
    }

    /// Updates listening preferences and reschedules that talkgroup's gain
    /// right away.
    pub fn set_user_settings(
        &mut self,
        talkgroup: &TalkgroupId,
        muted: Option<bool>,
        volume: Option<f32>,
    ) {
        {
            let Some(channel) = self.channels.get_mut(talkgroup) else {
                tracing::warn!(%talkgroup, "settings change for unknown talkgroup ignored");
                return;
            };
            if let Some(muted) = muted {
                channel.settings.muted = muted;
            }
            if let Some(volume) = volume {
                channel.settings.volume = clamp_volume(volume);
            }
        }
        let now = self.clock.now_secs();
        if let Some((target, _)) = self.plan_for(talkgroup)
            && let Some(channel) = self.channels.get_mut(talkgroup)
        {
            channel.gain.schedule(target, SETTINGS_RAMP, now);
        }
    }

    pub fn user_settings(&self, talkgroup: &TalkgroupId) -> Option<UserTalkgroupSettings> {
        self.channels.get(talkgroup).map(|c| c.settings)
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = clamp_volume(volume);
        if self.initialized {
            self.recompute();
        }
    }

    pub fn set_ducking_enabled(&mut self, enabled: bool) {
        self.ducking_enabled = enabled;
        if self.initialized {
            self.recompute();
        }
    }

    /// Imperative emergency preemption: everything else to silence now, the
    /// target to full volume now, mute notwithstanding. Held in place by a
    /// synthesized speaker until [`Self::clear_emergency`].
    pub fn emergency_override(&mut self, talkgroup: &TalkgroupId) -> Result<(), CoordinatorError> {
        let Some(channel) = self.channels.get(talkgroup) else {
            tracing::warn!(%talkgroup, "emergency override for unknown talkgroup ignored");
            return Ok(());
        };
        if channel.talkgroup.kind != TalkgroupKind::PriorityStatic {
            return Err(CoordinatorError::InvalidEmergencyTarget { talkgroup: talkgroup.clone() });
        }
        let priority = channel.talkgroup.priority;
        let now = self.clock.now_secs();
        for (id, channel) in self.channels.iter_mut() {
            let target = if id == talkgroup { 1.0 } else { 0.0 };
            channel.gain.schedule(target, Duration::ZERO, now);
        }
        self.active.insert(
            talkgroup.clone(),
            ActiveSpeaker {
                talkgroup: talkgroup.clone(),
                participant: OVERRIDE_PARTICIPANT.to_string(),
                started_secs: now,
                priority,
            },
        );
        self.set_phase(talkgroup, ChannelPhase::Speaking);
        self.override_target = Some(talkgroup.clone());
        tracing::warn!(%talkgroup, "emergency override engaged");
        Ok(())
    }

    pub fn clear_emergency(&mut self) {
        let Some(talkgroup) = self.override_target.take() else {
            return;
        };
        if self
            .active
            .get(&talkgroup)
            .is_some_and(|s| s.participant == OVERRIDE_PARTICIPANT)
        {
            self.active.remove(&talkgroup);
        }
        self.set_phase(&talkgroup, ChannelPhase::Idle);
        tracing::info!(%talkgroup, "emergency override cleared");
        self.recompute();
    }

    /// True iff some active speaker sits on a priority-static channel (the
    /// synthesized override speaker counts).
    pub fn is_emergency_active(&self) -> bool {
        self.active.keys().any(|id| {
            self.channels
                .get(id)
                .is_some_and(|c| c.talkgroup.kind == TalkgroupKind::PriorityStatic)
        })
    }

    pub fn emergency_talkgroup(&self) -> Option<&TalkgroupId> {
        self.override_target.as_ref().or_else(|| {
            self.active.keys().find(|id| {
                self.channels
                    .get(*id)
                    .is_some_and(|c| c.talkgroup.kind == TalkgroupKind::PriorityStatic)
            })
        })
    }

    pub fn active_speaker(&self, talkgroup: &TalkgroupId) -> Option<&ActiveSpeaker> {
        self.active.get(talkgroup)
    }

    pub fn phase(&self, talkgroup: &TalkgroupId) -> Option<ChannelPhase> {
        self.channels.get(talkgroup).map(|c| c.phase)
    }

    /// (current, target) of a talkgroup's gain stage, evaluated now.
    pub fn gain(&self, talkgroup: &TalkgroupId) -> Option<(f32, f32)> {
        let now = self.clock.now_secs();
        self.channels
            .get(talkgroup)
            .map(|c| (c.gain.value_at(now), c.gain.target()))
    }

    pub fn gains(&self) -> HashMap<TalkgroupId, (f32, f32)> {
        let now = self.clock.now_secs();
        self.channels
            .iter()
            .map(|(id, c)| (id.clone(), (c.gain.value_at(now), c.gain.target())))
            .collect()
    }

    pub fn attach_track(&mut self, talkgroup: &TalkgroupId, track: RemoteTrack) {
        let Some(channel) = self.channels.get_mut(talkgroup) else {
            tracing::warn!(%talkgroup, "track for unknown talkgroup ignored");
            return;
        };
        channel.tracks.retain(|t| t.participant != track.participant);
        tracing::debug!(%talkgroup, participant = %track.participant, "audio track routed to gain stage");
        channel.tracks.push(track);
    }

    /// Recomputes every gain schedule against the current speaker set.
    pub fn recompute(&mut self) {
        let now = self.clock.now_secs();
        let top = self.top_speaker();
        let master = self.master_volume;
        let ducking_enabled = self.ducking_enabled;
        let override_target = self.override_target.clone();
        let config = self.config.clone();
        for channel in self.channels.values_mut() {
            let (target, ramp) = plan_gain(
                channel,
                top.as_ref(),
                override_target.as_ref(),
                master,
                ducking_enabled,
                &config,
            );
            channel.gain.schedule(target, ramp, now);
        }
    }

    fn plan_for(&self, talkgroup: &TalkgroupId) -> Option<(f32, Duration)> {
        let channel = self.channels.get(talkgroup)?;
        Some(plan_gain(
            channel,
            self.top_speaker().as_ref(),
            self.override_target.as_ref(),
            self.master_volume,
            self.ducking_enabled,
            &self.config,
        ))
    }

    /// Highest-priority active speaker; earlier start, then identity, breaks
    /// ties deterministically.
    fn top_speaker(&self) -> Option<(TalkgroupId, TalkgroupKind)> {
        self.active
            .values()
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.started_secs.total_cmp(&b.started_secs))
                    .then(a.talkgroup.cmp(&b.talkgroup))
            })
            .and_then(|speaker| {
                self.channels
                    .get(&speaker.talkgroup)
                    .map(|c| (speaker.talkgroup.clone(), c.talkgroup.kind))
            })
    }

    /// Keeps the speaker set within the configured cap by dropping the
    /// lowest-priority extras.
    fn enforce_speaker_cap(&mut self) -> Vec<HoldDirective> {
        let cap = self.config.max_simultaneous_speakers;
        let mut directives = Vec::new();
        while cap > 0 && self.active.len() > cap {
            let Some(victim) = self
                .active
                .values()
                .max_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.started_secs.total_cmp(&b.started_secs))
                        .then(a.talkgroup.cmp(&b.talkgroup))
                })
                .map(|s| s.talkgroup.clone())
            else {
                break;
            };
            tracing::debug!(talkgroup = %victim, "speaker cap exceeded, dropping lowest priority");
            self.active.remove(&victim);
            let was_holding = self.phase(&victim) == Some(ChannelPhase::Holding);
            self.set_phase(&victim, ChannelPhase::Idle);
            if was_holding {
                directives.push(HoldDirective::Disarm { talkgroup: victim });
            }
        }
        directives
    }

    fn set_phase(&mut self, talkgroup: &TalkgroupId, phase: ChannelPhase) {
        if let Some(channel) = self.channels.get_mut(talkgroup) {
            channel.phase = phase;
        }
    }
}

/// The gain decision for one channel given the dominant speaker. Pure; the
/// clamp on user volume happened when the setting was stored.
fn plan_gain(
    channel: &Channel,
    top: Option<&(TalkgroupId, TalkgroupKind)>,
    override_target: Option<&TalkgroupId>,
    master: f32,
    ducking_enabled: bool,
    config: &EngineConfig,
) -> (f32, Duration) {
    let id = &channel.talkgroup.id;
    let kind = channel.talkgroup.kind;
    let effective = if channel.settings.muted {
        0.0
    } else {
        channel.settings.volume * clamp_volume(master)
    };

    // The override outranks everything, including the user's own mute.
    if override_target == Some(id) {
        return (1.0, Duration::ZERO);
    }

    let Some((top_id, top_kind)) = top else {
        // Nobody speaking: drift everyone back to their listening volume.
        let target = if !channel.settings.muted && kind == TalkgroupKind::PriorityStatic {
            effective.max(EMERGENCY_FLOOR)
        } else {
            effective
        };
        return (target, RELEASE_RAMP);
    };

    if channel.settings.muted {
        return (0.0, config.response_for(kind));
    }

    // Emergency speech silences every other channel outright.
    if *top_kind == TalkgroupKind::PriorityStatic && top_id != id {
        return (0.0, config.response_for(TalkgroupKind::PriorityStatic));
    }

    // Emergency channels are never ducked; keep them above the floor.
    if kind == TalkgroupKind::PriorityStatic {
        return (effective.max(EMERGENCY_FLOOR), config.response_for(kind));
    }

    // Having a speaker of its own does not protect a channel from a
    // higher-priority kind; victims move at the speaker kind's response time.
    if top_id != id && ducking_enabled && priority::ducks(*top_kind, kind) {
        let duck = priority::profile(*top_kind).duck_level;
        return (duck * effective, config.response_for(*top_kind));
    }

    (effective, config.response_for(kind))
}
