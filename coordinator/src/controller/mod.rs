//! Multi-room session controller. One task owns the ducking engine, the
//! per-talkgroup sessions and the observable state; commands, session events
//! and hold-timer expirations are serialized through its select loop, so the
//! engine only ever runs on this task.

pub mod backoff;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use lib_common_dmroxide::derive_room_name;
use lib_common_dmroxide::types::{ConnectionDetails, TalkgroupKind};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use url::Url;

use crate::ducking::gain::clamp_volume;
use crate::ducking::{
    AudioClock, DuckingEngine, EngineConfig, HoldDirective, Talkgroup, TalkgroupId,
    UserTalkgroupSettings,
};
use crate::error::CoordinatorError;
use crate::prefs::PrefsStore;
use crate::session::{MediaSession, SessionEvent, SessionEventTx, SessionFactory, SessionState};
use crate::state::{ConnectionStatus, CoordinatorState, TalkgroupStatus, priority_order};

use backoff::Backoff;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const CONNECT_DELAY_CAP: Duration = Duration::from_secs(5);
const SESSION_TIMEOUT: Duration = Duration::from_secs(15);
const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Observable scalars of one gain stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainReading {
    pub current: f32,
    pub target: f32,
}

enum Command {
    Connect(Box<ConnectionDetails>, oneshot::Sender<Result<(), CoordinatorError>>),
    Disconnect(oneshot::Sender<()>),
    Join(TalkgroupId, oneshot::Sender<()>),
    Leave(TalkgroupId, oneshot::Sender<()>),
    SetVolume(TalkgroupId, f32, oneshot::Sender<()>),
    SetMuted(TalkgroupId, bool, oneshot::Sender<()>),
    ToggleMute(TalkgroupId, oneshot::Sender<bool>),
    SetMasterVolume(f32, oneshot::Sender<()>),
    SetDuckingEnabled(bool, oneshot::Sender<()>),
    SetTransmitTarget(Option<TalkgroupId>, oneshot::Sender<Result<(), CoordinatorError>>),
    EmergencyOverride(TalkgroupId, oneshot::Sender<Result<(), CoordinatorError>>),
    ClearEmergency(oneshot::Sender<()>),
    Gains(oneshot::Sender<HashMap<TalkgroupId, GainReading>>),
}

enum LoopEvent {
    Command(Option<Command>),
    Session(TalkgroupId, SessionEvent),
    HoldExpired(TalkgroupId),
    Cancelled,
}

pub struct SessionController<F: SessionFactory> {
    factory: F,
    engine: DuckingEngine,
    prefs: PrefsStore,
    cancel: CancellationToken,
    sessions: HashMap<TalkgroupId, F::Session>,
    session_states: HashMap<TalkgroupId, SessionState>,
    talkgroups: Vec<Talkgroup>,
    joined: HashSet<TalkgroupId>,
    transmit_target: Option<TalkgroupId>,
    last_activity: HashMap<TalkgroupId, u64>,
    holds: DelayQueue<TalkgroupId>,
    hold_keys: HashMap<TalkgroupId, Key>,
    status: ConnectionStatus,
    state_tx: watch::Sender<CoordinatorState>,
    events_tx: SessionEventTx,
}

/// Clonable front for the controller task. All methods are answered by the
/// loop in arrival order.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CoordinatorState>,
}

impl<F: SessionFactory> SessionController<F> {
    pub fn spawn(
        factory: F,
        config: EngineConfig,
        prefs: PrefsStore,
        clock: Arc<dyn AudioClock>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> CoordinatorHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let initial = CoordinatorState {
            master_volume: prefs.prefs.master_volume,
            is_ducking_enabled: prefs.prefs.is_ducking_enabled,
            ..CoordinatorState::default()
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let mut engine = DuckingEngine::new(config, clock);
        engine.set_master_volume(prefs.prefs.master_volume);
        engine.set_ducking_enabled(prefs.prefs.is_ducking_enabled);
        let controller = Self {
            factory,
            engine,
            prefs,
            cancel,
            sessions: HashMap::new(),
            session_states: HashMap::new(),
            talkgroups: Vec::new(),
            joined: HashSet::new(),
            transmit_target: None,
            last_activity: HashMap::new(),
            holds: DelayQueue::new(),
            hold_keys: HashMap::new(),
            status: ConnectionStatus::Disconnected,
            state_tx,
            events_tx,
        };
        tracker.spawn(controller.run(commands_rx, events_rx));
        CoordinatorHandle { commands: commands_tx, state: state_rx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<(TalkgroupId, SessionEvent)>,
    ) {
        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                command = commands.recv() => LoopEvent::Command(command),
                Some((talkgroup, event)) = events.recv() => LoopEvent::Session(talkgroup, event),
                Some(expired) = self.holds.next(), if !self.holds.is_empty() => {
                    LoopEvent::HoldExpired(expired.into_inner())
                }
            };
            match event {
                LoopEvent::Cancelled => {
                    self.disconnect();
                    self.publish_state();
                    break;
                }
                LoopEvent::Command(None) => {
                    // Every handle is gone; nobody can drive us any more.
                    self.disconnect();
                    self.publish_state();
                    break;
                }
                LoopEvent::Command(Some(command)) => self.handle_command(command).await,
                LoopEvent::Session(talkgroup, event) => self.handle_session_event(talkgroup, event),
                LoopEvent::HoldExpired(talkgroup) => {
                    self.hold_keys.remove(&talkgroup);
                    self.engine.on_hold_expired(&talkgroup);
                }
            }
            self.publish_state();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(details, reply) => {
                let cancel = self.cancel.clone();
                let result = tokio::select! {
                    result = self.connect(*details) => result,
                    _ = cancel.cancelled() => Err(CoordinatorError::Closed),
                };
                // The reply must observe the published state, so flush first.
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Join(talkgroup, reply) => {
                self.join(&talkgroup);
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Leave(talkgroup, reply) => {
                self.leave(&talkgroup);
                self.publish_state();
                let _ = reply.send(());
            }
            Command::SetVolume(talkgroup, volume, reply) => {
                self.engine.set_user_settings(&talkgroup, None, Some(volume));
                self.publish_state();
                let _ = reply.send(());
            }
            Command::SetMuted(talkgroup, muted, reply) => {
                self.engine.set_user_settings(&talkgroup, Some(muted), None);
                self.publish_state();
                let _ = reply.send(());
            }
            Command::ToggleMute(talkgroup, reply) => {
                let next = self.engine.user_settings(&talkgroup).map(|s| !s.muted);
                if let Some(next) = next {
                    self.engine.set_user_settings(&talkgroup, Some(next), None);
                }
                self.publish_state();
                let _ = reply.send(next.unwrap_or(false));
            }
            Command::SetMasterVolume(volume, reply) => {
                self.engine.set_master_volume(volume);
                self.prefs.prefs.master_volume = clamp_volume(volume);
                self.persist_prefs();
                self.publish_state();
                let _ = reply.send(());
            }
            Command::SetDuckingEnabled(enabled, reply) => {
                self.engine.set_ducking_enabled(enabled);
                self.prefs.prefs.is_ducking_enabled = enabled;
                self.persist_prefs();
                self.publish_state();
                let _ = reply.send(());
            }
            Command::SetTransmitTarget(target, reply) => {
                let result = self.set_transmit_target(target);
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::EmergencyOverride(talkgroup, reply) => {
                let result = self.engine.emergency_override(&talkgroup);
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::ClearEmergency(reply) => {
                self.engine.clear_emergency();
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Gains(reply) => {
                let readings = self
                    .engine
                    .gains()
                    .into_iter()
                    .map(|(id, (current, target))| (id, GainReading { current, target }))
                    .collect();
                let _ = reply.send(readings);
            }
        }
    }

    async fn connect(&mut self, details: ConnectionDetails) -> Result<(), CoordinatorError> {
        if self.engine.is_initialized() {
            tracing::warn!("connect requested while already connected, ignoring");
            return Ok(());
        }
        details.validate().map_err(CoordinatorError::Config)?;
        let url = Url::parse(&details.server_url)
            .map_err(|_| CoordinatorError::InvalidServerUrl { url: details.server_url.clone() })?;
        self.status = ConnectionStatus::Connecting;
        self.publish_state();

        let talkgroups: Vec<Talkgroup> = details.rooms.iter().map(Talkgroup::from_room).collect();
        let opens = details.rooms.iter().map(|room| {
            let derived = derive_room_name(&room.talkgroup_id, &room.talkgroup_name);
            if !room.room_name.is_empty() && room.room_name != derived {
                tracing::warn!(
                    provided = %room.room_name,
                    %derived,
                    "room name deviates from the deterministic identity, using derived"
                );
            }
            let events = self.events_tx.clone();
            let talkgroup = room.talkgroup_id.clone();
            let factory = &self.factory;
            let url = &url;
            let credential = details.participant_token.as_str();
            async move {
                let result =
                    connect_room(factory, url, credential, derived, talkgroup.clone(), events)
                        .await;
                (talkgroup, result)
            }
        });
        let results = futures::future::join_all(opens).await;

        let mut sessions: HashMap<TalkgroupId, F::Session> = HashMap::new();
        let mut failure: Option<TalkgroupId> = None;
        for (talkgroup, result) in results {
            match result {
                Ok(session) => {
                    sessions.insert(talkgroup, session);
                }
                Err(e) => {
                    tracing::error!(%talkgroup, "session connect exhausted retries: {e:#}");
                    failure.get_or_insert(talkgroup);
                }
            }
        }
        if let Some(talkgroup) = failure {
            for (_, session) in sessions {
                session.close();
            }
            self.status = ConnectionStatus::Disconnected;
            return Err(CoordinatorError::ConnectFailed { talkgroup, attempts: CONNECT_ATTEMPTS });
        }

        let defaults = UserTalkgroupSettings {
            muted: false,
            volume: self.prefs.prefs.default_volume,
        };
        if let Err(e) = self.engine.initialize(&talkgroups, defaults) {
            for (_, session) in sessions {
                session.close();
            }
            self.status = ConnectionStatus::Disconnected;
            return Err(e);
        }
        self.session_states = sessions
            .keys()
            .map(|id| (id.clone(), SessionState::Connected))
            .collect();
        self.sessions = sessions;
        self.joined = talkgroups
            .iter()
            .filter(|t| {
                let is_static = matches!(
                    t.kind,
                    TalkgroupKind::PriorityStatic | TalkgroupKind::SecondaryStatic
                );
                if is_static { self.prefs.prefs.auto_join_static } else { true }
            })
            .map(|t| t.id.clone())
            .collect();
        self.talkgroups = talkgroups;
        self.status = ConnectionStatus::Connected;
        tracing::info!(sessions = self.sessions.len(), "all talkgroup sessions connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.session_states.clear();
        self.engine.destroy();
        self.holds.clear();
        self.hold_keys.clear();
        self.joined.clear();
        self.talkgroups.clear();
        self.last_activity.clear();
        self.transmit_target = None;
        self.status = ConnectionStatus::Disconnected;
        self.persist_prefs();
        tracing::info!("disconnected, coordinator state cleared");
    }

    fn join(&mut self, talkgroup: &TalkgroupId) {
        if !self.talkgroups.iter().any(|t| &t.id == talkgroup) {
            tracing::warn!(%talkgroup, "join for unknown talkgroup ignored");
            return;
        }
        self.joined.insert(talkgroup.clone());
        // Never steal the microphone from an established transmit target.
        if self.transmit_target.as_ref().is_some_and(|t| t != talkgroup) {
            return;
        }
        if let Some(session) = self.sessions.get(talkgroup)
            && let Err(e) = session.enable_microphone(true)
        {
            let err = CoordinatorError::Device {
                talkgroup: talkgroup.clone(),
                reason: e.to_string(),
            };
            tracing::warn!("{err}, listening continues");
        }
    }

    fn leave(&mut self, talkgroup: &TalkgroupId) {
        if !self.talkgroups.iter().any(|t| &t.id == talkgroup) {
            tracing::warn!(%talkgroup, "leave for unknown talkgroup ignored");
            return;
        }
        self.joined.remove(talkgroup);
        if let Some(session) = self.sessions.get(talkgroup)
            && let Err(e) = session.enable_microphone(false)
        {
            tracing::warn!(%talkgroup, "microphone disable failed: {e}");
        }
        if self.transmit_target.as_ref() == Some(talkgroup) {
            self.transmit_target = None;
        }
        let directives = self.engine.release_speaker(talkgroup);
        self.apply_hold_directives(directives);
    }

    fn set_transmit_target(
        &mut self,
        target: Option<TalkgroupId>,
    ) -> Result<(), CoordinatorError> {
        let Some(target) = target else {
            for (talkgroup, session) in &self.sessions {
                if let Err(e) = session.enable_microphone(false) {
                    tracing::warn!(%talkgroup, "microphone disable failed: {e}");
                }
            }
            self.transmit_target = None;
            return Ok(());
        };
        let Some(talkgroup) = self.talkgroups.iter().find(|t| t.id == target) else {
            tracing::warn!(talkgroup = %target, "transmit target unknown, ignored");
            return Ok(());
        };
        if !self.joined.contains(&target) || !talkgroup.can_publish {
            return Err(CoordinatorError::NotJoined { talkgroup: target });
        }
        let kind = talkgroup.kind;
        // The old target's microphone drops before the new one rises.
        for (talkgroup, session) in &self.sessions {
            if *talkgroup != target
                && let Err(e) = session.enable_microphone(false)
            {
                tracing::warn!(%talkgroup, "microphone disable failed: {e}");
            }
        }
        if let Some(session) = self.sessions.get(&target)
            && let Err(e) = session.enable_microphone(true)
        {
            let err = CoordinatorError::Device {
                talkgroup: target.clone(),
                reason: e.to_string(),
            };
            tracing::warn!("{err}, listening continues");
        }
        self.transmit_target = Some(target.clone());
        if kind == TalkgroupKind::PriorityStatic
            && let Err(e) = self.engine.emergency_override(&target)
        {
            tracing::warn!(talkgroup = %target, "emergency override rejected: {e}");
        }
        Ok(())
    }

    fn handle_session_event(&mut self, talkgroup: TalkgroupId, event: SessionEvent) {
        match event {
            SessionEvent::ActiveSpeakersChanged { speakers } => {
                // One talkgroup, one voice: the whole set collapses into a
                // single start/stop stream keyed on the first participant.
                let speaking = !speakers.is_empty();
                let participant = speakers
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                let now = self.engine.now_secs();
                let directives =
                    self.engine.on_speaker_event(&talkgroup, participant, speaking, now);
                self.apply_hold_directives(directives);
                if speaking {
                    self.last_activity.insert(talkgroup, unix_millis());
                }
            }
            SessionEvent::StateChanged { state } => {
                if matches!(state, SessionState::Reconnecting | SessionState::Disconnected) {
                    let directives = self.engine.on_session_lost(&talkgroup);
                    self.apply_hold_directives(directives);
                }
                self.session_states.insert(talkgroup, state);
                self.refresh_status();
            }
            SessionEvent::TrackSubscribed { track } => {
                self.engine.attach_track(&talkgroup, track);
                self.last_activity.insert(talkgroup, unix_millis());
            }
        }
    }

    fn apply_hold_directives(&mut self, directives: Vec<HoldDirective>) {
        for directive in directives {
            match directive {
                HoldDirective::Arm { talkgroup, hold } => {
                    if let Some(key) = self.hold_keys.remove(&talkgroup) {
                        self.holds.remove(&key);
                    }
                    let key = self.holds.insert(talkgroup.clone(), hold);
                    self.hold_keys.insert(talkgroup, key);
                }
                HoldDirective::Disarm { talkgroup } => {
                    if let Some(key) = self.hold_keys.remove(&talkgroup) {
                        self.holds.remove(&key);
                    }
                }
            }
        }
    }

    fn refresh_status(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let degraded = self
            .session_states
            .values()
            .any(|s| matches!(s, SessionState::Reconnecting | SessionState::Disconnected));
        let connecting = self
            .session_states
            .values()
            .any(|s| *s == SessionState::Connecting);
        self.status = if degraded {
            ConnectionStatus::Reconnecting
        } else if connecting {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Connected
        };
    }

    fn persist_prefs(&self) {
        if let Err(e) = self.prefs.save() {
            tracing::warn!("failed to persist preferences: {e:#}");
        }
    }

    fn publish_state(&self) {
        let mut talkgroups = BTreeMap::new();
        for talkgroup in &self.talkgroups {
            let settings = self.engine.user_settings(&talkgroup.id).unwrap_or_default();
            talkgroups.insert(
                talkgroup.id.clone(),
                TalkgroupStatus {
                    joined: self.joined.contains(&talkgroup.id),
                    muted: settings.muted,
                    volume: settings.volume,
                    is_active_speaker: self.engine.active_speaker(&talkgroup.id).is_some(),
                    last_activity_ms: self.last_activity.get(&talkgroup.id).copied(),
                },
            );
        }
        let next = CoordinatorState {
            talkgroups,
            is_connected: !self.sessions.is_empty(),
            connection_status: self.status,
            master_volume: self.prefs.prefs.master_volume,
            is_ducking_enabled: self.prefs.prefs.is_ducking_enabled,
            is_emergency_active: self.engine.is_emergency_active(),
            emergency_talkgroup: self.engine.emergency_talkgroup().cloned(),
            transmit_target: self.transmit_target.clone(),
            priority_order: priority_order(&self.talkgroups),
        };
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

async fn connect_room<F: SessionFactory>(
    factory: &F,
    url: &Url,
    credential: &str,
    room_name: String,
    talkgroup: TalkgroupId,
    events: SessionEventTx,
) -> anyhow::Result<F::Session> {
    let mut backoff = Backoff::new(CONNECT_INITIAL_DELAY, CONNECT_DELAY_CAP);
    let attempts = async {
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match factory
                .open(url, credential, &room_name, &talkgroup, events.clone())
                .await
            {
                Ok(session) => {
                    if attempt > 1 {
                        tracing::info!(%talkgroup, attempt, "session connected after retry");
                    }
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(%talkgroup, attempt, "session open failed: {e}");
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no connect attempts were made")))
    };
    tokio::time::timeout(SESSION_TIMEOUT, attempts)
        .await
        .map_err(|_| anyhow::anyhow!("session open timed out after {SESSION_TIMEOUT:?}"))?
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl CoordinatorHandle {
    /// Live view of the coordinator state; await `changed()` on it to react.
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        reply_rx.await.map_err(|_| CoordinatorError::Closed)
    }

    pub async fn connect(&self, details: ConnectionDetails) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::Connect(Box::new(details), reply)).await?
    }

    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.call(Command::Disconnect).await
    }

    pub async fn join(&self, talkgroup: impl Into<TalkgroupId>) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::Join(talkgroup.into(), reply)).await
    }

    pub async fn leave(&self, talkgroup: impl Into<TalkgroupId>) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::Leave(talkgroup.into(), reply)).await
    }

    pub async fn set_volume(
        &self,
        talkgroup: impl Into<TalkgroupId>,
        volume: f32,
    ) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::SetVolume(talkgroup.into(), volume, reply)).await
    }

    pub async fn set_muted(
        &self,
        talkgroup: impl Into<TalkgroupId>,
        muted: bool,
    ) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::SetMuted(talkgroup.into(), muted, reply)).await
    }

    /// Returns the muted flag after the flip.
    pub async fn toggle_mute(
        &self,
        talkgroup: impl Into<TalkgroupId>,
    ) -> Result<bool, CoordinatorError> {
        self.call(|reply| Command::ToggleMute(talkgroup.into(), reply)).await
    }

    pub async fn set_master_volume(&self, volume: f32) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::SetMasterVolume(volume, reply)).await
    }

    pub async fn set_ducking_enabled(&self, enabled: bool) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::SetDuckingEnabled(enabled, reply)).await
    }

    pub async fn set_transmit_target(
        &self,
        target: Option<TalkgroupId>,
    ) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::SetTransmitTarget(target, reply)).await?
    }

    pub async fn emergency_override(
        &self,
        talkgroup: impl Into<TalkgroupId>,
    ) -> Result<(), CoordinatorError> {
        self.call(|reply| Command::EmergencyOverride(talkgroup.into(), reply)).await?
    }

    pub async fn clear_emergency(&self) -> Result<(), CoordinatorError> {
        self.call(Command::ClearEmergency).await
    }

    /// Current and scheduled gain per talkgroup, for meters and logs.
    pub async fn gains(&self) -> Result<HashMap<TalkgroupId, GainReading>, CoordinatorError> {
        self.call(Command::Gains).await
    }
}
