//! In-process session simulator. Stands in for a real media backend so the
//! full connect → speak → duck → hold → release cycle can be exercised from
//! the binary and from integration tests, with failure and denial injection.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ducking::{RemoteTrack, TalkgroupId};

use super::{MediaSession, SessionEvent, SessionEventTx, SessionFactory, SessionState};

#[derive(Default)]
struct SimNetworkInner {
    rooms: HashMap<TalkgroupId, SimRoom>,
    pending_failures: HashMap<TalkgroupId, u32>,
    denied_microphones: HashSet<TalkgroupId>,
    mic_log: Vec<(TalkgroupId, bool)>,
}

struct SimRoom {
    mic_enabled: bool,
    events: SessionEventTx,
    cancel: CancellationToken,
}

/// Shared backend the simulated sessions register against. Tests keep a
/// handle to inject events and observe microphone state.
#[derive(Default)]
pub struct SimNetwork {
    inner: Mutex<SimNetworkInner>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` opens for this talkgroup will be refused.
    pub fn fail_next_opens(&self, talkgroup: &str, count: u32) {
        self.inner
            .lock()
            .unwrap()
            .pending_failures
            .insert(talkgroup.to_string(), count);
    }

    /// Make microphone enablement fail for this talkgroup.
    pub fn deny_microphone(&self, talkgroup: &str, deny: bool) {
        let mut inner = self.inner.lock().unwrap();
        if deny {
            inner.denied_microphones.insert(talkgroup.to_string());
        } else {
            inner.denied_microphones.remove(talkgroup);
        }
    }

    pub fn mic_enabled(&self, talkgroup: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(talkgroup)
            .is_some_and(|r| r.mic_enabled)
    }

    /// Every microphone transition in arrival order, for ordering assertions.
    pub fn mic_log(&self) -> Vec<(TalkgroupId, bool)> {
        self.inner.lock().unwrap().mic_log.clone()
    }

    pub fn is_open(&self, talkgroup: &str) -> bool {
        self.inner.lock().unwrap().rooms.contains_key(talkgroup)
    }

    /// Push a session event into the coordinator, as the backend would.
    pub async fn emit(&self, talkgroup: &str, event: SessionEvent) -> bool {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.rooms.get(talkgroup).map(|r| r.events.clone())
        };
        match sender {
            Some(sender) => sender.send((talkgroup.to_string(), event)).await.is_ok(),
            None => false,
        }
    }

    /// Convenience: a burst with exactly one speaker, or silence.
    pub async fn speak(&self, talkgroup: &str, participant: Option<&str>) -> bool {
        let speakers: BTreeSet<String> = participant.map(str::to_string).into_iter().collect();
        self.emit(talkgroup, SessionEvent::ActiveSpeakersChanged { speakers })
            .await
    }

    fn take_failure(&self, talkgroup: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending_failures.get_mut(talkgroup) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn register(&self, talkgroup: TalkgroupId, events: SessionEventTx, cancel: CancellationToken) {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .insert(talkgroup, SimRoom { mic_enabled: false, events, cancel });
    }

    fn deregister(&self, talkgroup: &str) {
        if let Some(room) = self.inner.lock().unwrap().rooms.remove(talkgroup) {
            room.cancel.cancel();
        }
    }

    fn set_mic(&self, talkgroup: &str, enabled: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if enabled && inner.denied_microphones.contains(talkgroup) {
            anyhow::bail!("microphone capture denied for {talkgroup}");
        }
        let Some(room) = inner.rooms.get_mut(talkgroup) else {
            anyhow::bail!("no open session for {talkgroup}");
        };
        if room.mic_enabled != enabled {
            room.mic_enabled = enabled;
            inner.mic_log.push((talkgroup.to_string(), enabled));
        }
        Ok(())
    }
}

/// Factory handed to the coordinator. With `chatter` on, each opened session
/// emits randomized speaker bursts so ducking is observable without a real
/// backend.
pub struct SimSessionFactory {
    net: Arc<SimNetwork>,
    chatter: bool,
}

impl SimSessionFactory {
    pub fn new(net: Arc<SimNetwork>, chatter: bool) -> Self {
        Self { net, chatter }
    }
}

pub struct SimSession {
    talkgroup: TalkgroupId,
    net: Arc<SimNetwork>,
    cancel: CancellationToken,
}

impl SessionFactory for SimSessionFactory {
    type Session = SimSession;

    fn open(
        &self,
        _server_url: &Url,
        _credential: &str,
        room_name: &str,
        talkgroup: &TalkgroupId,
        events: SessionEventTx,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send {
        let net = Arc::clone(&self.net);
        let chatter = self.chatter;
        let room_name = room_name.to_string();
        let talkgroup = talkgroup.clone();
        async move {
            if net.take_failure(&talkgroup) {
                anyhow::bail!("simulated transport refusal for {room_name}");
            }
            let cancel = CancellationToken::new();
            net.register(talkgroup.clone(), events.clone(), cancel.clone());
            let _ = events
                .send((
                    talkgroup.clone(),
                    SessionEvent::StateChanged { state: SessionState::Connected },
                ))
                .await;
            if chatter {
                tokio::spawn(chatter_loop(talkgroup.clone(), events, cancel.clone()));
            }
            Ok(SimSession { talkgroup, net, cancel })
        }
    }
}

impl MediaSession for SimSession {
    fn enable_microphone(&self, enabled: bool) -> anyhow::Result<()> {
        self.net.set_mic(&self.talkgroup, enabled)
    }

    fn close(&self) {
        self.cancel.cancel();
        self.net.deregister(&self.talkgroup);
    }
}

async fn chatter_loop(talkgroup: TalkgroupId, events: SessionEventTx, cancel: CancellationToken) {
    let participant = format!("sim-{talkgroup}");
    let track = RemoteTrack {
        participant: participant.clone(),
        track_id: format!("track-{talkgroup}"),
    };
    let _ = events
        .send((talkgroup.clone(), SessionEvent::TrackSubscribed { track }))
        .await;
    loop {
        let lull = Duration::from_millis(rand::random_range(2_000..10_000));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(lull) => {}
        }
        let speakers: BTreeSet<String> = [participant.clone()].into();
        if events
            .send((talkgroup.clone(), SessionEvent::ActiveSpeakersChanged { speakers }))
            .await
            .is_err()
        {
            return;
        }
        let burst = Duration::from_millis(rand::random_range(800..4_000));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(burst) => {}
        }
        if events
            .send((
                talkgroup.clone(),
                SessionEvent::ActiveSpeakersChanged { speakers: BTreeSet::new() },
            ))
            .await
            .is_err()
        {
            return;
        }
    }
}
