//! The media-session abstraction the controller consumes. The coordinator
//! never touches transport: a [`SessionFactory`] opens one session per
//! talkgroup room, and sessions push their events into the controller's queue
//! tagged with the owning talkgroup.

pub mod sim;

use std::collections::BTreeSet;
use std::future::Future;

use tokio::sync::mpsc;
use url::Url;

use crate::ducking::{ParticipantId, RemoteTrack, TalkgroupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Events a session reports upstream. Active speakers arrive as the whole
/// set so the controller can collapse a multi-speaker burst into the
/// one-voice-per-talkgroup stream the engine expects.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ActiveSpeakersChanged { speakers: BTreeSet<ParticipantId> },
    StateChanged { state: SessionState },
    TrackSubscribed { track: RemoteTrack },
}

pub type SessionEventTx = mpsc::Sender<(TalkgroupId, SessionEvent)>;

/// A live per-talkgroup media session.
pub trait MediaSession: Send + 'static {
    /// Start or stop publishing the local microphone into this room.
    fn enable_microphone(&self, enabled: bool) -> anyhow::Result<()>;
    fn close(&self);
}

/// Opens sessions against whatever media backend is plugged in. The
/// credential is the single multi-room grant from the connection details.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: MediaSession;

    fn open(
        &self,
        server_url: &Url,
        credential: &str,
        room_name: &str,
        talkgroup: &TalkgroupId,
        events: SessionEventTx,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}
