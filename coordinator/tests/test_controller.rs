//! Controller lifecycle against simulated sessions. Time is paused, so
//! backoff sleeps and hold timers elapse deterministically.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lib_common_dmroxide::types::{ConnectionDetails, RoomDescriptor, TalkgroupKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use talkgroup_coordinator::controller::{CoordinatorHandle, SessionController};
use talkgroup_coordinator::ducking::{EngineConfig, MonotonicClock};
use talkgroup_coordinator::error::CoordinatorError;
use talkgroup_coordinator::prefs::{Preferences, PrefsStore};
use talkgroup_coordinator::session::sim::{SimNetwork, SimSessionFactory};
use talkgroup_coordinator::session::{SessionEvent, SessionState};
use talkgroup_coordinator::state::{ConnectionStatus, CoordinatorState};

fn room(id: &str, name: &str, kind: TalkgroupKind, priority: u32, hold_secs: f64) -> RoomDescriptor {
    RoomDescriptor {
        room_name: String::new(),
        talkgroup_id: id.to_string(),
        talkgroup_name: name.to_string(),
        kind,
        priority,
        hold_time_seconds: hold_secs,
        can_publish: true,
        can_subscribe: true,
    }
}

fn details() -> ConnectionDetails {
    ConnectionDetails {
        server_url: "wss://media.example.net".to_string(),
        participant_token: "tok-multi-room".to_string(),
        participant_name: "unit-12".to_string(),
        rooms: vec![
            room("emg", "County Dispatch", TalkgroupKind::PriorityStatic, 100, 0.0),
            room("gen", "General Ops", TalkgroupKind::SecondaryStatic, 80, 2.0),
            room("rd", "Road Crew", TalkgroupKind::Dynamic, 50, 3.0),
        ],
    }
}

struct Rig {
    net: Arc<SimNetwork>,
    handle: CoordinatorHandle,
    cancel: CancellationToken,
    prefs_path: PathBuf,
    _tracker: TaskTracker,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.prefs_path);
    }
}

fn rig(test: &str) -> Rig {
    rig_with_prefs(test, |_| {})
}

fn rig_with_prefs(test: &str, customize: impl FnOnce(&mut Preferences)) -> Rig {
    let prefs_path = std::env::temp_dir().join(format!(
        "dmroxide-ctl-{test}-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&prefs_path);
    let mut prefs = PrefsStore::load(&prefs_path);
    customize(&mut prefs.prefs);
    let net = SimNetwork::new();
    let factory = SimSessionFactory::new(net.clone(), false);
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let handle = SessionController::spawn(
        factory,
        EngineConfig::default(),
        prefs,
        Arc::new(MonotonicClock::default()),
        cancel.clone(),
        &tracker,
    );
    Rig { net, handle, cancel, prefs_path, _tracker: tracker }
}

/// Await a state condition; paused time auto-advances through the timeout if
/// the condition never holds.
async fn wait_for_state(
    handle: &CoordinatorHandle,
    what: &str,
    predicate: impl Fn(&CoordinatorState) -> bool,
) {
    let mut state = handle.state();
    let waited = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if predicate(&state.borrow_and_update()) {
                return;
            }
            if state.changed().await.is_err() {
                panic!("coordinator dropped while waiting for {what}");
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn wait_for_gain_target(handle: &CoordinatorHandle, talkgroup: &str, expected: f32) {
    let waited = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let gains = handle.gains().await.expect("coordinator alive");
            if gains
                .get(talkgroup)
                .is_some_and(|g| (g.target - expected).abs() < 1e-4)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {talkgroup} target {expected}");
}

#[tokio::test(start_paused = true)]
async fn connect_publishes_priority_order_and_mic_follows_target() {
    let rig = rig("connect");
    rig.handle.connect(details()).await.unwrap();

    let state = rig.handle.current_state();
    assert!(state.is_connected);
    assert_eq!(state.connection_status, ConnectionStatus::Connected);
    assert_eq!(state.priority_order, vec!["emg", "gen", "rd"]);
    assert!(!state.is_emergency_active);
    assert!(state.talkgroups.values().all(|t| t.joined));

    rig.handle.set_transmit_target(Some("rd".to_string())).await.unwrap();
    assert!(rig.net.mic_enabled("rd"));
    assert!(!rig.net.mic_enabled("emg"));
    assert!(!rig.net.mic_enabled("gen"));
    assert_eq!(
        rig.handle.current_state().transmit_target.as_deref(),
        Some("rd")
    );
}

#[tokio::test(start_paused = true)]
async fn connect_retries_with_exponential_backoff() {
    let rig = rig("backoff");
    rig.net.fail_next_opens("gen", 2);

    let started = tokio::time::Instant::now();
    rig.handle.connect(details()).await.unwrap();
    let elapsed = started.elapsed();

    // Two refusals cost 1 s + 2 s of backoff before the third attempt lands.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(rig.net.is_open("gen"));
    assert!(rig.handle.current_state().is_connected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_tear_down_partial_sessions() {
    let rig = rig("teardown");
    rig.net.fail_next_opens("gen", 3);

    let err = rig.handle.connect(details()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ConnectFailed { .. }));

    let state = rig.handle.current_state();
    assert!(!state.is_connected);
    assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
    assert!(!rig.net.is_open("emg"));
    assert!(!rig.net.is_open("rd"));
}

#[tokio::test(start_paused = true)]
async fn statics_stay_unjoined_when_auto_join_is_off() {
    let rig = rig_with_prefs("autojoin", |prefs| prefs.auto_join_static = false);
    rig.handle.connect(details()).await.unwrap();

    let state = rig.handle.current_state();
    assert!(!state.talkgroups["emg"].joined);
    assert!(!state.talkgroups["gen"].joined);
    assert!(state.talkgroups["rd"].joined);

    // Unjoined statics cannot take the transmit target until joined.
    let err = rig
        .handle
        .set_transmit_target(Some("gen".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotJoined { .. }));

    rig.handle.join("gen").await.unwrap();
    assert!(rig.handle.current_state().talkgroups["gen"].joined);
    rig.handle.set_transmit_target(Some("gen".to_string())).await.unwrap();
    assert_eq!(
        rig.handle.current_state().transmit_target.as_deref(),
        Some("gen")
    );
}

#[tokio::test(start_paused = true)]
async fn transmit_target_requires_membership() {
    let rig = rig("notjoined");
    rig.handle.connect(details()).await.unwrap();

    rig.handle.leave("rd").await.unwrap();
    let err = rig
        .handle
        .set_transmit_target(Some("rd".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotJoined { .. }));
    assert_eq!(rig.handle.current_state().transmit_target, None);

    rig.handle.join("rd").await.unwrap();
    rig.handle.set_transmit_target(Some("rd".to_string())).await.unwrap();
    assert_eq!(
        rig.handle.current_state().transmit_target.as_deref(),
        Some("rd")
    );
}

#[tokio::test(start_paused = true)]
async fn old_mic_drops_before_the_new_one_rises() {
    let rig = rig("micswap");
    rig.handle.connect(details()).await.unwrap();

    rig.handle.set_transmit_target(Some("gen".to_string())).await.unwrap();
    rig.handle.set_transmit_target(Some("rd".to_string())).await.unwrap();

    let log = rig.net.mic_log();
    assert_eq!(
        log,
        vec![
            ("gen".to_string(), true),
            ("gen".to_string(), false),
            ("rd".to_string(), true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn emergency_transmit_target_engages_the_override() {
    let rig = rig("emgtarget");
    rig.handle.connect(details()).await.unwrap();

    rig.handle.set_transmit_target(Some("emg".to_string())).await.unwrap();
    let state = rig.handle.current_state();
    assert!(state.is_emergency_active);
    assert_eq!(state.emergency_talkgroup.as_deref(), Some("emg"));

    let gains = rig.handle.gains().await.unwrap();
    assert_eq!(gains["emg"].target, 1.0);
    assert!(gains["gen"].target <= 1e-4);
    assert!(gains["rd"].target <= 1e-4);

    rig.handle.clear_emergency().await.unwrap();
    assert!(!rig.handle.current_state().is_emergency_active);
    wait_for_gain_target(&rig.handle, "gen", 1.0).await;
}

#[tokio::test(start_paused = true)]
async fn session_loss_releases_stuck_ducking_after_hold() {
    let rig = rig("reconnect");
    rig.handle.connect(details()).await.unwrap();

    assert!(rig.net.speak("gen", Some("p1")).await);
    wait_for_state(&rig.handle, "gen speaking", |s| {
        s.talkgroups.get("gen").is_some_and(|t| t.is_active_speaker)
    })
    .await;
    wait_for_gain_target(&rig.handle, "rd", 0.1).await;

    // Transport drops underneath the active speaker.
    assert!(
        rig.net
            .emit("gen", SessionEvent::StateChanged { state: SessionState::Reconnecting })
            .await
    );
    wait_for_state(&rig.handle, "synthetic stop", |s| {
        s.connection_status == ConnectionStatus::Reconnecting
            && s.talkgroups.get("gen").is_some_and(|t| !t.is_active_speaker)
    })
    .await;

    // Ducking holds for gen's 2 s hold time, then releases.
    wait_for_gain_target(&rig.handle, "rd", 1.0).await;

    // Session comes back.
    assert!(
        rig.net
            .emit("gen", SessionEvent::StateChanged { state: SessionState::Connected })
            .await
    );
    wait_for_state(&rig.handle, "reconnected", |s| {
        s.connection_status == ConnectionStatus::Connected
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn join_and_toggle_mute_are_idempotent() {
    let rig = rig("idempotent");
    rig.handle.connect(details()).await.unwrap();

    rig.handle.join("rd").await.unwrap();
    let once = rig.handle.current_state();
    rig.handle.join("rd").await.unwrap();
    assert_eq!(rig.handle.current_state(), once);

    let muted = rig.handle.toggle_mute("rd").await.unwrap();
    assert!(muted);
    let muted = rig.handle.toggle_mute("rd").await.unwrap();
    assert!(!muted);
    assert_eq!(rig.handle.current_state(), once);
}

#[tokio::test(start_paused = true)]
async fn volume_reads_back_clamped() {
    let rig = rig("volume");
    rig.handle.connect(details()).await.unwrap();

    rig.handle.set_volume("rd", 0.4).await.unwrap();
    assert_eq!(rig.handle.current_state().talkgroups["rd"].volume, 0.4);

    rig.handle.set_volume("rd", 2.5).await.unwrap();
    assert_eq!(rig.handle.current_state().talkgroups["rd"].volume, 1.0);

    rig.handle.set_volume("rd", f32::NAN).await.unwrap();
    assert_eq!(rig.handle.current_state().talkgroups["rd"].volume, 0.0);
}

#[tokio::test(start_paused = true)]
async fn microphone_denial_is_not_fatal() {
    let rig = rig("micdenied");
    rig.handle.connect(details()).await.unwrap();

    rig.net.deny_microphone("rd", true);
    rig.handle.set_transmit_target(Some("rd".to_string())).await.unwrap();
    assert!(!rig.net.mic_enabled("rd"));
    // Still the transmit target; listening continues.
    assert_eq!(
        rig.handle.current_state().transmit_target.as_deref(),
        Some("rd")
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_talkgroup_operations_are_swallowed() {
    let rig = rig("unknown");
    rig.handle.connect(details()).await.unwrap();
    let before = rig.handle.current_state();
    let gains_before = rig.handle.gains().await.unwrap();

    assert!(rig.net.speak("ghost", Some("x")).await == false);
    rig.handle.set_volume("ghost", 0.2).await.unwrap();
    rig.handle.join("ghost").await.unwrap();
    rig.handle.set_transmit_target(Some("ghost".to_string())).await.unwrap();

    assert_eq!(rig.handle.current_state(), before);
    assert_eq!(rig.handle.gains().await.unwrap(), gains_before);
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_session_state_and_persists_prefs() {
    let rig = rig("disconnect");
    rig.handle.connect(details()).await.unwrap();
    rig.handle.set_master_volume(0.5).await.unwrap();

    rig.handle.disconnect().await.unwrap();
    let state = rig.handle.current_state();
    assert!(!state.is_connected);
    assert!(state.talkgroups.is_empty());
    assert_eq!(state.transmit_target, None);
    // Persisted subset survives.
    assert_eq!(state.master_volume, 0.5);
    assert!(!rig.net.is_open("emg"));

    let raw = std::fs::read_to_string(&rig.prefs_path).unwrap();
    let prefs: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(prefs["masterVolume"], serde_json::json!(0.5));
}
