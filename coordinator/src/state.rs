//! The observable record external consumers watch. Mutated only by the
//! controller loop; everyone else holds a `watch::Receiver`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ducking::{Talkgroup, TalkgroupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkgroupStatus {
    pub joined: bool,
    pub muted: bool,
    pub volume: f32,
    pub is_active_speaker: bool,
    pub last_activity_ms: Option<u64>,
}

impl Default for TalkgroupStatus {
    fn default() -> Self {
        Self {
            joined: false,
            muted: false,
            volume: 1.0,
            is_active_speaker: false,
            last_activity_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorState {
    pub talkgroups: BTreeMap<TalkgroupId, TalkgroupStatus>,
    pub is_connected: bool,
    pub connection_status: ConnectionStatus,
    pub master_volume: f32,
    pub is_ducking_enabled: bool,
    pub is_emergency_active: bool,
    pub emergency_talkgroup: Option<TalkgroupId>,
    pub transmit_target: Option<TalkgroupId>,
    pub priority_order: Vec<TalkgroupId>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            talkgroups: BTreeMap::new(),
            is_connected: false,
            connection_status: ConnectionStatus::Disconnected,
            master_volume: 1.0,
            is_ducking_enabled: true,
            is_emergency_active: false,
            emergency_talkgroup: None,
            transmit_target: None,
            priority_order: Vec::new(),
        }
    }
}

/// Membership list sorted by (priority desc, identity asc) so the UI renders
/// the same order every time.
pub fn priority_order(talkgroups: &[Talkgroup]) -> Vec<TalkgroupId> {
    let mut ordered: Vec<&Talkgroup> = talkgroups.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    ordered.into_iter().map(|t| t.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lib_common_dmroxide::types::TalkgroupKind;

    use super::*;

    fn talkgroup(id: &str, priority: u32) -> Talkgroup {
        Talkgroup {
            id: id.to_string(),
            name: id.to_string(),
            kind: TalkgroupKind::Dynamic,
            priority,
            hold_time: Duration::ZERO,
            can_publish: true,
            can_subscribe: true,
        }
    }

    #[test]
    fn priority_order_is_deterministic() {
        let talkgroups = vec![
            talkgroup("rd", 50),
            talkgroup("emg", 100),
            talkgroup("alpha", 50),
            talkgroup("gen", 80),
        ];
        assert_eq!(priority_order(&talkgroups), vec!["emg", "gen", "alpha", "rd"]);
    }
}
