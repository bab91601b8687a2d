use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Error, Display)]
#[serde(rename_all = "PascalCase")]
pub enum ConnectionError {
    MissingServerUrl,
    MissingParticipantToken,
    NoRoomsGranted,
}

/// The four DMR channel classes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TalkgroupKindSerde {
    PriorityStatic,
    SecondaryStatic,
    Dynamic,
    Adhoc,
}

/// One room grant inside the connection details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescriptorSerde {
    pub room_name: String,
    pub talkgroup_id: String,
    pub talkgroup_name: String,
    #[serde(rename = "type")]
    pub kind: TalkgroupKindSerde,
    pub priority: u32,
    pub hold_time_seconds: f64,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

/// Connection details handed to the coordinator by the provisioning side.
/// One opaque credential carries the grants for every room in `rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetailsSerde {
    pub server_url: String,
    pub participant_token: String,
    pub participant_name: String,
    pub rooms: Vec<RoomDescriptorSerde>,
}

impl ConnectionDetailsSerde {
    /// Structural validation only; URL syntax is the consumer's concern.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.server_url.trim().is_empty() {
            return Err(ConnectionError::MissingServerUrl);
        }
        if self.participant_token.trim().is_empty() {
            return Err(ConnectionError::MissingParticipantToken);
        }
        if self.rooms.is_empty() {
            return Err(ConnectionError::NoRoomsGranted);
        }
        Ok(())
    }
}
