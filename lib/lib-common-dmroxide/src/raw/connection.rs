use core::fmt;

use derive_more::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    MissingServerUrl,
    MissingParticipantToken,
    NoRoomsGranted,
}
impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TalkgroupKindRaw {
    PriorityStatic,
    SecondaryStatic,
    Dynamic,
    Adhoc,
}

#[derive(Debug, Clone)]
pub struct RoomDescriptorRaw {
    pub room_name: String,
    pub talkgroup_id: String,
    pub talkgroup_name: String,
    pub kind: TalkgroupKindRaw,
    pub priority: u32,
    pub hold_time_seconds: f64,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionDetailsRaw {
    pub server_url: String,
    pub participant_token: String,
    pub participant_name: String,
    pub rooms: Vec<RoomDescriptorRaw>,
}
