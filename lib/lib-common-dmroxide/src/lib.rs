#![allow(unused)]

mod raw;
mod serde;

#[cfg(feature = "serde")]
pub mod types {
    pub use crate::serde::connection::ConnectionDetailsSerde as ConnectionDetails;
    pub use crate::serde::connection::ConnectionError;
    pub use crate::serde::connection::RoomDescriptorSerde as RoomDescriptor;
    pub use crate::serde::connection::TalkgroupKindSerde as TalkgroupKind;
}

#[cfg(not(feature = "serde"))]
pub mod types {
    pub use crate::raw::connection::ConnectionDetailsRaw as ConnectionDetails;
    pub use crate::raw::connection::ConnectionError;
    pub use crate::raw::connection::RoomDescriptorRaw as RoomDescriptor;
    pub use crate::raw::connection::TalkgroupKindRaw as TalkgroupKind;
}

/// Media-room identity for a talkgroup. Must be stable across every
/// participant that derives it, so the mapping is purely mechanical:
/// `talkgroup_<id>_<name>` with the name lowercased and every character
/// outside [a-z0-9] collapsed to '_'.
pub fn derive_room_name(talkgroup_id: &str, talkgroup_name: &str) -> String {
    let sanitized: String = talkgroup_name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("talkgroup_{talkgroup_id}_{sanitized}")
}
