use derive_more::{Display, Error};

/// Failures surfaced by the coordinator. Anything not listed here is either
/// swallowed after a WARN log (operations on unknown talkgroups, microphone
/// denials) or wrapped in `anyhow` at the application boundary.
#[derive(Debug, Display, Error)]
pub enum CoordinatorError {
    #[display("connection details rejected: {_0}")]
    Config(lib_common_dmroxide::types::ConnectionError),

    #[display("server url {url:?} is not a valid URL")]
    InvalidServerUrl { url: String },

    #[display("session for talkgroup {talkgroup} failed after {attempts} attempts")]
    ConnectFailed { talkgroup: String, attempts: u32 },

    #[display("talkgroup {talkgroup} is not joined or cannot publish")]
    NotJoined { talkgroup: String },

    #[display("talkgroup {talkgroup} is not a priority-static channel")]
    InvalidEmergencyTarget { talkgroup: String },

    #[display("engine already initialized with a different talkgroup set")]
    KindMismatch,

    #[display("microphone unavailable on {talkgroup}: {reason}")]
    Device { talkgroup: String, reason: String },

    #[display("coordinator is shut down")]
    Closed,
}
