//! DMR-style multi-talkgroup audio coordinator.
//!
//! One participant sits in several logical voice channels at once; this crate
//! decides, moment by moment, how loud each inbound channel plays (priority
//! ducking with hold timers and emergency preemption) and which single
//! channel the microphone publishes to.

pub mod app;
pub mod app_config;
pub mod common;
pub mod controller;
pub mod ducking;
pub mod error;
pub mod prefs;
pub mod priority;
pub mod session;
pub mod state;

pub use controller::{CoordinatorHandle, SessionController};
pub use ducking::{DuckingEngine, EngineConfig};
pub use error::CoordinatorError;
pub use state::CoordinatorState;
