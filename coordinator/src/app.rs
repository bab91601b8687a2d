use std::sync::Arc;

use anyhow::{Context, Result};
use lib_common_dmroxide::types::ConnectionDetails;
use tokio::signal::{self};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app_config::{AppConfig, Environment};
use crate::controller::{CoordinatorHandle, SessionController};
use crate::ducking::MonotonicClock;
use crate::prefs::PrefsStore;
use crate::session::sim::{SimNetwork, SimSessionFactory};

pub struct App {
    ///Readonly config
    pub config: AppConfig,
    /// Token notifying of app shutdown
    pub cancellation_token: CancellationToken,
    /// Task tracker. Instead of using tokio::spawn use tracker.spawn
    task_tracker: TaskTracker,
}

impl App {
    pub fn new(config: AppConfig) -> &'static mut Self {
        let cancellation_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let app = Box::new(Self {
            config,
            cancellation_token,
            task_tracker,
        });
        Box::leak(app)
    }

    pub async fn run(&'static mut self) -> anyhow::Result<()> {
        let details = self.load_connection_details().await?;
        let prefs = PrefsStore::load(&self.config.prefs_path);
        // Simulated sessions stand in for the media backend; development
        // builds add randomized speaker chatter so ducking is visible.
        let chatter = self.config.environment == Environment::Development;
        let factory = SimSessionFactory::new(SimNetwork::new(), chatter);
        let handle = SessionController::spawn(
            factory,
            self.config.engine_config(),
            prefs,
            Arc::new(MonotonicClock::default()),
            self.cancellation_token.clone(),
            &self.task_tracker,
        );
        self.spawn_state_logger(handle.clone());
        handle.connect(details).await?;
        self.handle_signal().await;
        let _ = handle.disconnect().await;
        self.task_tracker.close();
        self.task_tracker.wait().await;
        Ok(())
    }

    async fn load_connection_details(&self) -> Result<ConnectionDetails> {
        let raw = tokio::fs::read_to_string(&self.config.connection_path)
            .await
            .with_context(|| {
                format!("failed to read connection details {:?}", self.config.connection_path)
            })?;
        serde_json::from_str(&raw).context("connection details are not valid JSON")
    }

    fn spawn_state_logger(&'static self, handle: CoordinatorHandle) {
        let cancel = self.cancellation_token.clone();
        self.task_tracker.spawn(async move {
            let mut state = handle.state();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = state.borrow_and_update().clone();
                        tracing::info!(
                            status = ?snapshot.connection_status,
                            emergency = snapshot.is_emergency_active,
                            transmit = ?snapshot.transmit_target,
                            speakers = snapshot
                                .talkgroups
                                .values()
                                .filter(|t| t.is_active_speaker)
                                .count(),
                            "coordinator state changed"
                        );
                    }
                }
            }
        });
    }

    async fn handle_signal(&'static self) {
        match signal::ctrl_c().await {
            Ok(_) => {
                tracing::info!("Interrupt detected!");
                self.cancellation_token.cancel();
                tracing::info!("Sent exit signal. Waiting for jobs to finish...");
            }
            Err(e) => {
                tracing::error!("Cannot listen for interrupt, app closing: {e}");
            }
        }
    }
}
