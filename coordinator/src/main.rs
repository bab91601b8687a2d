//! Headless entrypoint for the multi-talkgroup coordinator.
use talkgroup_coordinator::app::App;
use talkgroup_coordinator::app_config::AppConfig;
use talkgroup_coordinator::common;

/// Sync entrypoint to the app with setup.
fn main() {
    let config = AppConfig::new().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    });
    common::logging::setup_tracing_subscriber(&config).unwrap_or_else(|e| {
        eprintln!("{e:#}");
        std::process::exit(1);
    });

    tracing::info!("Created app config.");
    tracing::info!("{:?}", config);

    let code = run(config);
    ::std::process::exit(code);
}

#[tokio::main]
async fn run(options: AppConfig) -> i32 {
    let app = App::new(options);
    match app.run().await {
        Ok(_) => {
            tracing::info!("App exited normally");
            0
        }
        Err(e) => {
            tracing::error!("App exited unexpectedly: {e:#}");
            1
        }
    }
}
