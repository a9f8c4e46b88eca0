use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use eldercare::{run_server, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        tracing::warn!("missing credentials: {}", missing.join(", "));
    }

    let poll_secs = config.reminder_poll_secs;
    let state = AppState::from_config(config)?;

    if poll_secs > 0 {
        tokio::spawn(
            state
                .reminders
                .clone()
                .poll_forever(Duration::from_secs(poll_secs)),
        );
        tracing::info!(every_secs = poll_secs, "reminder polling enabled");
    }

    run_server(state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
