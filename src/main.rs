use std::sync::Arc;
use std::time::Duration;

use cloak_lib::app::{report_capture_error, Cloak};
use cloak_lib::settings::store::{JsonFileStore, PreferenceStore};

/// How often capture statistics are logged while sharing.
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let prefs_path = dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloak")
        .join("preferences.json");
    let store = Arc::new(JsonFileStore::new(prefs_path));
    store.start_debounce_task();

    let app = Cloak::new(
        cloak_lib::create_backends(),
        Arc::clone(&store) as Arc<dyn PreferenceStore>,
        tokio::runtime::Handle::current(),
        None,
    );

    if let Err(e) = app.session.start().await {
        report_capture_error(&e);
    }

    let mut diagnostics = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    diagnostics.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = diagnostics.tick() => {
                if app.session.state().is_capturing() {
                    tracing::info!("{}", app.bus.diagnostics().summary());
                }
            }
        }
    }

    app.shutdown().await;
    if let Err(e) = store.flush() {
        tracing::warn!("Failed to save preferences: {e}");
    }
}
