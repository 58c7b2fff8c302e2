//! scansort server entry point.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use dotenvy::dotenv;
use tracing::info;

use scansort::AppState;
use scansort::config::AppConfig;
use scansort::{server, telemetry};

#[tokio::main]
async fn main() {
    // Initialize tracing (M-LOG-STRUCTURED)
    telemetry::init();

    // Load .env (if present)
    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        name: "config.loaded",
        api_base = %config.api.base_url,
        model = %config.api.model,
        "Configuration loaded"
    );

    let autostart = config.intake.autostart;
    let state = AppState::from_config(config);

    if autostart {
        if let Err(err) = server::start_from_settings(&state).await {
            eprintln!("Autostart failed: {err}");
            std::process::exit(1);
        }
    }

    if let Err(err) = server::start_server(state).await {
        eprintln!("Server error: {err}");
        std::process::exit(1);
    }
}
