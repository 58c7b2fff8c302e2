//! scansort
//!
//! Watches a drop folder for scanned documents, reads the vendor name,
//! document id and document date off each one through a vision-capable
//! model API, and renames the file into an output folder. A small loopback
//! HTTP surface drives configure/start/stop/status for the operator's
//! control panel.
//!
//! # Architecture
//!
//! - **Intake**: folder watcher + per-file dispatcher (the pipeline core)
//! - **Vision**: provider seam over the external model API
//! - **Control surface**: Axum-based loopback HTTP API
//!
//! # Modules
//!
//! - [`intake`]: watcher, dispatcher, cache, parser, naming, conversion
//! - [`server`]: the control-panel boundary
//! - [`state`]: shared run context (flag, queue, processed list, cost ledger)

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod intake;
pub mod server;
pub mod state;
pub mod telemetry;

use std::sync::{Arc, Mutex};

use crate::config::AppConfig;
use crate::intake::Processor;
use crate::server::ControlSettings;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective app configuration (defaults for anything not staged).
    pub config: Arc<AppConfig>,
    /// Operator-staged intake settings, applied at the next start.
    pub settings: Arc<Mutex<ControlSettings>>,
    /// The live processor, if any.
    pub processor: Arc<tokio::sync::Mutex<Option<Arc<Processor>>>>,
}

impl AppState {
    /// Seed control-surface state from the loaded configuration.
    pub fn from_config(config: AppConfig) -> Self {
        let settings = ControlSettings {
            watch_folder: config.intake.watch_dir.clone(),
            output_folder: config.intake.output_dir.clone(),
            api_key: None,
            blocked_terms: config.intake.blocked_terms.clone(),
        };
        Self {
            config: Arc::new(config),
            settings: Arc::new(Mutex::new(settings)),
            processor: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }
}
