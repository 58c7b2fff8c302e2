//! Document intake: watching, analysis, renaming.
//!
//! The pipeline is wired per run: an immutable [`WatchConfig`] plus a fresh
//! shared [`RunContext`](crate::state::RunContext) produce one [`Processor`].
//! Changing the configuration means building a new processor; a stopped one
//! is never restarted.

pub mod cache;
pub mod convert;
pub mod dispatcher;
pub mod naming;
pub mod parser;
pub mod vision;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::state::{RunContext, StatusSnapshot};

use self::cache::ResultCache;
use self::dispatcher::FileDispatcher;
use self::vision::{DocumentAnalyzer, VisionClient};
use self::watcher::{FolderWatcher, WatchError};

/// Extensions the pipeline accepts: raster scans plus PDF, which is routed
/// through the external converter before analysis.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "pdf"];

/// Reserved output-folder prefix marking unprocessable input.
pub const FAILED_PREFIX: &str = "FAILED_";

/// Name of the persisted cache document inside the output folder.
pub const CACHE_FILE_NAME: &str = "analysis_cache.json";

pub fn supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Immutable per-run configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Lowercased substrings; a filename containing any of them is skipped.
    pub blocked_terms: Vec<String>,
    pub api_base_url: String,
    pub api_key: String,
    pub model: String,
    pub cache_path: PathBuf,
}

impl WatchConfig {
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        blocked_terms: impl IntoIterator<Item = String>,
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let output_dir = output_dir.into();
        let cache_path = output_dir.join(CACHE_FILE_NAME);
        Self {
            watch_dir: watch_dir.into(),
            output_dir,
            blocked_terms: blocked_terms
                .into_iter()
                .map(|term| term.trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
            api_base_url: api_base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            cache_path,
        }
    }
}

/// One intake run: shared context, dispatcher and watcher, wired together.
pub struct Processor {
    ctx: Arc<RunContext>,
    watcher: Arc<FolderWatcher>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor").finish()
    }
}

impl Processor {
    /// Build a processor backed by the real vision client.
    pub fn new(config: WatchConfig) -> Self {
        let ctx = Arc::new(RunContext::new());
        let analyzer: Arc<dyn DocumentAnalyzer> = Arc::new(VisionClient::new(
            config.api_base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            Arc::clone(&ctx),
        ));
        Self::assemble(config, ctx, analyzer)
    }

    /// Build a processor around a custom analysis backend.
    pub fn with_analyzer(config: WatchConfig, analyzer: Arc<dyn DocumentAnalyzer>) -> Self {
        Self::assemble(config, Arc::new(RunContext::new()), analyzer)
    }

    fn assemble(
        config: WatchConfig,
        ctx: Arc<RunContext>,
        analyzer: Arc<dyn DocumentAnalyzer>,
    ) -> Self {
        let config = Arc::new(config);
        let cache = ResultCache::load(&config.cache_path);
        let dispatcher = Arc::new(FileDispatcher::new(
            Arc::clone(&config),
            Arc::clone(&ctx),
            cache,
            analyzer,
        ));
        let watcher = Arc::new(FolderWatcher::new(config, Arc::clone(&ctx), dispatcher));
        Self { ctx, watcher }
    }

    pub fn start(&self) -> Result<(), WatchError> {
        self.watcher.start()
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
    }

    /// Thread-safe view for the control-panel boundary.
    pub fn status(&self) -> StatusSnapshot {
        self.ctx.snapshot()
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }
}
