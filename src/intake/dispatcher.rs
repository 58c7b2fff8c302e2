//! Per-file intake pipeline.
//!
//! Every discovered path runs through the same gates regardless of which
//! discovery mechanism found it: existence/readability, quarantine-prefix,
//! blocklist, then cache-or-analyze, validation, and relocation. Dispatch is
//! idempotent per file-existence: once a file has been consumed, a second
//! discovery finds nothing and abandons silently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::state::{ProcessedOutcome, ProcessedRecord, RunContext};

use super::cache::{ResultCache, content_hash};
use super::convert::{self, ConvertError};
use super::naming;
use super::parser::{self, DocumentFields, Extraction};
use super::vision::DocumentAnalyzer;
use super::{FAILED_PREFIX, WatchConfig};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("extraction produced an empty {0} field")]
    MissingField(&'static str),
}

/// What happened to a dispatched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Analyzed and relocated under its generated name.
    Relocated(PathBuf),
    /// Not processed; the file was left untouched (or had vanished).
    Skipped(SkipReason),
    /// Processing failed; a `FAILED_` copy was attempted.
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Vanished,
    QuarantineArtifact,
    Blocklisted,
    UnsupportedExtension,
}

struct Relocation {
    destination: PathBuf,
    extraction: Extraction,
}

#[derive(Debug)]
pub struct FileDispatcher {
    config: Arc<WatchConfig>,
    ctx: Arc<RunContext>,
    cache: ResultCache,
    analyzer: Arc<dyn DocumentAnalyzer>,
}

impl FileDispatcher {
    pub fn new(
        config: Arc<WatchConfig>,
        ctx: Arc<RunContext>,
        cache: ResultCache,
        analyzer: Arc<dyn DocumentAnalyzer>,
    ) -> Self {
        Self {
            config,
            ctx,
            cache,
            analyzer,
        }
    }

    /// Run one file through the pipeline. Safe to call repeatedly for the
    /// same path.
    pub async fn dispatch(&self, path: &Path) -> DispatchOutcome {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            return DispatchOutcome::Skipped(SkipReason::Vanished);
        };

        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                debug!(path = %path.display(), "file vanished before dispatch");
                return DispatchOutcome::Skipped(SkipReason::Vanished);
            }
        }

        if !super::supported_extension(path) {
            return DispatchOutcome::Skipped(SkipReason::UnsupportedExtension);
        }

        if name.starts_with(FAILED_PREFIX) {
            debug!(file = %name, "ignoring quarantine artifact");
            return DispatchOutcome::Skipped(SkipReason::QuarantineArtifact);
        }

        if let Some(term) = self.blocked_term(&name) {
            info!(file = %name, term = %term, "skipping blocklisted file");
            return DispatchOutcome::Skipped(SkipReason::Blocklisted);
        }

        self.ctx.enqueue(&name);
        self.ctx.set_status(format!("analyzing {name}"));

        let outcome = match self.process(path, &name).await {
            Ok(relocation) => {
                info!(
                    file = %name,
                    destination = %relocation.destination.display(),
                    company = %relocation.extraction.fields().company_name,
                    degraded = relocation.extraction.is_degraded(),
                    "file relocated"
                );
                self.ctx.record_processed(ProcessedRecord {
                    original: name.clone(),
                    destination: relocation
                        .destination
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string()),
                    outcome: ProcessedOutcome::Renamed,
                    degraded: relocation.extraction.is_degraded(),
                    completed_at: Local::now().to_rfc3339(),
                });
                DispatchOutcome::Relocated(relocation.destination)
            }
            Err(DispatchError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                // Same silent abandonment as the front gate: the watcher will
                // not re-offer a vanished file.
                debug!(file = %name, "file vanished during processing");
                DispatchOutcome::Skipped(SkipReason::Vanished)
            }
            Err(err) => {
                error!(file = %name, error = %err, "processing failed, quarantining");
                self.quarantine(path, &name).await;
                self.ctx.record_processed(ProcessedRecord {
                    original: name.clone(),
                    destination: None,
                    outcome: ProcessedOutcome::Quarantined,
                    degraded: false,
                    completed_at: Local::now().to_rfc3339(),
                });
                DispatchOutcome::Quarantined
            }
        };

        self.ctx.dequeue(&name);
        self.ctx
            .set_status(if self.ctx.is_running() { "watching" } else { "idle" });
        outcome
    }

    fn blocked_term(&self, name: &str) -> Option<&str> {
        let lowered = name.to_lowercase();
        self.config
            .blocked_terms
            .iter()
            .find(|term| lowered.contains(term.as_str()))
            .map(String::as_str)
    }

    async fn process(&self, path: &Path, name: &str) -> Result<Relocation, DispatchError> {
        let bytes = tokio::fs::read(path).await?;
        let hash = content_hash(&bytes);

        let extraction = match self.cache.lookup(&hash) {
            Some(fields) => {
                debug!(file = %name, "cache hit, skipping analysis");
                Extraction::Parsed(fields)
            }
            None => {
                let extraction = self.analyze(path, &bytes).await?;
                validate(extraction.fields())?;
                // Only real extractions are worth remembering; sentinel
                // results would pin "Unknown" onto these bytes forever.
                if let Extraction::Parsed(fields) = &extraction {
                    self.cache.store(hash, fields.clone());
                }
                extraction
            }
        };

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let generated = naming::destination_name(extraction.fields(), &extension);

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let destination = available_destination(&self.config.output_dir, &generated);

        // Copy-then-delete survives cross-device moves.
        tokio::fs::copy(path, &destination).await?;
        tokio::fs::remove_file(path).await?;

        Ok(Relocation {
            destination,
            extraction,
        })
    }

    async fn analyze(&self, path: &Path, bytes: &[u8]) -> Result<Extraction, DispatchError> {
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        let response = if is_pdf {
            let image_path = convert::pdf_to_image(path).await?;
            let image_bytes = tokio::fs::read(&image_path).await?;
            // Drop the rendered sibling so discovery never sees it.
            let _ = tokio::fs::remove_file(&image_path).await;
            self.analyzer.analyze(&image_bytes, "image/png").await
        } else {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            self.analyzer.analyze(bytes, &mime).await
        };

        Ok(parser::parse_reply(response.text.as_deref()))
    }

    /// Copy the original into the output folder under the `FAILED_` prefix.
    ///
    /// A successful quarantine consumes the original so later poll cycles do
    /// not reprocess it; if the copy fails the original stays for a retry.
    async fn quarantine(&self, path: &Path, name: &str) {
        let target = self.config.output_dir.join(format!("{FAILED_PREFIX}{name}"));
        if let Err(err) = tokio::fs::create_dir_all(&self.config.output_dir).await {
            warn!(error = %err, "could not create output folder for quarantine");
            return;
        }
        match tokio::fs::copy(path, &target).await {
            Ok(_) => {
                info!(file = %name, target = %target.display(), "file quarantined");
                if let Err(err) = tokio::fs::remove_file(path).await {
                    warn!(file = %name, error = %err, "quarantined original could not be removed");
                }
            }
            Err(err) => {
                warn!(file = %name, error = %err, "quarantine copy failed; original left in place");
            }
        }
    }
}

/// All three fields must be present and non-empty after parsing.
fn validate(fields: &DocumentFields) -> Result<(), DispatchError> {
    if fields.company_name.trim().is_empty() {
        return Err(DispatchError::MissingField("company_name"));
    }
    if fields.document_id.trim().is_empty() {
        return Err(DispatchError::MissingField("invoice_number"));
    }
    if fields.document_date.trim().is_empty() {
        return Err(DispatchError::MissingField("invoice_date"));
    }
    Ok(())
}

/// First non-existing destination: the generated name, then `_2`, `_3`, …
/// (never a silent overwrite).
fn available_destination(dir: &Path, generated: &str) -> PathBuf {
    let candidate = dir.join(generated);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, extension) = match generated.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (generated, String::new()),
    };
    let mut counter = 2u32;
    loop {
        let alternate = dir.join(format!("{stem}_{counter}{extension}"));
        if !alternate.exists() {
            return alternate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::vision::RawModelResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const GOOD_REPLY: &str = "Here is the data you asked for: \
{\"company_name\":\"Acme, Inc.\",\"invoice_number\":\"INV-42\",\"invoice_date\":\"04/09/2025\"}";

    #[derive(Debug)]
    struct FakeAnalyzer {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeAnalyzer {
        fn returning(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentAnalyzer for FakeAnalyzer {
        async fn analyze(&self, _image_bytes: &[u8], _mime_type: &str) -> RawModelResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RawModelResponse {
                text: self.reply.clone(),
                usage: None,
            }
        }
    }

    struct Fixture {
        watch: TempDir,
        output: TempDir,
        dispatcher: FileDispatcher,
        analyzer: Arc<FakeAnalyzer>,
    }

    fn fixture_with(reply: &str, blocked_terms: Vec<String>) -> Fixture {
        let watch = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let config = Arc::new(WatchConfig::new(
            watch.path(),
            output.path(),
            blocked_terms,
            "http://unused",
            "unused-key",
            "unused-model",
        ));
        let ctx = Arc::new(RunContext::new());
        let cache = ResultCache::load(&config.cache_path);
        let analyzer = FakeAnalyzer::returning(reply);
        let dispatcher = FileDispatcher::new(
            Arc::clone(&config),
            ctx,
            cache,
            Arc::clone(&analyzer) as Arc<dyn DocumentAnalyzer>,
        );
        Fixture {
            watch,
            output,
            dispatcher,
            analyzer,
        }
    }

    fn fixture(reply: &str) -> Fixture {
        fixture_with(reply, Vec::new())
    }

    #[tokio::test]
    async fn renames_into_output_and_caches_the_result() {
        let fx = fixture(GOOD_REPLY);
        let source = fx.watch.path().join("scan.jpg");
        std::fs::write(&source, b"jpeg bytes").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        let expected = fx.output.path().join("2025-04-09_Acme_Inc_INV-42.jpg");
        assert_eq!(outcome, DispatchOutcome::Relocated(expected.clone()));
        assert!(expected.exists());
        assert!(!source.exists());
        assert_eq!(fx.analyzer.calls(), 1);
        assert_eq!(fx.dispatcher.cache.len(), 1);
    }

    #[tokio::test]
    async fn identical_bytes_hit_the_cache_and_skip_the_network() {
        let fx = fixture(GOOD_REPLY);
        let first = fx.watch.path().join("first.jpg");
        let second = fx.watch.path().join("second.jpg");
        std::fs::write(&first, b"same bytes").unwrap();
        std::fs::write(&second, b"same bytes").unwrap();

        fx.dispatcher.dispatch(&first).await;
        let outcome = fx.dispatcher.dispatch(&second).await;

        assert_eq!(fx.analyzer.calls(), 1, "second file must not be analyzed");
        // Same generated name; the collision gets a numeric suffix instead
        // of overwriting the first relocation.
        let DispatchOutcome::Relocated(destination) = outcome else {
            panic!("expected relocation, got {outcome:?}");
        };
        assert_eq!(
            destination,
            fx.output.path().join("2025-04-09_Acme_Inc_INV-42_2.jpg")
        );
        assert!(fx.output.path().join("2025-04-09_Acme_Inc_INV-42.jpg").exists());
    }

    #[tokio::test]
    async fn blocklisted_file_never_reaches_analysis() {
        let fx = fixture_with(GOOD_REPLY, vec!["Draft".to_string()]);
        let source = fx.watch.path().join("quarterly_DRAFT_scan.jpg");
        std::fs::write(&source, b"bytes").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Blocklisted));
        assert_eq!(fx.analyzer.calls(), 0);
        assert!(source.exists(), "blocklisted file stays in the watch folder");
    }

    #[tokio::test]
    async fn quarantine_artifacts_are_never_reprocessed() {
        let fx = fixture(GOOD_REPLY);
        let source = fx.watch.path().join("FAILED_scan.jpg");
        std::fs::write(&source, b"bytes").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::QuarantineArtifact)
        );
        assert_eq!(fx.analyzer.calls(), 0);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn empty_fields_route_to_quarantine_without_caching() {
        let reply = r#"{"company_name":"","invoice_number":"","invoice_date":""}"#;
        let fx = fixture(reply);
        let source = fx.watch.path().join("scan.jpg");
        std::fs::write(&source, b"bytes").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        assert_eq!(outcome, DispatchOutcome::Quarantined);
        assert!(fx.output.path().join("FAILED_scan.jpg").exists());
        assert!(!source.exists(), "quarantined original is consumed");
        assert!(fx.dispatcher.cache.is_empty(), "failures must not be cached");
    }

    #[tokio::test]
    async fn degraded_reply_still_produces_a_usable_filename() {
        let fx = fixture("I could not read this document, sorry!");
        let source = fx.watch.path().join("scan.png");
        std::fs::write(&source, b"bytes").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        let DispatchOutcome::Relocated(destination) = outcome else {
            panic!("expected degraded relocation, got {outcome:?}");
        };
        let name = destination.file_name().unwrap().to_string_lossy();
        assert!(name.contains("Unknown"), "got {name}");
        assert!(fx.dispatcher.cache.is_empty(), "sentinels must not be cached");
    }

    #[tokio::test]
    async fn vanished_file_is_abandoned_silently() {
        let fx = fixture(GOOD_REPLY);
        let outcome = fx
            .dispatcher
            .dispatch(&fx.watch.path().join("never-existed.jpg"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Vanished));
        assert_eq!(fx.analyzer.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_extension_is_skipped() {
        let fx = fixture(GOOD_REPLY);
        let source = fx.watch.path().join("notes.txt");
        std::fs::write(&source, b"text").unwrap();

        let outcome = fx.dispatcher.dispatch(&source).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::UnsupportedExtension)
        );
        assert_eq!(fx.analyzer.calls(), 0);
    }
}
