//! PDF to raster conversion via an external converter.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Render resolution handed to the converter.
const RENDER_DPI: &str = "300";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to launch pdftoppm: {0}")]
    Launch(#[from] std::io::Error),
    #[error("pdftoppm exited with {status}: {stderr}")]
    ConverterFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("converter produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Convert the first page of a PDF into a sibling PNG at 300 dpi.
///
/// `pdftoppm -singlefile` writes exactly `<stem>.png` next to the input.
/// The exit status is checked before the derived path is trusted.
pub async fn pdf_to_image(path: &Path) -> Result<PathBuf, ConvertError> {
    let prefix = path.with_extension("");
    let output = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(RENDER_DPI)
        .arg("-f")
        .arg("1")
        .arg("-l")
        .arg("1")
        .arg("-singlefile")
        .arg(path)
        .arg(&prefix)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ConvertError::ConverterFailed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let derived = path.with_extension("png");
    if !derived.exists() {
        return Err(ConvertError::MissingOutput(derived));
    }

    debug!(input = %path.display(), image = %derived.display(), "pdf page rendered");
    Ok(derived)
}
