use std::fmt;
use std::path::{Path, PathBuf};

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, error};

pub const VIDEO_FORMAT: &str = "bv*+ba/b";
pub const MERGE_FORMAT: &str = "mp4";

/// Everything the engine needs for one download.
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub url: &'a str,
    pub output_template: String,
    pub cookie_file: Option<&'a Path>,
}

/// Rough classification of engine errors. All of them surface to clients as
/// the same failure; the kind only feeds the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unavailable,
    Forbidden,
    AuthRequired,
    Unsupported,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Unavailable => "unavailable",
            FailureKind::Forbidden => "forbidden",
            FailureKind::AuthRequired => "auth_required",
            FailureKind::Unsupported => "unsupported",
            FailureKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("extraction failed ({kind}): {message}")]
pub struct ExtractionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExtractionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a raw engine error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("unsupported url") {
            FailureKind::Unsupported
        } else if lower.contains("sign in") || lower.contains("login") || lower.contains("authentication") {
            FailureKind::AuthRequired
        } else if message.contains("403") || lower.contains("forbidden") {
            FailureKind::Forbidden
        } else if lower.contains("not found")
            || lower.contains("unavailable")
            || lower.contains("unable to download")
        {
            FailureKind::Unavailable
        } else {
            FailureKind::Other
        };
        Self { kind, message }
    }
}

/// The external extraction engine. Implementations download `request.url`
/// and return the file name the engine reports for it.
pub trait Extractor: Send + Sync {
    fn extract(&self, request: &ExtractRequest<'_>) -> Result<PathBuf, ExtractionFailure>;
}

/// yt-dlp driven through the embedded Python interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct YtDlp;

impl Extractor for YtDlp {
    fn extract(&self, request: &ExtractRequest<'_>) -> Result<PathBuf, ExtractionFailure> {
        Python::with_gil(|py| run_ytdlp(py, request)).map_err(|e| {
            let failure = ExtractionFailure::classify(e);
            error!("yt-dlp failed for {}: {failure}", request.url);
            failure
        })
    }
}

/// Calls `YoutubeDL(opts).extract_info(url, download=True)` and asks the same
/// instance for the final file name.
fn run_ytdlp(py: Python<'_>, request: &ExtractRequest<'_>) -> Result<PathBuf, String> {
    let yt_dlp = py
        .import("yt_dlp")
        .map_err(|e| format!("Failed to import yt_dlp: {e}"))?;

    let opts = build_options(py, request).map_err(|e| format!("Failed to build options: {e}"))?;

    let ydl = yt_dlp
        .getattr("YoutubeDL")
        .and_then(|class| class.call1((opts,)))
        .map_err(|e| format!("Failed to create YoutubeDL: {e}"))?;

    let outcome = (|| -> PyResult<String> {
        let kwargs = PyDict::new(py);
        kwargs.set_item("download", true)?;
        let info = ydl.call_method("extract_info", (request.url,), Some(&kwargs))?;
        ydl.call_method1("prepare_filename", (info,))?.extract::<String>()
    })();

    // Releases the cookie jar and any open file handles.
    if let Err(e) = ydl.call_method0("close") {
        debug!("YoutubeDL.close failed: {e}");
    }

    outcome.map(PathBuf::from).map_err(|e| e.to_string())
}

fn build_options<'py>(
    py: Python<'py>,
    request: &ExtractRequest<'_>,
) -> PyResult<Bound<'py, PyDict>> {
    let opts = PyDict::new(py);
    opts.set_item("format", VIDEO_FORMAT)?;
    opts.set_item("merge_output_format", MERGE_FORMAT)?;
    opts.set_item("quiet", true)?;
    opts.set_item("noplaylist", true)?;
    opts.set_item("outtmpl", request.output_template.as_str())?;
    if let Some(cookie_file) = request.cookie_file {
        opts.set_item("cookiefile", cookie_file.to_string_lossy().into_owned())?;
    }
    Ok(opts)
}
