use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::sqlite_cookies;

const NETSCAPE_MARKER: &str = "Netscape HTTP Cookie File";

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("invalid cookies reference: {0}")]
    MalformedReference(String),
    #[error("cookies file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("{0}")]
    InvalidFormat(String),
    #[error("failed to write cookies file: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns uploaded bytes into Netscape cookie-jar text.
///
/// A Firefox `cookies.sqlite` database is converted row by row. Anything else
/// must already be UTF-8 Netscape text and is returned untouched.
pub fn normalize(content: &[u8]) -> Result<Vec<u8>, CookieError> {
    if sqlite_cookies::is_sqlite(content) {
        let rows = sqlite_cookies::read_rows_from_bytes(content)
            .map_err(|e| CookieError::InvalidFormat(e.to_string()))?;
        info!("Converted {} cookies from Firefox cookies.sqlite", rows.len());
        return Ok(sqlite_cookies::to_netscape(&rows).into_bytes());
    }

    let text = std::str::from_utf8(content).map_err(|_| {
        CookieError::InvalidFormat("Cookies file must be UTF-8 text (Netscape format).".into())
    })?;
    if !text.contains(NETSCAPE_MARKER) {
        return Err(CookieError::InvalidFormat(format!(
            "Cookies file must contain the '{NETSCAPE_MARKER}' header."
        )));
    }
    Ok(content.to_vec())
}

/// Normalizes `content` and stores it at `destination`.
///
/// The bytes go to a temp file next to the destination which is then renamed
/// over it, so readers only ever see a complete jar.
pub fn save(destination: &Path, content: &[u8]) -> Result<PathBuf, CookieError> {
    info!("Saving cookies file to {}", destination.display());
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let processed = normalize(content)?;

    let write = || -> std::io::Result<()> {
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(&processed)?;
        staged.as_file().sync_all()?;
        staged.persist(destination).map_err(|e| e.error)?;
        Ok(())
    };
    if let Err(e) = write() {
        error!("Failed to save cookies file to {}: {e}", destination.display());
        return Err(e.into());
    }

    info!("Cookies file saved to {}", destination.display());
    Ok(destination.to_path_buf())
}

/// Maps a public cookies reference (as returned by the upload endpoint) to a
/// file inside `cookies_dir`. Only the last path segment is used.
pub fn resolve_reference(
    reference: Option<&str>,
    cookies_dir: &Path,
) -> Result<Option<PathBuf>, CookieError> {
    let reference = match reference {
        Some(r) if !r.is_empty() => r,
        _ => {
            debug!("No cookies reference provided; skipping cookies usage.");
            return Ok(None);
        }
    };

    let file_name = reference_file_name(reference).ok_or_else(|| {
        warn!("Invalid cookies reference {reference}");
        CookieError::MalformedReference(reference.to_string())
    })?;

    let candidate = cookies_dir.join(&file_name);
    if !candidate.is_file() {
        warn!(
            "Cookies file {} derived from {reference} not found",
            candidate.display()
        );
        return Err(CookieError::NotFound(candidate));
    }

    info!(
        "Resolved cookies file {} from reference {reference}",
        candidate.display()
    );
    Ok(Some(candidate))
}

/// Existence check for a locally supplied cookies path.
pub fn resolve_path(path: Option<&Path>) -> Result<Option<PathBuf>, CookieError> {
    let path = match path {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            debug!("No cookies path provided; skipping cookies usage.");
            return Ok(None);
        }
    };

    if !path.exists() {
        warn!("Cookies file {} does not exist", path.display());
        return Err(CookieError::NotFound(path.to_path_buf()));
    }

    info!("Using cookies file {}", path.display());
    Ok(Some(path.to_path_buf()))
}

/// Strips any directory components from an uploaded file name.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    Path::new(raw)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

fn reference_file_name(reference: &str) -> Option<String> {
    let path = match Url::parse(reference) {
        Ok(url) => url.path().to_string(),
        Err(_) => reference
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    sanitize_file_name(&path)
}
