use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::cleanup::{cleanup_folder, JOB_DIR_PREFIX};
use crate::cookies;
use crate::ytdlp::{ExtractRequest, ExtractionFailure, Extractor, FailureKind, MERGE_FORMAT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Downloading,
    Served,
    Failed,
    CleanedUp,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to prepare download: {0}")]
    Setup(#[from] io::Error),
    #[error(transparent)]
    Extraction(#[from] ExtractionFailure),
    #[error("download worker failed: {0}")]
    Worker(String),
}

/// A per-request scratch directory.
///
/// The directory is removed exactly once: explicitly through
/// [`DownloadJob::cleanup`], or when the job is dropped. Moving the job into
/// the response body ties removal to the end of streaming.
#[derive(Debug)]
pub struct DownloadJob {
    dir: PathBuf,
    state: JobState,
}

impl DownloadJob {
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(JOB_DIR_PREFIX)
            .tempdir_in(root)?
            .keep();
        debug!("Created job directory {}", dir.display());
        Ok(Self {
            dir,
            state: JobState::Created,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn advance(&mut self, next: JobState) {
        debug!("Job {}: {:?} -> {:?}", self.dir.display(), self.state, next);
        self.state = next;
    }

    pub fn mark_served(&mut self) {
        self.advance(JobState::Served);
    }

    pub fn fail(&mut self) {
        self.advance(JobState::Failed);
        self.cleanup();
    }

    pub fn cleanup(&mut self) {
        if self.state == JobState::CleanedUp {
            return;
        }
        cleanup_folder(&self.dir);
        self.advance(JobState::CleanedUp);
    }
}

impl Drop for DownloadJob {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Clone)]
pub struct Downloader {
    extractor: Arc<dyn Extractor>,
}

impl Downloader {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    /// Downloads `url` into `target_dir` and returns the merged mp4 path.
    ///
    /// A `cookies_path` that does not exist is ignored with a warning; the
    /// download then runs unauthenticated. Blocking.
    pub fn download(
        &self,
        url: &str,
        target_dir: &Path,
        cookies_path: Option<&Path>,
    ) -> Result<PathBuf, ExtractionFailure> {
        let output_template = target_dir
            .join("%(title)s.%(ext)s")
            .to_string_lossy()
            .into_owned();

        let cookie_file = cookies::resolve_path(cookies_path).unwrap_or_else(|_| {
            warn!(
                "Proceeding without cookies; file {} missing",
                cookies_path.map(|p| p.display().to_string()).unwrap_or_default()
            );
            None
        });

        info!("Downloading video from {url} into {}", target_dir.display());
        let reported = self.extractor.extract(&ExtractRequest {
            url,
            output_template,
            cookie_file: cookie_file.as_deref(),
        })?;

        let file_path = reported.with_extension(MERGE_FORMAT);
        if !file_path.is_file() {
            return Err(ExtractionFailure::new(
                FailureKind::Other,
                format!("expected output {} was not produced", file_path.display()),
            ));
        }

        info!("Video downloaded to {}", file_path.display());
        Ok(file_path)
    }

    /// Runs `job` to completion on the calling thread. On failure the job
    /// directory is already gone when the error is returned.
    pub fn run(
        &self,
        mut job: DownloadJob,
        url: &str,
        cookies_path: Option<&Path>,
    ) -> Result<(DownloadJob, PathBuf), ExtractionFailure> {
        job.advance(JobState::Downloading);
        match self.download(url, job.dir(), cookies_path) {
            Ok(path) => Ok((job, path)),
            Err(e) => {
                warn!("Download of {url} failed: {e}");
                job.fail();
                Err(e)
            }
        }
    }
}

/// File stream that owns the job it was produced by, so the job directory is
/// removed once the body is finished or dropped.
pub struct JobStream {
    inner: ReaderStream<File>,
    _job: DownloadJob,
}

impl JobStream {
    pub fn new(file: File, mut job: DownloadJob) -> Self {
        job.mark_served();
        Self {
            inner: ReaderStream::new(file),
            _job: job,
        }
    }
}

impl Stream for JobStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
