//! Orientation classification of staged video files.
//!
//! The prober shells out to `ffprobe` and the classifier buckets the first
//! video stream's aspect ratio into landscape / portrait / other.

use async_trait::async_trait;
use serde::Deserialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const LANDSCAPE_RATIO: f64 = 16.0 / 9.0;
const PORTRAIT_RATIO: f64 = 9.0 / 16.0;
const RATIO_TOLERANCE: f64 = 0.01;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a file could not be classified. Callers degrade to `Other`.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to run prober: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("prober exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("prober did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("unparseable prober output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no stream with width and height found")]
    NoDimensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Landscape,
    Portrait,
    Other,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Landscape => "landscape",
            Classification::Portrait => "portrait",
            Classification::Other => "other",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of `ffprobe -print_format json -show_streams` output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl ProbeOutput {
    /// Width and height of the first stream, when both are present.
    pub fn dimensions(&self) -> Option<(f64, f64)> {
        let stream = self.streams.first()?;
        Some((stream.width?, stream.height?))
    }
}

/// Inspects a media file and reports its stream metadata.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeOutput, ClassifyError>;
}

/// `MediaProber` backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    #[tracing::instrument(skip(self), fields(prober = %self.binary.display()))]
    async fn probe(&self, path: &Path) -> Result<ProbeOutput, ClassifyError> {
        let child = Command::new(&self.binary)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "v:0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ClassifyError::TimedOut(self.timeout))?
            .map_err(ClassifyError::Spawn)?;

        if !output.status.success() {
            return Err(ClassifyError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Bucket a width/height pair by aspect ratio.
///
/// Returns `None` for zero or non-finite dimensions.
pub fn classify_dimensions(width: f64, height: f64) -> Option<Classification> {
    if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
        return None;
    }

    let ratio = width / height;
    let label = if (ratio - LANDSCAPE_RATIO).abs() <= RATIO_TOLERANCE {
        Classification::Landscape
    } else if (ratio - PORTRAIT_RATIO).abs() <= RATIO_TOLERANCE {
        Classification::Portrait
    } else {
        Classification::Other
    };
    debug!(width, height, ratio, label = %label, "classified aspect ratio");
    Some(label)
}

#[derive(Clone)]
pub struct MediaClassifier {
    prober: Arc<dyn MediaProber>,
}

impl MediaClassifier {
    pub fn new(prober: Arc<dyn MediaProber>) -> Self {
        Self { prober }
    }

    pub async fn classify(&self, path: &Path) -> Result<Classification, ClassifyError> {
        let output = self.prober.probe(path).await?;
        let (width, height) = output.dimensions().ok_or(ClassifyError::NoDimensions)?;
        classify_dimensions(width, height).ok_or(ClassifyError::NoDimensions)
    }
}
