//! Staging of inbound uploads into bounded temporary files.
//!
//! A `StagedAsset` owns its temp file; dropping it removes the file, so every
//! exit path of a request (including early returns and panics) cleans up.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

/// Upper bound for thumbnail uploads (10 MiB).
pub const MAX_THUMBNAIL_BYTES: u64 = 10 << 20;

/// Upper bound for video uploads (1 GiB).
pub const MAX_VIDEO_BYTES: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An upload buffered on local disk, rewound to its first byte.
#[derive(Debug)]
pub struct StagedAsset {
    // Declared before `temp` so the handle closes before the file is unlinked.
    file: File,
    temp: NamedTempFile,
    len: u64,
    content_type: String,
}

impl StagedAsset {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Rewind and hand out the file for another full read.
    pub async fn reader(&mut self) -> io::Result<&mut File> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(&mut self.file)
    }
}

/// Creates `StagedAsset`s inside one directory.
#[derive(Debug, Clone)]
pub struct AssetStager {
    dir: PathBuf,
}

impl AssetStager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Copy `stream` into a fresh temp file, failing once it passes `max_bytes`.
    ///
    /// A stream error (for example a client hanging up mid-body) fails the
    /// copy; the partial file is removed when the temp handle drops.
    pub async fn stage<S, E>(
        &self,
        stream: S,
        content_type: &str,
        max_bytes: u64,
    ) -> Result<StagedAsset, StageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<io::Error>,
    {
        let temp = tempfile::Builder::new()
            .prefix("ingest-")
            .suffix(".upload")
            .tempfile_in(&self.dir)?;
        let mut file = File::from_std(temp.reopen()?);

        let mut len: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            len += chunk.len() as u64;
            if len > max_bytes {
                debug!(path = %temp.path().display(), limit = max_bytes, "upload over limit");
                return Err(StageError::PayloadTooLarge { limit: max_bytes });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        file.seek(SeekFrom::Start(0)).await?;

        debug!(path = %temp.path().display(), size_bytes = len, "staged upload");

        Ok(StagedAsset {
            file,
            temp,
            len,
            content_type: content_type.to_string(),
        })
    }
}
