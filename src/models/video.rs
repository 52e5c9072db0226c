//! Represents a video record whose media references are filled in by uploads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A video owned by a single user.
///
/// The row is created elsewhere; ingestion only rewrites `thumbnail_url`,
/// `video_url` and `updated_at`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Video {
    /// Primary key.
    pub id: Uuid,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Last time any field changed.
    pub updated_at: DateTime<Utc>,

    /// Where the thumbnail can be fetched from (URL or `data:` URL).
    pub thumbnail_url: Option<String>,

    /// Where the video file can be fetched from.
    pub video_url: Option<String>,

    pub title: String,

    pub description: String,

    /// Owner; the only user allowed to attach media.
    pub user_id: Uuid,
}

#[cfg(test)]
impl Video {
    /// A fresh record with no media attached.
    pub fn new(user_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            thumbnail_url: None,
            video_url: None,
            title: title.into(),
            description: description.into(),
            user_id,
        }
    }
}
