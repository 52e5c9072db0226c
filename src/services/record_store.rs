//! Video metadata persistence.
//!
//! The ingest pipeline only needs `get` and `update`; `SqliteRecordStore`
//! provides them on top of the `videos` table.

use crate::models::video::Video;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("video `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RecordResult<T> = Result<T, RecordStoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: Uuid) -> RecordResult<Option<Video>>;

    /// Overwrite the mutable columns of an existing row.
    async fn update(&self, video: &Video) -> RecordResult<()>;
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub async fn insert(&self, video: &Video) -> RecordResult<()> {
        sqlx::query(
            "INSERT INTO videos (id, created_at, updated_at, thumbnail_url, video_url,
                                 title, description, user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(video.id)
        .bind(video.created_at)
        .bind(video.updated_at)
        .bind(&video.thumbnail_url)
        .bind(&video.video_url)
        .bind(&video.title)
        .bind(&video.description)
        .bind(video.user_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, id: Uuid) -> RecordResult<Option<Video>> {
        let video = sqlx::query_as::<_, Video>(
            "SELECT id, created_at, updated_at, thumbnail_url, video_url,
                    title, description, user_id
             FROM videos WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(video)
    }

    async fn update(&self, video: &Video) -> RecordResult<()> {
        let result = sqlx::query(
            "UPDATE videos
             SET updated_at = ?, thumbnail_url = ?, video_url = ?, title = ?, description = ?
             WHERE id = ?",
        )
        .bind(video.updated_at)
        .bind(&video.thumbnail_url)
        .bind(&video.video_url)
        .bind(&video.title)
        .bind(&video.description)
        .bind(video.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NotFound(video.id));
        }
        Ok(())
    }
}
