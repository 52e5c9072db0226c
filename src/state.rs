//! Shared router state.

use crate::services::ingest::{AssetStores, IngestService};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Everything a handler can reach. Cloned per request; all fields are shared
/// handles, so requests never share mutable state.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub assets: AssetStores,
    pub db: Arc<SqlitePool>,
    pub staging_dir: PathBuf,
}
