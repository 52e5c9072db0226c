pub mod asset_store;
pub mod auth;
pub mod classifier;
pub mod ingest;
pub mod keys;
pub mod record_store;
pub mod stager;
