//! Random storage keys for committed assets.
//!
//! Keys look like `[prefix/]<base64url>.<ext>` where the middle part is the
//! unpadded URL-safe encoding of bytes drawn from the OS CSPRNG.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{TryRngCore, rngs::OsRng};
use std::fmt;
use thiserror::Error;

/// Default amount of entropy per key.
pub const DEFAULT_KEY_BYTES: usize = 32;

/// Smallest accepted amount of entropy per key.
pub const MIN_KEY_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("random source unavailable: {0}")]
    RandomSourceUnavailable(String),
    #[error("key needs at least {MIN_KEY_BYTES} random bytes, got {0}")]
    InsufficientEntropy(usize),
}

/// Opaque address of an asset inside its store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Wrap an existing key, e.g. one taken from a request path.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extension after the final `.`, if any.
    pub fn extension(&self) -> Option<&str> {
        let file = self.0.rsplit('/').next().unwrap_or(&self.0);
        file.rsplit_once('.').map(|(_, ext)| ext)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a fresh key from `byte_length` random bytes.
pub fn generate_key(
    byte_length: usize,
    extension: &str,
    prefix: Option<&str>,
) -> Result<StorageKey, KeyError> {
    if byte_length < MIN_KEY_BYTES {
        return Err(KeyError::InsufficientEntropy(byte_length));
    }

    let mut random = vec![0u8; byte_length];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(|err| KeyError::RandomSourceUnavailable(err.to_string()))?;

    let id = URL_SAFE_NO_PAD.encode(&random);
    let key = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{id}.{extension}"),
        _ => format!("{id}.{extension}"),
    };

    Ok(StorageKey(key))
}

/// File extension for a media type: the subtype after `/`.
pub fn extension_for(media_type: &str) -> &str {
    media_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .unwrap_or("bin")
}
