//! Artifact files and their public URLs

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::StorageError;

/// URL scheme used when publishing artifact links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlScheme {
    #[default]
    Https,
    Http,
}

impl fmt::Display for UrlScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlScheme::Https => f.write_str("https"),
            UrlScheme::Http => f.write_str("http"),
        }
    }
}

/// Media storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory holding uploaded images and rendered artifacts
    pub root: PathBuf,
    pub scheme: UrlScheme,
    /// Public host (and port) clients reach the media route on
    pub host: String,
    /// Route prefix the media directory is served under
    pub url_path: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("media"),
            scheme: UrlScheme::Https,
            host: "localhost:8080".to_string(),
            url_path: "/media".to_string(),
        }
    }
}

impl MediaConfig {
    /// Public URL for an artifact name
    pub fn url_for(&self, name: &str) -> String {
        format!(
            "{}://{}/{}/{}",
            self.scheme,
            self.host.trim_end_matches('/'),
            self.url_path.trim_matches('/'),
            name
        )
    }
}

/// A stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub url: String,
}

/// Write-once blob storage for images and rendered artifacts
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `name`; an existing artifact is never replaced
    fn put(&self, name: &str, bytes: &[u8]) -> Result<ArtifactRef, StorageError>;

    fn get(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    fn url_for(&self, name: &str) -> String;
}

/// Artifacts as files in a single directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    config: MediaConfig,
}

impl FsArtifactStore {
    pub fn new(config: MediaConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.root).map_err(|e| {
            StorageError::StorageFailure(format!(
                "cannot create media dir {}: {}",
                config.root.display(),
                e
            ))
        })?;
        info!(
            "Media store at {} served as {}",
            config.root.display(),
            config.url_for("")
        );
        Ok(Self { config })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.starts_with('.');
        if !plain {
            return Err(StorageError::StorageFailure(format!(
                "invalid artifact name '{}'",
                name
            )));
        }
        Ok(self.config.root.join(name))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<ArtifactRef, StorageError> {
        let path = self.path_for(name)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    StorageError::StorageFailure(format!("artifact '{}' already exists", name))
                }
                _ => StorageError::StorageFailure(format!("cannot create {}: {}", path.display(), e)),
            })?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::StorageFailure(format!("cannot write {}: {}", path.display(), e)))?;

        debug!("Stored artifact {} ({} bytes)", name, bytes.len());
        Ok(ArtifactRef {
            name: name.to_string(),
            url: self.url_for(name),
        })
    }

    fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(name)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(format!("artifact {}", name)),
            _ => StorageError::StorageFailure(format!("cannot read {}: {}", path.display(), e)),
        })
    }

    fn url_for(&self, name: &str) -> String {
        self.config.url_for(name)
    }
}
