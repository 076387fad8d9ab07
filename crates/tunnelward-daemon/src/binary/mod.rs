//! Bundled client binary resolution and validation.
//!
//! The binary directory holds one executable per platform, named
//! `client_<os>_<arch>[.exe]`, and optionally a `manifest.json` mapping those
//! names to `{ "sha256": ..., "version": ... }`. Resolution happens lazily on
//! first use and is cached for the lifetime of the manager.

pub mod platform;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub use platform::Platform;

use crate::error::{Result, TunnelError};

/// Name of the optional checksum/version manifest in the binary directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Resolved and validated client binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryInfo {
    /// `<os>_<arch>` identifier.
    pub platform: String,
    pub path: PathBuf,
    /// Version from the manifest, when one is present.
    pub version: Option<String>,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    pub validated: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    sha256: Option<String>,
    version: Option<String>,
}

type Manifest = HashMap<String, ManifestEntry>;

/// Resolves the client binary for the host platform.
pub struct BinaryManager {
    dir: PathBuf,
    platform: Option<Platform>,
    verify_checksum: bool,
    cache: Mutex<Option<Arc<BinaryInfo>>>,
    /// Checksum held after a failed revalidation until `reset`.
    pinned: Mutex<Option<String>>,
}

impl BinaryManager {
    /// Manager for the host platform rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            platform: Platform::current(),
            verify_checksum: false,
            cache: Mutex::new(None),
            pinned: Mutex::new(None),
        }
    }

    /// Require every binary to match the checksum in `manifest.json`.
    #[must_use]
    pub const fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Override the detected platform.
    #[must_use]
    pub const fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Default binary directory: `<data_dir>/tunnelward/bin`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("tunnelward").join("bin"))
    }

    /// Return the path of a validated binary, resolving it on first use.
    pub async fn ensure_binary(&self) -> Result<PathBuf> {
        if let Some(info) = self.cached_info() {
            return Ok(info.path.clone());
        }
        let info = Arc::new(self.resolve(self.pinned_sha256()).await?);
        info!(
            platform = %info.platform,
            path = %info.path.display(),
            version = info.version.as_deref().unwrap_or("unknown"),
            "Client binary resolved"
        );
        let path = info.path.clone();
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
        Ok(path)
    }

    /// Last resolved binary, without touching the filesystem.
    pub fn cached_info(&self) -> Option<Arc<BinaryInfo>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pinned_sha256(&self) -> Option<String> {
        self.pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the binary and verify it still matches the expected checksum.
    ///
    /// The expected checksum is the manifest entry when present, otherwise
    /// the checksum recorded at first resolution. On failure the cache is
    /// cleared and that checksum stays pinned: every later resolution must
    /// match it until [`reset`](Self::reset) is called.
    pub async fn revalidate(&self) -> Result<Arc<BinaryInfo>> {
        let previous = self
            .cached_info()
            .map(|info| info.sha256.clone())
            .or_else(|| self.pinned_sha256());
        match self.resolve(previous.clone()).await {
            Ok(info) => {
                let info = Arc::new(info);
                *self.cache.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&info));
                debug!(path = %info.path.display(), "Client binary revalidated");
                Ok(info)
            }
            Err(e) => {
                *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
                if previous.is_some() {
                    *self.pinned.lock().unwrap_or_else(PoisonError::into_inner) = previous;
                }
                warn!(error = %e, "Client binary failed revalidation");
                Err(e)
            }
        }
    }

    /// Forget the cached binary and any pinned checksum, so the next
    /// resolution accepts the file on disk as new.
    pub fn reset(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let pinned = self
            .pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pinned.is_some() {
            info!(path = %self.dir.display(), "Pinned client checksum cleared");
        }
    }

    async fn resolve(&self, previous_sha256: Option<String>) -> Result<BinaryInfo> {
        let platform = self.platform.ok_or_else(|| TunnelError::BinaryNotFound {
            platform: platform::host_identifier(),
            path: self.dir.clone(),
        })?;
        let name = platform.binary_name();
        let path = self.dir.join(&name);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TunnelError::BinaryNotFound {
                    platform: platform.to_string(),
                    path,
                });
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(TunnelError::BinaryInvalid {
                path,
                reason: "not a regular file".into(),
            });
        }

        make_executable(&path, &metadata).await?;

        let entry = self.manifest_entry(&name).await?;
        let sha256 = sha256_file(&path).await?;

        let expected = entry
            .as_ref()
            .and_then(|e| e.sha256.clone())
            .or(previous_sha256.clone());
        if self.verify_checksum || previous_sha256.is_some() {
            match expected {
                Some(expected) if !expected.eq_ignore_ascii_case(&sha256) => {
                    return Err(TunnelError::BinaryInvalid {
                        path,
                        reason: format!("checksum mismatch: expected {expected}, got {sha256}"),
                    });
                }
                None if self.verify_checksum => {
                    return Err(TunnelError::BinaryInvalid {
                        path,
                        reason: format!("no expected checksum for {name} in {MANIFEST_FILE}"),
                    });
                }
                _ => {}
            }
        }

        Ok(BinaryInfo {
            platform: platform.to_string(),
            path,
            version: entry.and_then(|e| e.version),
            sha256,
            validated: true,
        })
    }

    async fn manifest_entry(&self, name: &str) -> Result<Option<ManifestEntry>> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Manifest>(&content) {
            Ok(mut manifest) => Ok(manifest.remove(name)),
            Err(e) if self.verify_checksum => Err(TunnelError::BinaryInvalid {
                path: manifest_path,
                reason: format!("unreadable manifest: {e}"),
            }),
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "Ignoring malformed manifest");
                Ok(None)
            }
        }
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path, metadata: &std::fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o777 != 0o755 {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn make_executable(_path: &Path, _metadata: &std::fs::Metadata) -> Result<()> {
    Ok(())
}

/// Lowercase hex SHA-256 of a file's contents.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}
