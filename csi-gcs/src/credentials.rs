//! Service account key handling.
//!
//! Keys arrive as secret fields and have to exist on disk for gcloud and
//! gcsfuse. They are written to private temporary files under a dedicated
//! directory and removed once nothing uses them any more.

use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tonic::Status;
use tracing::{debug, error, warn};

/// Default directory for materialized keys.
pub const DEFAULT_KEY_STORAGE_PATH: &str = "/tmp/keys";

/// Secret field holding the key by convention.
pub const DEFAULT_KEY_NAME: &str = "key";
/// Accepted when [`DEFAULT_KEY_NAME`] is absent.
pub const FALLBACK_KEY_NAME: &str = "key.json";

/// Volume context entry pointing at a key already present on the host.
pub const CONTEXT_KEY_FILE: &str = "key_file";
/// Volume context entry selecting which secret field holds the key.
pub const CONTEXT_KEY_NAME: &str = "key_name";

/// Credentials handed to the object store and the mount helper.
#[derive(Debug)]
pub enum KeyFile {
    /// Written by the driver. The file is deleted when this value is dropped
    /// or [`KeyFile::remove`] is called.
    Managed(NamedTempFile),
    /// Supplied by the operator. Never deleted.
    External(PathBuf),
    /// No key, tools fall back to their ambient credentials.
    Ambient,
}

impl KeyFile {
    pub fn path(&self) -> Option<&Path> {
        match self {
            KeyFile::Managed(file) => Some(file.path()),
            KeyFile::External(path) => Some(path),
            KeyFile::Ambient => None,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, KeyFile::Managed(_))
    }

    /// Delete a managed key file now, reporting failures instead of
    /// swallowing them on drop.
    pub fn remove(self) -> io::Result<()> {
        match self {
            KeyFile::Managed(file) => file.close(),
            KeyFile::External(_) | KeyFile::Ambient => Ok(()),
        }
    }
}

/// Writes keys into the managed key directory.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> io::Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
    }

    /// Write `contents` to a new owner-only file in the key directory.
    pub fn materialize(&self, contents: &str) -> io::Result<KeyFile> {
        self.ensure_dir()?;
        let mut file = tempfile::Builder::new()
            .prefix("key-")
            .suffix(".json")
            .tempfile_in(&self.dir)?;
        file.as_file()
            .set_permissions(Permissions::from_mode(0o600))?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        debug!(path = %file.path().display(), "Saved service account key");
        Ok(KeyFile::Managed(file))
    }

    /// Credentials for a controller call: the conventional secret field if
    /// present, ambient credentials otherwise.
    pub fn from_secrets(&self, secrets: &HashMap<String, String>) -> Result<KeyFile, Status> {
        match lookup_key(secrets, DEFAULT_KEY_NAME) {
            Some((_, contents)) => self.save(contents),
            None => {
                debug!("No service account key in secrets, using ambient credentials");
                Ok(KeyFile::Ambient)
            }
        }
    }

    /// Credentials for a mount.
    ///
    /// An explicit `key_file` in the volume context wins. Otherwise the
    /// secret named by `key_name` (default `key`, then `key.json`) is
    /// required.
    pub fn for_mount(
        &self,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<KeyFile, Status> {
        if let Some(path) = volume_context.get(CONTEXT_KEY_FILE) {
            debug!(path = %path, "Using service account key from volume context");
            return Ok(KeyFile::External(PathBuf::from(path)));
        }

        let key_name = volume_context
            .get(CONTEXT_KEY_NAME)
            .map(String::as_str)
            .unwrap_or(DEFAULT_KEY_NAME);

        let (field, contents) = lookup_key(secrets, key_name).ok_or_else(|| {
            Status::invalid_argument(format!("Secret '{}' is unavailable", key_name))
        })?;
        debug!(field = %field, "Using service account key from secret");
        self.save(contents)
    }

    fn save(&self, contents: &str) -> Result<KeyFile, Status> {
        self.materialize(contents).map_err(|e| {
            error!(error = %e, dir = %self.dir.display(), "Failed to save service account key");
            Status::internal(format!(
                "Unable to save service account key to {}: {}",
                self.dir.display(),
                e
            ))
        })
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_STORAGE_PATH)
    }
}

/// Find the key field, applying the `key.json` fallback only for the
/// conventional name.
fn lookup_key<'a>(
    secrets: &'a HashMap<String, String>,
    key_name: &'a str,
) -> Option<(&'a str, &'a str)> {
    if let Some(contents) = secrets.get(key_name) {
        return Some((key_name, contents));
    }
    if key_name == DEFAULT_KEY_NAME
        && let Some(contents) = secrets.get(FALLBACK_KEY_NAME)
    {
        return Some((FALLBACK_KEY_NAME, contents));
    }
    None
}

/// Best-effort removal used when a key file outlives its operation.
pub fn discard(key_file: KeyFile) {
    let path = key_file.path().map(Path::to_path_buf);
    if let Err(e) = key_file.remove() {
        warn!(error = %e, path = ?path, "Error removing temporary key file");
    }
}
