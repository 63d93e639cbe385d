use super::{CookieLoader, Credentials, PersistenceCallback};
use crate::constants::{ROTATION_TOKEN_COOKIE, SESSION_ID_COOKIE};
use crate::error::{GeminiError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// JSON cookie cache: `{"__Secure-1PSID": "...", "__Secure-1PSIDTS": "..."}`.
///
/// Works both as a [`CookieLoader`] and, through [`CookieFile::persistence_callback`],
/// as the sink that mirrors rotated tokens to disk.
#[derive(Clone, Debug)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<Credentials> {
        let contents = fs::read_to_string(&self.path)?;
        let data: BTreeMap<String, String> = serde_json::from_str(&contents).map_err(|err| {
            GeminiError::Auth(format!(
                "invalid cookie file {}: {err}",
                self.path.display()
            ))
        })?;
        let session_id = data.get(SESSION_ID_COOKIE).cloned().ok_or_else(|| {
            GeminiError::Auth(format!(
                "{SESSION_ID_COOKIE} missing from {}",
                self.path.display()
            ))
        })?;
        Credentials::new(session_id, data.get(ROTATION_TOKEN_COOKIE).cloned())
    }

    pub fn save(&self, credentials: &Credentials) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data: BTreeMap<String, String> = credentials.cookies().into_iter().collect();
        let data = serde_json::to_string_pretty(&data).unwrap_or_else(|_| "{}".to_string());
        fs::write(&self.path, data)
    }

    pub fn persistence_callback(&self) -> PersistenceCallback {
        let file = self.clone();
        Arc::new(move |credentials: &Credentials| {
            if let Err(err) = file.save(credentials) {
                tracing::warn!(path = %file.path.display(), "failed to persist cookies: {err}");
            }
        })
    }
}

impl CookieLoader for CookieFile {
    fn load(&self) -> Result<Credentials> {
        self.read()
    }
}
