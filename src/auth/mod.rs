mod cookie_file;
mod rotation;
mod token;

pub use cookie_file::CookieFile;
pub use rotation::{ErrorCallback, RotationContext, RotationGate, Rotator, MIN_ROTATION_INTERVAL};
pub use token::{extract_access_token, fetch_access_token};

use crate::constants::{ROTATION_TOKEN_COOKIE, SESSION_ID_COOKIE};
use crate::error::{GeminiError, Result};
use crate::transport::CancelToken;
use std::env;
use std::sync::{Arc, RwLock};

pub const ENV_SESSION_ID: &str = "GEMINI_SECURE_1PSID";
pub const ENV_ROTATION_TOKEN: &str = "GEMINI_SECURE_1PSIDTS";

/// The session cookie pair. The session id never changes for the lifetime of a value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    session_id: String,
    rotation_token: Option<String>,
}

impl Credentials {
    pub fn new(session_id: impl Into<String>, rotation_token: Option<String>) -> Result<Self> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(GeminiError::Auth(format!(
                "{SESSION_ID_COOKIE} cookie is required"
            )));
        }
        Ok(Self {
            session_id,
            rotation_token: rotation_token.filter(|token| !token.trim().is_empty()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn rotation_token(&self) -> Option<&str> {
        self.rotation_token.as_deref()
    }

    pub fn with_rotation_token(&self, token: impl Into<String>) -> Self {
        Self {
            session_id: self.session_id.clone(),
            rotation_token: Some(token.into()),
        }
    }

    /// Cookie pairs attached to authenticated requests.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut cookies = vec![(SESSION_ID_COOKIE.to_string(), self.session_id.clone())];
        if let Some(token) = &self.rotation_token {
            cookies.push((ROTATION_TOKEN_COOKIE.to_string(), token.clone()));
        }
        cookies
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("session_id", &redact(&self.session_id))
            .field("rotation_token", &self.rotation_token.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(6).collect();
    format!("{prefix}…")
}

pub type PersistenceCallback = Arc<dyn Fn(&Credentials) + Send + Sync>;

/// Holds the credential pair; the only place the rotation token is mutated.
pub struct CookieStore {
    credentials: RwLock<Credentials>,
    on_update: Option<PersistenceCallback>,
}

impl CookieStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            on_update: None,
        }
    }

    pub fn with_persistence(credentials: Credentials, callback: Option<PersistenceCallback>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            on_update: callback,
        }
    }

    pub fn snapshot(&self) -> Credentials {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update_rotation_token(&self, token: &str) {
        let updated = {
            let mut guard = self
                .credentials
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = guard.with_rotation_token(token);
            guard.clone()
        };
        self.persist(&updated);
    }

    /// Swaps in a whole new pair, e.g. after re-extracting cookies from a browser.
    pub fn replace(&self, credentials: Credentials) {
        {
            let mut guard = self
                .credentials
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = credentials.clone();
        }
        self.persist(&credentials);
    }

    fn persist(&self, credentials: &Credentials) {
        if let Some(callback) = &self.on_update {
            callback(credentials);
        }
    }
}

pub trait CookieLoader: Send + Sync {
    fn load(&self) -> Result<Credentials>;
}

impl<F> CookieLoader for F
where
    F: Fn() -> Result<Credentials> + Send + Sync,
{
    fn load(&self) -> Result<Credentials> {
        self()
    }
}

/// Extracts fresh cookies from a local browser profile, identified by tag ("chrome", "firefox", ...).
pub trait BrowserCookieExtractor: Send + Sync {
    fn extract(&self, cancel: &CancelToken, browser: &str) -> Result<Credentials>;
}

impl<F> BrowserCookieExtractor for F
where
    F: Fn(&CancelToken, &str) -> Result<Credentials> + Send + Sync,
{
    fn extract(&self, cancel: &CancelToken, browser: &str) -> Result<Credentials> {
        self(cancel, browser)
    }
}

/// Reads the cookie pair from `GEMINI_SECURE_1PSID` / `GEMINI_SECURE_1PSIDTS`.
#[derive(Clone, Debug, Default)]
pub struct EnvCookieLoader;

impl CookieLoader for EnvCookieLoader {
    fn load(&self) -> Result<Credentials> {
        let session_id = env::var(ENV_SESSION_ID)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| GeminiError::Auth(format!("{ENV_SESSION_ID} is not set")))?;
        let rotation_token = env::var(ENV_ROTATION_TOKEN).ok();
        Credentials::new(session_id, rotation_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn creds() -> Credentials {
        Credentials::new("sid-value", Some("ts-old".to_string())).unwrap()
    }

    #[test]
    fn empty_session_id_is_rejected() {
        assert!(Credentials::new("  ", None).unwrap_err().is_auth());
    }

    #[test]
    fn blank_rotation_token_is_dropped() {
        let credentials = Credentials::new("sid", Some(String::new())).unwrap();
        assert_eq!(credentials.rotation_token(), None);
        assert_eq!(credentials.cookies().len(), 1);
    }

    #[test]
    fn update_swaps_token_and_persists() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: PersistenceCallback = Arc::new(move |credentials: &Credentials| {
            sink.lock()
                .unwrap()
                .push(credentials.rotation_token().unwrap_or_default().to_string());
        });
        let store = CookieStore::with_persistence(creds(), Some(callback));

        store.update_rotation_token("ts-new");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.session_id(), "sid-value");
        assert_eq!(snapshot.rotation_token(), Some("ts-new"));
        assert_eq!(*seen.lock().unwrap(), vec!["ts-new".to_string()]);
    }

    #[test]
    fn snapshots_are_never_torn() {
        let store = Arc::new(CookieStore::new(creds()));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.update_rotation_token(&format!("ts-{i}"));
                }
            })
        };
        for _ in 0..200 {
            let snapshot = store.snapshot();
            assert_eq!(snapshot.session_id(), "sid-value");
            assert!(snapshot.rotation_token().is_some());
        }
        writer.join().unwrap();
    }

    #[test]
    fn debug_output_redacts_values() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("sid-value"));
    }
}
