//! Periodic rotation of the short-lived `__Secure-1PSIDTS` cookie.

use super::{CookieStore, Credentials};
use crate::constants::{rotate_cookies_headers, Endpoint, ROTATE_COOKIES_BODY, ROTATION_TOKEN_COOKIE};
use crate::error::{GeminiError, Result};
use crate::transport::{HttpRequest, Method, RequestBody, Transport};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The rotation endpoint is never hit more often than this.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

const ERROR_EXCERPT_LIMIT: usize = 4096;

pub type ErrorCallback = Arc<dyn Fn(&GeminiError) + Send + Sync>;

/// Serialises calls to the rotation endpoint and enforces the minimum interval.
///
/// Every controller that should share the limit must share the gate.
/// [`RotationGate::shared`] is the process-wide instance used by default;
/// tests build their own to stay hermetic.
pub struct RotationGate {
    last_attempt: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl Default for RotationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationGate {
    pub fn new() -> Self {
        Self::with_min_interval(MIN_ROTATION_INTERVAL)
    }

    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self {
            last_attempt: Mutex::new(None),
            min_interval,
        }
    }

    /// Process-wide gate. Lives for the rest of the process once created.
    pub fn shared() -> Arc<RotationGate> {
        static SHARED: OnceLock<Arc<RotationGate>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(RotationGate::new())))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn since_last_attempt(&self) -> Option<Duration> {
        self.last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed())
    }

    /// Exchanges the session id for a fresh rotation token.
    ///
    /// Returns `Ok(None)` without touching the network when the previous
    /// attempt is younger than the minimum interval, or when the server
    /// answered 200 without setting a new token. The mutex is held for the
    /// whole exchange so concurrent callers queue behind it.
    pub fn rotate(
        &self,
        transport: &dyn Transport,
        credentials: &Credentials,
    ) -> Result<Option<String>> {
        let mut last_attempt = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(at) = *last_attempt {
            if at.elapsed() < self.min_interval {
                tracing::debug!(elapsed = ?at.elapsed(), "skipping cookie rotation");
                return Ok(None);
            }
        }
        *last_attempt = Some(Instant::now());

        let endpoint = Endpoint::RotateCookies;
        let request = HttpRequest::new(Method::Post, endpoint.url())
            .with_headers(rotate_cookies_headers())
            .with_body(RequestBody::Text(ROTATE_COOKIES_BODY.to_string()))
            .with_cookies(credentials.cookies());
        let mut response = transport
            .execute(request)
            .map_err(|err| GeminiError::network(endpoint.name(), err))?;

        match response.status {
            200 => Ok(response.cookie(ROTATION_TOKEN_COOKIE).map(str::to_string)),
            401 => Err(GeminiError::Auth(
                "cookie rotation rejected with status 401".to_string(),
            )),
            status => Err(GeminiError::Api {
                endpoint: endpoint.name().to_string(),
                status,
                excerpt: response.excerpt(ERROR_EXCERPT_LIMIT),
            }),
        }
    }
}

/// Everything the rotation loop needs, captured before the thread is spawned.
#[derive(Clone)]
pub struct RotationContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<CookieStore>,
    pub gate: Arc<RotationGate>,
    pub interval: Duration,
    pub on_error: Option<ErrorCallback>,
}

impl RotationContext {
    /// Runs one rotation attempt, applying the new token or reporting the error.
    pub fn rotate_once(&self) -> Option<String> {
        let credentials = self.store.snapshot();
        match self.gate.rotate(self.transport.as_ref(), &credentials) {
            Ok(Some(token)) => {
                self.store.update_rotation_token(&token);
                tracing::info!("rotated session cookie");
                Some(token)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("cookie rotation failed: {err}");
                if let Some(callback) = &self.on_error {
                    callback(&err);
                }
                None
            }
        }
    }
}

#[derive(Default)]
struct RotatorState {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Background ticker driving [`RotationContext::rotate_once`].
#[derive(Default)]
pub struct Rotator {
    state: Mutex<RotatorState>,
}

impl Rotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the loop; returns false if it was already running.
    pub fn start(&self, context: RotationContext) -> bool {
        let mut state = self.lock();
        if state.stop.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = context.interval;
        let spawned = thread::Builder::new()
            .name("gemini-cookie-rotator".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        context.rotate_once();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => {
                state.stop = Some(stop_tx);
                state.handle = Some(handle);
                tracing::debug!(?interval, "cookie rotator started");
                true
            }
            Err(err) => {
                tracing::warn!("failed to spawn cookie rotator: {err}");
                false
            }
        }
    }

    /// Signals the loop to exit; returns false if it was not running.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        let Some(stop) = state.stop.take() else {
            return false;
        };
        drop(stop);
        state.handle.take();
        tracing::debug!("cookie rotator stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().stop.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RotatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Rotator {
    fn drop(&mut self) {
        self.stop();
    }
}
