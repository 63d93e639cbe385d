//! The session controller.
//!
//! [`Client`] owns the cookie store, the access token and the background
//! machinery (cookie rotator, idle timer). Every public network operation
//! leases its session under the same state lock that saw the client running,
//! re-initialising a closed client first when `auto_reinit` is on.

mod chat;
mod gems;
mod generate;
mod idle;
mod upload;

pub use chat::ChatSession;
pub use gems::{create_gem_payload, delete_gem_payload, parse_gem_list, update_gem_payload};
pub use generate::{build_f_req, parse_model_output, GenerateOptions, PromptPayload};
pub use upload::{
    classify_mime, guess_mime_type, parse_upload_response, FileClass, FILE_SIZE_LIMIT,
    IMAGE_SIZE_LIMIT,
};

use crate::auth::{
    fetch_access_token, BrowserCookieExtractor, CookieLoader, CookieStore, Credentials,
    ErrorCallback, PersistenceCallback, RotationContext, Rotator,
};
use crate::config::ClientConfig;
use crate::constants::Model;
use crate::error::{GeminiError, Result};
use crate::rpc::{self, BatchContext, RequestCounter, RpcCall, RpcReply};
use crate::transport::{CancelToken, ReqwestTransport, Transport, TransportOptions};
use crate::types::{GemJar, ModelOutput};
use idle::IdleTimer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

/// Minimum spacing between user-triggered browser refreshes.
pub const MIN_BROWSER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_BROWSER: &str = "chrome";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Initialising,
    Running,
    Closed,
}

struct ClientState {
    phase: Phase,
    cookies: Option<Arc<CookieStore>>,
    access_token: Option<String>,
    model: Model,
    idle: Option<IdleTimer>,
    gems: Option<GemJar>,
    last_browser_refresh: Option<Instant>,
}

struct Shared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    initial_credentials: Option<Credentials>,
    cookie_loader: Option<Arc<dyn CookieLoader>>,
    browser_extractor: Option<Arc<dyn BrowserCookieExtractor>>,
    persistence: Option<PersistenceCallback>,
    on_error: Option<ErrorCallback>,
    rotator: Rotator,
    reqid: RequestCounter,
    idle_generation: AtomicU64,
    init_lock: Mutex<()>,
    state: RwLock<ClientState>,
}

/// Authenticated state copied out of the controller for one request.
pub(crate) struct Session {
    pub transport: Arc<dyn Transport>,
    pub credentials: Credentials,
    pub access_token: String,
    pub model: Model,
    pub reqid: u64,
}

impl Session {
    pub(crate) fn batch_context<'a>(&'a self, cancel: Option<&'a CancelToken>) -> BatchContext<'a> {
        BatchContext {
            transport: self.transport.as_ref(),
            credentials: &self.credentials,
            access_token: &self.access_token,
            model: self.model,
            reqid: self.reqid,
            cancel,
        }
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Credentials>,
    cookie_loader: Option<Arc<dyn CookieLoader>>,
    browser_extractor: Option<Arc<dyn BrowserCookieExtractor>>,
    persistence: Option<PersistenceCallback>,
    on_error: Option<ErrorCallback>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Used at init when no credentials were supplied.
    pub fn cookie_loader(mut self, loader: Arc<dyn CookieLoader>) -> Self {
        self.cookie_loader = Some(loader);
        self
    }

    pub fn browser_extractor(mut self, extractor: Arc<dyn BrowserCookieExtractor>) -> Self {
        self.browser_extractor = Some(extractor);
        self
    }

    /// Called after every successful rotation or browser refresh.
    pub fn persistence(mut self, callback: PersistenceCallback) -> Self {
        self.persistence = Some(callback);
        self
    }

    /// Receives background rotation failures.
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn build(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(TransportOptions::default())
                    .map_err(|err| GeminiError::network("transport", err))?,
            ),
        };
        let model = self.config.model;
        Ok(Client {
            shared: Arc::new(Shared {
                config: self.config,
                transport,
                initial_credentials: self.credentials,
                cookie_loader: self.cookie_loader,
                browser_extractor: self.browser_extractor,
                persistence: self.persistence,
                on_error: self.on_error,
                rotator: Rotator::new(),
                reqid: RequestCounter::new(),
                idle_generation: AtomicU64::new(0),
                init_lock: Mutex::new(()),
                state: RwLock::new(ClientState {
                    phase: Phase::Fresh,
                    cookies: None,
                    access_token: None,
                    model,
                    idle: None,
                    gems: None,
                    last_browser_refresh: None,
                }),
            }),
        })
    }
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Client over the default transport with explicit cookies.
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::builder().credentials(credentials).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> Phase {
        self.read_state().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_state().access_token.clone()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.read_state().cookies.as_ref().map(|store| store.snapshot())
    }

    pub fn model(&self) -> Model {
        self.read_state().model
    }

    pub fn set_model(&self, model: Model) {
        self.write_state().model = model;
    }

    pub fn is_rotating(&self) -> bool {
        self.shared.rotator.is_running()
    }

    /// Bootstraps cookies and the access token, then starts the background tasks.
    ///
    /// Concurrent calls are serialised; a call that finds the client already
    /// running returns immediately.
    pub fn init(&self) -> Result<()> {
        self.init_inner(false, None).map(drop)
    }

    /// With `lease`, also hands back a session taken under the lock that saw the client running.
    fn init_inner(&self, lease: bool, cancel: Option<&CancelToken>) -> Result<Option<Session>> {
        let _init = self
            .shared
            .init_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = {
            let mut state = self.write_state();
            match state.phase {
                Phase::Running if lease => return self.lease_locked(&mut state).map(Some),
                Phase::Running => return Ok(None),
                Phase::Closed if !self.shared.config.auto_reinit => {
                    return Err(GeminiError::AutoReinitDisabled)
                }
                _ => {}
            }
            let previous = state.phase;
            state.phase = Phase::Initialising;
            previous
        };

        match self.bootstrap(cancel) {
            Ok((store, token)) => self.commit_init(store, token, lease),
            Err(err) => {
                let mut state = self.write_state();
                if state.phase == Phase::Initialising {
                    state.phase = previous;
                }
                tracing::warn!("client init failed: {err}");
                Err(err)
            }
        }
    }

    fn bootstrap(&self, cancel: Option<&CancelToken>) -> Result<(Arc<CookieStore>, String)> {
        let existing = self.read_state().cookies.clone();
        let store = match existing {
            Some(store) => store,
            None => Arc::new(CookieStore::with_persistence(
                self.load_credentials(cancel)?,
                self.shared.persistence.clone(),
            )),
        };

        let transport = self.shared.transport.as_ref();
        match fetch_access_token(transport, &store.snapshot()) {
            Ok(token) => Ok((store, token)),
            Err(err) if err.is_auth() && self.shared.browser_extractor.is_some() => {
                tracing::warn!("access token fetch failed ({err}); retrying with browser cookies");
                let credentials = self.extract_from_browser(cancel)?;
                store.replace(credentials.clone());
                self.write_state().last_browser_refresh = Some(Instant::now());
                let token = fetch_access_token(transport, &credentials)?;
                Ok((store, token))
            }
            Err(err) => Err(err),
        }
    }

    fn load_credentials(&self, cancel: Option<&CancelToken>) -> Result<Credentials> {
        if let Some(credentials) = &self.shared.initial_credentials {
            return Ok(credentials.clone());
        }
        let loaded = match &self.shared.cookie_loader {
            Some(loader) => loader.load(),
            None => Err(GeminiError::Auth(
                "no credentials supplied and no cookie loader configured".to_string(),
            )),
        };
        match loaded {
            Ok(credentials) => Ok(credentials),
            Err(err) if self.shared.browser_extractor.is_some() => {
                tracing::info!("cookie loader failed ({err}); extracting cookies from browser");
                let credentials = self.extract_from_browser(cancel)?;
                self.write_state().last_browser_refresh = Some(Instant::now());
                Ok(credentials)
            }
            Err(err) => Err(err),
        }
    }

    fn extract_from_browser(&self, cancel: Option<&CancelToken>) -> Result<Credentials> {
        let extractor = self
            .shared
            .browser_extractor
            .as_ref()
            .ok_or_else(|| GeminiError::Auth("no browser cookie extractor configured".to_string()))?;
        let browser = self
            .shared
            .config
            .browser
            .as_deref()
            .unwrap_or(DEFAULT_BROWSER);
        match cancel {
            Some(cancel) => extractor.extract(cancel, browser),
            None => extractor.extract(&CancelToken::new(), browser),
        }
    }

    fn commit_init(
        &self,
        store: Arc<CookieStore>,
        token: String,
        lease: bool,
    ) -> Result<Option<Session>> {
        let mut state = self.write_state();
        if state.phase != Phase::Initialising {
            // Closed while bootstrapping.
            return Err(GeminiError::ClientClosed);
        }
        state.cookies = Some(Arc::clone(&store));
        state.access_token = Some(token);
        state.phase = Phase::Running;

        let config = &self.shared.config;
        if config.auto_refresh {
            self.shared.rotator.start(RotationContext {
                transport: Arc::clone(&self.shared.transport),
                store,
                gate: Arc::clone(&config.rotation_gate),
                interval: config.refresh_interval,
                on_error: self.shared.on_error.clone(),
            });
        }
        if config.auto_close {
            self.arm_idle_timer(&mut state);
        }
        tracing::info!(model = %state.model, "client initialised");
        if lease {
            self.snapshot_locked(&state).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Stops the rotator and idle timer and marks the client closed. Idempotent.
    pub fn close(&self) {
        let mut state = self.write_state();
        self.close_locked(&mut state);
    }

    fn close_locked(&self, state: &mut ClientState) {
        self.shared.rotator.stop();
        state.idle = None;
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closed;
        state.access_token = None;
        state.gems = None;
        tracing::info!("client closed");
    }

    /// Initialises a client that is not running, subject to `auto_reinit`.
    pub fn ensure_running(&self) -> Result<()> {
        let phase = self.phase();
        if phase == Phase::Running {
            return Ok(());
        }
        self.check_reinit(phase)?;
        tracing::debug!(?phase, "client not running; initialising");
        self.init()
    }

    fn check_reinit(&self, phase: Phase) -> Result<()> {
        match phase {
            Phase::Fresh if !self.shared.config.auto_reinit => Err(GeminiError::ClientClosed),
            Phase::Closed if !self.shared.config.auto_reinit => {
                Err(GeminiError::AutoReinitDisabled)
            }
            _ => Ok(()),
        }
    }

    /// Entry point of every network operation: a running client's session, with the idle
    /// deadline pushed back.
    ///
    /// A close that lands while re-initialising is retried while `auto_reinit` allows it, so
    /// callers see either a session or a policy error.
    pub(crate) fn running_session(&self, cancel: Option<&CancelToken>) -> Result<Session> {
        loop {
            let phase = {
                let mut state = self.write_state();
                if state.phase == Phase::Running {
                    return self.lease_locked(&mut state);
                }
                state.phase
            };
            self.check_reinit(phase)?;
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(GeminiError::Cancelled);
            }
            tracing::debug!(?phase, "client not running; initialising");
            match self.init_inner(true, cancel) {
                Ok(Some(session)) => return Ok(session),
                Ok(None) | Err(GeminiError::ClientClosed) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn lease_locked(&self, state: &mut ClientState) -> Result<Session> {
        if self.shared.config.auto_close {
            self.arm_idle_timer(state);
        }
        self.snapshot_locked(state)
    }

    /// Pushes the idle deadline back by `close_delay`.
    pub fn reset_idle_timer(&self) {
        if !self.shared.config.auto_close {
            return;
        }
        let mut state = self.write_state();
        if state.phase == Phase::Running {
            self.arm_idle_timer(&mut state);
        }
    }

    fn arm_idle_timer(&self, state: &mut ClientState) {
        // Dropping the old timer closes its stop channel before the new one exists.
        state.idle = None;
        let generation = self.shared.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        state.idle = IdleTimer::spawn(generation, self.shared.config.close_delay, move |fired| {
            if let Some(shared) = weak.upgrade() {
                Client { shared }.expire_idle(fired);
            }
        });
    }

    fn expire_idle(&self, generation: u64) {
        let mut state = self.write_state();
        let current = state.idle.as_ref().map(IdleTimer::generation);
        if current == Some(generation) {
            tracing::info!("closing idle client");
            self.close_locked(&mut state);
        }
    }

    fn snapshot_locked(&self, state: &ClientState) -> Result<Session> {
        if state.phase != Phase::Running {
            return Err(GeminiError::ClientClosed);
        }
        let (Some(store), Some(token)) = (&state.cookies, &state.access_token) else {
            return Err(GeminiError::ClientClosed);
        };
        Ok(Session {
            transport: Arc::clone(&self.shared.transport),
            credentials: store.snapshot(),
            access_token: token.clone(),
            model: state.model,
            reqid: self.shared.reqid.next(),
        })
    }

    /// True when a failed generate may be retried once after a browser refresh.
    pub fn browser_refresh_armed(&self) -> bool {
        self.shared.browser_extractor.is_some() && self.shared.config.browser.is_some()
    }

    /// Re-extracts cookies from the configured browser and fetches a new access token.
    ///
    /// Refused with [`GeminiError::RefreshTooSoon`] within a minute of the previous attempt.
    pub fn refresh_from_browser(&self) -> Result<()> {
        self.refresh_from_browser_with(None)
    }

    fn refresh_from_browser_with(&self, cancel: Option<&CancelToken>) -> Result<()> {
        if self.shared.browser_extractor.is_none() {
            return Err(GeminiError::Auth(
                "browser refresh is not configured".to_string(),
            ));
        }
        self.ensure_running()?;
        {
            let mut state = self.write_state();
            if let Some(last) = state.last_browser_refresh {
                let elapsed = last.elapsed();
                if elapsed < MIN_BROWSER_REFRESH_INTERVAL {
                    return Err(GeminiError::RefreshTooSoon {
                        wait: MIN_BROWSER_REFRESH_INTERVAL - elapsed,
                    });
                }
            }
            state.last_browser_refresh = Some(Instant::now());
        }

        let credentials = self.extract_from_browser(cancel)?;
        let token = fetch_access_token(self.shared.transport.as_ref(), &credentials)?;

        let mut state = self.write_state();
        match &state.cookies {
            Some(store) => store.replace(credentials),
            None => {
                if let Some(callback) = &self.shared.persistence {
                    callback(&credentials);
                }
                state.cookies = Some(Arc::new(CookieStore::with_persistence(
                    credentials,
                    self.shared.persistence.clone(),
                )));
            }
        }
        if state.phase == Phase::Running {
            state.access_token = Some(token);
        }
        tracing::info!("refreshed cookies from browser");
        Ok(())
    }

    /// Sends a prompt and parses the reply.
    ///
    /// An authentication failure is retried exactly once after a browser
    /// refresh when one is armed; any other error is returned as is.
    pub fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<ModelOutput> {
        match self.generate_once(prompt, &options) {
            Err(err) if err.is_auth() && self.browser_refresh_armed() => {
                tracing::warn!("generate failed with {err}; refreshing cookies from browser");
                let refreshed = self.refresh_from_browser_with(options.cancel.as_ref());
                if let Err(refresh_err) = refreshed {
                    tracing::warn!("browser refresh failed: {refresh_err}");
                    return Err(err);
                }
                self.generate_once(prompt, &options)
            }
            result => result,
        }
    }

    fn generate_once(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelOutput> {
        if prompt.is_empty() {
            return Err(GeminiError::InvalidArgument(
                "prompt must not be empty".to_string(),
            ));
        }
        let session = self.running_session(options.cancel.as_ref())?;
        generate::send(&session, prompt, options)
    }

    pub fn start_chat(&self) -> ChatSession {
        ChatSession::new(self.clone())
    }

    /// Posts a batch to the batch-execute endpoint; one reply per call, in order.
    pub fn batch_execute(&self, calls: &[RpcCall]) -> Result<Vec<RpcReply>> {
        rpc::validate_batch(calls)?;
        let session = self.running_session(None)?;
        rpc::batch_execute(&session.batch_context(None), calls)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ClientState> {
        self.shared
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ClientState> {
        self.shared
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("phase", &self.phase())
            .field("model", &self.model())
            .finish_non_exhaustive()
    }
}
