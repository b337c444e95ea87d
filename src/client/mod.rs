use crate::config::{AbandonPolicy, ClientOptions, StartupPolicy};
use crate::dispatch::DispatchSink;
use crate::error::ClientError;
use crate::model::{Envelope, Payload};
use crate::transport::{self, Connector, Session, SessionEvent};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

mod calls;

const RESOLVED_ID_WINDOW: usize = 256;

/// Client half of the UI <-> background channel.
///
/// Owns at most one [`Session`] at a time. Requests are correlated to responses by
/// envelope id; inbound envelopes that answer nothing are classified and routed to the
/// [`DispatchSink`]. A disconnect retires the session and a replacement is opened
/// straight away on the same channel name.
///
/// After `init`, background tasks keep running until [`BackgroundClient::shutdown`].
#[derive(Clone)]
pub struct BackgroundClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    sink: DispatchSink,
    visibility: watch::Receiver<bool>,
    initialized: AtomicBool,
    state: Mutex<ClientState>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    generation: u64,
    pending: HashMap<String, oneshot::Sender<Envelope<Value>>>,
    resolved: ResolvedIds,
}

/// Recently answered ids, so a repeated response is dropped instead of being routed.
#[derive(Default)]
struct ResolvedIds {
    recent: VecDeque<String>,
}

impl ResolvedIds {
    fn record(&mut self, id: String) {
        if self.recent.len() == RESOLVED_ID_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
    }

    fn contains(&self, id: &str) -> bool {
        self.recent.iter().any(|seen| seen == id)
    }
}

/// One outstanding request. Resolves with the first envelope carrying its id.
/// Dropping it, including on timeout, frees its slot in the pending table.
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall {
    id: String,
    rx: Option<oneshot::Receiver<Envelope<Value>>>,
    policy: AbandonPolicy,
    timeout: Option<Duration>,
    owner: Weak<Inner>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn response(mut self) -> Result<Envelope<Value>, ClientError> {
        let rx = self
            .rx
            .take()
            .ok_or(ClientError::Protocol("response already awaited"))?;
        let id = self.id.as_str();
        let policy = self.policy;
        let wait = async move {
            match rx.await {
                Ok(envelope) => Ok(envelope),
                Err(_) => match policy {
                    AbandonPolicy::Cancel => Err(ClientError::SessionReplaced),
                    AbandonPolicy::Abandon => {
                        tracing::debug!(id = %id, "call abandoned with its session");
                        std::future::pending().await
                    }
                },
            }
        };
        let envelope = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ClientError::Timeout(limit))??,
            None => wait.await?,
        };
        if let Some(err) = envelope.remote_error() {
            return Err(ClientError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(envelope)
    }

    pub async fn payload(self) -> Result<Payload, ClientError> {
        let envelope = self.response().await?;
        Ok(envelope.decode_payload()?)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.state().pending.remove(&self.id);
        }
    }
}

impl BackgroundClient {
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        sink: DispatchSink,
        visibility: watch::Receiver<bool>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                sink,
                visibility,
                initialized: AtomicBool::new(false),
                state: Mutex::new(ClientState::default()),
                shutdown,
            }),
        }
    }

    /// Connects, reports app status, starts the status timer and loads the initial
    /// permission, transaction, keyring and feature state. Only valid once.
    ///
    /// The instance counts as initialized even when this fails. If the first connect
    /// fails no supervisor is started: later calls return `NotConnected`, a retry
    /// returns `AlreadyInitialized`, and the caller has to build a new client.
    pub async fn init(&self) -> Result<(), ClientError> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyInitialized);
        }

        let events = self.inner.connect_session().await?;
        tokio::spawn(supervise(
            self.inner.clone(),
            events,
            self.inner.shutdown.subscribe(),
        ));

        self.send_app_status()?;
        let _status_task = crate::status::spawn_status_reporter(
            self.clone(),
            self.inner.options.status_interval,
            self.inner.shutdown.subscribe(),
        );

        self.load_startup_state().await?;
        tracing::info!(channel = %self.inner.options.channel_name, "background client initialized");
        Ok(())
    }

    async fn load_startup_state(&self) -> Result<(), ClientError> {
        match self.inner.options.startup_policy {
            StartupPolicy::RequireAll => {
                tokio::try_join!(
                    self.fetch_into_store(Payload::GetPermissionRequests),
                    self.fetch_into_store(Payload::GetTransactionRequests),
                    self.fetch_into_store(calls::wallet_status_request()),
                    self.fetch_into_store(Payload::GetFeatures),
                )?;
            }
            StartupPolicy::BestEffort => {
                let (permissions, transactions, wallet, features) = tokio::join!(
                    self.fetch_into_store(Payload::GetPermissionRequests),
                    self.fetch_into_store(Payload::GetTransactionRequests),
                    self.fetch_into_store(calls::wallet_status_request()),
                    self.fetch_into_store(Payload::GetFeatures),
                );
                for (what, result) in [
                    ("permission requests", permissions),
                    ("transaction requests", transactions),
                    ("wallet status", wallet),
                    ("features", features),
                ] {
                    if let Err(err) = result {
                        tracing::warn!(what, error = %err, "startup fetch failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Startup responses feed the same routing as pushes.
    async fn fetch_into_store(&self, payload: Payload) -> Result<(), ClientError> {
        let requested = payload.type_name();
        let response = self.request(payload)?.payload().await?;
        if !self.inner.sink.route(&response) {
            tracing::warn!(
                requested,
                received = response.type_name(),
                "startup response carried no state"
            );
        }
        Ok(())
    }

    /// Sends `payload` and registers a pending call for its response.
    /// Fails immediately when no session is connected.
    pub fn request(&self, payload: Payload) -> Result<PendingCall, ClientError> {
        self.ensure_initialized()?;
        let payload_type = payload.type_name();
        let envelope = Envelope::new(payload).to_value()?;
        let id = envelope.id.clone();
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.state();
        let session = state
            .session
            .as_ref()
            .filter(|s| s.connected())
            .ok_or(ClientError::NotConnected)?;
        session.send(envelope)?;
        state.pending.insert(id.clone(), tx);
        tracing::trace!(id = %id, payload_type, "request sent");

        Ok(PendingCall {
            id,
            rx: Some(rx),
            policy: self.inner.options.abandon_policy,
            timeout: self.inner.options.request_timeout,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Sends `payload` without waiting for a reply.
    pub fn send(&self, payload: Payload) -> Result<(), ClientError> {
        self.ensure_initialized()?;
        let payload_type = payload.type_name();
        let envelope = Envelope::new(payload).to_value()?;
        let state = self.inner.state();
        let session = state
            .session
            .as_ref()
            .filter(|s| s.connected())
            .ok_or(ClientError::NotConnected)?;
        tracing::trace!(id = %envelope.id, payload_type, "message sent");
        session.send(envelope)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state()
            .session
            .as_ref()
            .map(Session::connected)
            .unwrap_or(false)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn sink(&self) -> &DispatchSink {
        &self.inner.sink
    }

    /// Stops the status timer and the reconnect loop and drops the session.
    ///
    /// Those tasks hold the client's shared state, so dropping every handle is not
    /// enough to stop them: call this before letting the client go.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn ensure_initialized(&self) -> Result<(), ClientError> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect_session(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, ClientError> {
        let channel = &self.options.channel_name;
        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            self.connector.connect(channel),
        )
        .await
        .map_err(|_| {
            ClientError::Connect(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
        })?
        .map_err(ClientError::Connect)?;

        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;
        let (session, events) =
            transport::open_session(stream, generation, self.options.max_frame_size);
        state.session = Some(session);
        tracing::info!(generation, channel = %channel, "connected to background service");
        Ok(events)
    }

    /// Drops the current session. Calls still waiting on it are abandoned.
    fn retire_session(&self) {
        let (generation, abandoned) = {
            let mut state = self.state();
            let generation = state.session.take().map(|session| {
                session.close();
                session.generation()
            });
            let abandoned = state.pending.len();
            state.pending.clear();
            (generation, abandoned)
        };
        if let Some(generation) = generation {
            tracing::info!(
                generation,
                abandoned,
                policy = ?self.options.abandon_policy,
                "background session retired"
            );
        }
    }

    fn handle_inbound(&self, envelope: Envelope<Value>) {
        let waiter = {
            let mut state = self.state();
            match state.pending.remove(&envelope.id) {
                Some(tx) => {
                    state.resolved.record(envelope.id.clone());
                    Some(tx)
                }
                None if state.resolved.contains(&envelope.id) => {
                    tracing::debug!(id = %envelope.id, "dropping duplicate response");
                    return;
                }
                None => None,
            }
        };

        match waiter {
            Some(tx) => {
                let id = envelope.id.clone();
                if tx.send(envelope).is_err() {
                    tracing::debug!(id = %id, "response arrived after caller stopped waiting");
                }
            }
            None => self.route_unsolicited(&envelope),
        }
    }

    fn route_unsolicited(&self, envelope: &Envelope<Value>) {
        match envelope.decode_payload() {
            Ok(payload) => {
                if !self.sink.route(&payload) {
                    tracing::debug!(
                        id = %envelope.id,
                        payload_type = payload.type_name(),
                        "dropping unrouted envelope"
                    );
                }
            }
            Err(err) => {
                tracing::debug!(id = %envelope.id, error = %err, "dropping unrecognized envelope");
            }
        }
    }

    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        let mut backoff = self.options.reconnect_initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connect_session().await {
                Ok(events) => {
                    tracing::info!(attempt, "reconnected to background service");
                    return Some(events);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, retry_in_ms = backoff.as_millis() as u64, "reconnect failed");
                }
            }
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return None,
                _ = tokio::time::sleep(with_jitter(backoff)) => {}
            }
            backoff = (backoff * 2).min(self.options.reconnect_max_backoff);
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Processes session events in arrival order and replaces the session on disconnect.
async fn supervise(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    inner.retire_session();
                    tracing::info!("background client shut down");
                    return;
                }
                event = events.recv() => event,
            };
            match event {
                Some(SessionEvent::Message(envelope)) => inner.handle_inbound(envelope),
                Some(SessionEvent::Disconnected) | None => break,
            }
        }

        tracing::warn!("background session disconnected");
        inner.retire_session();
        match inner.reconnect(&mut shutdown).await {
            Some(next) => events = next,
            None => {
                tracing::info!("background client shut down");
                return;
            }
        }
    }
}
