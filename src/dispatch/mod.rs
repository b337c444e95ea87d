use crate::model::{
    ActiveOrigin, FeatureSet, KeyringPayload, KeyringStatus, Payload, PermissionRequest,
    TransactionRequest,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum StateCommand {
    SetPermissions(Vec<PermissionRequest>),
    SetTransactionRequests(Vec<TransactionRequest>),
    SetActiveOrigin(ActiveOrigin),
    SetKeyringStatus(KeyringStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    State(StateCommand),
    Features(FeatureSet),
}

pub trait StateStore: Send + Sync {
    fn apply(&self, command: StateCommand);
}

pub trait FeatureService: Send + Sync {
    /// Replaces the active feature set.
    fn set_features(&self, features: FeatureSet);
    fn is_on(&self, feature: &str) -> bool;
}

/// Maps a payload to at most one state update, checked in this order:
/// permissions, transaction requests, active origin, keyring status, features.
pub fn classify(payload: &Payload) -> Option<Dispatch> {
    match payload {
        Payload::PermissionRequests { permissions } => Some(Dispatch::State(
            StateCommand::SetPermissions(permissions.clone()),
        )),
        Payload::GetTransactionRequestsResponse { tx_requests } => Some(Dispatch::State(
            StateCommand::SetTransactionRequests(tx_requests.clone()),
        )),
        Payload::UpdateActiveOrigin(origin) => Some(Dispatch::State(
            StateCommand::SetActiveOrigin(origin.clone()),
        )),
        Payload::Keyring(KeyringPayload::WalletStatusUpdate(call)) => call
            .result
            .clone()
            .map(|status| Dispatch::State(StateCommand::SetKeyringStatus(status))),
        Payload::LoadedFeatures { features } => Some(Dispatch::Features(features.clone())),
        _ => None,
    }
}

#[derive(Clone)]
pub struct DispatchSink {
    store: Arc<dyn StateStore>,
    features: Arc<dyn FeatureService>,
}

impl DispatchSink {
    pub fn new(store: Arc<dyn StateStore>, features: Arc<dyn FeatureService>) -> Self {
        Self { store, features }
    }

    pub fn dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::State(command) => self.store.apply(command),
            Dispatch::Features(features) => self.features.set_features(features),
        }
    }

    /// Classifies and applies; returns whether anything was dispatched.
    pub fn route(&self, payload: &Payload) -> bool {
        match classify(payload) {
            Some(dispatch) => {
                tracing::debug!(payload_type = payload.type_name(), "dispatching push");
                self.dispatch(dispatch);
                true
            }
            None => false,
        }
    }

    pub fn features(&self) -> &Arc<dyn FeatureService> {
        &self.features
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppState {
    pub permissions: Vec<PermissionRequest>,
    pub transaction_requests: Vec<TransactionRequest>,
    pub active_origin: ActiveOrigin,
    pub keyring_status: KeyringStatus,
}

/// Store backed by a `watch` channel so readers can await changes.
pub struct InMemoryStore {
    tx: watch::Sender<AppState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AppState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> AppState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStore {
    fn apply(&self, command: StateCommand) {
        self.tx.send_modify(|state| match command {
            StateCommand::SetPermissions(list) => state.permissions = list,
            StateCommand::SetTransactionRequests(list) => state.transaction_requests = list,
            StateCommand::SetActiveOrigin(origin) => state.active_origin = origin,
            StateCommand::SetKeyringStatus(status) => state.keyring_status = status,
        });
    }
}

/// Feature flags in the `{ name: { defaultValue, .. } }` shape; a bare value also counts.
#[derive(Default)]
pub struct FeatureFlags {
    features: RwLock<FeatureSet>,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        let features = self.features.read().unwrap_or_else(PoisonError::into_inner);
        features.keys().cloned().collect()
    }
}

impl FeatureService for FeatureFlags {
    fn set_features(&self, features: FeatureSet) {
        let mut current = self.features.write().unwrap_or_else(PoisonError::into_inner);
        *current = features;
    }

    fn is_on(&self, feature: &str) -> bool {
        let features = self.features.read().unwrap_or_else(PoisonError::into_inner);
        let value = match features.get(feature) {
            Some(Value::Object(def)) => def.get("defaultValue").cloned().unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => return false,
        };
        truthy(&value)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
