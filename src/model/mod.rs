use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque permission request record as held by the background service.
pub type PermissionRequest = Value;
/// Opaque transaction request record as held by the background service.
pub type TransactionRequest = Value;
/// Feature definitions keyed by feature name.
pub type FeatureSet = serde_json::Map<String, Value>;

/// Unit of exchange on the channel. A response reuses the id of its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_value(&self) -> Result<Envelope<Value>, serde_json::Error> {
        Ok(Envelope {
            id: self.id.clone(),
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

impl Envelope<Value> {
    pub fn decode_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Error replies carry `error: true` instead of a typed payload.
    pub fn remote_error(&self) -> Option<RemoteError> {
        if self.payload.get("error").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        Some(RemoteError {
            code: self.payload.get("code").and_then(Value::as_i64),
            message: self
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    GetPermissionRequests,
    PermissionRequests {
        permissions: Vec<PermissionRequest>,
    },
    PermissionResponse {
        id: String,
        accounts: Vec<String>,
        allowed: bool,
        #[serde(rename = "responseDate")]
        response_date: String,
    },
    GetTransactionRequests,
    GetTransactionRequestsResponse {
        #[serde(rename = "txRequests")]
        tx_requests: Vec<TransactionRequest>,
    },
    TransactionRequestResponse {
        #[serde(rename = "txID")]
        tx_id: String,
        approved: bool,
        #[serde(rename = "txResult", default, skip_serializing_if = "Option::is_none")]
        tx_result: Option<Value>,
        #[serde(
            rename = "txResultError",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        tx_result_error: Option<String>,
    },
    UpdateActiveOrigin(ActiveOrigin),
    DisconnectApp {
        origin: String,
    },
    GetFeatures,
    LoadedFeatures {
        features: FeatureSet,
    },
    Done,
    Keyring(KeyringPayload),
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GetPermissionRequests => "get-permission-requests",
            Self::PermissionRequests { .. } => "permission-requests",
            Self::PermissionResponse { .. } => "permission-response",
            Self::GetTransactionRequests => "get-transaction-requests",
            Self::GetTransactionRequestsResponse { .. } => "get-transaction-requests-response",
            Self::TransactionRequestResponse { .. } => "transaction-request-response",
            Self::UpdateActiveOrigin(_) => "update-active-origin",
            Self::DisconnectApp { .. } => "disconnect-app",
            Self::GetFeatures => "get-features",
            Self::LoadedFeatures { .. } => "loaded-features",
            Self::Done => "done",
            Self::Keyring(_) => "keyring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveOrigin {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(rename = "favIcon", default)]
    pub fav_icon: Option<String>,
}

/// Keyring operations share one envelope type and are told apart by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum KeyringPayload {
    Create(KeyringCall<CreateArgs, Value>),
    Unlock(KeyringCall<PasswordArgs, Value>),
    Lock(KeyringCall<Value, Value>),
    Clear(KeyringCall<Value, Value>),
    GetEntropy(KeyringCall<String, String>),
    SetLockTimeout(KeyringCall<LockTimeoutArgs, Value>),
    SignData(KeyringCall<SignDataArgs, SerializedSignature>),
    AppStatusUpdate(KeyringCall<AppStatusArgs, Value>),
    WalletStatusUpdate(KeyringCall<Value, KeyringStatus>),
}

impl KeyringPayload {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Unlock(_) => "unlock",
            Self::Lock(_) => "lock",
            Self::Clear(_) => "clear",
            Self::GetEntropy(_) => "getEntropy",
            Self::SetLockTimeout(_) => "setLockTimeout",
            Self::SignData(_) => "signData",
            Self::AppStatusUpdate(_) => "appStatusUpdate",
            Self::WalletStatusUpdate(_) => "walletStatusUpdate",
        }
    }
}

/// `args` travel on requests, `return` on responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyringCall<A, R> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<A>,
    #[serde(rename = "return", skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
}

impl<A, R> KeyringCall<A, R> {
    pub fn request(args: A) -> Self {
        Self {
            args: Some(args),
            result: None,
        }
    }

    pub fn bare() -> Self {
        Self {
            args: None,
            result: None,
        }
    }

    pub fn response(result: R) -> Self {
        Self {
            args: None,
            result: Some(result),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateArgs {
    pub password: String,
    #[serde(
        rename = "importedEntropy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub imported_entropy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordArgs {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTimeoutArgs {
    /// Minutes of inactivity before the background locks the keyring.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignDataArgs {
    /// Base64 of the bytes to sign.
    pub data: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatusArgs {
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyringStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_initialized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_address: Option<String>,
}

/// Signing result as produced by the background: base64 fields plus scheme name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSignature {
    pub signature_scheme: String,
    pub signature: String,
    pub pub_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_payloads_use_kebab_case_type_tags() {
        let value = serde_json::to_value(Payload::GetPermissionRequests).unwrap();
        assert_eq!(value, json!({ "type": "get-permission-requests" }));

        let value = serde_json::to_value(Payload::TransactionRequestResponse {
            tx_id: "tx-1".to_string(),
            approved: false,
            tx_result: None,
            tx_result_error: Some("rejected".to_string()),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "transaction-request-response",
                "txID": "tx-1",
                "approved": false,
                "txResultError": "rejected",
            })
        );
    }

    #[test]
    fn keyring_payload_carries_type_and_method() {
        let payload = Payload::Keyring(KeyringPayload::AppStatusUpdate(KeyringCall::request(
            AppStatusArgs { active: true },
        )));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({ "type": "keyring", "method": "appStatusUpdate", "args": { "active": true } })
        );
        let decoded: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn wallet_status_response_decodes_return_value() {
        let env = Envelope::with_id(
            "abc",
            json!({
                "type": "keyring",
                "method": "walletStatusUpdate",
                "return": { "isLocked": true, "isInitialized": true },
            }),
        );
        match env.decode_payload().unwrap() {
            Payload::Keyring(KeyringPayload::WalletStatusUpdate(call)) => {
                let status = call.result.expect("return value");
                assert_eq!(status.is_locked, Some(true));
                assert_eq!(status.is_initialized, Some(true));
                assert!(status.active_address.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn keyring_requests_and_responses_decode_from_json() {
        let create = Envelope::with_id(
            "c1",
            json!({
                "type": "keyring",
                "method": "create",
                "args": { "password": "pw", "importedEntropy": "abcd" },
            }),
        );
        assert_eq!(
            create.decode_payload().unwrap(),
            Payload::Keyring(KeyringPayload::Create(KeyringCall::request(CreateArgs {
                password: "pw".to_string(),
                imported_entropy: Some("abcd".to_string()),
            })))
        );

        let signed = Envelope::with_id(
            "s1",
            json!({
                "type": "keyring",
                "method": "signData",
                "return": { "signatureScheme": "ED25519", "signature": "AQI=", "pubKey": "AwQ=" },
            }),
        );
        match signed.decode_payload().unwrap() {
            Payload::Keyring(KeyringPayload::SignData(call)) => {
                assert!(call.args.is_none());
                let raw = call.result.expect("return value");
                assert_eq!(raw.signature_scheme, "ED25519");
                assert_eq!(raw.pub_key, "AwQ=");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let unlock = Envelope::with_id("u1", json!({ "type": "keyring", "method": "unlock" }));
        assert_eq!(
            unlock.decode_payload().unwrap(),
            Payload::Keyring(KeyringPayload::Unlock(KeyringCall::bare()))
        );
    }

    #[test]
    fn unit_variants_tolerate_extra_fields() {
        let env = Envelope::with_id("x", json!({ "type": "done", "extra": 1 }));
        assert_eq!(env.decode_payload().unwrap(), Payload::Done);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let env = Envelope::with_id("x", json!({ "type": "something-else" }));
        assert!(env.decode_payload().is_err());
    }

    #[test]
    fn error_reply_is_detected() {
        let env = Envelope::with_id(
            "x",
            json!({ "error": true, "code": -1, "message": "Wrong password" }),
        );
        let err = env.remote_error().unwrap();
        assert_eq!(err.code, Some(-1));
        assert_eq!(err.message, "Wrong password");

        let ok = Envelope::with_id("y", json!({ "type": "done" }));
        assert!(ok.remote_error().is_none());
    }

    #[test]
    fn fresh_envelopes_get_distinct_ids() {
        let a = Envelope::new(Payload::GetFeatures);
        let b = Envelope::new(Payload::GetFeatures);
        assert_ne!(a.id, b.id);
    }
}
