use super::BackgroundClient;
use crate::error::ClientError;
use crate::model::{
    AppStatusArgs, CreateArgs, FeatureSet, KeyringCall, KeyringPayload, KeyringStatus,
    LockTimeoutArgs, PasswordArgs, Payload, PermissionRequest, SignDataArgs, TransactionRequest,
};
use crate::signature::SignedData;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

pub(super) fn wallet_status_request() -> Payload {
    Payload::Keyring(KeyringPayload::WalletStatusUpdate(KeyringCall::bare()))
}

fn unexpected(payload: &Payload) -> ClientError {
    ClientError::UnexpectedResponse(payload.type_name().to_string())
}

impl BackgroundClient {
    pub fn send_permission_response(
        &self,
        id: impl Into<String>,
        accounts: Vec<String>,
        allowed: bool,
        response_date: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(Payload::PermissionResponse {
            id: id.into(),
            accounts,
            allowed,
            response_date: response_date.into(),
        })
    }

    pub async fn get_permission_requests(&self) -> Result<Vec<PermissionRequest>, ClientError> {
        match self.request(Payload::GetPermissionRequests)?.payload().await? {
            Payload::PermissionRequests { permissions } => Ok(permissions),
            other => Err(unexpected(&other)),
        }
    }

    pub fn send_transaction_request_response(
        &self,
        tx_id: impl Into<String>,
        approved: bool,
        tx_result: Option<Value>,
        tx_result_error: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(Payload::TransactionRequestResponse {
            tx_id: tx_id.into(),
            approved,
            tx_result,
            tx_result_error,
        })
    }

    pub async fn get_transaction_requests(&self) -> Result<Vec<TransactionRequest>, ClientError> {
        match self.request(Payload::GetTransactionRequests)?.payload().await? {
            Payload::GetTransactionRequestsResponse { tx_requests } => Ok(tx_requests),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn disconnect_app(&self, origin: impl Into<String>) -> Result<(), ClientError> {
        self.request(Payload::DisconnectApp {
            origin: origin.into(),
        })?
        .response()
        .await?;
        Ok(())
    }

    pub async fn create_vault(
        &self,
        password: impl Into<String>,
        imported_entropy: Option<String>,
    ) -> Result<(), ClientError> {
        self.keyring(KeyringPayload::Create(KeyringCall::request(CreateArgs {
            password: password.into(),
            imported_entropy,
        })))
        .await
    }

    pub async fn unlock_wallet(&self, password: impl Into<String>) -> Result<(), ClientError> {
        self.keyring(KeyringPayload::Unlock(KeyringCall::request(PasswordArgs {
            password: password.into(),
        })))
        .await
    }

    pub async fn lock_wallet(&self) -> Result<(), ClientError> {
        self.keyring(KeyringPayload::Lock(KeyringCall::bare())).await
    }

    pub async fn clear_wallet(&self) -> Result<(), ClientError> {
        self.keyring(KeyringPayload::Clear(KeyringCall::bare())).await
    }

    /// Minutes of inactivity before the background locks the keyring.
    pub async fn set_keyring_lock_timeout(&self, timeout: u64) -> Result<(), ClientError> {
        self.keyring(KeyringPayload::SetLockTimeout(KeyringCall::request(
            LockTimeoutArgs { timeout },
        )))
        .await
    }

    pub async fn get_entropy(&self, password: Option<String>) -> Result<String, ClientError> {
        let call = KeyringCall {
            args: password,
            result: None,
        };
        let envelope = self
            .request(Payload::Keyring(KeyringPayload::GetEntropy(call)))?
            .response()
            .await?;
        match envelope.decode_payload() {
            Ok(Payload::Keyring(KeyringPayload::GetEntropy(KeyringCall {
                result: Some(entropy),
                ..
            }))) => Ok(entropy),
            _ => Err(ClientError::Protocol("mnemonic not found")),
        }
    }

    pub async fn sign_data(&self, address: &str, data: &[u8]) -> Result<SignedData, ClientError> {
        let args = SignDataArgs {
            data: BASE64.encode(data),
            address: address.to_string(),
        };
        let envelope = self
            .request(Payload::Keyring(KeyringPayload::SignData(KeyringCall::request(args))))?
            .response()
            .await?;
        match envelope.decode_payload() {
            Ok(Payload::Keyring(KeyringPayload::SignData(KeyringCall {
                result: Some(raw),
                ..
            }))) => Ok(SignedData::from_serialized(&raw)?),
            _ => Err(ClientError::Protocol("unknown response")),
        }
    }

    pub async fn get_wallet_status(&self) -> Result<KeyringStatus, ClientError> {
        match self.request(wallet_status_request())?.payload().await? {
            Payload::Keyring(KeyringPayload::WalletStatusUpdate(KeyringCall {
                result: Some(status),
                ..
            })) => Ok(status),
            Payload::Keyring(KeyringPayload::WalletStatusUpdate(_)) => {
                Err(ClientError::Protocol("unknown response"))
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn load_features(&self) -> Result<FeatureSet, ClientError> {
        match self.request(Payload::GetFeatures)?.payload().await? {
            Payload::LoadedFeatures { features } => Ok(features),
            other => Err(unexpected(&other)),
        }
    }

    /// Tells the background whether the UI is in view, so it can hold off auto-lock.
    pub fn send_app_status(&self) -> Result<(), ClientError> {
        let active = *self.inner.visibility.borrow();
        self.send(Payload::Keyring(KeyringPayload::AppStatusUpdate(
            KeyringCall::request(AppStatusArgs { active }),
        )))
    }

    async fn keyring(&self, payload: KeyringPayload) -> Result<(), ClientError> {
        let method = payload.method_name();
        self.request(Payload::Keyring(payload))?.response().await?;
        tracing::debug!(method, "keyring call acknowledged");
        Ok(())
    }
}
