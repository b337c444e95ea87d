//! Developer stand-in for the background process. Listens on the channel socket, answers
//! every request with canned data and pushes an active-origin change every few seconds.

#[cfg(unix)]
mod stub {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::{json, Map, Value};
    use std::io;
    use std::time::Duration;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;
    use wallet_background_bridge::model::{
        ActiveOrigin, KeyringCall, KeyringPayload, KeyringStatus, SerializedSignature,
    };
    use wallet_background_bridge::transport::{read_frame, socket_path, write_frame};
    use wallet_background_bridge::{Config, Envelope, Payload};

    const PUSH_INTERVAL: Duration = Duration::from_secs(5);
    const STUB_ADDRESS: &str = "0x00000000000000000000000000000000000000000000000000000000000000a1";
    const ORIGINS: [&str; 2] = ["https://app.example", "https://swap.example"];

    struct StubWallet {
        locked: bool,
        key: SigningKey,
    }

    pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let path = socket_path(&config.socket_dir(), &config.transport.channel_name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "background stub listening");

        let max_frame_size = config.transport.max_frame_size;
        loop {
            let (stream, _) = listener.accept().await?;
            tracing::info!("client connected");
            tokio::spawn(async move {
                match serve(stream, max_frame_size).await {
                    Ok(()) => tracing::info!("client disconnected"),
                    Err(err) => tracing::warn!(error = %err, "client session failed"),
                }
            });
        }
    }

    async fn serve(stream: UnixStream, max_frame_size: usize) -> io::Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<Value>>();

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &envelope, max_frame_size).await {
                    tracing::warn!(error = %err, "write failed");
                    break;
                }
            }
        });
        let push_task = tokio::spawn(push_active_origin(tx.clone()));

        let mut wallet = StubWallet::new();
        let result = loop {
            let request = match read_frame::<_, Value>(&mut reader, max_frame_size).await {
                Ok(request) => request,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(err) => break Err(err),
            };
            let Some(reply) = wallet.respond(&request) else {
                continue;
            };
            if tx.send(reply).is_err() {
                break Ok(());
            }
        };

        push_task.abort();
        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn push_active_origin(tx: mpsc::UnboundedSender<Envelope<Value>>) {
        let mut ticker = tokio::time::interval(PUSH_INTERVAL);
        ticker.tick().await;
        for origin in ORIGINS.iter().cycle() {
            ticker.tick().await;
            let push = Envelope::new(Payload::UpdateActiveOrigin(ActiveOrigin {
                origin: Some(origin.to_string()),
                fav_icon: None,
            }));
            let Ok(push) = push.to_value() else {
                return;
            };
            tracing::debug!(origin, "-> update-active-origin");
            if tx.send(push).is_err() {
                return;
            }
        }
    }

    fn error_reply(id: &str, message: &str) -> Envelope<Value> {
        Envelope::with_id(id, json!({ "error": true, "message": message }))
    }

    impl StubWallet {
        fn new() -> Self {
            Self {
                locked: true,
                key: SigningKey::from_bytes(&[42u8; 32]),
            }
        }

        fn respond(&mut self, request: &Envelope<Value>) -> Option<Envelope<Value>> {
            let payload = match request.decode_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(id = %request.id, error = %err, "undecodable request");
                    return Some(error_reply(&request.id, "unsupported message"));
                }
            };
            tracing::debug!(id = %request.id, payload_type = payload.type_name(), "<- request");

            let reply = match payload {
                Payload::GetPermissionRequests => Payload::PermissionRequests {
                    permissions: vec![json!({ "id": "perm-stub", "origin": ORIGINS[0] })],
                },
                Payload::GetTransactionRequests => {
                    Payload::GetTransactionRequestsResponse { tx_requests: Vec::new() }
                }
                Payload::GetFeatures => {
                    let mut features = Map::new();
                    features.insert("wallet-dapps".into(), json!({ "defaultValue": true }));
                    features.insert("wallet-swap".into(), json!({ "defaultValue": false }));
                    Payload::LoadedFeatures { features }
                }
                Payload::DisconnectApp { origin } => {
                    tracing::info!(origin = %origin, "app disconnected");
                    Payload::Done
                }
                Payload::PermissionResponse { id, allowed, .. } => {
                    tracing::info!(id = %id, allowed, "permission response");
                    return None;
                }
                Payload::TransactionRequestResponse { tx_id, approved, .. } => {
                    tracing::info!(tx_id = %tx_id, approved, "transaction response");
                    return None;
                }
                Payload::Keyring(call) => match self.keyring(call) {
                    Some(reply) => Payload::Keyring(reply),
                    None => return None,
                },
                other => {
                    return Some(error_reply(
                        &request.id,
                        &format!("unsupported request: {}", other.type_name()),
                    ))
                }
            };
            match Envelope::with_id(request.id.clone(), reply).to_value() {
                Ok(envelope) => Some(envelope),
                Err(err) => Some(error_reply(&request.id, &err.to_string())),
            }
        }

        fn keyring(&mut self, call: KeyringPayload) -> Option<KeyringPayload> {
            let reply = match call {
                KeyringPayload::AppStatusUpdate(call) => {
                    let active = call.args.map(|args| args.active).unwrap_or(false);
                    tracing::debug!(active, "app status");
                    return None;
                }
                KeyringPayload::WalletStatusUpdate(_) => {
                    KeyringPayload::WalletStatusUpdate(KeyringCall::response(KeyringStatus {
                        is_locked: Some(self.locked),
                        is_initialized: Some(true),
                        active_address: Some(STUB_ADDRESS.to_string()),
                    }))
                }
                KeyringPayload::Unlock(_) => {
                    self.locked = false;
                    KeyringPayload::Unlock(KeyringCall::bare())
                }
                KeyringPayload::Lock(_) => {
                    self.locked = true;
                    KeyringPayload::Lock(KeyringCall::bare())
                }
                KeyringPayload::Create(_) => KeyringPayload::Create(KeyringCall::bare()),
                KeyringPayload::Clear(_) => KeyringPayload::Clear(KeyringCall::bare()),
                KeyringPayload::SetLockTimeout(_) => {
                    KeyringPayload::SetLockTimeout(KeyringCall::bare())
                }
                KeyringPayload::GetEntropy(_) => KeyringPayload::GetEntropy(KeyringCall::response(
                    hex::encode(&self.key.to_bytes()[..16]),
                )),
                KeyringPayload::SignData(call) => {
                    let data = call
                        .args
                        .and_then(|args| BASE64.decode(args.data).ok())
                        .unwrap_or_default();
                    let signature = self.key.sign(&data);
                    KeyringPayload::SignData(KeyringCall::response(SerializedSignature {
                        signature_scheme: "ED25519".to_string(),
                        signature: BASE64.encode(signature.to_bytes()),
                        pub_key: BASE64.encode(self.key.verifying_key().to_bytes()),
                    }))
                }
            };
            Some(reply)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn entropy_is_hex_of_the_key_prefix() {
            let mut wallet = StubWallet::new();
            let reply = wallet.keyring(KeyringPayload::GetEntropy(KeyringCall::bare()));
            match reply {
                Some(KeyringPayload::GetEntropy(call)) => {
                    let entropy = call.result.expect("entropy returned");
                    assert_eq!(entropy.len(), 32);
                    assert_eq!(hex::decode(&entropy).unwrap(), wallet.key.to_bytes()[..16]);
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }

        #[test]
        fn unlock_is_reflected_in_wallet_status() {
            let mut wallet = StubWallet::new();
            let request = Envelope::with_id(
                "u1",
                json!({ "type": "keyring", "method": "unlock", "args": { "password": "pw" } }),
            );
            let ack = wallet.respond(&request).expect("unlock acknowledged");
            assert_eq!(ack.id, "u1");
            assert!(!wallet.locked);

            let status = Envelope::with_id(
                "s1",
                json!({ "type": "keyring", "method": "walletStatusUpdate" }),
            );
            let reply = wallet.respond(&status).expect("status returned");
            assert_eq!(reply.payload["return"]["isLocked"], false);
        }
    }
}

#[cfg(unix)]
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    stub::run().await
}

#[cfg(not(unix))]
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("background_stub listens on a Unix socket and is not available on this platform");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_target(false)
        .init();
    run().await
}
