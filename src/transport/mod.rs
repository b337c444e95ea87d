use crate::error::ClientError;
use crate::model::Envelope;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};

const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(10);
const PROTOCOL_ERROR_RESET_THRESHOLD: usize = 5;

pub trait IpcStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn IpcStream>;

/// Opens a duplex byte stream to the background service for a named channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, channel: &str) -> io::Result<BoxedStream>;
}

/// Channel names may contain characters that are awkward in paths and pipe names.
pub fn sanitize_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Unix domain socket (or named pipe on Windows) per channel.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    dir: PathBuf,
}

impl SocketConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn endpoint(&self, channel: &str) -> PathBuf {
        socket_path(&self.dir, channel)
    }
}

pub fn socket_path(dir: &Path, channel: &str) -> PathBuf {
    dir.join(format!("{}.sock", sanitize_channel(channel)))
}

pub fn pipe_name(channel: &str) -> String {
    format!(r"\\.\pipe\{}", sanitize_channel(channel))
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, channel: &str) -> io::Result<BoxedStream> {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(self.endpoint(channel)).await?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ClientOptions;
            let pipe = ClientOptions::new().open(pipe_name(channel))?;
            Ok(Box::new(pipe))
        }
    }
}

/// In-process connector: every `connect` yields one end of a fresh duplex pipe and
/// hands the other end to whoever holds the receiver returned by `new`.
pub struct DuplexConnector {
    buffer: usize,
    peers: mpsc::UnboundedSender<DuplexStream>,
    available: AtomicBool,
}

impl DuplexConnector {
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                buffer,
                peers,
                available: AtomicBool::new(true),
            },
            rx,
        )
    }

    /// While unavailable, connects fail with `ConnectionRefused`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _channel: &str) -> io::Result<BoxedStream> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "background unavailable",
            ));
        }
        let (local, remote) = tokio::io::duplex(self.buffer);
        self.peers
            .send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no background peer"))?;
        Ok(Box::new(local))
    }
}

pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: usize) -> io::Result<Envelope<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32_le().await? as usize;
    if len > max_frame_size {
        // skip the body so the next prefix is read from a frame boundary
        let mut body = AsyncReadExt::take(&mut *reader, len as u64);
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("decode failed: {err}")))
}

pub async fn write_frame<W, T>(
    writer: &mut W,
    message: &Envelope<T>,
    max_frame_size: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = rmp_serde::to_vec_named(message).map_err(|err| {
        io::Error::new(io::ErrorKind::InvalidData, format!("encode failed: {err}"))
    })?;
    if payload.len() > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("encoded frame too large: {}", payload.len()),
        ));
    }
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

#[derive(Debug)]
pub enum SessionEvent {
    Message(Envelope<Value>),
    Disconnected,
}

/// Handle to one live connection. Replaced, never reused, after a disconnect.
#[derive(Clone)]
pub struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<Envelope<Value>>,
    connected: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl Session {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send(&self, envelope: Envelope<Value>) -> Result<(), ClientError> {
        if !self.connected() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .send(envelope)
            .map_err(|_| ClientError::NotConnected)
    }

    /// Stops the reader; the disconnect event still fires.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Spawns the reader and writer tasks for `stream`.
pub fn open_session(
    stream: BoxedStream,
    generation: u64,
    max_frame_size: usize,
) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    let close = Arc::new(Notify::new());

    tokio::spawn(write_loop(
        writer,
        outbound_rx,
        connected.clone(),
        events_tx.clone(),
        max_frame_size,
        generation,
    ));
    tokio::spawn(read_loop(
        reader,
        connected.clone(),
        events_tx,
        close.clone(),
        max_frame_size,
        generation,
    ));

    (
        Session {
            generation,
            outbound: outbound_tx,
            connected,
            close,
        },
        events_rx,
    )
}

fn mark_disconnected(connected: &AtomicBool, events: &mpsc::UnboundedSender<SessionEvent>) {
    if connected.swap(false, Ordering::SeqCst) {
        let _ = events.send(SessionEvent::Disconnected);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope<Value>>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
    max_frame_size: usize,
    generation: u64,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &envelope, max_frame_size).await {
            if err.kind() == io::ErrorKind::InvalidData {
                tracing::warn!(generation, id = %envelope.id, error = %err, "dropping unencodable envelope");
                continue;
            }
            tracing::warn!(generation, error = %err, "session write failed");
            mark_disconnected(&connected, &events);
            return;
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
    close: Arc<Notify>,
    max_frame_size: usize,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut protocol_errors = ProtocolErrorTracker::new();
    loop {
        let frame = tokio::select! {
            _ = close.notified() => {
                tracing::debug!(generation, "session closed locally");
                break;
            }
            frame = read_frame::<_, Value>(&mut reader, max_frame_size) => frame,
        };
        match frame {
            Ok(envelope) => {
                if events.send(SessionEvent::Message(envelope)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(generation, error = %err, "skipping undecodable frame");
                if protocol_errors.record_and_should_reset() {
                    tracing::warn!(generation, "session reset after repeated protocol errors");
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::info!(generation, "background closed the channel");
                break;
            }
            Err(err) => {
                tracing::warn!(generation, error = %err, "session read failed");
                break;
            }
        }
    }
    mark_disconnected(&connected, &events);
}

struct ProtocolErrorTracker {
    recent: VecDeque<Instant>,
}

impl ProtocolErrorTracker {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
        }
    }

    fn record_and_should_reset(&mut self) -> bool {
        let now = Instant::now();
        self.recent.push_back(now);
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > PROTOCOL_ERROR_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len() > PROTOCOL_ERROR_RESET_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;
    use serde_json::json;

    const MAX: usize = 64 * 1024;

    #[test]
    fn channel_names_are_sanitized_for_endpoints() {
        assert_eq!(sanitize_channel("ui<->background"), "ui_-_background");
        let connector = SocketConnector::new("/run/user/1000");
        assert_eq!(
            connector.endpoint("ui<->background"),
            PathBuf::from("/run/user/1000/ui_-_background.sock")
        );
        assert_eq!(pipe_name("ui<->background"), r"\\.\pipe\ui_-_background");
    }

    #[tokio::test]
    async fn frames_carry_typed_envelopes_as_values() {
        let (mut a, mut b) = tokio::io::duplex(MAX);
        let env = Envelope::with_id("req-1", Payload::GetFeatures);
        write_frame(&mut a, &env, MAX).await.unwrap();
        let decoded: Envelope<Value> = read_frame(&mut b, MAX).await.unwrap();
        assert_eq!(decoded.id, "req-1");
        assert_eq!(decoded.payload, json!({ "type": "get-features" }));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_on_both_ends() {
        let (mut a, mut b) = tokio::io::duplex(MAX);
        let big = Envelope::with_id("big", json!({ "blob": "x".repeat(2048) }));
        let err = write_frame(&mut a, &big, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        a.write_u32_le(10_000).await.unwrap();
        a.write_all(&[0u8; 10_000]).await.unwrap();
        let err = read_frame::<_, Value>(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn session_delivers_messages_and_single_disconnect() {
        let (connector, mut peers) = DuplexConnector::new(MAX);
        let stream = connector.connect("test").await.unwrap();
        let mut remote = peers.recv().await.unwrap();
        let (session, mut events) = open_session(stream, 1, MAX);
        assert!(session.connected());
        assert_eq!(session.generation(), 1);

        session
            .send(Envelope::with_id("out", json!({ "type": "done" })))
            .unwrap();
        let outbound: Envelope<Value> = read_frame(&mut remote, MAX).await.unwrap();
        assert_eq!(outbound.id, "out");

        write_frame(&mut remote, &Envelope::with_id("in", json!({ "type": "done" })), MAX)
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            SessionEvent::Message(env) => assert_eq!(env.id, "in"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(remote);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Disconnected
        ));
        assert!(!session.connected());
        assert!(matches!(
            session.send(Envelope::with_id("late", json!({}))),
            Err(ClientError::NotConnected)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_without_losing_the_next_one() {
        let (connector, mut peers) = DuplexConnector::new(MAX);
        let stream = connector.connect("test").await.unwrap();
        let mut remote = peers.recv().await.unwrap();
        let (session, mut events) = open_session(stream, 3, 1024);

        remote.write_u32_le(2000).await.unwrap();
        remote.write_all(&[0xaau8; 2000]).await.unwrap();
        write_frame(&mut remote, &Envelope::with_id("after", json!({ "type": "done" })), 1024)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("next frame delivered")
            .unwrap();
        match event {
            SessionEvent::Message(env) => assert_eq!(env.id, "after"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.connected());
    }

    #[tokio::test]
    async fn repeated_garbage_frames_reset_the_session() {
        let (connector, mut peers) = DuplexConnector::new(MAX);
        let stream = connector.connect("test").await.unwrap();
        let mut remote = peers.recv().await.unwrap();
        let (session, mut events) = open_session(stream, 7, MAX);

        for _ in 0..=PROTOCOL_ERROR_RESET_THRESHOLD {
            remote.write_u32_le(3).await.unwrap();
            remote.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("session should reset")
            .unwrap();
        assert!(matches!(event, SessionEvent::Disconnected));
        assert!(!session.connected());
    }

    #[tokio::test]
    async fn unavailable_duplex_connector_refuses() {
        let (connector, _peers) = DuplexConnector::new(MAX);
        connector.set_available(false);
        let err = connector.connect("test").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
