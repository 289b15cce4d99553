//! JSON-RPC client for the target system.
//!
//! One connection is shared by all runs. Requests carry a numeric id; a reader
//! task routes each response to the caller waiting on that id, so calls may
//! complete out of order. When the stream drops, every outstanding call fails
//! with `ConnectionLost` and the next call reconnects with bounded backoff.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{ClientCodec, RpcRequest, RpcResponse};
use super::{ConnectionState, Endpoint, ToolTransport, TransportError};
use crate::config::TransportConfig;

/// Any bidirectional byte stream.
pub trait RpcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RpcStream for T {}

pub type BoxedStream = Box<dyn RpcStream>;

/// Opens a fresh stream to the target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxedStream>;

    fn describe(&self) -> String;
}

/// Connects to a configured [`Endpoint`].
pub struct EndpointConnector {
    endpoint: Endpoint,
}

impl EndpointConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub call_timeout: Duration,
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientSettings {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&TransportConfig> for ClientSettings {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(cfg.call_timeout_sec),
            reconnect_attempts: cfg.reconnect_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.reconnect_max_backoff_ms),
        }
    }
}

type Reply = oneshot::Sender<Result<Value, TransportError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

/// Handles to one live stream.
#[derive(Clone)]
struct Link {
    writer: mpsc::Sender<RpcRequest>,
    pending: PendingMap,
    closed: CancellationToken,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// Connection state, owned by the newest link. A reader task of a replaced
/// link must not report the newer one as down.
#[derive(Clone)]
struct LinkState {
    state: watch::Sender<ConnectionState>,
    generation: Arc<AtomicU64>,
}

impl LinkState {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set(&self, to: ConnectionState) {
        self.state.send_replace(to);
    }

    /// Start connecting a new link and return its generation.
    fn begin(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = ConnectionState::Connecting;
        });
        generation
    }

    /// Mark link `generation` as lost. Returns false when a newer link has
    /// taken over.
    fn lost(&self, generation: u64) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation
                || *state == ConnectionState::Disconnected
            {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        })
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    state: LinkState,
    link: tokio::sync::Mutex<Option<Link>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                state: LinkState::new(),
                link: tokio::sync::Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(cfg: &TransportConfig) -> Result<Self, TransportError> {
        let endpoint: Endpoint = cfg.endpoint.parse()?;
        Ok(Self::new(
            Arc::new(EndpointConnector::new(endpoint)),
            ClientSettings::from(cfg),
        ))
    }

    /// Drop the current connection. Outstanding calls fail with
    /// `ConnectionLost`; the next call reconnects.
    pub async fn disconnect(&self) {
        if let Some(link) = self.inner.link.lock().await.take() {
            link.closed.cancel();
        }
    }

    async fn ensure_connected(&self) -> Result<Link, TransportError> {
        let mut guard = self.inner.link.lock().await;
        if let Some(link) = guard.as_ref().filter(|l| l.is_open()) {
            return Ok(link.clone());
        }

        let settings = &self.inner.settings;
        let target = self.inner.connector.describe();
        let generation = self.inner.state.begin();

        let mut last_error = String::new();
        for attempt in 0..settings.reconnect_attempts.max(1) {
            if attempt > 0 {
                let delay = with_jitter(settings.backoff(attempt - 1));
                debug!(target = %target, attempt, ?delay, "reconnect backoff");
                tokio::time::sleep(delay).await;
            }

            match self.inner.connector.connect().await {
                Ok(stream) => {
                    let link = spawn_link(stream, self.inner.state.clone(), generation);
                    self.inner.state.set(ConnectionState::Connected);
                    info!(target = %target, "connected to target system");
                    *guard = Some(link.clone());
                    return Ok(link);
                }
                Err(e) => {
                    warn!(target = %target, attempt = attempt + 1, error = %e, "connect failed");
                    last_error = e.to_string();
                }
            }
        }

        self.inner.state.set(ConnectionState::Disconnected);
        *guard = None;
        Err(TransportError::Unavailable(format!(
            "{} after {} attempts: {}",
            target, settings.reconnect_attempts, last_error
        )))
    }
}

#[async_trait]
impl ToolTransport for RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let link = self.ensure_connected().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        lock(&link.pending).insert(id, tx);
        // Register before checking `closed`: the reader cancels first and
        // drains second, so one of the two always sees this entry.
        if !link.is_open() {
            lock(&link.pending).remove(&id);
            return Err(TransportError::ConnectionLost);
        }

        debug!(id, method, "rpc call");
        if link
            .writer
            .send(RpcRequest::new(id, method, params))
            .await
            .is_err()
        {
            lock(&link.pending).remove(&id);
            return Err(TransportError::ConnectionLost);
        }

        let timeout = self.inner.settings.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                lock(&link.pending).remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, Reply>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn the reader and writer tasks for a fresh stream.
fn spawn_link(stream: BoxedStream, state: LinkState, generation: u64) -> Link {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(read_half, ClientCodec::new());
    let mut frames_out = FramedWrite::new(write_half, ClientCodec::new());

    let (writer, mut outbox) = mpsc::channel::<RpcRequest>(64);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let closed = CancellationToken::new();

    let write_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_closed.cancelled() => break,
                next = outbox.recv() => match next {
                    Some(request) => {
                        if let Err(e) = frames_out.send(request).await {
                            warn!(error = %e, "rpc write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        write_closed.cancel();
    });

    let read_closed = closed.clone();
    let read_pending = pending.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = read_closed.cancelled() => break,
                frame = frames_in.next() => match frame {
                    Some(Ok(response)) => route_response(&read_pending, response),
                    Some(Err(e)) => {
                        warn!(error = %e, "rpc read failed");
                        break;
                    }
                    None => {
                        debug!("target closed the connection");
                        break;
                    }
                },
            }
        }

        read_closed.cancel();
        let orphaned: Vec<Reply> = lock(&read_pending).drain().map(|(_, tx)| tx).collect();
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "failing in-flight calls after connection loss");
        }
        for tx in orphaned {
            let _ = tx.send(Err(TransportError::ConnectionLost));
        }
        if !state.lost(generation) {
            debug!(generation, "stale link closed after a newer one connected");
        }
    });

    Link {
        writer,
        pending,
        closed,
    }
}

fn route_response(pending: &PendingMap, response: RpcResponse) {
    let Some(tx) = lock(pending).remove(&response.id) else {
        debug!(id = response.id, "response for unknown or abandoned call");
        return;
    };

    let result = match (response.error, response.result) {
        (Some(err), _) => Err(TransportError::Remote {
            code: err.code,
            message: err.message,
        }),
        (None, Some(result)) => Ok(result),
        (None, None) => Ok(Value::Null),
    };
    let _ = tx.send(result);
}

/// Adds up to 25% random extra delay.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
