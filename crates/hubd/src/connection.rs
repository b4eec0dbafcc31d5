use crate::error::HubError;
use async_trait::async_trait;
use dashmap::DashMap;
use hub_wire::{encode, Header};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Well-known connection metadata keys.
pub mod meta {
    /// Node id bound to the peer (`u32`).
    pub const NODE_ID: &str = "nodeID";
    /// Device id bound to the peer (string).
    pub const DEVICE_ID: &str = "deviceID";
    /// Overlay role of the peer (string, see [`super::role`]).
    pub const ROLE: &str = "role";
}

/// Overlay roles stamped on connections.
pub mod role {
    /// Outbound link to the configured parent hub.
    pub const PARENT: &str = "parent";
    /// Inbound link from a device or downstream hub.
    pub const CHILD: &str = "child";
    /// Lateral link between hubs of the same tier.
    pub const PEER: &str = "peer";
}

/// A metadata value attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    /// Numeric value (node ids).
    U32(u32),
    /// String value (device ids, roles).
    Str(String),
}

impl MetaValue {
    /// Returns the numeric value, if this is a [`MetaValue::U32`].
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Returns the string value, if this is a [`MetaValue::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            Self::U32(_) => None,
        }
    }
}

/// Consumer of decoded inbound frames, invoked from the reader task.
#[async_trait]
pub trait ReceiveSink: Send + Sync {
    /// Called once per decoded frame, in arrival order.
    async fn on_frame(&self, conn: Arc<Connection>, hdr: Header, payload: Vec<u8>);
}

static NEXT_CONN_SEQ: AtomicU64 = AtomicU64::new(1);

/// A live socket with its outbound queue, metadata, and receive hook.
///
/// Sending never blocks the caller: frames land on a bounded queue drained
/// by a dedicated writer task under a write deadline. A write failure or
/// timeout cancels the connection.
pub struct Connection {
    id: String,
    remote_addr: SocketAddr,
    outbound: bool,
    meta: DashMap<&'static str, MetaValue>,
    out_tx: mpsc::Sender<Vec<u8>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    sink: OnceLock<Arc<dyn ReceiveSink>>,
    dispatch_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wraps an accepted or dialed stream and starts its writer task.
    #[must_use]
    pub fn spawn(
        stream: TcpStream,
        remote_addr: SocketAddr,
        outbound: bool,
        send_buffer: usize,
        write_timeout: Duration,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let seq = NEXT_CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!("{remote_addr}#{seq}");
        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(send_buffer);
        let cancel = parent_cancel.child_token();

        let conn = Arc::new(Self {
            id,
            remote_addr,
            outbound,
            meta: DashMap::new(),
            out_tx,
            reader: Mutex::new(Some(read_half)),
            sink: OnceLock::new(),
            dispatch_lock: Arc::new(Mutex::new(())),
            cancel,
        });

        let writer_cancel = conn.cancel.clone();
        let writer_id = conn.id.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    data = out_rx.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                match timeout(write_timeout, write_half.write_all(&data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(conn = %writer_id, "write failed: {}", e);
                        writer_cancel.cancel();
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(conn = %writer_id, "write deadline exceeded");
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        conn
    }

    /// Unique connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the remote peer.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// `true` when this side initiated the connection (parent links).
    #[must_use]
    pub const fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Stores a metadata value under a well-known key.
    pub fn set_meta(&self, key: &'static str, value: MetaValue) {
        self.meta.insert(key, value);
    }

    /// Fetches a metadata value.
    #[must_use]
    pub fn get_meta(&self, key: &str) -> Option<MetaValue> {
        self.meta.get(key).map(|e| e.value().clone())
    }

    /// Node id from metadata, if bound.
    #[must_use]
    pub fn node_id(&self) -> Option<u32> {
        self.get_meta(meta::NODE_ID).and_then(|v| v.as_u32())
    }

    /// Overlay role from metadata, if stamped.
    #[must_use]
    pub fn role(&self) -> Option<String> {
        self.get_meta(meta::ROLE)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Installs the frame consumer. Must happen before the read loop runs;
    /// later calls are ignored.
    pub fn set_receiver(&self, sink: Arc<dyn ReceiveSink>) {
        let _ = self.sink.set(sink);
    }

    /// Hands a decoded frame to the installed receive sink.
    pub async fn dispatch_receive(conn: &Arc<Self>, hdr: Header, payload: Vec<u8>) {
        if let Some(sink) = conn.sink.get() {
            sink.on_frame(Arc::clone(conn), hdr, payload).await;
        } else {
            tracing::warn!(conn = %conn.id, "frame received before sink installed");
        }
    }

    /// Takes the read half for the connection's read loop. Returns `None`
    /// after the first call.
    pub async fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().await.take()
    }

    /// Serializes handler invocations for this connection (dispatcher
    /// ordering guarantee).
    #[must_use]
    pub fn dispatch_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.dispatch_lock)
    }

    /// Enqueues raw bytes for the writer task.
    ///
    /// # Errors
    ///
    /// [`HubError::Backpressure`] when the queue is full,
    /// [`HubError::ConnectionClosed`] when the connection is gone.
    pub fn send(&self, data: Vec<u8>) -> Result<(), HubError> {
        if self.cancel.is_cancelled() {
            return Err(HubError::ConnectionClosed);
        }
        self.out_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => HubError::ConnectionClosed,
        })
    }

    /// Encodes a frame and enqueues it.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send`].
    pub fn send_frame(&self, hdr: &Header, payload: &[u8]) -> Result<(), HubError> {
        self.send(encode(hdr, payload))
    }

    /// Token observed by the reader and writer tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the connection's tasks. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// `true` once [`Connection::close`] ran or a task failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
