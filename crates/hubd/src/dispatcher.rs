use crate::connection::Connection;
use crate::error::HubError;
use crate::metrics::counters;
use async_trait::async_trait;
use hub_wire::Header;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Number of addressable sub-protocols (6-bit selector).
pub const SUB_PROTO_SLOTS: usize = 64;

/// A sub-protocol handler registered with the dispatcher.
#[async_trait]
pub trait SubHandler: Send + Sync {
    /// Sub-protocol selector this handler serves, `0..=63`.
    fn sub_proto(&self) -> u8;

    /// Processes one frame. `conn` is absent for internally injected events.
    async fn on_receive(&self, conn: Option<Arc<Connection>>, hdr: Header, payload: Vec<u8>);

    /// Notification that a connection closed; drop state owned by it.
    fn on_conn_closed(&self, _conn_id: &str) {}
}

/// A unit of work queued for the worker pool.
pub struct DispatchEvent {
    /// Originating connection, when the frame came off a socket.
    pub conn: Option<Arc<Connection>>,
    /// Decoded frame header.
    pub hdr: Header,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Fan-out stage: per-connection sharded FIFO queues drained by a worker
/// pool, routed by sub-protocol to registered handlers.
///
/// All frames from one connection hash to one shard, and a worker acquires
/// the connection's dispatch lock before releasing the shard receiver, so
/// handler invocations for a single connection run in arrival order even
/// with several workers per shard.
pub struct Dispatcher {
    senders: Vec<mpsc::Sender<DispatchEvent>>,
    handlers: RwLock<Vec<Option<Arc<dyn SubHandler>>>>,
    default_handler: RwLock<Option<Arc<dyn SubHandler>>>,
    enqueue_timeout: Duration,
    cancel: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Builds the shard queues and starts `channel_count × workers_per_channel`
    /// worker tasks.
    #[must_use]
    pub fn new(
        channel_count: usize,
        workers_per_channel: usize,
        channel_buffer: usize,
        enqueue_timeout: Duration,
    ) -> Arc<Self> {
        let channel_count = channel_count.max(1);
        let workers_per_channel = workers_per_channel.max(1);
        let channel_buffer = channel_buffer.max(1);

        let mut senders = Vec::with_capacity(channel_count);
        let mut receivers = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let (tx, rx) = mpsc::channel(channel_buffer);
            senders.push(tx);
            receivers.push(Arc::new(Mutex::new(rx)));
        }

        let dispatcher = Arc::new(Self {
            senders,
            handlers: RwLock::new(vec![None; SUB_PROTO_SLOTS]),
            default_handler: RwLock::new(None),
            enqueue_timeout,
            cancel: CancellationToken::new(),
            workers: StdMutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(channel_count * workers_per_channel);
        for rx in receivers {
            for _ in 0..workers_per_channel {
                let this = Arc::clone(&dispatcher);
                let rx = Arc::clone(&rx);
                handles.push(tokio::spawn(this.worker_loop(rx)));
            }
        }
        *dispatcher.workers.lock().expect("workers lock poisoned") = handles;

        dispatcher
    }

    /// Registers a handler for its sub-protocol.
    ///
    /// # Errors
    ///
    /// [`HubError::SubProtoOutOfRange`] for selectors above 63 and
    /// [`HubError::DuplicateSubProto`] when the slot is taken.
    pub fn register_handler(&self, handler: Arc<dyn SubHandler>) -> Result<(), HubError> {
        let sub = handler.sub_proto();
        if sub as usize >= SUB_PROTO_SLOTS {
            return Err(HubError::SubProtoOutOfRange(sub));
        }
        let mut table = self.handlers.write().expect("handlers lock poisoned");
        if table[sub as usize].is_some() {
            return Err(HubError::DuplicateSubProto(sub));
        }
        table[sub as usize] = Some(handler);
        Ok(())
    }

    /// Installs the catch-all handler for unregistered sub-protocols.
    pub fn set_default_handler(&self, handler: Arc<dyn SubHandler>) {
        *self
            .default_handler
            .write()
            .expect("default handler lock poisoned") = Some(handler);
    }

    fn lookup(&self, sub: u8) -> Option<Arc<dyn SubHandler>> {
        let table = self.handlers.read().expect("handlers lock poisoned");
        table
            .get(sub as usize)
            .and_then(Clone::clone)
            .or_else(|| {
                self.default_handler
                    .read()
                    .expect("default handler lock poisoned")
                    .clone()
            })
    }

    fn select_shard(&self, evt: &DispatchEvent) -> usize {
        if self.senders.len() == 1 {
            return 0;
        }
        if let Some(conn) = &evt.conn {
            let mut hasher = DefaultHasher::new();
            conn.id().hash(&mut hasher);
            return (hasher.finish() % self.senders.len() as u64) as usize;
        }
        evt.hdr.sub_proto as usize % self.senders.len()
    }

    /// Queues an event for the worker pool, waiting up to the configured
    /// enqueue timeout for shard space. On timeout the frame is dropped
    /// with a warning.
    pub async fn enqueue(&self, evt: DispatchEvent) {
        let idx = self.select_shard(&evt);
        let sub = evt.hdr.sub_proto;
        tokio::select! {
            () = self.cancel.cancelled() => {
                counters::frames_dropped_total("shutdown");
            }
            res = self.senders[idx].send_timeout(evt, self.enqueue_timeout) => {
                match res {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        tracing::warn!(shard = idx, sub_proto = sub, "dispatch queue full, frame dropped");
                        counters::frames_dropped_total("enqueue_timeout");
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        counters::frames_dropped_total("shutdown");
                    }
                }
            }
        }
    }

    /// Forwards a connection-closed notification to every handler.
    pub fn notify_conn_closed(&self, conn_id: &str) {
        let table = self.handlers.read().expect("handlers lock poisoned");
        for handler in table.iter().flatten() {
            handler.on_conn_closed(conn_id);
        }
        if let Some(h) = self
            .default_handler
            .read()
            .expect("default handler lock poisoned")
            .as_ref()
        {
            h.on_conn_closed(conn_id);
        }
    }

    async fn worker_loop(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<DispatchEvent>>>) {
        loop {
            let popped = {
                let mut rx = rx.lock().await;
                let evt = tokio::select! {
                    () = self.cancel.cancelled() => None,
                    evt = rx.recv() => evt,
                };
                match evt {
                    Some(evt) => {
                        let lock = match &evt.conn {
                            Some(c) => Some(c.dispatch_lock().lock_owned().await),
                            None => None,
                        };
                        Some((evt, lock))
                    }
                    None => None,
                }
            };
            let Some((evt, lock)) = popped else { break };
            self.run_handler(evt, lock).await;
        }

        // shutdown: drain whatever is already queued, then exit
        loop {
            let popped = {
                let mut rx = rx.lock().await;
                match rx.try_recv() {
                    Ok(evt) => {
                        let lock = match &evt.conn {
                            Some(c) => Some(c.dispatch_lock().lock_owned().await),
                            None => None,
                        };
                        Some((evt, lock))
                    }
                    Err(_) => None,
                }
            };
            let Some((evt, lock)) = popped else { break };
            self.run_handler(evt, lock).await;
        }
    }

    async fn run_handler(&self, evt: DispatchEvent, lock: Option<OwnedMutexGuard<()>>) {
        let Some(handler) = self.lookup(evt.hdr.sub_proto) else {
            tracing::debug!(sub_proto = evt.hdr.sub_proto, "no handler for sub proto");
            counters::frames_dropped_total("no_handler");
            return;
        };
        counters::frames_dispatched_total();
        // Each invocation runs in its own task so a handler panic never
        // takes the worker down with it.
        let task = tokio::spawn(async move {
            let _serialized = lock;
            handler.on_receive(evt.conn, evt.hdr, evt.payload).await;
        });
        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!("handler panicked: {}", e);
                counters::frames_dropped_total("handler_panic");
            }
        }
    }

    /// Stops the worker pool: queued items are drained, workers join.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().expect("workers lock poisoned"),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_wire::Major;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    struct Recording {
        sub: u8,
        seen: StdMutex<Vec<u32>>,
        closed: AtomicUsize,
    }

    impl Recording {
        fn new(sub: u8) -> Arc<Self> {
            Arc::new(Self {
                sub,
                seen: StdMutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubHandler for Recording {
        fn sub_proto(&self) -> u8 {
            self.sub
        }

        async fn on_receive(&self, _conn: Option<Arc<Connection>>, hdr: Header, _payload: Vec<u8>) {
            // uneven latency to provoke reordering if serialization is broken
            if hdr.msg_id % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            self.seen.lock().unwrap().push(hdr.msg_id);
        }

        fn on_conn_closed(&self, _conn_id: &str) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn test_conn() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        Connection::spawn(
            client,
            addr,
            false,
            8,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
    }

    fn event(conn: Option<Arc<Connection>>, sub: u8, msg_id: u32) -> DispatchEvent {
        let mut hdr = Header::new(Major::Cmd, sub).unwrap();
        hdr.msg_id = msg_id;
        hdr.source = 1;
        DispatchEvent {
            conn,
            hdr,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let d = Dispatcher::new(1, 1, 8, Duration::from_millis(200));
        d.register_handler(Recording::new(2)).unwrap();
        assert!(matches!(
            d.register_handler(Recording::new(2)),
            Err(HubError::DuplicateSubProto(2))
        ));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn out_of_range_registration_fails() {
        let d = Dispatcher::new(1, 1, 8, Duration::from_millis(200));
        assert!(matches!(
            d.register_handler(Recording::new(64)),
            Err(HubError::SubProtoOutOfRange(64))
        ));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let d = Dispatcher::new(4, 4, 256, Duration::from_millis(200));
        let handler = Recording::new(2);
        d.register_handler(Arc::clone(&handler) as Arc<dyn SubHandler>)
            .unwrap();

        let conn = test_conn().await;
        for i in 0..60 {
            d.enqueue(event(Some(Arc::clone(&conn)), 2, i)).await;
        }
        d.shutdown().await;

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen, (0..60).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn default_handler_catches_unregistered_sub_proto() {
        let d = Dispatcher::new(2, 2, 8, Duration::from_millis(200));
        let fallback = Recording::new(0);
        d.set_default_handler(Arc::clone(&fallback) as Arc<dyn SubHandler>);

        let conn = test_conn().await;
        d.enqueue(event(Some(conn), 9, 42)).await;
        d.shutdown().await;

        assert_eq!(fallback.seen.lock().unwrap().as_slice(), &[42]);
    }

    #[tokio::test]
    async fn detached_events_route_by_sub_proto() {
        let d = Dispatcher::new(2, 1, 8, Duration::from_millis(200));
        let handler = Recording::new(2);
        d.register_handler(Arc::clone(&handler) as Arc<dyn SubHandler>)
            .unwrap();
        d.enqueue(event(None, 2, 7)).await;
        d.shutdown().await;
        assert_eq!(handler.seen.lock().unwrap().as_slice(), &[7]);
    }

    #[tokio::test]
    async fn shutdown_drains_and_is_idempotent() {
        let d = Dispatcher::new(1, 1, 64, Duration::from_millis(200));
        let handler = Recording::new(2);
        d.register_handler(Arc::clone(&handler) as Arc<dyn SubHandler>)
            .unwrap();

        let conn = test_conn().await;
        for i in 0..20 {
            d.enqueue(event(Some(Arc::clone(&conn)), 2, i)).await;
        }
        d.shutdown().await;
        d.shutdown().await;
        assert_eq!(handler.seen.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn conn_closed_reaches_all_handlers() {
        let d = Dispatcher::new(1, 1, 8, Duration::from_millis(200));
        let h1 = Recording::new(2);
        let h2 = Recording::new(3);
        d.register_handler(Arc::clone(&h1) as Arc<dyn SubHandler>)
            .unwrap();
        d.register_handler(Arc::clone(&h2) as Arc<dyn SubHandler>)
            .unwrap();
        d.notify_conn_closed("gone");
        assert_eq!(h1.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h2.closed.load(Ordering::SeqCst), 1);
        d.shutdown().await;
    }
}
