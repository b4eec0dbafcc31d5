use crate::config::HubConfig;
use crate::connection::{meta, role, Connection, MetaValue, ReceiveSink};
use crate::dispatcher::{DispatchEvent, Dispatcher, SubHandler};
use crate::error::HubError;
use crate::handler::authority::AuthorityAuthHandler;
use crate::handler::edge::EdgeAuthHandler;
use crate::handler::ServerHandle;
use crate::manager::{ConnectionManager, Hooks};
use crate::metrics::gauges;
use crate::permission::Permissions;
use crate::prerouting::PreRouting;
use crate::store::{MemoryStore, Store};
use async_trait::async_trait;
use hub_wire::{read_frame, Header};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Catch-all for sub-protocols with no registered handler. Cross-hub
/// forwarding would live here; this build only logs.
struct UnroutedHandler;

#[async_trait]
impl SubHandler for UnroutedHandler {
    fn sub_proto(&self) -> u8 {
        0
    }

    async fn on_receive(&self, conn: Option<Arc<Connection>>, hdr: Header, _payload: Vec<u8>) {
        debug!(
            conn = conn.as_ref().map_or("-", |c| c.id()),
            sub_proto = hdr.sub_proto,
            "no route for sub proto, frame dropped"
        );
    }
}

/// Receive sink wiring a connection's reader into pre-routing + dispatch.
struct HubSink {
    hub: Weak<Hub>,
}

#[async_trait]
impl ReceiveSink for HubSink {
    async fn on_frame(&self, conn: Arc<Connection>, hdr: Header, payload: Vec<u8>) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if !hub.prerouting.admit(&conn, &hdr) {
            return;
        }
        hub.dispatcher
            .enqueue(DispatchEvent {
                conn: Some(conn),
                hdr,
                payload,
            })
            .await;
    }
}

/// The hub server: wires listener, connection manager, pre-routing,
/// dispatcher, and the auth handler; owns the lifecycle.
pub struct Hub {
    cfg: HubConfig,
    manager: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    prerouting: PreRouting,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: StdMutex<Option<SocketAddr>>,
    started: AtomicBool,
    self_ref: OnceLock<Weak<Hub>>,
}

impl Hub {
    /// Builds a hub with the in-process device store.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidConfig`] on rejected configuration and
    /// registration errors from the dispatcher.
    pub fn new(cfg: HubConfig) -> Result<Arc<Self>, HubError> {
        let store = Arc::new(MemoryStore::new(cfg.allocation_seed()));
        Self::with_store(cfg, store)
    }

    /// Builds a hub over an externally provided device store.
    ///
    /// # Errors
    ///
    /// Same as [`Hub::new`].
    pub fn with_store(cfg: HubConfig, store: Arc<dyn Store>) -> Result<Arc<Self>, HubError> {
        cfg.validate().map_err(HubError::InvalidConfig)?;

        let dispatcher = Dispatcher::new(
            cfg.channel_count,
            cfg.workers_per_channel,
            cfg.channel_buffer,
            Duration::from_millis(cfg.enqueue_timeout_ms),
        );

        let hub = Arc::new(Self {
            cfg,
            manager: ConnectionManager::new(),
            dispatcher,
            prerouting: PreRouting::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: StdMutex::new(None),
            started: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = hub.self_ref.set(Arc::downgrade(&hub));

        // handlers reach back through a provider bound after construction,
        // never through an owning reference
        let handle = ServerHandle::new();
        handle.bind(&hub);
        if hub.cfg.authority_mode {
            hub.dispatcher
                .register_handler(AuthorityAuthHandler::new(handle, store))?;
        } else {
            let perms = Permissions::from_config(&hub.cfg);
            hub.dispatcher.register_handler(EdgeAuthHandler::new(
                handle,
                perms,
                hub.cfg.authority_node_id,
                Duration::from_secs(hub.cfg.pending_timeout_secs),
                hub.cfg.allocation_seed(),
            ))?;
        }
        hub.dispatcher.set_default_handler(Arc::new(UnroutedHandler));

        Ok(hub)
    }

    /// Binds the listener and starts the accept, read, and parent-link
    /// tasks. Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`HubError::AlreadyStarted`] on a second call, otherwise bind errors.
    pub async fn start(&self) -> Result<SocketAddr, HubError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HubError::AlreadyStarted);
        }
        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("hub self reference bound at construction");

        let listener = TcpListener::bind(self.cfg.listen).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().expect("local addr lock poisoned") = Some(local_addr);

        let on_add_hub = Arc::downgrade(&this);
        let on_remove_hub = Arc::downgrade(&this);
        self.manager.set_hooks(Hooks {
            on_add: Some(Box::new(move |conn| {
                gauges::inc_connections_active();
                if let Some(hub) = on_add_hub.upgrade() {
                    conn.set_receiver(Arc::new(HubSink {
                        hub: Arc::downgrade(&hub),
                    }));
                    let conn = Arc::clone(conn);
                    let loop_hub = Arc::clone(&hub);
                    hub.tracker.spawn(Self::read_loop(loop_hub, conn));
                }
            })),
            on_remove: Some(Box::new(move |conn| {
                gauges::dec_connections_active();
                if let Some(hub) = on_remove_hub.upgrade() {
                    hub.dispatcher.notify_conn_closed(conn.id());
                }
            })),
        });

        self.tracker
            .spawn(Self::accept_loop(Arc::clone(&this), listener));

        if self.cfg.parent_enable {
            if let Some(parent_addr) = self.cfg.parent_addr {
                self.tracker.spawn(Self::parent_loop(this, parent_addr));
            }
        }

        info!(node_id = self.cfg.node_id, "hub listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn accept_loop(hub: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                () = hub.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let conn = Connection::spawn(
                        stream,
                        addr,
                        false,
                        hub.cfg.send_buffer,
                        Duration::from_secs(hub.cfg.write_timeout_secs),
                        &hub.cancel,
                    );
                    debug!(conn = %conn.id(), "connection accepted");
                    if let Err(e) = hub.manager.add(conn) {
                        error!("failed to register connection: {}", e);
                    }
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn read_loop(hub: Arc<Self>, conn: Arc<Connection>) {
        let Some(mut reader) = conn.take_reader().await else {
            return;
        };
        let token = conn.cancel_token();
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok((hdr, payload)) => Connection::dispatch_receive(&conn, hdr, payload).await,
                Err(e) => {
                    debug!(conn = %conn.id(), "read loop exit: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = hub.manager.remove(conn.id()) {
            debug!(conn = %conn.id(), "remove conn: {}", e);
        }
    }

    /// Dials the configured parent and redials on loss at a fixed interval
    /// until shutdown.
    async fn parent_loop(hub: Arc<Self>, parent_addr: SocketAddr) {
        let interval = Duration::from_secs(hub.cfg.parent_reconnect_secs);
        loop {
            if hub.cancel.is_cancelled() {
                break;
            }
            match TcpStream::connect(parent_addr).await {
                Ok(stream) => {
                    let conn = Connection::spawn(
                        stream,
                        parent_addr,
                        true,
                        hub.cfg.send_buffer,
                        Duration::from_secs(hub.cfg.write_timeout_secs),
                        &hub.cancel,
                    );
                    conn.set_meta(meta::ROLE, MetaValue::Str(role::PARENT.to_string()));
                    if hub.cfg.authority_node_id != 0 {
                        conn.set_meta(meta::NODE_ID, MetaValue::U32(hub.cfg.authority_node_id));
                    }
                    match hub.manager.add(Arc::clone(&conn)) {
                        Ok(()) => {
                            if hub.cfg.authority_node_id != 0 {
                                hub.manager
                                    .update_node_index(hub.cfg.authority_node_id, Some(&conn));
                            }
                            info!(parent = %parent_addr, "parent link established");
                            conn.cancel_token().cancelled().await;
                            warn!(parent = %parent_addr, "parent link lost");
                        }
                        Err(e) => warn!("failed to register parent link: {}", e),
                    }
                }
                Err(e) => {
                    debug!(parent = %parent_addr, "parent dial failed: {}", e);
                }
            }
            tokio::select! {
                () = hub.cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Hook point invoked for every outbound frame routed through the hub.
    fn on_send(conn: &Arc<Connection>, hdr: &Header) {
        tracing::trace!(
            conn = %conn.id(),
            sub_proto = hdr.sub_proto,
            target = hdr.target,
            "sending frame"
        );
    }

    /// Sends a frame on a registered connection.
    ///
    /// # Errors
    ///
    /// [`HubError::ConnNotFound`] for unknown ids; queue errors from the
    /// connection otherwise.
    pub fn send(&self, conn_id: &str, hdr: &Header, payload: &[u8]) -> Result<(), HubError> {
        let Some(conn) = self.manager.get(conn_id) else {
            return Err(HubError::ConnNotFound(conn_id.to_string()));
        };
        Self::on_send(&conn, hdr);
        conn.send_frame(hdr, payload)
    }

    /// Stops the hub: cancels all tasks, waits for them up to `deadline`,
    /// shuts the dispatcher down, and closes every connection. Idempotent.
    ///
    /// # Errors
    ///
    /// [`HubError::StopTimeout`] when tasks did not finish in time; cleanup
    /// still ran.
    pub async fn stop(&self, deadline: Duration) -> Result<(), HubError> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.tracker.close();
        let waited = timeout(deadline, self.tracker.wait()).await;
        self.dispatcher.shutdown().await;
        self.manager.close_all();
        match waited {
            Ok(()) => Ok(()),
            Err(_) => Err(HubError::StopTimeout),
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// This hub's node id.
    #[must_use]
    pub const fn node_id(&self) -> u32 {
        self.cfg.node_id
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.cfg
    }

    /// Root token cancelled on [`Hub::stop`].
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Address the listener bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use hub_wire::Major;

    fn loopback_config() -> HubConfig {
        let mut cfg = valid_config();
        cfg.listen = "127.0.0.1:0".parse().unwrap();
        cfg
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let hub = Hub::new(loopback_config()).unwrap();
        let addr = hub.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(hub.local_addr(), Some(addr));
        hub.stop(Duration::from_secs(2)).await.unwrap();
        // idempotent
        hub.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let hub = Hub::new(loopback_config()).unwrap();
        hub.start().await.unwrap();
        assert!(matches!(hub.start().await, Err(HubError::AlreadyStarted)));
        hub.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn send_to_unknown_conn_fails() {
        let hub = Hub::new(loopback_config()).unwrap();
        let hdr = Header::new(Major::Msg, 1).unwrap();
        assert!(matches!(
            hub.send("nope", &hdr, b""),
            Err(HubError::ConnNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut cfg = loopback_config();
        cfg.node_id = 0;
        assert!(matches!(Hub::new(cfg), Err(HubError::InvalidConfig(_))));
    }
}
