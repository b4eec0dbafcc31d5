//! Sub-protocol handlers for the authentication protocol.

/// Authoritative end of the auth verbs, backed by the device store.
pub mod authority;
/// Edge-hub end: whitelist cache, assist forwarding, revoke broadcast.
pub mod edge;

use crate::connection::Connection;
use crate::server::Hub;
use hub_wire::auth::{code, Envelope, RespData};
use hub_wire::{Header, Major, SUB_PROTO_AUTH};
use serde::Serialize;
use std::sync::{Arc, OnceLock, Weak};

/// One-way back-reference from handlers to the server, bound after the
/// server is built. Handlers never own the server.
#[derive(Clone, Default)]
pub struct ServerHandle {
    inner: Arc<OnceLock<Weak<Hub>>>,
}

impl ServerHandle {
    /// Creates an unbound handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the handle to a server. Later calls are ignored.
    pub fn bind(&self, hub: &Arc<Hub>) {
        let _ = self.inner.set(Arc::downgrade(hub));
    }

    /// Upgrades to the server, if bound and alive.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Hub>> {
        self.inner.get().and_then(Weak::upgrade)
    }
}

/// Builds a response header: request header cloned when present, class by
/// outcome code, auth sub-protocol, own node id as source, target 0 so the
/// nearest hub delivers to the originating device.
#[must_use]
pub(crate) fn resp_header(node_id: u32, req_hdr: Option<&Header>, resp_code: i32) -> Header {
    let major = if resp_code == code::SUCCESS {
        Major::OkResp
    } else {
        Major::ErrResp
    };
    let mut hdr = match req_hdr {
        Some(req) => req.reply(major),
        None => Header::new(major, SUB_PROTO_AUTH).expect("auth sub proto in range"),
    };
    hdr.sub_proto = SUB_PROTO_AUTH;
    hdr.source = node_id;
    hdr.target = 0;
    hdr
}

/// Sends a `*_resp` envelope back on a connection, routing through the
/// server when the handle is bound (send hook, metrics) and falling back to
/// the connection directly otherwise.
pub(crate) fn send_resp(
    handle: &ServerHandle,
    conn: &Arc<Connection>,
    req_hdr: Option<&Header>,
    action: &str,
    data: &RespData,
) {
    let Ok(envelope) = Envelope::new(action, data) else {
        tracing::error!(action, "response payload not serializable");
        return;
    };
    let Ok(payload) = envelope.to_bytes() else {
        tracing::error!(action, "response envelope not serializable");
        return;
    };
    match handle.get() {
        Some(hub) => {
            let hdr = resp_header(hub.node_id(), req_hdr, data.code);
            if let Err(e) = hub.send(conn.id(), &hdr, &payload) {
                tracing::warn!(conn = %conn.id(), action, "send resp failed: {}", e);
            }
        }
        None => {
            let hdr = resp_header(0, req_hdr, data.code);
            if let Err(e) = conn.send_frame(&hdr, &payload) {
                tracing::warn!(conn = %conn.id(), action, "send resp failed: {}", e);
            }
        }
    }
}

/// Forwards a command envelope to another hub, targeting its bound node id
/// when known.
pub(crate) fn forward<T: Serialize>(
    handle: &ServerHandle,
    target: &Arc<Connection>,
    action: &str,
    data: &T,
) {
    let Ok(envelope) = Envelope::new(action, data) else {
        tracing::error!(action, "forward payload not serializable");
        return;
    };
    let Ok(payload) = envelope.to_bytes() else {
        tracing::error!(action, "forward envelope not serializable");
        return;
    };
    let mut hdr = Header::new(Major::Cmd, SUB_PROTO_AUTH).expect("auth sub proto in range");
    hdr.target = target.node_id().unwrap_or(0);
    match handle.get() {
        Some(hub) => {
            hdr.source = hub.node_id();
            if let Err(e) = hub.send(target.id(), &hdr, &payload) {
                tracing::warn!(conn = %target.id(), action, "forward failed: {}", e);
            }
        }
        None => {
            if let Err(e) = target.send_frame(&hdr, &payload) {
                tracing::warn!(conn = %target.id(), action, "forward failed: {}", e);
            }
        }
    }
}

/// Picks the resp action name for the assisted / direct variants of a verb.
pub(crate) const fn choose_action(
    assisted: bool,
    assisted_action: &'static str,
    direct_action: &'static str,
) -> &'static str {
    if assisted {
        assisted_action
    } else {
        direct_action
    }
}
