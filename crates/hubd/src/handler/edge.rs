use crate::connection::{meta, role, Connection, MetaValue};
use crate::dispatcher::SubHandler;
use crate::handler::{choose_action, forward, send_resp, ServerHandle};
use crate::metrics::counters;
use crate::permission::{self, Permissions};
use crate::server::Hub;
use crate::store::{credential_matches, generate_credential, Binding, DeleteOutcome};
use async_trait::async_trait;
use dashmap::DashMap;
use hub_wire::auth::{
    action, code, Envelope, LoginData, OfflineData, QueryCredData, RegisterData, RespData,
    RevokeData,
};
use hub_wire::{encode, Header, Major, SUB_PROTO_AUTH};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Edge-local device bindings: the whitelist consulted for offline login.
#[derive(Debug, Default)]
pub struct Whitelist {
    entries: DashMap<String, Binding>,
}

impl Whitelist {
    /// Creates an empty whitelist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces a binding.
    pub fn save(&self, device_id: &str, binding: Binding) {
        self.entries.insert(device_id.to_string(), binding);
    }

    /// Looks up a binding.
    #[must_use]
    pub fn lookup(&self, device_id: &str) -> Option<Binding> {
        self.entries.get(device_id).map(|e| e.value().clone())
    }

    /// Deletes a binding, refusing when a credential is supplied and does
    /// not match.
    pub fn delete_if(&self, device_id: &str, credential: Option<&str>) -> DeleteOutcome {
        let Some(existing) = self.lookup(device_id) else {
            return DeleteOutcome {
                node_id: 0,
                removed: false,
                mismatch: false,
            };
        };
        if let Some(cred) = credential {
            if !credential_matches(cred, &existing.credential) {
                return DeleteOutcome {
                    node_id: existing.node_id,
                    removed: false,
                    mismatch: true,
                };
            }
        }
        self.entries.remove(device_id);
        DeleteOutcome {
            node_id: existing.node_id,
            removed: true,
            mismatch: false,
        }
    }

    /// Number of bindings held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no binding is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Register,
    Login,
}

impl PendingKind {
    const fn resp_action(self) -> &'static str {
        match self {
            Self::Register => action::REGISTER_RESP,
            Self::Login => action::LOGIN_RESP,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    conn_id: String,
    seq: u64,
    kind: PendingKind,
}

struct EdgeState {
    handle: ServerHandle,
    perms: Permissions,
    authority_node_id: u32,
    pending_timeout: Duration,
    next_id: AtomicU32,
    whitelist: Whitelist,
    pending: DashMap<String, PendingEntry>,
    pending_seq: AtomicU64,
}

/// Serves the auth verbs at an edge hub: answers from the local whitelist,
/// proxies cache misses to the authority as `assist_*`, correlates the
/// responses by device id, rebroadcasts revokes, and propagates offline to
/// the parent.
pub struct EdgeAuthHandler {
    state: Arc<EdgeState>,
}

impl EdgeAuthHandler {
    /// Creates the handler.
    ///
    /// `allocation_seed` is the root node id: self-authority node ids are
    /// allocated monotonically above it.
    #[must_use]
    pub fn new(
        handle: ServerHandle,
        perms: Permissions,
        authority_node_id: u32,
        pending_timeout: Duration,
        allocation_seed: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(EdgeState {
                handle,
                perms,
                authority_node_id,
                pending_timeout,
                next_id: AtomicU32::new(allocation_seed.saturating_add(1)),
                whitelist: Whitelist::new(),
                pending: DashMap::new(),
                pending_seq: AtomicU64::new(1),
            }),
        })
    }

    /// The edge whitelist, exposed for inspection.
    #[must_use]
    pub fn whitelist(&self) -> &Whitelist {
        &self.state.whitelist
    }
}

impl EdgeState {
    fn parent_conn(hub: &Arc<Hub>) -> Option<Arc<Connection>> {
        let mut found = None;
        hub.manager().range(|conn| {
            if conn.role().as_deref() == Some(role::PARENT) {
                found = Some(Arc::clone(conn));
                false
            } else {
                true
            }
        });
        found
    }

    /// Authority selection: configured node id first, then the parent link,
    /// else this hub is authoritative.
    fn select_authority(&self, hub: &Arc<Hub>) -> Option<Arc<Connection>> {
        if self.authority_node_id != 0 {
            if let Some(conn) = hub.manager().get_by_node(self.authority_node_id) {
                return Some(conn);
            }
        }
        Self::parent_conn(hub)
    }

    /// Returns the stable binding for a device under self-authority,
    /// allocating node id and credential on first sight.
    fn self_bind(&self, device_id: &str) -> Binding {
        if let Some(existing) = self.whitelist.lookup(device_id) {
            return existing;
        }
        let binding = Binding {
            node_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            credential: generate_credential(),
        };
        self.whitelist.save(device_id, binding.clone());
        binding
    }

    fn save_binding(&self, conn: &Arc<Connection>, device_id: &str, binding: &Binding) {
        self.whitelist.save(device_id, binding.clone());
        conn.set_meta(meta::NODE_ID, MetaValue::U32(binding.node_id));
        conn.set_meta(meta::DEVICE_ID, MetaValue::Str(device_id.to_string()));
        if let Some(hub) = self.handle.get() {
            hub.manager().update_node_index(binding.node_id, Some(conn));
            hub.manager().update_device_index(device_id, Some(conn));
        }
    }

    /// Records an in-flight assist forward and arms its timeout. A second
    /// request for the same device supersedes the first; the superseded
    /// response is dropped on arrival.
    fn set_pending(this: &Arc<Self>, device_id: &str, conn_id: &str, kind: PendingKind) {
        let seq = this.pending_seq.fetch_add(1, Ordering::Relaxed);
        this.pending.insert(
            device_id.to_string(),
            PendingEntry {
                conn_id: conn_id.to_string(),
                seq,
                kind,
            },
        );
        let state = Arc::clone(this);
        let device = device_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(state.pending_timeout).await;
            let Some((_, entry)) = state.pending.remove_if(&device, |_, e| e.seq == seq) else {
                return;
            };
            tracing::debug!(device = %device, "assist forward timed out");
            let Some(hub) = state.handle.get() else {
                return;
            };
            let Some(conn) = hub.manager().get(&entry.conn_id) else {
                return;
            };
            send_resp(
                &state.handle,
                &conn,
                None,
                entry.kind.resp_action(),
                &RespData {
                    code: code::ASSIST_FAILED,
                    msg: "authority unreachable".into(),
                    device_id: device,
                    ..RespData::default()
                },
            );
        });
    }

    fn pop_pending(&self, device_id: &str) -> Option<PendingEntry> {
        self.pending.remove(device_id).map(|(_, entry)| entry)
    }

    fn handle_register(this: &Arc<Self>, conn: &Arc<Connection>, hdr: &Header, envelope: &Envelope) {
        let req = match envelope.data_as::<RegisterData>() {
            Ok(req) if !req.device_id.is_empty() => req,
            _ => {
                send_resp(
                    &this.handle,
                    conn,
                    Some(hdr),
                    action::REGISTER_RESP,
                    &RespData::error(code::BAD_REQUEST, "invalid register data"),
                );
                return;
            }
        };
        if let Some(authority) = this.handle.get().and_then(|hub| this.select_authority(&hub)) {
            Self::set_pending(this, &req.device_id, conn.id(), PendingKind::Register);
            forward(&this.handle, &authority, action::ASSIST_REGISTER, &req);
            return;
        }
        let binding = this.self_bind(&req.device_id);
        this.save_binding(conn, &req.device_id, &binding);
        send_resp(
            &this.handle,
            conn,
            Some(hdr),
            action::REGISTER_RESP,
            &RespData {
                code: code::SUCCESS,
                msg: "ok".into(),
                device_id: req.device_id,
                node_id: binding.node_id,
                credential: binding.credential,
            },
        );
    }

    fn handle_register_resp(&self, envelope: &Envelope) {
        let Ok(resp) = envelope.data_as::<RespData>() else {
            return;
        };
        if resp.device_id.is_empty() {
            return;
        }
        let Some(entry) = self.pop_pending(&resp.device_id) else {
            return; // superseded or never forwarded: drop
        };
        let Some(hub) = self.handle.get() else {
            return;
        };
        let Some(conn) = hub.manager().get(&entry.conn_id) else {
            return; // device disconnected while the assist was in flight
        };
        if resp.code == code::SUCCESS {
            self.save_binding(
                &conn,
                &resp.device_id,
                &Binding {
                    node_id: resp.node_id,
                    credential: resp.credential.clone(),
                },
            );
        }
        send_resp(&self.handle, &conn, None, action::REGISTER_RESP, &resp);
    }

    fn handle_login(
        this: &Arc<Self>,
        conn: &Arc<Connection>,
        hdr: &Header,
        envelope: &Envelope,
        assisted: bool,
    ) {
        let resp_action = choose_action(assisted, action::ASSIST_LOGIN_RESP, action::LOGIN_RESP);
        let req = match envelope.data_as::<LoginData>() {
            Ok(req) if !req.device_id.is_empty() => req,
            _ => {
                send_resp(
                    &this.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData::error(code::BAD_REQUEST, "invalid login data"),
                );
                return;
            }
        };
        if assisted {
            match this.whitelist.lookup(&req.device_id) {
                Some(rec) if credential_matches(&req.credential, &rec.credential) => {
                    send_resp(
                        &this.handle,
                        conn,
                        Some(hdr),
                        resp_action,
                        &RespData {
                            code: code::SUCCESS,
                            msg: "ok".into(),
                            device_id: req.device_id,
                            node_id: rec.node_id,
                            credential: rec.credential,
                        },
                    );
                }
                _ => {
                    send_resp(
                        &this.handle,
                        conn,
                        Some(hdr),
                        resp_action,
                        &RespData::error(code::INVALID_CREDENTIAL, "invalid credential"),
                    );
                }
            }
            return;
        }
        if let Some(rec) = this.whitelist.lookup(&req.device_id) {
            if credential_matches(&req.credential, &rec.credential) {
                this.save_binding(conn, &req.device_id, &rec);
                send_resp(
                    &this.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData {
                        code: code::SUCCESS,
                        msg: "ok".into(),
                        device_id: req.device_id,
                        node_id: rec.node_id,
                        credential: rec.credential,
                    },
                );
            } else {
                send_resp(
                    &this.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData::error(code::INVALID_CREDENTIAL, "invalid credential"),
                );
            }
            return;
        }
        if let Some(authority) = this.handle.get().and_then(|hub| this.select_authority(&hub)) {
            Self::set_pending(this, &req.device_id, conn.id(), PendingKind::Login);
            forward(&this.handle, &authority, action::ASSIST_LOGIN, &req);
            return;
        }
        send_resp(
            &this.handle,
            conn,
            Some(hdr),
            resp_action,
            &RespData::error(code::INVALID_CREDENTIAL, "invalid credential"),
        );
    }

    fn handle_login_resp(&self, envelope: &Envelope) {
        let Ok(resp) = envelope.data_as::<RespData>() else {
            return;
        };
        if resp.device_id.is_empty() {
            return;
        }
        let Some(entry) = self.pop_pending(&resp.device_id) else {
            return;
        };
        let Some(hub) = self.handle.get() else {
            return;
        };
        let Some(conn) = hub.manager().get(&entry.conn_id) else {
            return;
        };
        if resp.code == code::SUCCESS {
            self.save_binding(
                &conn,
                &resp.device_id,
                &Binding {
                    node_id: resp.node_id,
                    credential: resp.credential.clone(),
                },
            );
        }
        send_resp(&self.handle, &conn, None, action::LOGIN_RESP, &resp);
    }

    fn handle_assist_query(&self, conn: &Arc<Connection>, hdr: &Header, envelope: &Envelope) {
        let req = match envelope.data_as::<QueryCredData>() {
            Ok(req) if !req.device_id.is_empty() => req,
            _ => {
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    action::ASSIST_QUERY_CREDENTIAL_RESP,
                    &RespData::error(code::BAD_REQUEST, "invalid query"),
                );
                return;
            }
        };
        match self.whitelist.lookup(&req.device_id) {
            Some(rec) => send_resp(
                &self.handle,
                conn,
                Some(hdr),
                action::ASSIST_QUERY_CREDENTIAL_RESP,
                &RespData {
                    code: code::SUCCESS,
                    msg: "ok".into(),
                    device_id: req.device_id,
                    node_id: rec.node_id,
                    credential: rec.credential,
                },
            ),
            None => send_resp(
                &self.handle,
                conn,
                Some(hdr),
                action::ASSIST_QUERY_CREDENTIAL_RESP,
                &RespData::error(code::INVALID_CREDENTIAL, "not found"),
            ),
        }
    }

    fn handle_assist_query_resp(&self, envelope: &Envelope) {
        let Ok(resp) = envelope.data_as::<RespData>() else {
            return;
        };
        if resp.device_id.is_empty() {
            return;
        }
        let Some(entry) = self.pop_pending(&resp.device_id) else {
            return;
        };
        let Some(hub) = self.handle.get() else {
            return;
        };
        let Some(conn) = hub.manager().get(&entry.conn_id) else {
            return;
        };
        if resp.code == code::SUCCESS {
            self.save_binding(
                &conn,
                &resp.device_id,
                &Binding {
                    node_id: resp.node_id,
                    credential: resp.credential.clone(),
                },
            );
            send_resp(
                &self.handle,
                &conn,
                None,
                action::LOGIN_RESP,
                &RespData {
                    code: code::SUCCESS,
                    msg: "ok".into(),
                    device_id: resp.device_id,
                    node_id: resp.node_id,
                    credential: resp.credential,
                },
            );
            return;
        }
        send_resp(
            &self.handle,
            &conn,
            None,
            action::LOGIN_RESP,
            &RespData::error(resp.code, &resp.msg),
        );
    }

    fn handle_revoke(&self, conn: Option<&Arc<Connection>>, hdr: &Header, envelope: &Envelope) {
        let Ok(req) = envelope.data_as::<RevokeData>() else {
            return;
        };
        if req.device_id.is_empty() {
            return;
        }
        let source = permission::source_node_id(hdr, conn);
        if !self.perms.has(source, permission::AUTH_REVOKE) {
            tracing::debug!(node = source, "revoke denied by permission table");
            return;
        }
        let credential = if req.credential.is_empty() {
            None
        } else {
            Some(req.credential.as_str())
        };
        let outcome = self.whitelist.delete_if(&req.device_id, credential);
        let hub = self.handle.get();
        let node_id = if outcome.node_id != 0 {
            outcome.node_id
        } else {
            req.node_id
        };
        if outcome.removed {
            if let Some(hub) = &hub {
                hub.manager().update_device_index(&req.device_id, None);
                if outcome.node_id != 0 {
                    hub.manager().update_node_index(outcome.node_id, None);
                }
            }
            if let Some(conn) = conn {
                send_resp(
                    &self.handle,
                    conn,
                    None,
                    action::REVOKE_RESP,
                    &RespData {
                        code: code::SUCCESS,
                        msg: "ok".into(),
                        device_id: req.device_id.clone(),
                        node_id,
                        credential: String::new(),
                    },
                );
            }
        } else if outcome.mismatch {
            if let Some(conn) = conn {
                send_resp(
                    &self.handle,
                    conn,
                    None,
                    action::REVOKE_RESP,
                    &RespData {
                        code: code::CREDENTIAL_MISMATCH,
                        msg: "credential mismatch".into(),
                        device_id: req.device_id.clone(),
                        node_id,
                        credential: String::new(),
                    },
                );
            }
        }
        // rebroadcast to every link except the one it came in on; the
        // overlay is a tree, so not-back-to-sender is loop-free
        if let Some(hub) = hub {
            let Ok(env) = Envelope::new(action::REVOKE, &req) else {
                return;
            };
            let Ok(payload) = env.to_bytes() else {
                return;
            };
            let mut out = Header::new(Major::Cmd, SUB_PROTO_AUTH).expect("auth sub proto in range");
            out.source = hub.node_id();
            let frame = encode(&out, &payload);
            hub.manager()
                .broadcast(&frame, conn.map(|c| c.id()));
            counters::revoke_broadcast_total();
        }
    }

    fn handle_offline(
        &self,
        conn: Option<&Arc<Connection>>,
        envelope: &Envelope,
        assisted: bool,
    ) {
        let Ok(req) = envelope.data_as::<OfflineData>() else {
            return;
        };
        if req.device_id.is_empty() {
            return;
        }
        // credential is never consulted for offline
        self.whitelist.delete_if(&req.device_id, None);
        let hub = self.handle.get();
        if let Some(hub) = &hub {
            hub.manager().update_device_index(&req.device_id, None);
            if req.node_id != 0 {
                hub.manager().update_node_index(req.node_id, None);
            }
        }
        if assisted {
            return;
        }
        let Some(hub) = hub else { return };
        let Some(parent) = Self::parent_conn(&hub) else {
            return;
        };
        if conn.is_some_and(|c| c.id() == parent.id()) {
            return; // the parent told us; do not echo it back
        }
        forward(&self.handle, &parent, action::ASSIST_OFFLINE, &req);
    }
}

#[async_trait]
impl SubHandler for EdgeAuthHandler {
    fn sub_proto(&self) -> u8 {
        SUB_PROTO_AUTH
    }

    async fn on_receive(&self, conn: Option<Arc<Connection>>, hdr: Header, payload: Vec<u8>) {
        let envelope = match Envelope::from_bytes(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("invalid auth payload: {}", e);
                return;
            }
        };
        let act = envelope.action.trim().to_lowercase();
        counters::auth_actions_total(match act.as_str() {
            action::REGISTER | action::ASSIST_REGISTER => "register",
            action::LOGIN | action::ASSIST_LOGIN => "login",
            action::REVOKE => "revoke",
            action::OFFLINE | action::ASSIST_OFFLINE => "offline",
            _ => "other",
        });

        let state = &self.state;
        match act.as_str() {
            action::REGISTER => {
                let Some(conn) = conn else {
                    tracing::debug!(action = %act, "auth frame without connection");
                    return;
                };
                EdgeState::handle_register(state, &conn, &hdr, &envelope);
            }
            action::ASSIST_REGISTER => {
                // authority-only verb: the edge forwards it outward but
                // never answers it, so node ids stay authority-allocated
                tracing::debug!(conn = conn.as_ref().map_or("-", |c| c.id()), "assist_register ignored at edge");
            }
            action::REGISTER_RESP | action::ASSIST_REGISTER_RESP => {
                state.handle_register_resp(&envelope);
            }
            action::LOGIN | action::ASSIST_LOGIN => {
                let Some(conn) = conn else {
                    tracing::debug!(action = %act, "auth frame without connection");
                    return;
                };
                EdgeState::handle_login(state, &conn, &hdr, &envelope, act == action::ASSIST_LOGIN);
            }
            action::LOGIN_RESP | action::ASSIST_LOGIN_RESP => {
                state.handle_login_resp(&envelope);
            }
            action::ASSIST_QUERY_CREDENTIAL => {
                let Some(conn) = conn else {
                    tracing::debug!(action = %act, "auth frame without connection");
                    return;
                };
                state.handle_assist_query(&conn, &hdr, &envelope);
            }
            action::ASSIST_QUERY_CREDENTIAL_RESP => {
                state.handle_assist_query_resp(&envelope);
            }
            action::REVOKE => {
                state.handle_revoke(conn.as_ref(), &hdr, &envelope);
            }
            action::OFFLINE | action::ASSIST_OFFLINE => {
                state.handle_offline(conn.as_ref(), &envelope, act == action::ASSIST_OFFLINE);
            }
            other => {
                tracing::debug!(action = other, "unknown auth action");
            }
        }
    }

    fn on_conn_closed(&self, conn_id: &str) {
        self.state.pending.retain(|_, entry| entry.conn_id != conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handler() -> Arc<EdgeAuthHandler> {
        let cfg = crate::config::tests::valid_config();
        EdgeAuthHandler::new(
            ServerHandle::new(),
            Permissions::from_config(&cfg),
            0,
            Duration::from_secs(10),
            1,
        )
    }

    #[test]
    fn whitelist_delete_if_matrix() {
        let wl = Whitelist::new();
        wl.save(
            "dev",
            Binding {
                node_id: 2,
                credential: "tok".into(),
            },
        );

        let mismatch = wl.delete_if("dev", Some("wrong"));
        assert!(mismatch.mismatch);
        assert!(!mismatch.removed);
        assert_eq!(wl.len(), 1);

        let removed = wl.delete_if("dev", Some("tok"));
        assert!(removed.removed);
        assert_eq!(removed.node_id, 2);
        assert!(wl.is_empty());

        let missing = wl.delete_if("dev", None);
        assert!(!missing.removed);
        assert!(!missing.mismatch);
    }

    #[test]
    fn whitelist_delete_without_credential_is_unconditional() {
        let wl = Whitelist::new();
        wl.save(
            "dev",
            Binding {
                node_id: 2,
                credential: "tok".into(),
            },
        );
        assert!(wl.delete_if("dev", None).removed);
    }

    #[test]
    fn self_bind_is_stable_across_re_register() {
        let handler = test_handler();
        let first = handler.state.self_bind("dev");
        let second = handler.state.self_bind("dev");
        assert_eq!(first, second);
        assert_eq!(first.node_id, 2);
        assert_eq!(first.credential.len(), 43);

        let other = handler.state.self_bind("dev2");
        assert_eq!(other.node_id, 3);
    }

    #[tokio::test]
    async fn second_pending_supersedes_first() {
        let handler = test_handler();
        let state = &handler.state;
        EdgeState::set_pending(state, "dev", "conn-1", PendingKind::Register);
        EdgeState::set_pending(state, "dev", "conn-2", PendingKind::Login);
        assert_eq!(state.pending.len(), 1);

        let entry = state.pop_pending("dev").unwrap();
        assert_eq!(entry.conn_id, "conn-2");
        assert_eq!(entry.kind, PendingKind::Login);
        assert!(state.pop_pending("dev").is_none());
    }

    #[tokio::test]
    async fn conn_close_drops_owned_pending_entries() {
        let handler = test_handler();
        EdgeState::set_pending(&handler.state, "dev-a", "conn-1", PendingKind::Register);
        EdgeState::set_pending(&handler.state, "dev-b", "conn-2", PendingKind::Login);
        handler.on_conn_closed("conn-1");
        assert!(handler.state.pop_pending("dev-a").is_none());
        assert!(handler.state.pop_pending("dev-b").is_some());
    }
}
