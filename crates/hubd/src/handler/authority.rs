use crate::connection::Connection;
use crate::dispatcher::SubHandler;
use crate::handler::{choose_action, send_resp, ServerHandle};
use crate::metrics::counters;
use crate::store::{credential_matches, Binding, Store, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use hub_wire::auth::{
    action, code, Envelope, LoginData, OfflineData, QueryCredData, RegisterData, RespData,
    RevokeData,
};
use hub_wire::{Header, SUB_PROTO_AUTH};
use std::future::Future;
use std::sync::Arc;

/// Serves the auth verbs authoritatively, backed by the device [`Store`]
/// with a write-through cache. Registered for sub-protocol 2 when the hub
/// runs in authority mode.
pub struct AuthorityAuthHandler {
    handle: ServerHandle,
    store: Arc<dyn Store>,
    cache: DashMap<String, Binding>,
}

impl AuthorityAuthHandler {
    /// Creates the handler over a store.
    #[must_use]
    pub fn new(handle: ServerHandle, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            store,
            cache: DashMap::new(),
        })
    }

    /// Races a store call against server shutdown, so cancelled requests
    /// surface as store failures (and reach the device as 4500).
    async fn store_call<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.handle.get() {
            Some(hub) => {
                let cancel = hub.cancel_token();
                tokio::select! {
                    () = cancel.cancelled() => Err(StoreError::Unavailable("shutting down".into())),
                    res = fut => res,
                }
            }
            None => fut.await,
        }
    }

    fn remember(&self, device_id: &str, binding: Binding) {
        self.cache.insert(device_id.to_string(), binding);
    }

    fn forget(&self, device_id: &str) {
        self.cache.remove(device_id);
    }

    fn cached(&self, device_id: &str) -> Option<Binding> {
        self.cache.get(device_id).map(|e| e.value().clone())
    }

    async fn handle_register(
        &self,
        conn: &Arc<Connection>,
        hdr: &Header,
        envelope: &Envelope,
        assisted: bool,
    ) {
        let resp_action = choose_action(assisted, action::ASSIST_REGISTER_RESP, action::REGISTER_RESP);
        let req: RegisterData = match envelope.data_as() {
            Ok(req) => req,
            Err(_) => {
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData::error(code::BAD_REQUEST, "invalid register data"),
                );
                return;
            }
        };
        if req.device_id.is_empty() {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                resp_action,
                &RespData::error(code::BAD_REQUEST, "invalid register data"),
            );
            return;
        }
        match self.store_call(self.store.upsert_device(&req.device_id)).await {
            Ok(binding) => {
                self.remember(&req.device_id, binding.clone());
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData {
                        code: code::SUCCESS,
                        msg: "ok".into(),
                        device_id: req.device_id,
                        node_id: binding.node_id,
                        credential: binding.credential,
                    },
                );
            }
            Err(e) => {
                tracing::error!(device = %req.device_id, "register failed: {}", e);
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData::error(code::INTERNAL, "internal error"),
                );
            }
        }
    }

    async fn handle_login(
        &self,
        conn: &Arc<Connection>,
        hdr: &Header,
        envelope: &Envelope,
        assisted: bool,
    ) {
        let resp_action = choose_action(assisted, action::ASSIST_LOGIN_RESP, action::LOGIN_RESP);
        let req: LoginData = match envelope.data_as() {
            Ok(req) => req,
            Err(_) => {
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    resp_action,
                    &RespData::error(code::BAD_REQUEST, "invalid login data"),
                );
                return;
            }
        };
        if req.device_id.is_empty() {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                resp_action,
                &RespData::error(code::BAD_REQUEST, "invalid login data"),
            );
            return;
        }
        let binding = match self.cached(&req.device_id) {
            Some(binding) => binding,
            None => match self.store_call(self.store.get_device(&req.device_id)).await {
                Ok(Some(binding)) => {
                    self.remember(&req.device_id, binding.clone());
                    binding
                }
                Ok(None) => {
                    send_resp(
                        &self.handle,
                        conn,
                        Some(hdr),
                        resp_action,
                        &RespData::error(code::INVALID_CREDENTIAL, "invalid credential"),
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(device = %req.device_id, "login lookup failed: {}", e);
                    send_resp(
                        &self.handle,
                        conn,
                        Some(hdr),
                        resp_action,
                        &RespData::error(code::INTERNAL, "internal error"),
                    );
                    return;
                }
            },
        };
        if !credential_matches(&req.credential, &binding.credential) {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                resp_action,
                &RespData::error(code::INVALID_CREDENTIAL, "invalid credential"),
            );
            return;
        }
        send_resp(
            &self.handle,
            conn,
            Some(hdr),
            resp_action,
            &RespData {
                code: code::SUCCESS,
                msg: "ok".into(),
                device_id: req.device_id,
                node_id: binding.node_id,
                credential: binding.credential,
            },
        );
    }

    async fn handle_assist_query(&self, conn: &Arc<Connection>, hdr: &Header, envelope: &Envelope) {
        let req: QueryCredData = match envelope.data_as() {
            Ok(req) => req,
            Err(_) => {
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
        if req.device_id.is_empty() {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                action::ASSIST_QUERY_CREDENTIAL_RESP,
                &RespData::error(code::BAD_REQUEST, "invalid query"),
            );
            return;
        }
        let binding = match self.cached(&req.device_id) {
            Some(binding) => binding,
            None => match self.store_call(self.store.get_device(&req.device_id)).await {
                Ok(Some(binding)) => {
                    self.remember(&req.device_id, binding.clone());
                    binding
                }
                Ok(None) => {
                    send_resp(
                        &self.handle,
                        conn,
                        Some(hdr),
                        action::ASSIST_QUERY_CREDENTIAL_RESP,
                        &RespData::error(code::INVALID_CREDENTIAL, "not found"),
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(device = %req.device_id, "assist query failed: {}", e);
                    send_resp(
                        &self.handle,
                        conn,
                        Some(hdr),
                        action::ASSIST_QUERY_CREDENTIAL_RESP,
                        &RespData::error(code::INTERNAL, "internal error"),
                    );
                    return;
                }
            },
        };
        send_resp(
            &self.handle,
            conn,
            Some(hdr),
            action::ASSIST_QUERY_CREDENTIAL_RESP,
            &RespData {
                code: code::SUCCESS,
                msg: "ok".into(),
                device_id: req.device_id,
                node_id: binding.node_id,
                credential: binding.credential,
            },
        );
    }

    async fn handle_revoke(&self, conn: &Arc<Connection>, hdr: &Header, envelope: &Envelope) {
        let Ok(req) = envelope.data_as::<RevokeData>() else {
            return;
        };
        if req.device_id.is_empty() {
            return;
        }
        let credential = if req.credential.is_empty() {
            None
        } else {
            Some(req.credential.as_str())
        };
        let outcome = match self
            .store_call(self.store.delete_device(&req.device_id, credential))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(device = %req.device_id, "revoke failed: {}", e);
                send_resp(
                    &self.handle,
                    conn,
                    Some(hdr),
                    action::REVOKE_RESP,
                    &RespData::error(code::INTERNAL, "internal error"),
                );
                return;
            }
        };
        self.forget(&req.device_id);
        if outcome.mismatch {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                action::REVOKE_RESP,
                &RespData {
                    code: code::CREDENTIAL_MISMATCH,
                    msg: "credential mismatch".into(),
                    device_id: req.device_id,
                    node_id: outcome.node_id,
                    credential: String::new(),
                },
            );
            return;
        }
        if outcome.removed {
            send_resp(
                &self.handle,
                conn,
                Some(hdr),
                action::REVOKE_RESP,
                &RespData {
                    code: code::SUCCESS,
                    msg: "ok".into(),
                    device_id: req.device_id,
                    node_id: outcome.node_id,
                    credential: String::new(),
                },
            );
        }
        // not found: stay silent
    }

    fn handle_offline(&self, envelope: &Envelope) {
        let Ok(req) = envelope.data_as::<OfflineData>() else {
            return;
        };
        if req.device_id.is_empty() {
            return;
        }
        self.forget(&req.device_id);
    }
}

#[async_trait]
impl SubHandler for AuthorityAuthHandler {
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

        match act.as_str() {
            action::OFFLINE | action::ASSIST_OFFLINE => {
                self.handle_offline(&envelope);
                return;
            }
            _ => {}
        }

        let Some(conn) = conn else {
            tracing::debug!(action = %act, "auth frame without connection");
            return;
        };
        match act.as_str() {
            action::REGISTER => self.handle_register(&conn, &hdr, &envelope, false).await,
            action::ASSIST_REGISTER => self.handle_register(&conn, &hdr, &envelope, true).await,
            action::LOGIN => self.handle_login(&conn, &hdr, &envelope, false).await,
            action::ASSIST_LOGIN => self.handle_login(&conn, &hdr, &envelope, true).await,
            action::ASSIST_QUERY_CREDENTIAL => {
                self.handle_assist_query(&conn, &hdr, &envelope).await;
            }
            action::REVOKE => self.handle_revoke(&conn, &hdr, &envelope).await,
            other => {
                tracing::debug!(action = other, "unknown auth action");
            }
        }
    }
}
