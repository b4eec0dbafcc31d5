//! Authentication sub-protocol envelope and payload types.
//!
//! Auth frames carry a JSON payload of the form
//! `{"action": <string>, "data": <object>}`. Responses use the
//! `<request>_resp` action name; `data.code` is the authoritative outcome
//! indicator (1 = success).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Action names of the authentication protocol (closed set).
pub mod action {
    /// Device registration at the directly connected hub.
    pub const REGISTER: &str = "register";
    /// Registration forwarded from an edge hub to the authority.
    pub const ASSIST_REGISTER: &str = "assist_register";
    /// Response to [`REGISTER`].
    pub const REGISTER_RESP: &str = "register_resp";
    /// Response to [`ASSIST_REGISTER`].
    pub const ASSIST_REGISTER_RESP: &str = "assist_register_resp";
    /// Device login.
    pub const LOGIN: &str = "login";
    /// Login forwarded from an edge hub to the authority.
    pub const ASSIST_LOGIN: &str = "assist_login";
    /// Response to [`LOGIN`].
    pub const LOGIN_RESP: &str = "login_resp";
    /// Response to [`ASSIST_LOGIN`].
    pub const ASSIST_LOGIN_RESP: &str = "assist_login_resp";
    /// Binding revocation, rebroadcast through the overlay.
    pub const REVOKE: &str = "revoke";
    /// Response to [`REVOKE`] (only from hubs that held the binding).
    pub const REVOKE_RESP: &str = "revoke_resp";
    /// Credential lookup forwarded to the authority.
    pub const ASSIST_QUERY_CREDENTIAL: &str = "assist_query_credential";
    /// Response to [`ASSIST_QUERY_CREDENTIAL`].
    pub const ASSIST_QUERY_CREDENTIAL_RESP: &str = "assist_query_credential_resp";
    /// Device going offline; evicts cached bindings. Never answered.
    pub const OFFLINE: &str = "offline";
    /// Offline propagated from an edge hub to its parent. Never answered.
    pub const ASSIST_OFFLINE: &str = "assist_offline";
}

/// Response codes carried in `data.code`.
pub mod code {
    /// Success.
    pub const SUCCESS: i32 = 1;
    /// Malformed request payload.
    pub const BAD_REQUEST: i32 = 400;
    /// Device unknown or credential mismatch on login.
    pub const INVALID_CREDENTIAL: i32 = 4001;
    /// Authority unreachable or the assist round-trip failed.
    pub const ASSIST_FAILED: i32 = 4002;
    /// Whitelist entry not found on revoke (usually silent).
    pub const NOT_FOUND: i32 = 4401;
    /// Credential mismatch on revoke.
    pub const CREDENTIAL_MISMATCH: i32 = 4402;
    /// Internal error.
    pub const INTERNAL: i32 = 4500;
    /// Internal error while processing offline.
    pub const OFFLINE_INTERNAL: i32 = 4700;
    /// Offline target index not found.
    pub const OFFLINE_INDEX_NOT_FOUND: i32 = 4701;
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Outer auth message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Action name from the [`action`] set.
    pub action: String,
    /// Action-specific payload, parsed per action.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Builds an envelope from an action name and a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `data` cannot be represented as JSON.
    pub fn new<T: Serialize>(action: &str, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            action: action.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Serializes the envelope into frame payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error on non-JSON-representable content.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from frame payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error on malformed JSON.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Deserializes the inner `data` object into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error when `data` does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

/// `register` / `assist_register` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterData {
    /// Opaque device identifier, unique key of the binding.
    #[serde(default)]
    pub device_id: String,
}

/// `login` / `assist_login` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginData {
    /// Device identifier to authenticate.
    #[serde(default)]
    pub device_id: String,
    /// Credential presented by the device.
    #[serde(default)]
    pub credential: String,
}

/// `revoke` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevokeData {
    /// Device whose binding is revoked.
    #[serde(default)]
    pub device_id: String,
    /// Bound node id, if known to the caller.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub node_id: u32,
    /// Optional credential; when present it must match the binding.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// `assist_query_credential` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCredData {
    /// Device identifier to look up.
    #[serde(default)]
    pub device_id: String,
}

/// `offline` / `assist_offline` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineData {
    /// Device going offline.
    #[serde(default)]
    pub device_id: String,
    /// Bound node id, used to clear the node index.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub node_id: u32,
    /// Free-form reason, informational only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Response payload for all `*_resp` actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RespData {
    /// Outcome code from the [`code`] set.
    pub code: i32,
    /// Human-readable outcome description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    /// Device the response refers to; correlation key for assist replies.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    /// Node id bound to the device.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub node_id: u32,
    /// Credential bound to the device, present on register/query success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl RespData {
    /// Shorthand for an error response with no binding fields.
    #[must_use]
    pub fn error(code: i32, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_typed_data() {
        let env = Envelope::new(
            action::LOGIN,
            &LoginData {
                device_id: "mac-01".into(),
                credential: "secret".into(),
            },
        )
        .unwrap();
        let bytes = env.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.action, action::LOGIN);
        let data: LoginData = parsed.data_as().unwrap();
        assert_eq!(data.device_id, "mac-01");
        assert_eq!(data.credential, "secret");
    }

    #[test]
    fn resp_data_skips_empty_optional_fields() {
        let resp = RespData::error(code::INVALID_CREDENTIAL, "invalid credential");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("4001"));
        assert!(!json.contains("device_id"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("credential"));
    }

    #[test]
    fn resp_data_carries_binding_on_success() {
        let resp = RespData {
            code: code::SUCCESS,
            msg: "ok".into(),
            device_id: "mac-01".into(),
            node_id: 2,
            credential: "tok".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["code"], 1);
        assert_eq!(json["node_id"], 2);
        assert_eq!(json["credential"], "tok");
    }

    #[test]
    fn revoke_data_tolerates_missing_optionals() {
        let data: RevokeData = serde_json::from_str(r#"{"device_id":"d1"}"#).unwrap();
        assert_eq!(data.device_id, "d1");
        assert_eq!(data.node_id, 0);
        assert!(data.credential.is_empty());
    }

    #[test]
    fn envelope_without_data_defaults_to_null() {
        let env = Envelope::from_bytes(br#"{"action":"offline"}"#).unwrap();
        assert_eq!(env.action, action::OFFLINE);
        let data: OfflineData = env.data_as().unwrap_or_default();
        assert!(data.device_id.is_empty());
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(Envelope::from_bytes(b"not json").is_err());
    }
}
