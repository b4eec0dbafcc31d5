use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// A device's persistent identity: assigned node id plus credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Node id assigned at first register, stable across re-registers.
    pub node_id: u32,
    /// 32 random bytes, base64url unpadded.
    pub credential: String,
}

/// Result of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Node id of the (formerly) bound device, 0 when unknown.
    pub node_id: u32,
    /// The binding existed and was deleted.
    pub removed: bool,
    /// A credential was supplied and did not match; nothing was deleted.
    pub mismatch: bool,
}

/// Errors surfaced by device stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store was closed.
    #[error("store closed")]
    Closed,
}

/// Persistent device→(node id, credential) mapping consumed by the
/// authority handler. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates or returns the binding for a device. The node id and
    /// credential are assigned once and returned unchanged on re-register.
    async fn upsert_device(&self, device_id: &str) -> Result<Binding, StoreError>;

    /// Looks up a binding.
    async fn get_device(&self, device_id: &str) -> Result<Option<Binding>, StoreError>;

    /// Deletes a binding. When `credential` is supplied it must match,
    /// otherwise the delete is refused with `mismatch`.
    async fn delete_device(
        &self,
        device_id: &str,
        credential: Option<&str>,
    ) -> Result<DeleteOutcome, StoreError>;

    /// Releases backing resources.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Generates a fresh credential: 32 random bytes, base64url unpadded.
#[must_use]
pub fn generate_credential() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Constant-time credential comparison. Unequal lengths compare false.
#[must_use]
pub fn credential_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// In-process [`Store`] for self-contained deployments and tests. Node ids
/// are allocated from a monotone counter above the configured root id; the
/// counter is not persisted across restarts.
pub struct MemoryStore {
    devices: DashMap<String, Binding>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Creates a store allocating node ids starting at `root_node_id + 1`.
    #[must_use]
    pub fn new(root_node_id: u32) -> Self {
        Self {
            devices: DashMap::new(),
            next_id: AtomicU32::new(root_node_id.saturating_add(1)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_device(&self, device_id: &str) -> Result<Binding, StoreError> {
        self.ensure_open()?;
        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Binding {
                node_id: self.next_id.fetch_add(1, Ordering::Relaxed),
                credential: generate_credential(),
            });
        Ok(entry.value().clone())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Binding>, StoreError> {
        self.ensure_open()?;
        Ok(self.devices.get(device_id).map(|e| e.value().clone()))
    }

    async fn delete_device(
        &self,
        device_id: &str,
        credential: Option<&str>,
    ) -> Result<DeleteOutcome, StoreError> {
        self.ensure_open()?;
        let Some(existing) = self.devices.get(device_id).map(|e| e.value().clone()) else {
            return Ok(DeleteOutcome {
                node_id: 0,
                removed: false,
                mismatch: false,
            });
        };
        if let Some(cred) = credential {
            if !credential_matches(cred, &existing.credential) {
                return Ok(DeleteOutcome {
                    node_id: existing.node_id,
                    removed: false,
                    mismatch: true,
                });
            }
        }
        self.devices.remove(device_id);
        Ok(DeleteOutcome {
            node_id: existing.node_id,
            removed: true,
            mismatch: false,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
