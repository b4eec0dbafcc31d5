use crate::connection::{meta, role, Connection, MetaValue};
use crate::metrics::counters;
use hub_wire::{Header, SUB_PROTO_AUTH};
use std::sync::Arc;

/// Gate applied to every inbound frame before it reaches the dispatcher.
///
/// Unauthenticated frames (`SourceID == 0`) are only admitted on the auth
/// sub-protocol; everything else from an unauthenticated source is dropped.
/// The first admitted frame stamps the connection's overlay role.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreRouting;

impl PreRouting {
    /// Creates the filter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns `true` when the frame may be dispatched.
    pub fn admit(&self, conn: &Arc<Connection>, hdr: &Header) -> bool {
        if hdr.source == 0 && hdr.sub_proto != SUB_PROTO_AUTH {
            counters::frames_dropped_total("unauthenticated");
            tracing::debug!(
                conn = %conn.id(),
                sub_proto = hdr.sub_proto,
                "dropping unauthenticated non-auth frame"
            );
            return false;
        }
        if conn.get_meta(meta::ROLE).is_none() {
            let r = if conn.is_outbound() {
                role::PARENT
            } else {
                role::CHILD
            };
            conn.set_meta(meta::ROLE, MetaValue::Str(r.to_string()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_wire::Major;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    async fn test_conn(outbound: bool) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        Connection::spawn(
            client,
            addr,
            outbound,
            8,
            std::time::Duration::from_secs(5),
            &CancellationToken::new(),
        )
    }

    fn header(source: u32, sub_proto: u8) -> Header {
        let mut hdr = Header::new(Major::Cmd, sub_proto).unwrap();
        hdr.source = source;
        hdr
    }

    #[tokio::test]
    async fn unauthenticated_non_auth_frame_is_dropped() {
        let filter = PreRouting::new();
        let conn = test_conn(false).await;
        assert!(!filter.admit(&conn, &header(0, 1)));
    }

    #[tokio::test]
    async fn unauthenticated_auth_frame_passes() {
        let filter = PreRouting::new();
        let conn = test_conn(false).await;
        assert!(filter.admit(&conn, &header(0, SUB_PROTO_AUTH)));
    }

    #[tokio::test]
    async fn authenticated_frame_passes_any_sub_proto() {
        let filter = PreRouting::new();
        let conn = test_conn(false).await;
        assert!(filter.admit(&conn, &header(7, 1)));
    }

    #[tokio::test]
    async fn role_stamped_once() {
        let filter = PreRouting::new();
        let conn = test_conn(true).await;
        assert!(filter.admit(&conn, &header(7, SUB_PROTO_AUTH)));
        assert_eq!(conn.role().as_deref(), Some(role::PARENT));

        // a later frame does not overwrite an existing role
        conn.set_meta(meta::ROLE, MetaValue::Str(role::PEER.into()));
        assert!(filter.admit(&conn, &header(7, SUB_PROTO_AUTH)));
        assert_eq!(conn.role().as_deref(), Some(role::PEER));
    }

    #[tokio::test]
    async fn inbound_connection_stamped_child() {
        let filter = PreRouting::new();
        let conn = test_conn(false).await;
        assert!(filter.admit(&conn, &header(0, SUB_PROTO_AUTH)));
        assert_eq!(conn.role().as_deref(), Some(role::CHILD));
    }
}
