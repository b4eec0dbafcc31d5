use hub_wire::auth::{action, Envelope, LoginData, RegisterData, RespData, RevokeData};
use hub_wire::{encode, read_frame, Header, Major, SUB_PROTO_AUTH};
use hubd::config::HubConfig;
use hubd::Hub;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

pub fn test_config() -> HubConfig {
    HubConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        node_id: 1,
        root_node_id: 0,
        parent_addr: None,
        parent_enable: false,
        parent_reconnect_secs: 1,
        authority_node_id: 0,
        authority_mode: false,
        store_dsn: None,
        channel_count: 2,
        workers_per_channel: 2,
        channel_buffer: 128,
        enqueue_timeout_ms: 200,
        send_buffer: 64,
        write_timeout_secs: 5,
        pending_timeout_secs: 10,
        auth_default_role: "node".into(),
        auth_default_perms: "*".into(),
        auth_node_roles: String::new(),
        auth_role_perms: String::new(),
    }
}

pub async fn start_hub(cfg: HubConfig) -> (Arc<Hub>, SocketAddr) {
    let hub = Hub::new(cfg).expect("hub config");
    let addr = hub.start().await.expect("hub start");
    (hub, addr)
}

/// Self-authoritative edge hub, the S1 topology: no parent, root node 1.
pub async fn start_edge_hub() -> (Arc<Hub>, SocketAddr) {
    start_hub(test_config()).await
}

/// Authority hub backed by the in-process store.
pub async fn start_authority_hub() -> (Arc<Hub>, SocketAddr) {
    let mut cfg = test_config();
    cfg.authority_mode = true;
    start_hub(cfg).await
}

/// Edge hub maintaining a parent link to `parent`.
pub async fn start_edge_with_parent(parent: SocketAddr, node_id: u32) -> (Arc<Hub>, SocketAddr) {
    let mut cfg = test_config();
    cfg.node_id = node_id;
    cfg.parent_enable = true;
    cfg.parent_addr = Some(parent);
    cfg.authority_node_id = 1;
    start_hub(cfg).await
}

/// Polls `predicate` every 10 ms until it holds, panicking after 2 s.
pub async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A device-side client speaking the frame protocol over TCP.
pub struct TestClient {
    stream: TcpStream,
    msg_seq: u32,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("client connect");
        Self { stream, msg_seq: 0 }
    }

    pub async fn send_frame(&mut self, hdr: &Header, payload: &[u8]) {
        let frame = encode(hdr, payload);
        self.stream.write_all(&frame).await.expect("client write");
    }

    pub async fn send_raw(&mut self, sub_proto: u8, source: u32, payload: &[u8]) {
        self.msg_seq += 1;
        let mut hdr = Header::new(Major::Cmd, sub_proto).unwrap();
        hdr.msg_id = self.msg_seq;
        hdr.source = source;
        self.send_frame(&hdr, payload).await;
    }

    pub async fn send_action<T: Serialize>(&mut self, act: &str, data: &T) {
        let payload = Envelope::new(act, data).unwrap().to_bytes().unwrap();
        self.send_raw(SUB_PROTO_AUTH, 0, &payload).await;
    }

    pub async fn recv_frame(&mut self) -> (Header, Vec<u8>) {
        timeout(Duration::from_secs(2), read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for frame")
            .expect("frame decode")
    }

    /// Receives one auth frame and parses the envelope into its action name
    /// and response payload.
    pub async fn recv_resp(&mut self) -> (String, RespData) {
        let (hdr, payload) = self.recv_frame().await;
        assert_eq!(hdr.sub_proto, SUB_PROTO_AUTH);
        let envelope = Envelope::from_bytes(&payload).expect("auth envelope");
        let resp: RespData = envelope.data_as().expect("resp data");
        (envelope.action, resp)
    }

    /// Returns a frame if one arrives within `wait`, `None` otherwise.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<(Header, Vec<u8>)> {
        match timeout(wait, read_frame(&mut self.stream)).await {
            Ok(Ok(frame)) => Some(frame),
            _ => None,
        }
    }

    pub async fn register(&mut self, device_id: &str) -> RespData {
        self.send_action(
            action::REGISTER,
            &RegisterData {
                device_id: device_id.into(),
            },
        )
        .await;
        let (act, resp) = self.recv_resp().await;
        assert_eq!(act, action::REGISTER_RESP);
        resp
    }

    pub async fn login(&mut self, device_id: &str, credential: &str) -> RespData {
        self.send_action(
            action::LOGIN,
            &LoginData {
                device_id: device_id.into(),
                credential: credential.into(),
            },
        )
        .await;
        let (act, resp) = self.recv_resp().await;
        assert_eq!(act, action::LOGIN_RESP);
        resp
    }

    pub async fn revoke(&mut self, device_id: &str, node_id: u32, credential: &str) {
        self.send_action(
            action::REVOKE,
            &RevokeData {
                device_id: device_id.into(),
                node_id,
                credential: credential.into(),
            },
        )
        .await;
    }
}
