use clap::Parser;
use std::net::SocketAddr;

/// CLI arguments for the hub daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "hubd")]
#[command(about = "Hierarchical device auth hub")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:9100", env = "HUBD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9190", env = "HUBD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Node id of this hub.
    #[arg(long, default_value = "1", env = "HUBD_NODE_ID")]
    pub node_id: u32,
    /// Root node id seeding self-authority allocation (0 = use node id).
    #[arg(long, default_value = "0", env = "HUBD_ROOT_NODE_ID")]
    pub root_node_id: u32,
    /// Address of the parent hub.
    #[arg(long, env = "HUBD_PARENT_ADDR")]
    pub parent_addr: Option<SocketAddr>,
    /// Maintain a connection to the parent hub.
    #[arg(long, default_value = "false", env = "HUBD_PARENT_ENABLE")]
    pub parent_enable: bool,
    /// Seconds between parent reconnect attempts.
    #[arg(long, default_value = "3", env = "HUBD_PARENT_RECONNECT")]
    pub parent_reconnect_secs: u64,
    /// Node id of the authority hub (0 = unset, fall back to parent link).
    #[arg(long, default_value = "0", env = "HUBD_AUTHORITY_NODE_ID")]
    pub authority_node_id: u32,
    /// Serve auth verbs authoritatively, backed by the device store.
    #[arg(long, default_value = "false", env = "HUBD_AUTHORITY_MODE")]
    pub authority_mode: bool,
    /// Device store DSN. The in-process store ignores it; accepted so
    /// deployments can pass one through uniformly.
    #[arg(long, env = "HUBD_STORE_DSN")]
    pub store_dsn: Option<String>,
    /// Number of dispatcher shards.
    #[arg(long, default_value = "2", env = "HUBD_CHANNEL_COUNT")]
    pub channel_count: usize,
    /// Worker tasks per dispatcher shard.
    #[arg(long, default_value = "2", env = "HUBD_WORKERS_PER_CHANNEL")]
    pub workers_per_channel: usize,
    /// Capacity of each dispatcher shard queue.
    #[arg(long, default_value = "128", env = "HUBD_CHANNEL_BUFFER")]
    pub channel_buffer: usize,
    /// Milliseconds to wait for dispatcher queue space before dropping.
    #[arg(long, default_value = "200", env = "HUBD_ENQUEUE_TIMEOUT_MS")]
    pub enqueue_timeout_ms: u64,
    /// Capacity of each connection's outbound queue.
    #[arg(long, default_value = "64", env = "HUBD_SEND_BUFFER")]
    pub send_buffer: usize,
    /// Socket write deadline in seconds.
    #[arg(long, default_value = "5", env = "HUBD_WRITE_TIMEOUT")]
    pub write_timeout_secs: u64,
    /// Seconds before an in-flight assist forward times out.
    #[arg(long, default_value = "10", env = "HUBD_PENDING_TIMEOUT")]
    pub pending_timeout_secs: u64,
    /// Role assigned to nodes without an explicit entry.
    #[arg(long, default_value = "node", env = "HUBD_AUTH_DEFAULT_ROLE")]
    pub auth_default_role: String,
    /// Comma-separated permissions of the default role.
    #[arg(long, default_value = "*", env = "HUBD_AUTH_DEFAULT_PERMS")]
    pub auth_default_perms: String,
    /// Node-to-role overrides, e.g. "1:admin;7:node".
    #[arg(long, default_value = "", env = "HUBD_AUTH_NODE_ROLES")]
    pub auth_node_roles: String,
    /// Role-to-permission table, e.g. "admin:*;node:auth.revoke".
    #[arg(long, default_value = "", env = "HUBD_AUTH_ROLE_PERMS")]
    pub auth_role_perms: String,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Node id of this hub.
    pub node_id: u32,
    /// Root node id seeding self-authority allocation.
    pub root_node_id: u32,
    /// Address of the parent hub.
    pub parent_addr: Option<SocketAddr>,
    /// Maintain a connection to the parent hub.
    pub parent_enable: bool,
    /// Seconds between parent reconnect attempts.
    pub parent_reconnect_secs: u64,
    /// Node id of the authority hub (0 = unset).
    pub authority_node_id: u32,
    /// Serve auth verbs authoritatively.
    pub authority_mode: bool,
    /// Device store DSN, passed through to external store factories.
    pub store_dsn: Option<String>,
    /// Number of dispatcher shards.
    pub channel_count: usize,
    /// Worker tasks per dispatcher shard.
    pub workers_per_channel: usize,
    /// Capacity of each dispatcher shard queue.
    pub channel_buffer: usize,
    /// Milliseconds to wait for dispatcher queue space before dropping.
    pub enqueue_timeout_ms: u64,
    /// Capacity of each connection's outbound queue.
    pub send_buffer: usize,
    /// Socket write deadline in seconds.
    pub write_timeout_secs: u64,
    /// Seconds before an in-flight assist forward times out.
    pub pending_timeout_secs: u64,
    /// Role assigned to nodes without an explicit entry.
    pub auth_default_role: String,
    /// Comma-separated permissions of the default role.
    pub auth_default_perms: String,
    /// Node-to-role overrides.
    pub auth_node_roles: String,
    /// Role-to-permission table.
    pub auth_role_perms: String,
}

impl HubConfig {
    /// Node id seeding the self-authority allocator.
    #[must_use]
    pub const fn allocation_seed(&self) -> u32 {
        if self.root_node_id == 0 {
            self.node_id
        } else {
            self.root_node_id
        }
    }

    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first rejected value.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id == 0 {
            return Err("node_id must be greater than 0".to_string());
        }
        if self.authority_mode && self.parent_enable {
            return Err("authority_mode cannot be combined with parent_enable".to_string());
        }
        if self.parent_enable && self.parent_addr.is_none() {
            return Err("parent_enable requires parent_addr".to_string());
        }
        if self.parent_reconnect_secs == 0 {
            return Err("parent_reconnect_secs must be greater than 0".to_string());
        }
        if self.channel_count == 0 {
            return Err("channel_count must be greater than 0".to_string());
        }
        if self.channel_count > 1024 {
            return Err("channel_count exceeds reasonable limit (1024)".to_string());
        }
        if self.workers_per_channel == 0 {
            return Err("workers_per_channel must be greater than 0".to_string());
        }
        if self.workers_per_channel > 256 {
            return Err("workers_per_channel exceeds reasonable limit (256)".to_string());
        }
        if self.channel_buffer == 0 {
            return Err("channel_buffer must be greater than 0".to_string());
        }
        if self.enqueue_timeout_ms == 0 {
            return Err("enqueue_timeout_ms must be greater than 0".to_string());
        }
        if self.enqueue_timeout_ms > 60_000 {
            return Err("enqueue_timeout_ms exceeds reasonable limit (60000)".to_string());
        }
        if self.send_buffer == 0 {
            return Err("send_buffer must be greater than 0".to_string());
        }
        if self.write_timeout_secs == 0 || self.write_timeout_secs > 60 {
            return Err("write_timeout_secs must be within 1..=60".to_string());
        }
        if self.pending_timeout_secs == 0 || self.pending_timeout_secs > 300 {
            return Err("pending_timeout_secs must be within 1..=300".to_string());
        }
        Ok(())
    }
}

impl From<Args> for HubConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            node_id: args.node_id,
            root_node_id: args.root_node_id,
            parent_addr: args.parent_addr,
            parent_enable: args.parent_enable,
            parent_reconnect_secs: args.parent_reconnect_secs,
            authority_node_id: args.authority_node_id,
            authority_mode: args.authority_mode,
            store_dsn: args.store_dsn,
            channel_count: args.channel_count,
            workers_per_channel: args.workers_per_channel,
            channel_buffer: args.channel_buffer,
            enqueue_timeout_ms: args.enqueue_timeout_ms,
            send_buffer: args.send_buffer,
            write_timeout_secs: args.write_timeout_secs,
            pending_timeout_secs: args.pending_timeout_secs,
            auth_default_role: args.auth_default_role,
            auth_default_perms: args.auth_default_perms,
            auth_node_roles: args.auth_node_roles,
            auth_role_perms: args.auth_role_perms,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> HubConfig {
        HubConfig {
            listen: "127.0.0.1:9100".parse().unwrap(),
            metrics_addr: "127.0.0.1:9190".parse().unwrap(),
            node_id: 1,
            root_node_id: 0,
            parent_addr: None,
            parent_enable: false,
            parent_reconnect_secs: 3,
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

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn node_id_zero_rejected() {
        let mut c = valid_config();
        c.node_id = 0;
        assert!(c.validate().unwrap_err().contains("node_id"));
    }

    #[test]
    fn authority_mode_conflicts_with_parent() {
        let mut c = valid_config();
        c.authority_mode = true;
        c.parent_enable = true;
        c.parent_addr = Some("127.0.0.1:9101".parse().unwrap());
        assert!(c.validate().unwrap_err().contains("authority_mode"));
    }

    #[test]
    fn parent_enable_requires_addr() {
        let mut c = valid_config();
        c.parent_enable = true;
        assert!(c.validate().unwrap_err().contains("parent_addr"));
    }

    #[test]
    fn channel_count_bounds() {
        let mut c = valid_config();
        c.channel_count = 0;
        assert!(c.validate().is_err());
        c.channel_count = 1025;
        assert!(c.validate().is_err());
        c.channel_count = 1024;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn timeout_bounds() {
        let mut c = valid_config();
        c.write_timeout_secs = 0;
        assert!(c.validate().is_err());
        c.write_timeout_secs = 61;
        assert!(c.validate().is_err());
        c.write_timeout_secs = 10;
        c.pending_timeout_secs = 0;
        assert!(c.validate().is_err());
        c.pending_timeout_secs = 301;
        assert!(c.validate().is_err());
    }

    #[test]
    fn allocation_seed_falls_back_to_node_id() {
        let mut c = valid_config();
        assert_eq!(c.allocation_seed(), 1);
        c.root_node_id = 5;
        assert_eq!(c.allocation_seed(), 5);
    }
}
