use crate::config::HubConfig;
use crate::connection::Connection;
use hub_wire::Header;
use std::collections::HashMap;
use std::sync::Arc;

/// Permission entry matching every permission.
pub const WILDCARD: &str = "*";
/// Permission required to revoke a device binding.
pub const AUTH_REVOKE: &str = "auth.revoke";

/// Coarse role/permission lookup driven by config strings.
///
/// Nodes resolve to a role (`node_roles`, falling back to the default
/// role), and roles resolve to a permission list (`role_perms`, falling
/// back to the default permissions). Node 0 and the empty permission are
/// always allowed.
#[derive(Debug, Clone)]
pub struct Permissions {
    default_role: String,
    default_perms: Vec<String>,
    node_roles: HashMap<u32, String>,
    role_perms: HashMap<String, Vec<String>>,
}

impl Permissions {
    /// Parses the permission tables out of the hub configuration.
    #[must_use]
    pub fn from_config(cfg: &HubConfig) -> Self {
        let default_role = {
            let trimmed = cfg.auth_default_role.trim();
            if trimmed.is_empty() { "node" } else { trimmed }.to_string()
        };
        Self {
            default_role,
            default_perms: parse_list(&cfg.auth_default_perms),
            node_roles: parse_node_roles(&cfg.auth_node_roles),
            role_perms: parse_role_perms(&cfg.auth_role_perms),
        }
    }

    /// Role of a node, falling back to the default role.
    #[must_use]
    pub fn resolve_role(&self, node_id: u32) -> &str {
        if node_id != 0 {
            if let Some(role) = self.node_roles.get(&node_id) {
                return role;
            }
        }
        &self.default_role
    }

    /// Permission list of a node's role.
    #[must_use]
    pub fn resolve_perms(&self, node_id: u32) -> &[String] {
        let role = self.resolve_role(node_id);
        self.role_perms
            .get(role)
            .map_or(self.default_perms.as_slice(), Vec::as_slice)
    }

    /// `true` when the node may exercise the permission.
    #[must_use]
    pub fn has(&self, node_id: u32, perm: &str) -> bool {
        if perm.is_empty() || node_id == 0 {
            return true;
        }
        self.resolve_perms(node_id)
            .iter()
            .any(|entry| entry == WILDCARD || entry == perm)
    }
}

/// Node id attributable to a frame: the header source, falling back to the
/// connection's bound node id.
#[must_use]
pub fn source_node_id(hdr: &Header, conn: Option<&Arc<Connection>>) -> u32 {
    if hdr.source != 0 {
        return hdr.source;
    }
    conn.and_then(|c| c.node_id()).unwrap_or(0)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_node_roles(raw: &str) -> HashMap<u32, String> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((id, role)) = pair.split_once(':') else {
            continue;
        };
        let role = role.trim();
        if let Ok(id) = id.trim().parse::<u32>() {
            if !role.is_empty() {
                out.insert(id, role.to_string());
            }
        }
    }
    out
}

fn parse_role_perms(raw: &str) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((role, perms)) = pair.split_once(':') else {
            continue;
        };
        let role = role.trim();
        if !role.is_empty() {
            out.insert(role.to_string(), parse_list(perms));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(default_perms: &str, node_roles: &str, role_perms: &str) -> Permissions {
        let mut cfg = crate::config::tests::valid_config();
        cfg.auth_default_perms = default_perms.to_string();
        cfg.auth_node_roles = node_roles.to_string();
        cfg.auth_role_perms = role_perms.to_string();
        Permissions::from_config(&cfg)
    }

    #[test]
    fn defaults_grant_wildcard() {
        let p = perms("*", "", "");
        assert!(p.has(7, AUTH_REVOKE));
        assert!(p.has(7, "anything.else"));
    }

    #[test]
    fn node_zero_and_empty_perm_always_allowed() {
        let p = perms("", "", "");
        assert!(p.has(0, AUTH_REVOKE));
        assert!(p.has(7, ""));
        assert!(!p.has(7, AUTH_REVOKE));
    }

    #[test]
    fn role_table_overrides_default() {
        let p = perms("*", "7:readonly", "readonly:var.get");
        assert!(!p.has(7, AUTH_REVOKE));
        assert!(p.has(7, "var.get"));
        // other nodes still use the default role and perms
        assert!(p.has(8, AUTH_REVOKE));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let p = perms("*", "x:admin;9", "admin:*;:oops");
        assert_eq!(p.resolve_role(9), "node");
        assert!(p.has(9, AUTH_REVOKE));
    }

    #[test]
    fn resolve_role_prefers_node_entry() {
        let p = perms("*", "3:admin", "admin:auth.revoke");
        assert_eq!(p.resolve_role(3), "admin");
        assert_eq!(p.resolve_role(4), "node");
        assert!(p.has(3, AUTH_REVOKE));
        assert!(!p.has(3, "var.private_set"));
    }
}
