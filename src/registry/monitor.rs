//! The resource-monitor registry (C5): keyed by client ID, with colocation
//! lookups by IP address so a load client's host can be matched to the
//! monitor watching it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::registry::RegisteredConnection;

#[derive(Debug, Default)]
pub struct MonitorRegistry {
    connections: RwLock<HashMap<String, Arc<dyn RegisteredConnection>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses a duplicate client ID (§4.5), the same as the load registry.
    pub fn register(&self, conn: Arc<dyn RegisteredConnection>) -> CoreResult<()> {
        let mut guard = self.connections.write();
        if guard.contains_key(conn.client_id()) {
            return Err(CoreError::Protocol(format!(
                "duplicate resource-monitor client id '{}'",
                conn.client_id()
            )));
        }
        guard.insert(conn.client_id().to_string(), conn);
        Ok(())
    }

    pub fn unregister(&self, client_id: &str) {
        self.connections.write().remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of all registered monitors, for admin status listings (§6).
    pub fn snapshot(&self) -> Vec<Arc<dyn RegisteredConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// All monitors colocated on the same host as `ip` — a load client's
    /// resource usage is reported by whichever monitor shares its address.
    pub fn monitors_at(&self, ip: IpAddr) -> Vec<Arc<dyn RegisteredConnection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.remote_ip() == ip)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FakeConn {
        id: String,
        ip: IpAddr,
    }

    impl RegisteredConnection for FakeConn {
        fn client_id(&self) -> &str {
            &self.id
        }
        fn remote_ip(&self) -> IpAddr {
            self.ip
        }
    }

    fn conn(id: &str, ip: [u8; 4]) -> Arc<dyn RegisteredConnection> {
        Arc::new(FakeConn {
            id: id.to_string(),
            ip: IpAddr::V4(Ipv4Addr::from(ip)),
        })
    }

    #[test]
    fn duplicate_client_id_is_refused() {
        let registry = MonitorRegistry::new();
        registry.register(conn("mon-1", [10, 0, 0, 1])).unwrap();
        assert!(registry.register(conn("mon-1", [10, 0, 0, 2])).is_err());
    }

    #[test]
    fn colocation_lookup_matches_by_ip() {
        let registry = MonitorRegistry::new();
        registry.register(conn("mon-1", [10, 0, 0, 1])).unwrap();
        registry.register(conn("mon-2", [10, 0, 0, 2])).unwrap();

        let at_host = registry.monitors_at(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(at_host.len(), 1);
        assert_eq!(at_host[0].client_id(), "mon-1");

        let elsewhere = registry.monitors_at(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)));
        assert!(elsewhere.is_empty());
    }
}
