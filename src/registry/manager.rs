//! The client-manager registry (C7): a flat list of hosts able to start and
//! stop load-client processes on demand, with per-host capacity bookkeeping
//! so the coordinator never asks a host to exceed its declared limit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::registry::RegisteredConnection;

struct ManagedHost {
    conn: Arc<dyn RegisteredConnection>,
    max_clients_this_host: u32,
    started_count: u32,
}

#[derive(Default)]
pub struct ManagerRegistry {
    hosts: RwLock<HashMap<String, ManagedHost>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        conn: Arc<dyn RegisteredConnection>,
        max_clients_this_host: u32,
    ) -> CoreResult<()> {
        let mut guard = self.hosts.write();
        if guard.contains_key(conn.client_id()) {
            return Err(CoreError::Protocol(format!(
                "duplicate client-manager id '{}'",
                conn.client_id()
            )));
        }
        guard.insert(
            conn.client_id().to_string(),
            ManagedHost {
                conn,
                max_clients_this_host,
                started_count: 0,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, client_id: &str) {
        self.hosts.write().remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    /// Snapshot of all registered managers, for admin status listings (§6).
    pub fn snapshot(&self) -> Vec<Arc<dyn RegisteredConnection>> {
        self.hosts.read().values().map(|h| h.conn.clone()).collect()
    }

    /// Decrements `started_count` for the manager whose host matches `ip`,
    /// if any (§4.7: "C4 informs C7 whenever a load session is lost so
    /// that the manager whose IP matches can decrement its started_count;
    /// a stale count does not cause correctness issues"). Silently a no-op
    /// if no manager registered at that address.
    pub fn record_load_client_lost(&self, ip: IpAddr) {
        let mut guard = self.hosts.write();
        if let Some(host) = guard.values_mut().find(|h| h.conn.remote_ip() == ip) {
            host.started_count = host.started_count.saturating_sub(1);
        }
    }

    /// How many load-client processes this host currently believes it has
    /// started, for `stop_clients`'s "n <= started_count" validation (§4.7).
    pub fn started_count(&self, client_id: &str) -> CoreResult<u32> {
        let guard = self.hosts.read();
        let host = guard
            .get(client_id)
            .ok_or_else(|| CoreError::Protocol(format!("no such client manager '{client_id}'")))?;
        Ok(host.started_count)
    }

    /// How many more load-client processes this host can still be asked to
    /// start, bounded by the limit it declared at hello time.
    pub fn available_capacity(&self, client_id: &str) -> CoreResult<u32> {
        let guard = self.hosts.read();
        let host = guard
            .get(client_id)
            .ok_or_else(|| CoreError::Protocol(format!("no such client manager '{client_id}'")))?;
        Ok(host.max_clients_this_host.saturating_sub(host.started_count))
    }

    /// Records that `count` more load clients were successfully started on
    /// this host, refusing to exceed the host's declared limit.
    pub fn record_started(&self, client_id: &str, count: u32) -> CoreResult<()> {
        let mut guard = self.hosts.write();
        let host = guard
            .get_mut(client_id)
            .ok_or_else(|| CoreError::Protocol(format!("no such client manager '{client_id}'")))?;
        let next = host.started_count + count;
        if next > host.max_clients_this_host {
            return Err(CoreError::Capacity(format!(
                "starting {count} more would exceed {client_id}'s limit of {}",
                host.max_clients_this_host
            )));
        }
        host.started_count = next;
        Ok(())
    }

    /// Records that `count` load clients on this host stopped (0 means
    /// "stop all", mirroring `stop-client-request`'s wire encoding).
    pub fn record_stopped(&self, client_id: &str, count: u32) -> CoreResult<()> {
        let mut guard = self.hosts.write();
        let host = guard
            .get_mut(client_id)
            .ok_or_else(|| CoreError::Protocol(format!("no such client manager '{client_id}'")))?;
        host.started_count = if count == 0 {
            0
        } else {
            host.started_count.saturating_sub(count)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct FakeConn {
        id: String,
    }

    impl RegisteredConnection for FakeConn {
        fn client_id(&self) -> &str {
            &self.id
        }
        fn remote_ip(&self) -> IpAddr {
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        }
    }

    fn conn(id: &str) -> Arc<dyn RegisteredConnection> {
        Arc::new(FakeConn { id: id.to_string() })
    }

    #[test]
    fn records_started_up_to_the_declared_limit() {
        let registry = ManagerRegistry::new();
        registry.register(conn("host-1"), 4).unwrap();
        registry.record_started("host-1", 4).unwrap();
        assert_eq!(registry.available_capacity("host-1").unwrap(), 0);
        assert!(registry.record_started("host-1", 1).is_err());
    }

    #[test]
    fn stop_all_resets_started_count_to_zero() {
        let registry = ManagerRegistry::new();
        registry.register(conn("host-1"), 4).unwrap();
        registry.record_started("host-1", 3).unwrap();
        registry.record_stopped("host-1", 0).unwrap();
        assert_eq!(registry.available_capacity("host-1").unwrap(), 4);
    }
}
