//! The load-client registry (C4): two views over the connected load
//! clients — the full set (for status listings) and the available subset
//! (neither busy nor restricted-away from this selection), plus the
//! cohort-selection policy that moves sessions from one to the other
//! (§3, §4.4).
//!
//! Unlike the monitor/manager/stat registries, the load registry does
//! *not* refuse a duplicate client ID at admission (§4.4: "Load sessions
//! do not enforce this uniqueness — multiple clients per host are
//! permitted"), so membership is tracked by connection identity
//! (`Arc::ptr_eq`), not by client ID.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::registry::{try_write_within, RegisteredConnection};

type Conn = Arc<dyn RegisteredConnection>;

#[derive(Default)]
pub struct LoadRegistry {
    full: RwLock<Vec<Conn>>,
    available: RwLock<Vec<Conn>>,
}

fn remove_by_identity(list: &mut Vec<Conn>, target: &Conn) -> bool {
    let before = list.len();
    list.retain(|c| !Arc::ptr_eq(c, target));
    list.len() != before
}

impl LoadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a newly handshaken load client into both the full and
    /// available views. Gives up rather than blocking the accept loop
    /// indefinitely if the write lock isn't free within `lock_timeout`
    /// (§4.4, §5).
    pub fn register(&self, conn: Conn, lock_timeout: Duration) -> CoreResult<()> {
        let mut full = try_write_within(&self.full, lock_timeout)?;
        full.push(conn.clone());
        drop(full);
        self.available.write().push(conn);
        Ok(())
    }

    /// Removes a session from both views (connection-loss path, §4.4).
    pub fn unregister(&self, conn: &Conn) {
        self.full.write().retain(|c| !Arc::ptr_eq(c, conn));
        self.available.write().retain(|c| !Arc::ptr_eq(c, conn));
    }

    pub fn len(&self) -> usize {
        self.full.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available_len(&self) -> usize {
        self.available.read().len()
    }

    /// Snapshot of the full list, for admin status listings (§6).
    pub fn snapshot(&self) -> Vec<Conn> {
        self.full.read().clone()
    }

    /// Re-inserts a session into the available list on job completion
    /// (§4.4). Idempotent: a session already present is a no-op (§8
    /// property 4 "round-trip completion").
    pub fn mark_available(&self, conn: &Conn) {
        let mut available = self.available.write();
        if !available.iter().any(|c| Arc::ptr_eq(c, conn)) {
            available.push(conn.clone());
        }
    }

    /// Picks `count` distinct load clients to run a job against, committing
    /// the removal from the available list only on success (§8 property 3
    /// "cohort atomicity"): either exactly `count` sessions come out and are
    /// removed from the available list exactly once, or an error is
    /// returned and the available list is left bitwise-unchanged.
    ///
    /// `explicit_ips` are honored first: one eligible client per requested
    /// address, in order; missing any is a hard failure (§4.4 step 2).
    /// Remaining slots are filled round-robin across the distinct IPs of
    /// the clients left over, so a single loaded-down host can't supply the
    /// whole cohort (§4.4 step 3). Restricted-mode sessions are skipped
    /// during that fill (they only serve explicit requests) but remain
    /// eligible as an exact `explicit_ips` match.
    pub fn select_cohort(&self, explicit_ips: &[IpAddr], count: usize) -> CoreResult<Vec<Conn>> {
        let available = self.available.write();
        let mut selected: Vec<Conn> = Vec::new();

        for ip in explicit_ips {
            let found = available
                .iter()
                .find(|c| c.remote_ip() == *ip && !selected.iter().any(|s| Arc::ptr_eq(s, c)));
            match found {
                Some(conn) => selected.push(conn.clone()),
                None => {
                    return Err(CoreError::Capacity(format!(
                        "no available load client at explicit address {ip}"
                    )));
                }
            }
        }

        if selected.len() < count {
            // Round-robin fill across distinct IPs of whatever's left,
            // skipping restricted sessions and anything already selected —
            // including other sessions on a host that already supplied one
            // of the explicit-IP picks above (§4.4 step 3, S3: once a host
            // has a session chosen via `explicit_ips`, its remaining
            // sessions don't also backfill the round-robin).
            let selected_ips: std::collections::HashSet<IpAddr> =
                selected.iter().map(|c| c.remote_ip()).collect();
            let mut by_ip: Vec<(IpAddr, Vec<Conn>)> = Vec::new();
            for conn in available.iter() {
                if conn.is_restricted() || selected_ips.contains(&conn.remote_ip()) {
                    continue;
                }
                match by_ip.iter_mut().find(|(ip, _)| *ip == conn.remote_ip()) {
                    Some((_, bucket)) => bucket.push(conn.clone()),
                    None => by_ip.push((conn.remote_ip(), vec![conn.clone()])),
                }
            }
            by_ip.sort_by_key(|(ip, _)| *ip);

            'fill: while selected.len() < count {
                let before = selected.len();
                for (_, bucket) in by_ip.iter_mut() {
                    if let Some(conn) = bucket.pop() {
                        selected.push(conn);
                        if selected.len() == count {
                            break 'fill;
                        }
                    }
                }
                by_ip.retain(|(_, bucket)| !bucket.is_empty());
                if selected.len() == before || by_ip.is_empty() {
                    break;
                }
            }
        }

        if selected.len() < count {
            return Err(CoreError::Capacity(format!(
                "only {} of {} requested load clients available",
                selected.len(),
                count
            )));
        }

        // Commit: only now do we mutate the available list, and only with
        // exactly the sessions we're returning.
        drop(available);
        let mut available = self.available.write();
        for conn in &selected {
            remove_by_identity(&mut available, conn);
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    struct FakeConn {
        id: String,
        ip: IpAddr,
        restricted: bool,
    }

    impl RegisteredConnection for FakeConn {
        fn client_id(&self) -> &str {
            &self.id
        }
        fn remote_ip(&self) -> IpAddr {
            self.ip
        }
        fn is_restricted(&self) -> bool {
            self.restricted
        }
    }

    fn conn(id: &str, ip: [u8; 4], restricted: bool) -> Conn {
        Arc::new(FakeConn {
            id: id.to_string(),
            ip: IpAddr::V4(Ipv4Addr::from(ip)),
            restricted,
        })
    }

    #[test]
    fn duplicate_client_id_is_permitted_for_load_sessions() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("loader-1", [10, 0, 0, 1], false), Duration::from_millis(50))
            .unwrap();
        registry
            .register(conn("loader-1", [10, 0, 0, 2], false), Duration::from_millis(50))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn explicit_ip_is_honored_first() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("a", [10, 0, 0, 1], false), Duration::from_millis(50))
            .unwrap();
        registry
            .register(conn("b", [10, 0, 0, 2], false), Duration::from_millis(50))
            .unwrap();

        let cohort = registry
            .select_cohort(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))], 1)
            .unwrap();
        assert_eq!(cohort.len(), 1);
        assert_eq!(cohort[0].client_id(), "b");
        assert_eq!(registry.available_len(), 1);
        assert_eq!(registry.len(), 2, "full list is untouched by selection");
    }

    #[test]
    fn round_robin_fill_spreads_across_distinct_ips() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("a1", [10, 0, 0, 1], false), Duration::from_millis(50))
            .unwrap();
        registry
            .register(conn("a2", [10, 0, 0, 1], false), Duration::from_millis(50))
            .unwrap();
        registry
            .register(conn("b1", [10, 0, 0, 2], false), Duration::from_millis(50))
            .unwrap();

        let cohort = registry.select_cohort(&[], 2).unwrap();
        let ips: HashSet<IpAddr> = cohort.iter().map(|c| c.remote_ip()).collect();
        assert_eq!(ips.len(), 2, "should draw from both distinct IPs, not pile onto one");
    }

    /// spec.md §8 scenario S3: A(10.0.0.1), B(10.0.0.1), C(10.0.0.2,
    /// restricted), D(10.0.0.3), E(10.0.0.3); `explicit_ips=[10.0.0.1]`,
    /// `count=3`. The explicit step takes one of {A, B} (here A, since
    /// `select_cohort` scans in registration order); the fill step must
    /// then skip B (same host already supplied a pick) and C (restricted),
    /// landing on D and E. Expected cohort: [A, D, E] with C and B left in
    /// the available list.
    #[test]
    fn explicit_ip_host_does_not_also_backfill_the_round_robin() {
        let registry = LoadRegistry::new();
        registry.register(conn("a", [10, 0, 0, 1], false), Duration::from_millis(50)).unwrap();
        registry.register(conn("b", [10, 0, 0, 1], false), Duration::from_millis(50)).unwrap();
        registry.register(conn("c", [10, 0, 0, 2], true), Duration::from_millis(50)).unwrap();
        registry.register(conn("d", [10, 0, 0, 3], false), Duration::from_millis(50)).unwrap();
        registry.register(conn("e", [10, 0, 0, 3], false), Duration::from_millis(50)).unwrap();

        let cohort = registry
            .select_cohort(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))], 3)
            .unwrap();
        let ids: HashSet<&str> = cohort.iter().map(|c| c.client_id()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("a"), "the explicit-IP pick must be in the cohort");
        assert!(ids.contains("d") && ids.contains("e"), "fill must draw from the other host, not b");
        assert!(!ids.contains("b"), "b shares a host with the explicit pick and must not backfill");
        assert!(!ids.contains("c"), "c is restricted and must not backfill");

        let remaining: HashSet<String> = registry
            .snapshot()
            .iter()
            .map(|c| c.client_id().to_string())
            .filter(|id| !ids.contains(id.as_str()))
            .collect();
        assert_eq!(remaining, HashSet::from(["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn restricted_clients_are_skipped_during_fill() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("restricted-1", [10, 0, 0, 1], true), Duration::from_millis(50))
            .unwrap();

        assert!(registry.select_cohort(&[], 1).is_err());
        assert_eq!(registry.available_len(), 1, "aborted selection leaves the available list untouched");
    }

    #[test]
    fn restricted_clients_are_still_eligible_for_an_explicit_ip_match() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("restricted-1", [10, 0, 0, 1], true), Duration::from_millis(50))
            .unwrap();
        let cohort = registry
            .select_cohort(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))], 1)
            .unwrap();
        assert_eq!(cohort[0].client_id(), "restricted-1");
    }

    #[test]
    fn selection_is_all_or_nothing_and_leaves_available_list_untouched() {
        let registry = LoadRegistry::new();
        registry
            .register(conn("a", [10, 0, 0, 1], false), Duration::from_millis(50))
            .unwrap();

        assert!(registry.select_cohort(&[], 5).is_err());
        assert_eq!(registry.available_len(), 1);
        assert_eq!(registry.select_cohort(&[], 1).unwrap().len(), 1);
    }

    #[test]
    fn completion_reinsertion_is_idempotent() {
        let registry = LoadRegistry::new();
        let a = conn("a", [10, 0, 0, 1], false);
        registry.register(a.clone(), Duration::from_millis(50)).unwrap();
        let cohort = registry.select_cohort(&[], 1).unwrap();
        assert_eq!(registry.available_len(), 0);

        registry.mark_available(&cohort[0]);
        registry.mark_available(&cohort[0]);
        assert_eq!(registry.available_len(), 1, "re-insertion of an already-available session is a no-op");
    }
}
