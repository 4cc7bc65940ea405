//! Connection registries (C4/C5/C7): reader/writer-locked maps keyed by
//! client ID, one per agent population, each with its own admission and
//! lookup rules (§5).

pub mod load;
pub mod manager;
pub mod monitor;

use std::net::IpAddr;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{CoreError, CoreResult};

/// The minimum a registry needs to know about a connection to admit,
/// select and report on it. Implemented by the session type that owns the
/// actual socket; registries hold `Arc<dyn RegisteredConnection>` so this
/// module has no dependency on the session module.
pub trait RegisteredConnection: Send + Sync {
    fn client_id(&self) -> &str;
    fn remote_ip(&self) -> IpAddr;
    fn is_restricted(&self) -> bool {
        false
    }
}

/// Acquires a write lock but gives up after `timeout` instead of blocking
/// the accept loop indefinitely (§5: "bounded lock-acquire timeout on the
/// load registry's accept path").
pub fn try_write_within<T>(
    lock: &RwLock<T>,
    timeout: Duration,
) -> CoreResult<RwLockWriteGuard<'_, T>> {
    lock.try_write_for(timeout).ok_or(CoreError::LockTimeout)
}
