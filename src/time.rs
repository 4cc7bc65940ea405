//! Wall-clock access, abstracted behind a trait the way `fantoch::time`
//! abstracts `SysTime` away from its protocol workers — so that
//! hello-response's server-time echo and the stat store's last-update
//! tracking can be exercised with a fixed clock in tests instead of the
//! real one.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait SysTime: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn millis(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTime;

impl SysTime for RunTime {
    fn millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after the Unix epoch")
            .as_millis() as i64
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FixedTime(pub i64);

#[cfg(test)]
impl SysTime for FixedTime {
    fn millis(&self) -> i64 {
        self.0
    }
}
