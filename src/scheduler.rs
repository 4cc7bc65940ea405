//! External interface contracts (§6): the scheduler, credential validator
//! and job-class provider all live outside this crate in the real
//! deployment. These traits pin down the boundary the connection fabric
//! calls across; only a minimal in-memory double is provided here, for this
//! crate's own tests.

use async_trait::async_trait;

use crate::error::AuthCode;
use crate::job::Role;
use crate::wire::message::JobCompletionState;

/// Validates a client's offered credentials during handshake. The real
/// validator lives behind an admin-configured scheme and is out of scope
/// here (§6); this crate only calls through the trait.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(
        &self,
        client_id: &str,
        role: Role,
        scheme: Option<&str>,
        credentials: Option<&[u8]>,
    ) -> AuthCode;
}

/// Resolves a named job class to the bytes a load client should run. The
/// actual class store (filesystem, database, bundled jar repository, ...)
/// is external (§6).
#[async_trait]
pub trait JobClassProvider: Send + Sync {
    async fn class_bytes(&self, class_name: &str) -> Option<Vec<u8>>;
}

/// What a session reports back to the scheduler about one job it was
/// running or watching — whether the agent sent a real `job-completed` or
/// the connection was lost and the fabric synthesized one (§2, §4.4, §4.5).
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub client_id: String,
    pub state: JobCompletionState,
    pub actual_start_time_millis: i64,
    pub actual_stop_time_millis: i64,
    pub stat_trackers: Vec<String>,
    pub message: Option<String>,
}

/// The scheduler decides which cohort of connected load clients a given job
/// request should run against, and is notified as jobs complete. The
/// connection fabric only calls across this boundary; it never makes
/// scheduling decisions itself (§6).
#[async_trait]
pub trait SchedulerHandle: Send + Sync {
    /// A client reported (or the fabric synthesized) the end of a job it
    /// was running or monitoring.
    async fn job_completed(&self, outcome: JobOutcome);

    /// Whether the scheduler currently knows about `job_id` at all. §4.6
    /// "register-stat": "if the job is not known to the scheduler, drop
    /// silently" — the stat handler calls this before creating a `JobStats`
    /// entry for a job nobody dispatched.
    async fn knows_job(&self, job_id: &str) -> bool;

    /// §4.8 shutdown step 2: "stop the scheduler; wait for it to drain."
    /// Out of scope beyond this call — the scheduler owns its own drain
    /// policy. Default is a no-op for schedulers with nothing to flush.
    async fn shutdown(&self) {}
}

/// A permissive validator accepting every credential, useful for tests and
/// for deployments that gate access at the network layer instead.
pub struct AllowAllValidator;

#[async_trait]
impl CredentialValidator for AllowAllValidator {
    async fn validate(
        &self,
        _client_id: &str,
        _role: Role,
        _scheme: Option<&str>,
        _credentials: Option<&[u8]>,
    ) -> AuthCode {
        AuthCode::Success
    }
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryClassProvider {
        classes: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl InMemoryClassProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, name: &str, bytes: Vec<u8>) {
            self.classes.lock().insert(name.to_string(), bytes);
        }
    }

    #[async_trait]
    impl JobClassProvider for InMemoryClassProvider {
        async fn class_bytes(&self, class_name: &str) -> Option<Vec<u8>> {
            self.classes.lock().get(class_name).cloned()
        }
    }

    #[derive(Default)]
    pub struct RecordingScheduler {
        pub completed: Mutex<Vec<JobOutcome>>,
        /// Job IDs this double will answer `knows_job` affirmatively for.
        /// Tests that don't care about the stat-handler gate leave this
        /// empty and call `known_jobs().insert(...)` first.
        pub known: Mutex<std::collections::HashSet<String>>,
    }

    impl RecordingScheduler {
        pub fn with_known_jobs(job_ids: impl IntoIterator<Item = String>) -> Self {
            Self {
                completed: Mutex::new(Vec::new()),
                known: Mutex::new(job_ids.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl SchedulerHandle for RecordingScheduler {
        async fn job_completed(&self, outcome: JobOutcome) {
            self.completed.lock().push(outcome);
        }

        async fn knows_job(&self, job_id: &str) -> bool {
            self.known.lock().contains(job_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_doubles::*;
    use super::*;

    #[tokio::test]
    async fn allow_all_validator_always_succeeds() {
        let validator = AllowAllValidator;
        let code = validator.validate("loader-1", Role::LoadClient, None, None).await;
        assert_eq!(code, AuthCode::Success);
    }

    #[tokio::test]
    async fn in_memory_class_provider_round_trips() {
        let provider = InMemoryClassProvider::new();
        provider.insert("SearchRateJob", vec![1, 2, 3]);
        assert_eq!(
            provider.class_bytes("SearchRateJob").await,
            Some(vec![1, 2, 3])
        );
        assert_eq!(provider.class_bytes("NoSuchJob").await, None);
    }

    #[tokio::test]
    async fn recording_scheduler_tracks_completions() {
        let scheduler = RecordingScheduler::default();
        scheduler
            .job_completed(JobOutcome {
                job_id: "job-1".into(),
                client_id: "loader-1".into(),
                state: JobCompletionState::CompletedSuccessfully,
                actual_start_time_millis: 0,
                actual_stop_time_millis: 10,
                stat_trackers: vec![],
                message: None,
            })
            .await;
        assert_eq!(scheduler.completed.lock().len(), 1);
        assert_eq!(scheduler.completed.lock()[0].job_id, "job-1");
    }
}
