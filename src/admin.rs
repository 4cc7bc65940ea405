//! The admin-facing query contract (§6): "the external collaborator's view
//! of the core." Per-listener snapshot lists, disconnect controls, cohort
//! allocation, and real-time stat reads, as a trait the in-process
//! `Coordinator` implements — the admin UI itself stays out of scope, but
//! the core must actually provide working bodies for one to call (see
//! SPEC_FULL's "Admin query surface" supplement).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::job::JobSpec;
use crate::listener::load::ConnectionSummary;
use crate::session::Session;

#[async_trait]
pub trait AdminQuery: Send + Sync {
    fn sorted_load_clients(&self) -> Vec<ConnectionSummary>;
    fn sorted_monitor_clients(&self) -> Vec<ConnectionSummary>;
    fn sorted_managers(&self) -> Vec<ConnectionSummary>;
    fn sorted_stat_clients(&self) -> Vec<ConnectionSummary>;

    async fn request_disconnect_load_client(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()>;
    async fn request_disconnect_monitor(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()>;
    async fn request_disconnect_stat_client(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()>;
    async fn request_disconnect_manager(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()>;

    fn force_disconnect_load_client(&self, client_id: &str);
    fn force_disconnect_monitor(&self, client_id: &str);
    fn force_disconnect_stat_client(&self, client_id: &str);
    fn force_disconnect_manager(&self, client_id: &str);

    /// §6 `connections_available_for(job)`: how many load clients the pool
    /// could currently seat, ignoring `job.explicit_load_ips` preference.
    fn connections_available_for(&self, job: &JobSpec) -> usize;

    /// §6 `get_cohort_for(job)`: resolves (and reserves) the load-client
    /// cohort a job would actually be dispatched against.
    fn get_cohort_for(&self, job: &JobSpec) -> CoreResult<Vec<Arc<Session>>>;

    fn stat_names(&self, job_id: &str) -> Vec<String>;
    fn stat_values(&self, job_id: &str, stat: &str) -> Option<Vec<f64>>;
    fn first_interval(&self, job_id: &str, stat: &str) -> Option<i64>;
}
