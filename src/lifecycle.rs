//! Process lifecycle (C8): startup/shutdown ordering and the job-dispatch
//! orchestration that ties the four listener subsystems together (§4.8, §2).
//! Mirrors `fantoch`'s `run::process` entry point — one function that wires
//! configuration, registries and listeners together and hands back a
//! long-lived handle — but split into an explicit `start`/`shutdown` pair
//! since this crate's listeners, unlike a single consensus protocol run,
//! have an independent admin-driven lifecycle.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::AdminQuery;
use crate::config::{Config, ConfigProvider};
use crate::error::{CoreError, CoreResult};
use crate::ids::ConnectionIdGen;
use crate::job::JobSpec;
use crate::listener::load::{ConnectionSummary, LoadListener};
use crate::listener::manager::ManagerListener;
use crate::listener::monitor::MonitorListener;
use crate::listener::stat::StatListener;
use crate::listener::Transport;
use crate::registry::RegisteredConnection;
use crate::scheduler::{CredentialValidator, JobClassProvider, SchedulerHandle};
use crate::session::Session;
use crate::stats::StatStore;
use crate::time::SysTime;
use crate::wire::message::{JobRequest, JobResponse};
use crate::{log, warn};

/// What one load session did with the job it was handed, paired so a
/// caller can tell which client a failure or response belongs to.
pub struct DispatchOutcome {
    pub session: Arc<Session>,
    pub result: CoreResult<JobResponse>,
}

/// A full `dispatch_job` attempt: per-client load results plus the monitor
/// cohort resolved (and now tracking the job) alongside it (§2).
pub struct DispatchResult {
    pub load: Vec<DispatchOutcome>,
    pub monitors: Vec<Arc<Session>>,
}

/// Owns the four listener subsystems (C4-C7) and orchestrates startup,
/// job dispatch, and shutdown. In read-only mode `load`/`monitor`/`stat`/
/// `manager`/`scheduler` are all `None` — "the process only serves admin
/// queries" (§4.8).
pub struct Coordinator {
    config: Config,
    clock: Arc<dyn SysTime>,
    config_provider: Arc<dyn ConfigProvider>,
    stat_store: Arc<StatStore>,
    scheduler: Option<Arc<dyn SchedulerHandle>>,
    load: Option<Arc<LoadListener>>,
    monitor: Option<Arc<MonitorListener>>,
    stat: Option<Arc<StatListener>>,
    manager: Option<Arc<ManagerListener>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Binds all four listeners and starts accepting, in the startup order
    /// §4.8 names: "configuration store -> (optional) job-class catalog ->
    /// (optional) logger -> C7, C4, C5, C6 -> scheduler." The config store,
    /// job-class catalog and logger are the caller's responsibility to have
    /// readied before calling this (they're external collaborators); this
    /// function covers the C7/C4/C5/C6 bind-and-accept step and hands the
    /// already-running scheduler its listeners.
    ///
    /// In read-only mode, binds nothing and starts no scheduler.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: Config,
        clock: Arc<dyn SysTime>,
        config_provider: Arc<dyn ConfigProvider>,
        validator: Arc<dyn CredentialValidator>,
        class_provider: Arc<dyn JobClassProvider>,
        scheduler: Arc<dyn SchedulerHandle>,
    ) -> CoreResult<Arc<Coordinator>> {
        let stat_store = Arc::new(StatStore::new());

        if config.read_only {
            log!("starting in read-only mode: no listeners, no scheduler");
            return Ok(Arc::new(Coordinator {
                config,
                clock,
                config_provider,
                stat_store,
                scheduler: None,
                load: None,
                monitor: None,
                stat: None,
                manager: None,
                accept_tasks: Mutex::new(Vec::new()),
            }));
        }

        let transport = Arc::new(Self::build_transport(&config)?);
        let connection_ids = Arc::new(ConnectionIdGen::new());

        // C7 first: the manager registry is a dependency of C4 (it needs
        // to learn when a load session is lost so it can decrement a
        // host's started-count, §4.4/§4.7).
        let manager_addr = SocketAddr::new(config.bind_address, config.client_manager_port);
        let manager_tcp = TcpListener::bind(manager_addr)
            .await
            .map_err(|e| CoreError::Protocol(format!("failed to bind client-manager listener on {manager_addr}: {e}")))?;
        let manager = ManagerListener::new(
            connection_ids.clone(),
            validator.clone(),
            clock.clone(),
            config.load_client_port,
            config.keepalive_interval(),
            config.response_wait_timeout(),
            config.require_auth,
            config.auth_scheme.clone(),
        );

        let load_addr = SocketAddr::new(config.bind_address, config.load_client_port);
        let load_tcp = TcpListener::bind(load_addr)
            .await
            .map_err(|e| CoreError::Protocol(format!("failed to bind load-client listener on {load_addr}: {e}")))?;
        let load = LoadListener::new(
            connection_ids.clone(),
            validator.clone(),
            class_provider,
            scheduler.clone(),
            manager.registry.clone(),
            clock.clone(),
            config.max_load_clients,
            config.registry_lock_timeout(),
            config.keepalive_interval(),
            config.response_wait_timeout(),
            config.require_auth,
            config.auth_scheme.clone(),
        );

        let monitor_addr = SocketAddr::new(config.bind_address, config.resource_monitor_port);
        let monitor_tcp = TcpListener::bind(monitor_addr)
            .await
            .map_err(|e| CoreError::Protocol(format!("failed to bind resource-monitor listener on {monitor_addr}: {e}")))?;
        let monitor = MonitorListener::new(
            connection_ids.clone(),
            validator.clone(),
            scheduler.clone(),
            clock.clone(),
            None,
            config.keepalive_interval(),
            config.response_wait_timeout(),
            config.require_auth,
            config.auth_scheme.clone(),
        );

        let stat_addr = SocketAddr::new(config.bind_address, config.stat_port);
        let stat_tcp = TcpListener::bind(stat_addr)
            .await
            .map_err(|e| CoreError::Protocol(format!("failed to bind stat listener on {stat_addr}: {e}")))?;
        let stat = StatListener::new(
            stat_store.clone(),
            connection_ids,
            validator,
            scheduler.clone(),
            clock.clone(),
            config.keepalive_interval(),
            config.response_wait_timeout(),
            config.require_auth,
            config.auth_scheme.clone(),
        );

        let mut accept_tasks = Vec::with_capacity(4);
        accept_tasks.push(tokio::spawn(manager.clone().accept_loop(manager_tcp, transport.clone())));
        accept_tasks.push(tokio::spawn(load.clone().accept_loop(load_tcp, transport.clone())));
        accept_tasks.push(tokio::spawn(monitor.clone().accept_loop(monitor_tcp, transport.clone())));
        accept_tasks.push(tokio::spawn(stat.clone().accept_loop(stat_tcp, transport)));

        log!(
            load_port = config.load_client_port,
            monitor_port = config.resource_monitor_port,
            stat_port = config.stat_port,
            manager_port = config.client_manager_port,
            "all listeners accepting"
        );

        Ok(Arc::new(Coordinator {
            config,
            clock,
            config_provider,
            stat_store,
            scheduler: Some(scheduler),
            load: Some(load),
            monitor: Some(monitor),
            stat: Some(stat),
            manager: Some(manager),
            accept_tasks: Mutex::new(accept_tasks),
        }))
    }

    #[cfg(feature = "tls")]
    fn build_transport(config: &Config) -> CoreResult<Transport> {
        use std::fs::File;
        use std::io::BufReader;
        use std::sync::Arc as StdArc;
        use tokio_rustls::rustls::pki_types::PrivateKeyDer;
        use tokio_rustls::rustls::ServerConfig;

        let Some(tls) = &config.tls else {
            return Ok(Transport::Plain);
        };

        let cert_file = File::open(&tls.keystore_path)
            .map_err(|e| CoreError::Protocol(format!("failed to open TLS keystore: {e}")))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Protocol(format!("failed to parse TLS keystore certs: {e}")))?;

        let key_file = File::open(&tls.keystore_path)
            .map_err(|e| CoreError::Protocol(format!("failed to open TLS keystore: {e}")))?;
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Protocol(format!("failed to parse TLS private key: {e}")))?;
        let key = keys
            .pop()
            .map(PrivateKeyDer::Pkcs8)
            .ok_or_else(|| CoreError::Protocol("TLS keystore contains no private key".into()))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| CoreError::Protocol(format!("invalid TLS server config: {e}")))?;

        Ok(Transport::Tls(crate::listener::TlsAcceptor(StdArc::new(
            tokio_rustls::TlsAcceptor::from(StdArc::new(server_config)),
        ))))
    }

    #[cfg(not(feature = "tls"))]
    fn build_transport(_config: &Config) -> CoreResult<Transport> {
        Ok(Transport::Plain)
    }

    /// §2's end-to-end dispatch: resolve a load cohort, then a monitor
    /// cohort colocated/matched against it, rolling the load cohort back
    /// to the available pool if the monitor side can't be satisfied, then
    /// issue `job-request` on every load session without short-circuiting
    /// on the first failure.
    pub async fn dispatch_job(&self, job: &JobSpec) -> CoreResult<DispatchResult> {
        let load = self
            .load
            .as_ref()
            .ok_or_else(|| CoreError::Protocol("dispatch_job called in read-only mode".into()))?;
        let monitor = self
            .monitor
            .as_ref()
            .ok_or_else(|| CoreError::Protocol("dispatch_job called in read-only mode".into()))?;

        let load_cohort = load.get_cohort_for(job)?;
        let load_ips: Vec<IpAddr> = load_cohort.iter().map(|s| s.remote_addr.ip()).collect();

        let monitor_cohort = match monitor.monitor_cohort_for(job, &load_ips) {
            Ok(cohort) => cohort,
            Err(e) => {
                for session in &load_cohort {
                    let conn: Arc<dyn RegisteredConnection> = session.clone();
                    load.registry.mark_available(&conn);
                }
                return Err(e);
            }
        };

        // Every client's job-request is independent of the others, so issue
        // them concurrently rather than paying the round-trip latency once
        // per client in the cohort (§2: "without short-circuiting on the
        // first failure" only rules out bailing early, not running serially).
        let response_wait_timeout = self.config.response_wait_timeout();
        let dispatches = load_cohort
            .into_iter()
            .enumerate()
            .map(|(client_number, session)| {
                let request = JobRequest {
                    job_id: job.job_id.clone(),
                    job_class: job.job_class.clone(),
                    client_number: client_number as u32,
                    threads: job.threads,
                    thread_startup_delay_ms: job.thread_startup_delay_ms,
                    collection_interval_secs: job.collection_interval_secs,
                    duration_secs: job.duration_secs,
                    parameters: job.parameters.clone(),
                };
                async move {
                    let result = session.dispatch_job(request, response_wait_timeout).await;
                    DispatchOutcome { session, result }
                }
            });
        let outcomes = futures::future::join_all(dispatches).await;

        Ok(DispatchResult {
            load: outcomes,
            monitors: monitor_cohort,
        })
    }

    /// Shutdown in the reverse, explicit-drain order §4.8 names:
    /// 1. stop accepting, 2. stop+drain the scheduler, 3. close the
    /// config store, 4. drain and close every live session, 5. (the
    /// listener tasks having already been aborted, there's nothing further
    /// to await). Closing the logger is the caller's responsibility since
    /// it owns the `LogGuard`, not the `Coordinator`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        for task in self.accept_tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }

        self.config_provider.close().await;

        if let Some(load) = &self.load {
            for summary in load.sorted_clients() {
                if let Err(e) = load.request_disconnect(&summary.client_id, drain_timeout).await {
                    warn!(client_id = %summary.client_id, error = %e, "load-client disconnect during shutdown failed");
                }
            }
        }
        if let Some(monitor) = &self.monitor {
            for summary in monitor.sorted_clients() {
                if let Err(e) = monitor.request_disconnect(&summary.client_id, drain_timeout).await {
                    warn!(client_id = %summary.client_id, error = %e, "resource-monitor disconnect during shutdown failed");
                }
            }
        }
        if let Some(stat) = &self.stat {
            for summary in stat.sorted_clients() {
                if let Err(e) = stat.request_disconnect(&summary.client_id, drain_timeout).await {
                    warn!(client_id = %summary.client_id, error = %e, "stat-client disconnect during shutdown failed");
                }
            }
        }
        if let Some(manager) = &self.manager {
            for summary in manager.sorted_clients() {
                if let Err(e) = manager.request_disconnect(&summary.client_id, drain_timeout).await {
                    warn!(client_id = %summary.client_id, error = %e, "client-manager disconnect during shutdown failed");
                }
            }
        }

        log!("coordinator shutdown complete");
    }
}

#[async_trait]
impl AdminQuery for Coordinator {
    fn sorted_load_clients(&self) -> Vec<ConnectionSummary> {
        self.load.as_ref().map(|l| l.sorted_clients()).unwrap_or_default()
    }

    fn sorted_monitor_clients(&self) -> Vec<ConnectionSummary> {
        self.monitor.as_ref().map(|m| m.sorted_clients()).unwrap_or_default()
    }

    fn sorted_managers(&self) -> Vec<ConnectionSummary> {
        self.manager.as_ref().map(|m| m.sorted_clients()).unwrap_or_default()
    }

    fn sorted_stat_clients(&self) -> Vec<ConnectionSummary> {
        self.stat.as_ref().map(|s| s.sorted_clients()).unwrap_or_default()
    }

    async fn request_disconnect_load_client(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        match &self.load {
            Some(l) => l.request_disconnect(client_id, drain_timeout).await,
            None => Ok(()),
        }
    }

    async fn request_disconnect_monitor(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        match &self.monitor {
            Some(m) => m.request_disconnect(client_id, drain_timeout).await,
            None => Ok(()),
        }
    }

    async fn request_disconnect_stat_client(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        match &self.stat {
            Some(s) => s.request_disconnect(client_id, drain_timeout).await,
            None => Ok(()),
        }
    }

    async fn request_disconnect_manager(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        match &self.manager {
            Some(m) => m.request_disconnect(client_id, drain_timeout).await,
            None => Ok(()),
        }
    }

    fn force_disconnect_load_client(&self, client_id: &str) {
        if let Some(l) = &self.load {
            l.force_disconnect(client_id);
        }
    }

    fn force_disconnect_monitor(&self, client_id: &str) {
        if let Some(m) = &self.monitor {
            m.force_disconnect(client_id);
        }
    }

    fn force_disconnect_stat_client(&self, client_id: &str) {
        if let Some(s) = &self.stat {
            s.force_disconnect(client_id);
        }
    }

    fn force_disconnect_manager(&self, client_id: &str) {
        if let Some(m) = &self.manager {
            m.force_disconnect(client_id);
        }
    }

    fn connections_available_for(&self, _job: &JobSpec) -> usize {
        self.load.as_ref().map(|l| l.available_len()).unwrap_or(0)
    }

    fn get_cohort_for(&self, job: &JobSpec) -> CoreResult<Vec<Arc<Session>>> {
        match &self.load {
            Some(l) => l.get_cohort_for(job),
            None => Err(CoreError::Protocol("get_cohort_for called in read-only mode".into())),
        }
    }

    fn stat_names(&self, job_id: &str) -> Vec<String> {
        self.stat_store.stat_names(job_id)
    }

    fn stat_values(&self, job_id: &str, stat: &str) -> Option<Vec<f64>> {
        self.stat_store.values(job_id, stat)
    }

    fn first_interval(&self, job_id: &str, stat: &str) -> Option<i64> {
        self.stat_store.first_interval(job_id, stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::scheduler::test_doubles::{InMemoryClassProvider, RecordingScheduler};
    use crate::scheduler::AllowAllValidator;
    use crate::time::RunTime;

    #[tokio::test]
    async fn read_only_mode_starts_nothing_and_rejects_dispatch() {
        let mut config = Config::default();
        config.read_only = true;
        let coordinator = Coordinator::start(
            config,
            Arc::new(RunTime),
            Arc::new(StaticConfigProvider),
            Arc::new(AllowAllValidator),
            Arc::new(InMemoryClassProvider::new()),
            Arc::new(RecordingScheduler::default()),
        )
        .await
        .unwrap();

        assert!(coordinator.sorted_load_clients().is_empty());
        assert!(coordinator.sorted_managers().is_empty());

        let job = JobSpec {
            job_id: "job-1".into(),
            job_class: "SearchRateJob".into(),
            required_client_count: 1,
            explicit_load_ips: vec![],
            duration_secs: 10,
            threads: 1,
            thread_startup_delay_ms: 0,
            collection_interval_secs: 1,
            parameters: vec![],
            required_monitor_ips: vec![],
            colocate_monitors_with_load: false,
        };
        assert!(coordinator.dispatch_job(&job).await.is_err());

        coordinator.shutdown(Duration::from_millis(10)).await;
    }
}
