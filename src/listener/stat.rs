//! Stat listener (C6): after handshake, a stat-client session recognizes
//! only `register-stat` and `report-stat`; anything else is logged and
//! ignored (§4.6). Real-time reads go straight through `StatStore`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::error::CoreResult;
use crate::ids::ConnectionIdGen;
use crate::job::Role;
use crate::listener::Transport;
use crate::scheduler::{CredentialValidator, SchedulerHandle};
use crate::session::{perform_handshake, Session, UnsolicitedHandler};
use crate::stats::StatStore;
use crate::time::SysTime;
use crate::wire::message::{Envelope, HelloCode, MessageBody};
use crate::{log, warn};

pub use crate::listener::load::ConnectionSummary;

/// Interval-window depth every series this listener registers is bounded
/// to; the scheduler or stat store owner configures it once at startup
/// rather than per-request (§3 `maxIntervals`).
const DEFAULT_MAX_INTERVALS: usize = 120;

pub struct StatListener {
    pub store: Arc<StatStore>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connection_ids: Arc<ConnectionIdGen>,
    validator: Arc<dyn CredentialValidator>,
    scheduler: Arc<dyn SchedulerHandle>,
    clock: Arc<dyn SysTime>,
    keepalive_interval: Duration,
    response_wait_timeout: Duration,
    max_intervals: usize,
    require_auth: bool,
    auth_scheme: Option<String>,
}

impl StatListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StatStore>,
        connection_ids: Arc<ConnectionIdGen>,
        validator: Arc<dyn CredentialValidator>,
        scheduler: Arc<dyn SchedulerHandle>,
        clock: Arc<dyn SysTime>,
        keepalive_interval: Duration,
        response_wait_timeout: Duration,
        require_auth: bool,
        auth_scheme: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            connection_ids,
            validator,
            scheduler,
            clock,
            keepalive_interval,
            response_wait_timeout,
            max_intervals: DEFAULT_MAX_INTERVALS,
            require_auth,
            auth_scheme,
        })
    }

    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, transport: Arc<Transport>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "stat listener accept failed");
                    continue;
                }
            };
            let this = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                this.handle_connection(stream, addr, &transport).await;
            });
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, transport: &Transport) {
        let (mut reader, mut writer) = match transport.split(stream).await {
            Ok(halves) => halves,
            Err(e) => {
                warn!(remote = %addr, error = %e, "transport setup failed");
                return;
            }
        };

        let this = self.clone();
        let admission_check = move |client_id: &str| -> Result<(), (HelloCode, String)> {
            if this.sessions.lock().contains_key(client_id) {
                return Err((
                    HelloCode::ClientRejected,
                    format!("duplicate stat-client id '{client_id}'"),
                ));
            }
            Ok(())
        };

        let handshake = match perform_handshake(
            &mut reader,
            &mut writer,
            Role::StatClient,
            self.validator.as_ref(),
            self.require_auth,
            self.auth_scheme.as_deref(),
            &admission_check,
            self.response_wait_timeout,
            self.clock.as_ref(),
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(remote = %addr, error = %e, "stat-client handshake failed");
                return;
            }
        };

        let session = Session::new(
            self.connection_ids.next(),
            handshake.client_id,
            addr,
            Role::StatClient,
            handshake.restricted,
            reader,
            writer,
            self.clock.as_ref(),
        );
        self.sessions.lock().insert(session.client_id.clone(), session.clone());

        log!(client_id = %session.client_id, connection_id = session.connection_id, "stat client connected");

        session.run(self.clone(), self.keepalive_interval).await;
    }

    pub fn sorted_clients(&self) -> Vec<ConnectionSummary> {
        let mut out: Vec<ConnectionSummary> = self
            .sessions
            .lock()
            .values()
            .map(|s| ConnectionSummary {
                client_id: s.client_id.clone(),
                remote_ip: s.remote_addr.ip(),
                restricted: s.restricted,
            })
            .collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    pub async fn request_disconnect(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        let session = self.sessions.lock().get(client_id).cloned();
        if let Some(session) = session {
            session.shutdown(drain_timeout, true).await?;
        }
        Ok(())
    }

    pub fn force_disconnect(&self, client_id: &str) {
        if let Some(session) = self.sessions.lock().get(client_id).cloned() {
            session.request_close();
        }
    }

    pub fn stat_names(&self, job_id: &str) -> Vec<String> {
        self.store.stat_names(job_id)
    }

    pub fn stat_values(&self, job_id: &str, stat: &str) -> Option<Vec<f64>> {
        self.store.values(job_id, stat)
    }

    pub fn first_interval(&self, job_id: &str, stat: &str) -> Option<i64> {
        self.store.first_interval(job_id, stat)
    }
}

#[async_trait]
impl UnsolicitedHandler for StatListener {
    async fn on_unsolicited(&self, session: Arc<Session>, envelope: Envelope) {
        match envelope.body {
            MessageBody::RegisterStat(register) => {
                // §4.6: "if the job is not known to the scheduler, drop
                // silently (log at job-processing level)."
                if self.scheduler.knows_job(&register.job_id).await {
                    self.store.register(&register.job_id, &register.stat_names, self.max_intervals);
                } else {
                    log!(
                        client_id = %session.client_id,
                        job_id = %register.job_id,
                        "register-stat for a job the scheduler doesn't know about, dropping"
                    );
                }
            }
            MessageBody::ReportStat(report) => {
                for sample in report.samples {
                    if let Err(e) = self.store.report(
                        &report.job_id,
                        &sample.stat_name,
                        sample.stat_type,
                        sample.interval,
                        sample.value,
                    ) {
                        log!(
                            client_id = %session.client_id,
                            job_id = %report.job_id,
                            stat = %sample.stat_name,
                            error = %e,
                            "dropping out-of-contract stat sample"
                        );
                    }
                }
            }
            other => {
                warn!(client_id = %session.client_id, body = ?other, "protocol violation on stat session, closing");
                let _ = session
                    .send_notification(MessageBody::ServerShutdown(crate::wire::message::ServerShutdown))
                    .await;
                session.request_close();
            }
        }
    }

    async fn on_connection_lost(&self, session: Arc<Session>) {
        self.sessions.lock().remove(&session.client_id);
        log!(client_id = %session.client_id, "stat client connection lost");
    }
}

#[cfg(test)]
mod accept_tests {
    use super::*;
    use crate::ids::ConnectionIdGen;
    use crate::scheduler::test_doubles::RecordingScheduler;
    use crate::scheduler::AllowAllValidator;
    use crate::time::RunTime;
    use crate::wire::codec::{read_record, write_record};
    use crate::wire::message::{ClientHello, RegisterStat, ReportStat, StatSample, StatType};
    use std::time::Duration as StdDuration;

    async fn bound_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn hello(client_id: &str) -> MessageBody {
        MessageBody::ClientHello(ClientHello {
            client_id: client_id.into(),
            client_version: "1.0".into(),
            auth_id: None,
            credentials: None,
            scheme: None,
            supports_time_sync: false,
            restricted: false,
        })
    }

    /// §4.6 report-stat flow: after register-stat names a series, reported
    /// samples land in the store and are readable through the listener's
    /// real-time accessors.
    #[tokio::test]
    async fn register_then_report_stat_lands_in_the_store() {
        let (tcp, addr) = bound_listener().await;
        let store = Arc::new(StatStore::new());
        let listener = StatListener::new(
            store,
            Arc::new(ConnectionIdGen::new()),
            Arc::new(AllowAllValidator),
            Arc::new(RecordingScheduler::with_known_jobs(["job-1".to_string()])),
            Arc::new(RunTime),
            StdDuration::from_secs(30),
            StdDuration::from_secs(5),
            false,
            None,
        );
        let transport = Arc::new(Transport::Plain);
        tokio::spawn(listener.clone().accept_loop(tcp, transport));

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_record(&mut client, &Envelope::new(0, hello("stat-1")).encode())
            .await
            .unwrap();
        let _ = read_record(&mut client, Some(StdDuration::from_secs(2))).await.unwrap();

        write_record(
            &mut client,
            &Envelope::new(
                0,
                MessageBody::RegisterStat(RegisterStat {
                    job_id: "job-1".into(),
                    stat_names: vec!["latency".into()],
                }),
            )
            .encode(),
        )
        .await
        .unwrap();

        write_record(
            &mut client,
            &Envelope::new(
                0,
                MessageBody::ReportStat(ReportStat {
                    job_id: "job-1".into(),
                    samples: vec![StatSample {
                        client_id: "loader-1".into(),
                        thread_id: 0,
                        stat_name: "latency".into(),
                        interval: Some(1),
                        stat_type: StatType::Add,
                        value: 12.5,
                    }],
                }),
            )
            .encode(),
        )
        .await
        .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(listener.stat_names("job-1"), vec!["latency".to_string()]);
        assert_eq!(listener.stat_values("job-1", "latency"), Some(vec![12.5]));
    }

    /// §4.6: "if the job is not known to the scheduler, drop silently" — a
    /// register-stat for a job the scheduler double has no record of must
    /// not create a `JobStats` entry.
    #[tokio::test]
    async fn register_stat_for_unknown_job_is_dropped_silently() {
        let (tcp, addr) = bound_listener().await;
        let store = Arc::new(StatStore::new());
        let listener = StatListener::new(
            store,
            Arc::new(ConnectionIdGen::new()),
            Arc::new(AllowAllValidator),
            Arc::new(RecordingScheduler::default()),
            Arc::new(RunTime),
            StdDuration::from_secs(30),
            StdDuration::from_secs(5),
            false,
            None,
        );
        let transport = Arc::new(Transport::Plain);
        tokio::spawn(listener.clone().accept_loop(tcp, transport));

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_record(&mut client, &Envelope::new(0, hello("stat-1")).encode())
            .await
            .unwrap();
        let _ = read_record(&mut client, Some(StdDuration::from_secs(2))).await.unwrap();

        write_record(
            &mut client,
            &Envelope::new(
                0,
                MessageBody::RegisterStat(RegisterStat {
                    job_id: "no-such-job".into(),
                    stat_names: vec!["latency".into()],
                }),
            )
            .encode(),
        )
        .await
        .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(listener.stat_names("no-such-job").is_empty());
    }
}
