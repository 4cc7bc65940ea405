//! Resource-monitor listener (C5): same handshake/acceptance skeleton as
//! C4, but duplicate client-IDs are refused and each session tracks a
//! *set* of in-progress jobs it's watching rather than at most one (§4.5).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{CoreError, CoreResult};
use crate::ids::ConnectionIdGen;
use crate::job::{ActiveJob, JobSpec, Role};
use crate::listener::Transport;
use crate::registry::monitor::MonitorRegistry;
use crate::registry::RegisteredConnection;
use crate::scheduler::{CredentialValidator, JobOutcome, SchedulerHandle};
use crate::session::{perform_handshake, Session, UnsolicitedHandler};
use crate::time::SysTime;
use crate::wire::message::{ClientState, Envelope, HelloCode, HelloResponse, MessageBody, StatusRequest};
use crate::{log, warn};

pub use crate::listener::load::ConnectionSummary;

pub struct MonitorListener {
    pub registry: Arc<MonitorRegistry>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connection_ids: Arc<ConnectionIdGen>,
    validator: Arc<dyn CredentialValidator>,
    scheduler: Arc<dyn SchedulerHandle>,
    clock: Arc<dyn SysTime>,
    max_clients: Option<u32>,
    keepalive_interval: Duration,
    response_wait_timeout: Duration,
    require_auth: bool,
    auth_scheme: Option<String>,
}

impl MonitorListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_ids: Arc<ConnectionIdGen>,
        validator: Arc<dyn CredentialValidator>,
        scheduler: Arc<dyn SchedulerHandle>,
        clock: Arc<dyn SysTime>,
        max_clients: Option<u32>,
        keepalive_interval: Duration,
        response_wait_timeout: Duration,
        require_auth: bool,
        auth_scheme: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(MonitorRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
            connection_ids,
            validator,
            scheduler,
            clock,
            max_clients,
            keepalive_interval,
            response_wait_timeout,
            require_auth,
            auth_scheme,
        })
    }

    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, transport: Arc<Transport>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "resource-monitor listener accept failed");
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

        if let Some(limit) = self.max_clients {
            if self.registry.len() as u32 >= limit {
                let response = Envelope::new(
                    1,
                    MessageBody::HelloResponse(HelloResponse {
                        code: HelloCode::ConnectionLimitReached,
                        message: "resource-monitor connection limit reached".into(),
                        server_time_millis: self.clock.millis(),
                    }),
                );
                let _ = crate::wire::codec::write_record(&mut writer, &response.encode()).await;
                return;
            }
        }

        let this = self.clone();
        let admission_check = move |client_id: &str| -> Result<(), (HelloCode, String)> {
            if this.sessions.lock().contains_key(client_id) {
                return Err((
                    HelloCode::ClientRejected,
                    format!("duplicate resource-monitor client id '{client_id}'"),
                ));
            }
            Ok(())
        };

        let handshake = match perform_handshake(
            &mut reader,
            &mut writer,
            Role::ResourceMonitor,
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
                warn!(remote = %addr, error = %e, "resource-monitor handshake failed");
                return;
            }
        };

        let session = Session::new(
            self.connection_ids.next(),
            handshake.client_id,
            addr,
            Role::ResourceMonitor,
            handshake.restricted,
            reader,
            writer,
            self.clock.as_ref(),
        );

        // The admission check above and this registration race only if two
        // connections for the same client ID complete their handshake
        // concurrently; `register` is the authoritative check.
        let conn: Arc<dyn RegisteredConnection> = session.clone();
        if let Err(e) = self.registry.register(conn) {
            warn!(client_id = %session.client_id, error = %e, "duplicate resource-monitor client id refused");
            return;
        }
        self.sessions.lock().insert(session.client_id.clone(), session.clone());

        log!(client_id = %session.client_id, connection_id = session.connection_id, "resource-monitor connected");

        let _ = session
            .send_request(
                MessageBody::StatusRequest(StatusRequest { job_id: None }),
                self.response_wait_timeout,
            )
            .await;

        session.run(self.clone(), self.keepalive_interval).await;
    }

    /// §4.5 monitor cohort resolution: required explicit IPs, optionally
    /// augmented by colocation with the job's already-chosen load cohort.
    pub fn monitor_cohort_for(&self, job: &JobSpec, load_cohort_ips: &[IpAddr]) -> CoreResult<Vec<Arc<Session>>> {
        let mut cohort: Vec<Arc<Session>> = Vec::new();
        let sessions = self.sessions.lock();

        for ip in &job.required_monitor_ips {
            let found = self
                .registry
                .monitors_at(*ip)
                .into_iter()
                .find_map(|conn| sessions.get(conn.client_id()).cloned());
            match found {
                Some(session) => {
                    if !cohort.iter().any(|s| Arc::ptr_eq(s, &session)) {
                        cohort.push(session);
                    }
                }
                None => {
                    return Err(CoreError::Capacity(format!(
                        "no registered resource monitor at required address {ip}"
                    )))
                }
            }
        }

        if job.colocate_monitors_with_load {
            for ip in load_cohort_ips {
                for conn in self.registry.monitors_at(*ip) {
                    if let Some(session) = sessions.get(conn.client_id()) {
                        if !cohort.iter().any(|s| Arc::ptr_eq(s, session)) {
                            cohort.push(session.clone());
                        }
                    }
                }
            }
        }

        for session in &cohort {
            session.track_active_job(ActiveJob::new(
                job.job_id.clone(),
                job.job_class.clone(),
                0,
                self.clock.millis(),
            ));
        }

        Ok(cohort)
    }

    pub fn sorted_clients(&self) -> Vec<ConnectionSummary> {
        let mut out: Vec<ConnectionSummary> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|c| ConnectionSummary {
                client_id: c.client_id().to_string(),
                remote_ip: c.remote_ip(),
                restricted: c.is_restricted(),
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
}

#[async_trait]
impl UnsolicitedHandler for MonitorListener {
    async fn on_unsolicited(&self, session: Arc<Session>, envelope: Envelope) {
        match envelope.body {
            MessageBody::JobCompleted(completed) => {
                session.clear_active_job(&completed.job_id);
                self.scheduler
                    .job_completed(JobOutcome {
                        job_id: completed.job_id,
                        client_id: session.client_id.clone(),
                        state: completed.state,
                        actual_start_time_millis: completed.actual_start_time_millis,
                        actual_stop_time_millis: completed.actual_stop_time_millis,
                        stat_trackers: completed.stat_trackers,
                        message: completed.message,
                    })
                    .await;
            }
            MessageBody::StatusResponse(status) if status.client_state == ClientState::ShuttingDown => {
                log!(client_id = %session.client_id, "resource-monitor client reported shutting down");
                session.request_close();
            }
            other => {
                warn!(client_id = %session.client_id, body = ?other, "unexpected unsolicited message on resource-monitor session, ignoring");
            }
        }
    }

    async fn on_connection_lost(&self, session: Arc<Session>) {
        self.registry.unregister(&session.client_id);
        self.sessions.lock().remove(&session.client_id);

        for (job, state, now) in session.force_complete_active_jobs(self.clock.as_ref()) {
            self.scheduler
                .job_completed(JobOutcome {
                    job_id: job.job_id,
                    client_id: session.client_id.clone(),
                    state,
                    actual_start_time_millis: job.dispatched_at_millis,
                    actual_stop_time_millis: now,
                    stat_trackers: Vec::new(),
                    message: Some(format!(
                        "job cancelled because the connection to client {} was lost",
                        session.client_id
                    )),
                })
                .await;
        }

        log!(client_id = %session.client_id, "resource-monitor connection lost");
    }
}

#[cfg(test)]
mod accept_tests {
    use super::*;
    use crate::ids::ConnectionIdGen;
    use crate::scheduler::test_doubles::RecordingScheduler;
    use crate::scheduler::AllowAllValidator;
    use crate::time::RunTime;
    use crate::wire::codec::{read_record, write_record, ReadOutcome};
    use crate::wire::message::ClientHello;
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

    async fn hello_response(stream: &mut TcpStream) -> HelloResponse {
        match read_record(stream, Some(StdDuration::from_secs(2))).await.unwrap() {
            ReadOutcome::Record(element) => match Envelope::decode(&element).unwrap().body {
                MessageBody::HelloResponse(r) => r,
                other => panic!("expected hello-response, got {:?}", other),
            },
            other => panic!("expected a record, got {:?}", other),
        }
    }

    /// §8 S2: a second resource-monitor connecting with a client ID already
    /// registered is refused with hello-response(client-rejected); the first
    /// connection is left untouched.
    #[tokio::test]
    async fn duplicate_client_id_is_rejected() {
        let (tcp, addr) = bound_listener().await;
        let listener = MonitorListener::new(
            Arc::new(ConnectionIdGen::new()),
            Arc::new(AllowAllValidator),
            Arc::new(RecordingScheduler::default()),
            Arc::new(RunTime),
            None,
            StdDuration::from_secs(30),
            StdDuration::from_secs(5),
            false,
            None,
        );
        let transport = Arc::new(Transport::Plain);
        tokio::spawn(listener.clone().accept_loop(tcp, transport));

        let mut first = TcpStream::connect(addr).await.unwrap();
        write_record(&mut first, &Envelope::new(0, hello("monitor-1")).encode())
            .await
            .unwrap();
        assert_eq!(hello_response(&mut first).await.code, HelloCode::Success);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(listener.registry.len(), 1);

        let mut second = TcpStream::connect(addr).await.unwrap();
        write_record(&mut second, &Envelope::new(0, hello("monitor-1")).encode())
            .await
            .unwrap();
        assert_eq!(
            hello_response(&mut second).await.code,
            HelloCode::ClientRejected
        );
        assert_eq!(listener.registry.len(), 1);
    }
}
