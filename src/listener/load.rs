//! Load-client listener (C4): accept loop, admission, cohort selection,
//! and the unsolicited vocabulary a load-client session may originate —
//! job-completed and class-transfer-request (§4.4).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::error::CoreResult;
use crate::ids::ConnectionIdGen;
use crate::job::{JobSpec, Role};
use crate::listener::Transport;
use crate::registry::load::LoadRegistry;
use crate::registry::manager::ManagerRegistry;
use crate::registry::RegisteredConnection;
use crate::scheduler::{CredentialValidator, JobClassProvider, JobOutcome, SchedulerHandle};
use crate::session::{perform_handshake, Session, UnsolicitedHandler};
use crate::time::SysTime;
use crate::wire::codec::write_record;
use crate::wire::message::{
    ClassTransferCode, ClassTransferResponse, ClientState, Envelope, HelloCode, HelloResponse,
    MessageBody, StatusRequest,
};
use crate::{log, warn};

/// Read-only summary of one registered connection, for admin listings
/// (§6 `sorted_load_clients()` et al.).
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub client_id: String,
    pub remote_ip: std::net::IpAddr,
    pub restricted: bool,
}

pub struct LoadListener {
    pub registry: Arc<LoadRegistry>,
    sessions: Mutex<Vec<Arc<Session>>>,
    connection_ids: Arc<ConnectionIdGen>,
    validator: Arc<dyn CredentialValidator>,
    class_provider: Arc<dyn JobClassProvider>,
    scheduler: Arc<dyn SchedulerHandle>,
    manager_registry: Arc<ManagerRegistry>,
    clock: Arc<dyn SysTime>,
    max_clients: Option<u32>,
    registry_lock_timeout: Duration,
    keepalive_interval: Duration,
    response_wait_timeout: Duration,
    require_auth: bool,
    auth_scheme: Option<String>,
}

impl LoadListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_ids: Arc<ConnectionIdGen>,
        validator: Arc<dyn CredentialValidator>,
        class_provider: Arc<dyn JobClassProvider>,
        scheduler: Arc<dyn SchedulerHandle>,
        manager_registry: Arc<ManagerRegistry>,
        clock: Arc<dyn SysTime>,
        max_clients: Option<u32>,
        registry_lock_timeout: Duration,
        keepalive_interval: Duration,
        response_wait_timeout: Duration,
        require_auth: bool,
        auth_scheme: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(LoadRegistry::new()),
            sessions: Mutex::new(Vec::new()),
            connection_ids,
            validator,
            class_provider,
            scheduler,
            manager_registry,
            clock,
            max_clients,
            registry_lock_timeout,
            keepalive_interval,
            response_wait_timeout,
            require_auth,
            auth_scheme,
        })
    }

    /// Runs the accept loop until the listening socket is closed (§4.8
    /// shutdown step 1 stops accepting by dropping the `TcpListener`).
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, transport: Arc<Transport>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "load listener accept failed");
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

        let max_clients = self.max_clients;
        let current_len = self.registry.len();
        let admission_check = move |_client_id: &str| -> Result<(), (HelloCode, String)> {
            if let Some(limit) = max_clients {
                if current_len as u32 >= limit {
                    return Err((
                        HelloCode::ConnectionLimitReached,
                        "load-client connection limit reached".into(),
                    ));
                }
            }
            Ok(())
        };

        let handshake = match perform_handshake(
            &mut reader,
            &mut writer,
            Role::LoadClient,
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
                warn!(remote = %addr, error = %e, "load-client handshake failed");
                return;
            }
        };

        let session = Session::new(
            self.connection_ids.next(),
            handshake.client_id,
            addr,
            Role::LoadClient,
            handshake.restricted,
            reader,
            writer,
            self.clock.as_ref(),
        );

        let conn: Arc<dyn RegisteredConnection> = session.clone();
        if let Err(e) = self.registry.register(conn, self.registry_lock_timeout) {
            warn!(client_id = %session.client_id, error = %e, "failed to admit load client");
            return;
        }
        self.sessions.lock().push(session.clone());

        log!(client_id = %session.client_id, connection_id = session.connection_id, "load client connected");

        // Prompts an initial state exchange (§4.4). Best-effort: the
        // receive loop below is what actually demultiplexes the reply.
        let _ = session
            .send_request(
                MessageBody::StatusRequest(StatusRequest { job_id: None }),
                self.response_wait_timeout,
            )
            .await;

        session.run(self.clone(), self.keepalive_interval).await;
    }

    /// Resolves a registry selection (trait objects) back to the concrete
    /// sessions this listener owns, matched by connection identity.
    fn resolve(&self, selected: Vec<Arc<dyn RegisteredConnection>>) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock();
        selected
            .into_iter()
            .filter_map(|conn| {
                sessions
                    .iter()
                    .find(|s| {
                        let as_dyn: Arc<dyn RegisteredConnection> = (*s).clone();
                        Arc::ptr_eq(&as_dyn, &conn)
                    })
                    .cloned()
            })
            .collect()
    }

    /// §6 `get_cohort_for(job)`: selects `job.required_client_count` load
    /// sessions per §4.4's explicit-IP-then-round-robin-fill policy.
    pub fn get_cohort_for(&self, job: &JobSpec) -> CoreResult<Vec<Arc<Session>>> {
        let selected = self
            .registry
            .select_cohort(&job.explicit_load_ips, job.required_client_count as usize)?;
        Ok(self.resolve(selected))
    }

    /// §6 `connections_available_for(job)`.
    pub fn available_len(&self) -> usize {
        self.registry.available_len()
    }

    /// §6 `sorted_load_clients()`.
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

    fn sessions_for(&self, client_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect()
    }

    /// §6 `request_disconnect(client-id)`: graceful — drains any
    /// in-progress job, sends server-shutdown, then closes (§8 property 8).
    pub async fn request_disconnect(&self, client_id: &str, drain_timeout: Duration) -> CoreResult<()> {
        for session in self.sessions_for(client_id) {
            session.shutdown(drain_timeout, true).await?;
        }
        Ok(())
    }

    /// §6 `force_disconnect(client-id)` / §8 property 9: breaks the receive
    /// loop immediately; its own connection-lost path synthesizes
    /// job-completed(stopped-due-to-error) for anything in flight.
    pub fn force_disconnect(&self, client_id: &str) {
        for session in self.sessions_for(client_id) {
            session.request_close();
        }
    }
}

#[async_trait]
impl UnsolicitedHandler for LoadListener {
    async fn on_unsolicited(&self, session: Arc<Session>, envelope: Envelope) {
        match envelope.body {
            MessageBody::JobCompleted(completed) => {
                session.clear_active_job(&completed.job_id);
                let conn: Arc<dyn RegisteredConnection> = session.clone();
                self.registry.mark_available(&conn);
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
            MessageBody::ClassTransferRequest(request) => {
                let response = match self.class_provider.class_bytes(&request.class_name).await {
                    Some(bytes) => ClassTransferResponse {
                        code: ClassTransferCode::Success,
                        class_bytes: Some(bytes),
                    },
                    None => ClassTransferResponse {
                        code: ClassTransferCode::ClassNotFound,
                        class_bytes: None,
                    },
                };
                if let Err(e) = session
                    .send_reply(envelope.id, MessageBody::ClassTransferResponse(response))
                    .await
                {
                    warn!(client_id = %session.client_id, error = %e, "failed to reply to class-transfer-request");
                }
            }
            MessageBody::StatusResponse(status) if status.client_state == ClientState::ShuttingDown => {
                log!(client_id = %session.client_id, "load client reported shutting down");
                session.request_close();
            }
            other => {
                warn!(client_id = %session.client_id, body = ?other, "unexpected unsolicited message on load session, ignoring");
            }
        }
    }

    async fn on_connection_lost(&self, session: Arc<Session>) {
        let conn: Arc<dyn RegisteredConnection> = session.clone();
        self.registry.unregister(&conn);
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, &session));

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

        self.manager_registry.record_load_client_lost(session.remote_addr.ip());
        log!(client_id = %session.client_id, "load client connection lost");
    }
}

#[cfg(test)]
mod accept_tests {
    use super::*;
    use crate::scheduler::test_doubles::{InMemoryClassProvider, RecordingScheduler};
    use crate::scheduler::AllowAllValidator;
    use crate::time::{RunTime, SysTime};
    use crate::wire::codec::{read_record, ReadOutcome};
    use crate::wire::message::{ClientHello, JobCompletionState};
    use std::time::Duration as StdDuration;

    async fn bound_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn client_hello(client_id: &str) -> MessageBody {
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

    /// §8 S1: a load client connects without auth required, gets
    /// hello-response(success), and lands in both the full and available
    /// registry views.
    #[tokio::test]
    async fn handshake_admits_client_into_full_and_available_lists() {
        let (tcp, addr) = bound_listener().await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let listener = LoadListener::new(
            Arc::new(ConnectionIdGen::new()),
            Arc::new(AllowAllValidator),
            Arc::new(InMemoryClassProvider::new()),
            scheduler.clone(),
            Arc::new(ManagerRegistry::new()),
            Arc::new(RunTime),
            None,
            StdDuration::from_millis(200),
            StdDuration::from_secs(30),
            StdDuration::from_secs(5),
            false,
            None,
        );
        let transport = Arc::new(Transport::Plain);
        tokio::spawn(listener.clone().accept_loop(tcp, transport));

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_record(&mut client, &Envelope::new(0, client_hello("loader-1")).encode())
            .await
            .unwrap();

        let response = match read_record(&mut client, Some(StdDuration::from_secs(2)))
            .await
            .unwrap()
        {
            ReadOutcome::Record(element) => Envelope::decode(&element).unwrap(),
            other => panic!("expected a record, got {:?}", other),
        };
        match response.body {
            MessageBody::HelloResponse(r) => assert_eq!(r.code, HelloCode::Success),
            other => panic!("expected hello-response, got {:?}", other),
        }

        // Give the registration a moment to land before asserting on it.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(listener.registry.len(), 1);
        assert_eq!(listener.registry.available_len(), 1);
    }

    /// §8 S6: forcing a disconnect on a load session with an in-progress
    /// job synthesizes exactly one job-completed(stopped-due-to-error) with
    /// no stat trackers, and the session is removed from the registry.
    #[tokio::test]
    async fn forced_disconnect_synthesizes_completion_for_in_progress_job() {
        let (tcp, addr) = bound_listener().await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let listener = LoadListener::new(
            Arc::new(ConnectionIdGen::new()),
            Arc::new(AllowAllValidator),
            Arc::new(InMemoryClassProvider::new()),
            scheduler.clone(),
            Arc::new(ManagerRegistry::new()),
            Arc::new(RunTime),
            None,
            StdDuration::from_millis(200),
            StdDuration::from_secs(30),
            StdDuration::from_secs(5),
            false,
            None,
        );
        let transport = Arc::new(Transport::Plain);
        tokio::spawn(listener.clone().accept_loop(tcp, transport));

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_record(&mut client, &Envelope::new(0, client_hello("loader-1")).encode())
            .await
            .unwrap();
        let _ = read_record(&mut client, Some(StdDuration::from_secs(2))).await.unwrap();

        // The listener issues an unsolicited status-request right after
        // admission; drain it so it doesn't confuse the job-response read
        // below, then answer the job-request that follows.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let session = listener
            .sessions_for("loader-1")
            .into_iter()
            .next()
            .expect("session should be registered");
        session.track_active_job(crate::job::ActiveJob::new(
            "job-1".into(),
            "SearchRateJob".into(),
            0,
            RunTime.millis(),
        ));

        listener.force_disconnect("loader-1");
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        assert_eq!(listener.registry.len(), 0);
        let completed = scheduler.completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job_id, "job-1");
        assert_eq!(completed[0].state, JobCompletionState::StoppedDueToError);
        assert!(completed[0].stat_trackers.is_empty());
    }
}
