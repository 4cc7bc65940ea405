//! The per-connection session (C3): handshake, receive loop, and the
//! `send`/`await_response` API that `dispatch_job`/`control_job`/
//! `status_request`/`shutdown` build on.
//!
//! Mirrors `fantoch`'s `run/task/process.rs` split between a reader side
//! that demultiplexes incoming traffic and a writer side callers push
//! requests through, but collapsed onto a single owned connection (no
//! inter-task channels) since each session here is already its own task —
//! there's no further fan-in/fan-out to route through a channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::error::{AuthCode, CoreError, CoreResult};
use crate::ids::{is_solicited, is_unsolicited, ClientId, ConnectionId, MessageIdGen};
use crate::job::{ActiveJob, Role};
use crate::registry::RegisteredConnection;
use crate::scheduler::CredentialValidator;
use crate::time::SysTime;
use crate::wire::codec::{read_record, write_record, ReadOutcome};
use crate::wire::message::{
    ClientHello, ClientManagerHello, ClientState, Envelope, HelloCode, HelloResponse,
    JobCompletionState, JobControlRequest, JobControlResponse, JobControlType, JobRequest,
    JobResponse, MessageBody, ResultCode, ServerShutdown, StatusCode, StatusRequest,
    StatusResponse, NO_TIME_SYNC,
};
use crate::{log, warn};

/// How many consecutive transport-level read failures a session tolerates
/// before the receive loop gives up on the connection (§5 "two-strike
/// IO-failure gate"). A single transient error doesn't kill the session; a
/// second one in a row does.
pub const IO_FAILURE_LIMIT: u32 = 2;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Outcome of the handshake read, before a `Session` exists to own it.
pub struct HandshakeInfo {
    pub client_id: ClientId,
    pub client_version: String,
    pub restricted: bool,
    /// Only meaningful for `Role::ClientManager`.
    pub max_clients_this_host: Option<u32>,
}

/// Reads the role-appropriate hello message, runs it past an admission
/// check (duplicate client-ID, connection-limit) and then the credential
/// validator, and writes the hello-response — all before any `Session`
/// exists, since the client ID a session is registered under comes out of
/// this exchange (§4.1, §4.4 "duplicate client-ID refusal"). The
/// hello-response always echoes the request's own message ID; it isn't a
/// server-originated request awaiting a correlated reply.
pub async fn perform_handshake(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    role: Role,
    validator: &dyn CredentialValidator,
    require_auth: bool,
    configured_scheme: Option<&str>,
    admission_check: &dyn Fn(&str) -> Result<(), (HelloCode, String)>,
    deadline: Duration,
    clock: &dyn SysTime,
) -> CoreResult<HandshakeInfo> {
    let outcome = read_record(reader, Some(deadline)).await?;
    let element = match outcome {
        ReadOutcome::Record(element) => element,
        ReadOutcome::Eof => {
            return Err(CoreError::Protocol(
                "connection closed before handshake".into(),
            ))
        }
        ReadOutcome::Timeout => return Err(CoreError::Timeout),
    };
    let envelope = Envelope::decode(&element)?;

    let (info, auth_id, scheme, credentials, supports_time_sync) = match (role, envelope.body) {
        (Role::ClientManager, MessageBody::ClientManagerHello(hello)) => (
            HandshakeInfo {
                client_id: hello.client_id,
                client_version: hello.client_version,
                restricted: false,
                max_clients_this_host: Some(hello.max_clients_this_host),
            },
            None,
            None,
            None,
            false,
        ),
        (_, MessageBody::ClientHello(hello)) => (
            HandshakeInfo {
                client_id: hello.client_id,
                client_version: hello.client_version,
                restricted: hello.restricted,
                max_clients_this_host: None,
            },
            hello.auth_id,
            hello.scheme,
            hello.credentials,
            hello.supports_time_sync,
        ),
        (_, other) => {
            return Err(CoreError::Protocol(format!(
                "expected a hello message for role {:?}, got {:?}",
                role, other
            )))
        }
    };

    let _ = auth_id;
    if let Some(expected) = configured_scheme {
        if credentials.is_some() && scheme.as_deref() != Some(expected) {
            return Err(CoreError::Protocol(format!(
                "unsupported authentication scheme offered by '{}': {:?}",
                info.client_id, scheme
            )));
        }
    }

    let (hello_code, message) = match admission_check(&info.client_id) {
        Err((code, message)) => (code, message),
        Ok(()) if credentials.is_none() && !require_auth => (HelloCode::Success, "ok".to_string()),
        Ok(()) if credentials.is_none() => (
            HelloCode::ServerError,
            "authentication required but no credentials offered".to_string(),
        ),
        Ok(()) => {
            let code = validator
                .validate(&info.client_id, role, scheme.as_deref(), credentials.as_deref())
                .await;
            match code {
                AuthCode::Success => (HelloCode::Success, "ok".to_string()),
                AuthCode::ValidatorNotConfigured => {
                    (HelloCode::ServerError, AuthCode::ValidatorNotConfigured.to_string())
                }
                other => (HelloCode::ClientRejected, other.to_string()),
            }
        }
    };

    let server_time = if supports_time_sync {
        clock.millis()
    } else {
        NO_TIME_SYNC
    };

    let response = Envelope::new(
        envelope.id,
        MessageBody::HelloResponse(HelloResponse {
            code: hello_code,
            message: message.clone(),
            server_time_millis: server_time,
        }),
    );
    write_record(writer, &response.encode()).await?;

    if hello_code != HelloCode::Success {
        return Err(CoreError::Protocol(message));
    }

    Ok(info)
}

/// Reacts to messages the peer sent without the session having asked for
/// them: job-completed notifications, register-stat/report-stat, and so
/// on. Implemented once per listener (C4-C7) since each agent population
/// sends a different unsolicited vocabulary.
#[async_trait]
pub trait UnsolicitedHandler: Send + Sync {
    async fn on_unsolicited(&self, session: Arc<Session>, envelope: Envelope);
    async fn on_connection_lost(&self, session: Arc<Session>);
}

/// One live, handshaken connection. Holds the split transport, the
/// per-session odd-ID generator, and a map from outstanding request IDs to
/// the oneshot each `send_request` caller is waiting on.
pub struct Session {
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub remote_addr: SocketAddr,
    pub role: Role,
    pub restricted: bool,
    pub established_at_millis: i64,
    message_ids: MessageIdGen,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    /// In-progress jobs this session is running (load) or watching
    /// (monitor), keyed by job ID. A load session holds at most one entry
    /// at a time (§3 invariant); a monitor session may hold many.
    active_jobs: Mutex<HashMap<String, ActiveJob>>,
    io_failures: AtomicU32,
    /// Signaled by `request_close` to break the receive loop out of a
    /// blocked read without needing access to the raw socket (force
    /// disconnect, and the unsolicited shutting-down status-response path
    /// in §4.3 step 6).
    close_signal: tokio::sync::Notify,
}

impl RegisteredConnection for Session {
    fn client_id(&self) -> &str {
        &self.client_id
    }
    fn remote_ip(&self) -> std::net::IpAddr {
        self.remote_addr.ip()
    }
    fn is_restricted(&self) -> bool {
        self.restricted
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: ConnectionId,
        client_id: ClientId,
        remote_addr: SocketAddr,
        role: Role,
        restricted: bool,
        reader: BoxedReader,
        writer: BoxedWriter,
        clock: &dyn SysTime,
    ) -> Arc<Session> {
        Arc::new(Session {
            connection_id,
            client_id,
            remote_addr,
            role,
            restricted,
            established_at_millis: clock.millis(),
            message_ids: MessageIdGen::new(),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            active_jobs: Mutex::new(HashMap::new()),
            io_failures: AtomicU32::new(0),
            close_signal: tokio::sync::Notify::new(),
        })
    }

    /// Wakes the receive loop out of a blocked read so it tears the
    /// connection down on its next iteration, without needing access to
    /// the raw socket.
    pub fn request_close(&self) {
        self.close_signal.notify_waiters();
    }

    /// Writes a server-originated message with no expectation of a
    /// correlated reply (keepalive, server-shutdown, job-control-request
    /// fire-and-forget on the shutdown path).
    pub async fn send_notification(&self, body: MessageBody) -> CoreResult<u64> {
        let id = self.message_ids.next();
        let envelope = Envelope::new(id, body);
        let mut writer = self.writer.lock().await;
        write_record(&mut *writer, &envelope.encode()).await?;
        Ok(id)
    }

    /// Writes a server-originated request and waits up to `timeout` for the
    /// reply the receive loop demultiplexes back to this ID (§4.3 "await
    /// API"). A response that never arrives surfaces as `CoreError::Timeout`
    /// rather than hanging the caller forever.
    pub async fn send_request(&self, body: MessageBody, timeout: Duration) -> CoreResult<Envelope> {
        let id = self.message_ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let envelope = Envelope::new(id, body);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_record(&mut *writer, &envelope.encode()).await {
                self.pending.lock().remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_canceled)) => Err(CoreError::Local(
                "session closed while awaiting response".into(),
            )),
            Err(_elapsed) => {
                self.pending.lock().remove(&id);
                Err(CoreError::Timeout)
            }
        }
    }

    /// Replies to a client-originated (unsolicited) request using the same
    /// message ID, so the peer can correlate the reply itself without the
    /// server minting a new one (§4.6: a load client's class-transfer
    /// request originates from the client, not the server).
    pub async fn send_reply(&self, id: u64, body: MessageBody) -> CoreResult<()> {
        let envelope = Envelope::new(id, body);
        let mut writer = self.writer.lock().await;
        write_record(&mut *writer, &envelope.encode()).await
    }

    /// The job a load session is currently busy with, if any (a load
    /// session never holds more than one).
    pub fn active_job(&self) -> Option<ActiveJob> {
        self.active_jobs.lock().values().next().cloned()
    }

    pub fn active_job_by_id(&self, job_id: &str) -> Option<ActiveJob> {
        self.active_jobs.lock().get(job_id).cloned()
    }

    pub fn is_busy(&self) -> bool {
        !self.active_jobs.lock().is_empty()
    }

    /// All jobs this session is currently tracking, in no particular order.
    /// Non-empty only for monitor sessions once the pool has added more
    /// than one (§3: "a monitor session may hold many, keyed by job-ID").
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.active_jobs.lock().values().cloned().collect()
    }

    /// Adds a job as in-progress without a wire round-trip — used when a
    /// resource-monitor session is added to a job's monitor cohort (§4.5):
    /// monitors never receive `dispatch_job`, the pool simply records them
    /// as watching the job.
    pub fn track_active_job(&self, job: ActiveJob) {
        self.active_jobs.lock().insert(job.job_id.clone(), job);
    }

    /// Removes one job from this session's in-progress set, e.g. because
    /// the agent reported it as done (§4.4/§4.5 completion paths).
    pub fn clear_active_job(&self, job_id: &str) -> Option<ActiveJob> {
        self.active_jobs.lock().remove(job_id)
    }

    /// Removes every in-progress job this session held, for the
    /// connection-lost path (§4.4/§4.5): each one becomes a synthesized
    /// `job-completed(stopped-due-to-error)`.
    pub fn take_all_active_jobs(&self) -> Vec<ActiveJob> {
        self.active_jobs.lock().drain().map(|(_, job)| job).collect()
    }

    /// The receive loop (§4.3): reads with a soft deadline, turns a timeout
    /// into a keepalive rather than an error, demultiplexes solicited
    /// replies to whoever is awaiting that ID, hands unsolicited traffic to
    /// `handler`, and tolerates one transport error in a row before giving
    /// up (the two-strike gate).
    pub async fn run(self: Arc<Self>, handler: Arc<dyn UnsolicitedHandler>, keepalive_interval: Duration) {
        loop {
            let outcome = {
                let mut reader = self.reader.lock().await;
                tokio::select! {
                    outcome = read_record(&mut *reader, Some(keepalive_interval)) => outcome,
                    _ = self.close_signal.notified() => {
                        log!(connection_id = self.connection_id, "close requested, tearing down session");
                        break;
                    }
                }
            };

            match outcome {
                Ok(ReadOutcome::Timeout) => {
                    self.io_failures.store(0, Ordering::Relaxed);
                    if let Err(e) = self.send_notification(MessageBody::Keepalive(crate::wire::message::Keepalive)).await {
                        warn!(connection_id = self.connection_id, error = %e, "keepalive send failed");
                        break;
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    log!(connection_id = self.connection_id, "connection closed by peer");
                    break;
                }
                Ok(ReadOutcome::Record(element)) => {
                    self.io_failures.store(0, Ordering::Relaxed);
                    match Envelope::decode(&element) {
                        Ok(envelope) => self.dispatch_incoming(envelope, &handler).await,
                        Err(e) => {
                            warn!(connection_id = self.connection_id, error = %e, "decode error, continuing");
                        }
                    }
                }
                Err(CoreError::Transport(e)) => {
                    let failures = self.io_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(connection_id = self.connection_id, error = %e, failures, "transport read error");
                    if failures >= IO_FAILURE_LIMIT {
                        break;
                    }
                }
                Err(e) => {
                    warn!(connection_id = self.connection_id, error = %e, "protocol error, continuing");
                }
            }
        }

        handler.on_connection_lost(self.clone()).await;
    }

    async fn dispatch_incoming(
        self: &Arc<Self>,
        envelope: Envelope,
        handler: &Arc<dyn UnsolicitedHandler>,
    ) {
        if is_solicited(envelope.id) {
            let waiter = self.pending.lock().remove(&envelope.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => {
                    warn!(
                        connection_id = self.connection_id,
                        message_id = envelope.id,
                        "solicited reply with no matching request, dropping"
                    );
                }
            }
        } else {
            debug_assert!(is_unsolicited(envelope.id));
            handler.on_unsolicited(self.clone(), envelope).await;
        }
    }

    // --- per-operation contracts (§4.3) -------------------------------------

    /// Dispatches a job to this (load-client) session, refusing immediately
    /// without touching wire state if one is already in flight (§4.3,
    /// §8 property 2: at-most-one-job).
    pub async fn dispatch_job(&self, request: JobRequest, timeout: Duration) -> CoreResult<JobResponse> {
        if self.is_busy() {
            return Err(CoreError::JobRequestRefused(format!(
                "already processing a job on client {}",
                self.client_id
            )));
        }
        let job_id = request.job_id.clone();
        let job_class = request.job_class.clone();
        let client_number = request.client_number;

        let response = match self.send_request(MessageBody::JobRequest(request), timeout).await {
            Ok(envelope) => match envelope.body {
                MessageBody::JobResponse(r) => r,
                other => {
                    return Err(CoreError::Protocol(format!(
                        "expected job-response, got {:?}",
                        other
                    )))
                }
            },
            // §7: "Timeout ... surfaced to the caller as a synthesized
            // no-response message, not as an exception. The session is not
            // killed."
            Err(CoreError::Timeout) => JobResponse {
                code: ResultCode::NoResponse,
                message: "no response from client within the configured wait".into(),
            },
            // §7: "Local error — send failed during a dispatch ... the
            // session is considered dead for the caller."
            Err(e) => return Err(CoreError::Local(e.to_string())),
        };

        if response.code.is_success() {
            self.track_active_job(ActiveJob::new(
                job_id,
                job_class,
                client_number,
                self.established_at_millis,
            ));
        }
        Ok(response)
    }

    /// §4.3: fails immediately with `no-such-job` if `job_id` isn't on this
    /// session; otherwise sends job-control-request and clears the
    /// in-progress job when the response code says so — which codes
    /// qualify depends on the session's role (§4.3).
    pub async fn control_job(
        &self,
        job_id: &str,
        request: JobControlRequest,
        timeout: Duration,
    ) -> CoreResult<JobControlResponse> {
        if self.active_job_by_id(job_id).is_none() {
            return Err(CoreError::NoSuchJob(job_id.to_string()));
        }

        let response = match self.send_request(MessageBody::JobControlRequest(request), timeout).await {
            Ok(envelope) => match envelope.body {
                MessageBody::JobControlResponse(r) => r,
                other => {
                    return Err(CoreError::Protocol(format!(
                        "expected job-control-response, got {:?}",
                        other
                    )))
                }
            },
            Err(CoreError::Timeout) => JobControlResponse {
                code: ResultCode::NoResponse,
                message: "no response from client within the configured wait".into(),
            },
            Err(e) => return Err(CoreError::Local(e.to_string())),
        };

        let clears = match self.role {
            Role::LoadClient => matches!(
                response.code,
                ResultCode::ClassNotFound
                    | ResultCode::ClassNotValid
                    | ResultCode::JobCreationFailure
                    | ResultCode::NoSuchJob
            ),
            Role::ResourceMonitor => matches!(response.code, ResultCode::NoSuchJob),
            _ => false,
        };
        if clears {
            self.clear_active_job(job_id);
        }
        Ok(response)
    }

    /// §4.3: on timeout or IO error, synthesizes a
    /// `status-response(no-response, client-state-unknown, reason)` rather
    /// than propagating an error to the caller.
    pub async fn status_request(
        &self,
        request: StatusRequest,
        timeout: Duration,
    ) -> CoreResult<StatusResponse> {
        match self.send_request(MessageBody::StatusRequest(request), timeout).await {
            Ok(envelope) => match envelope.body {
                MessageBody::StatusResponse(r) => Ok(r),
                other => Err(CoreError::Protocol(format!(
                    "expected status-response, got {:?}",
                    other
                ))),
            },
            Err(e) => Ok(StatusResponse {
                code: StatusCode::NoResponse,
                client_state: ClientState::Unknown,
                job_id: None,
                message: format!("no status response from client: {e}"),
            }),
        }
    }

    /// Graceful shutdown (§4.3, §4.8): if a job is in progress, tells the
    /// peer to stop it due to shutdown and polls (bounded sleep) until
    /// every in-progress job on this session has cleared, then sends
    /// server-shutdown. `close_socket` additionally drops the transport so
    /// the receive loop observes EOF and exits on its own.
    pub async fn shutdown(&self, drain_timeout: Duration, close_socket: bool) -> CoreResult<()> {
        let in_progress: Vec<String> = self.active_jobs.lock().keys().cloned().collect();
        for job_id in in_progress {
            let request = JobControlRequest {
                job_id: job_id.clone(),
                control_type: JobControlType::StopDueToShutdown,
            };
            // Best-effort: a peer that doesn't answer still gets the
            // server-shutdown notification below and is dropped regardless.
            let _ = self.control_job(&job_id, request, drain_timeout).await;
            self.clear_active_job(&job_id);
        }

        self.send_notification(MessageBody::ServerShutdown(ServerShutdown)).await?;

        if close_socket {
            let mut writer = self.writer.lock().await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
        }
        Ok(())
    }

    /// Forceful disconnect (e.g. admin `force_disconnect`, or the receive
    /// loop observing EOF/IO failure): synthesizes a completion for every
    /// in-progress job so downstream consumers of status never see a job
    /// silently vanish (§8 testable property 9).
    pub fn force_complete_active_jobs(&self, clock: &dyn SysTime) -> Vec<(ActiveJob, JobCompletionState, i64)> {
        let now = clock.millis();
        self.take_all_active_jobs()
            .into_iter()
            .map(|job| (job, JobCompletionState::StoppedDueToError, now))
            .collect()
    }
}

#[cfg(test)]
mod handshake_tests {
    use super::*;
    use crate::scheduler::AllowAllValidator;
    use crate::time::RunTime;
    use tokio::io::AsyncWriteExt;

    fn client_hello(credentials: Option<Vec<u8>>, scheme: Option<String>) -> MessageBody {
        MessageBody::ClientHello(ClientHello {
            client_id: "loader-1".into(),
            client_version: "1.0".into(),
            auth_id: None,
            credentials,
            scheme,
            supports_time_sync: false,
            restricted: false,
        })
    }

    async fn write_hello(client: &mut (impl AsyncWrite + Unpin), body: MessageBody) {
        let envelope = Envelope::new(1, body);
        write_record(client, &envelope.encode()).await.unwrap();
    }

    async fn read_hello_response(client: &mut (impl AsyncRead + Unpin)) -> HelloResponse {
        match read_record(client, None).await.unwrap() {
            ReadOutcome::Record(element) => match Envelope::decode(&element).unwrap().body {
                MessageBody::HelloResponse(r) => r,
                other => panic!("expected hello-response, got {:?}", other),
            },
            other => panic!("expected a record, got {:?}", other),
        }
    }

    fn allow_all(_client_id: &str) -> Result<(), (HelloCode, String)> {
        Ok(())
    }

    #[tokio::test]
    async fn credentials_absent_and_auth_not_required_succeeds() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = {
            let (r, w) = tokio::io::split(server);
            (Box::new(r), Box::new(w))
        };
        write_hello(&mut client, client_hello(None, None)).await;

        let validator = AllowAllValidator;
        let result = perform_handshake(
            &mut reader,
            &mut writer,
            Role::LoadClient,
            &validator,
            false,
            None,
            &allow_all,
            Duration::from_secs(1),
            &RunTime,
        )
        .await;
        assert!(result.is_ok());

        let response = read_hello_response(&mut client).await;
        assert_eq!(response.code, HelloCode::Success);
    }

    #[tokio::test]
    async fn credentials_absent_and_auth_required_is_rejected_with_server_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = {
            let (r, w) = tokio::io::split(server);
            (Box::new(r), Box::new(w))
        };
        write_hello(&mut client, client_hello(None, None)).await;

        let validator = AllowAllValidator;
        let result = perform_handshake(
            &mut reader,
            &mut writer,
            Role::LoadClient,
            &validator,
            true,
            None,
            &allow_all,
            Duration::from_secs(1),
            &RunTime,
        )
        .await;
        assert!(result.is_err());

        let response = read_hello_response(&mut client).await;
        assert_eq!(response.code, HelloCode::ServerError);
    }

    #[tokio::test]
    async fn mismatched_scheme_is_a_fatal_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = {
            let (r, w) = tokio::io::split(server);
            (Box::new(r), Box::new(w))
        };
        write_hello(
            &mut client,
            client_hello(Some(b"token".to_vec()), Some("other-scheme".into())),
        )
        .await;

        let validator = AllowAllValidator;
        let result = perform_handshake(
            &mut reader,
            &mut writer,
            Role::LoadClient,
            &validator,
            false,
            Some("expected-scheme"),
            &allow_all,
            Duration::from_secs(1),
            &RunTime,
        )
        .await;

        assert!(matches!(result, Err(CoreError::Protocol(_))));
    }

    #[tokio::test]
    async fn matching_scheme_with_accepting_validator_succeeds() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = {
            let (r, w) = tokio::io::split(server);
            (Box::new(r), Box::new(w))
        };
        write_hello(
            &mut client,
            client_hello(Some(b"token".to_vec()), Some("expected-scheme".into())),
        )
        .await;

        let validator = AllowAllValidator;
        let result = perform_handshake(
            &mut reader,
            &mut writer,
            Role::LoadClient,
            &validator,
            false,
            Some("expected-scheme"),
            &allow_all,
            Duration::from_secs(1),
            &RunTime,
        )
        .await;
        assert!(result.is_ok());

        let response = read_hello_response(&mut client).await;
        assert_eq!(response.code, HelloCode::Success);
    }
}
