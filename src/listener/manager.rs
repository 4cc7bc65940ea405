//! Client-manager listener (C7): accepts manager agents keyed by client ID
//! and issues remote start/stop requests on the scheduler's behalf (§4.7).
//! Unlike C4-C6, this listener's sessions are mostly idle — the traffic
//! flows server-to-client (`start-client-request`/`stop-client-request`)
//! rather than the other way around.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{CoreError, CoreResult};
use crate::ids::ConnectionIdGen;
use crate::job::Role;
use crate::listener::Transport;
use crate::registry::manager::ManagerRegistry;
use crate::registry::RegisteredConnection;
use crate::scheduler::CredentialValidator;
use crate::session::{perform_handshake, Session, UnsolicitedHandler};
use crate::time::SysTime;
use crate::wire::message::{
    ClientState, Envelope, HelloCode, MessageBody, ResultCode, StartClientRequest,
    StartClientResponse, StatusCode, StopClientRequest, StopClientResponse,
};
use crate::{log, warn};

pub use crate::listener::load::ConnectionSummary;

pub struct ManagerListener {
    pub registry: Arc<ManagerRegistry>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connection_ids: Arc<ConnectionIdGen>,
    validator: Arc<dyn CredentialValidator>,
    clock: Arc<dyn SysTime>,
    /// The load-client listener's port, advertised to managers in every
    /// `start-client-request` so newly spawned load clients know where to
    /// dial in (§4.7).
    load_listener_port: u16,
    keepalive_interval: Duration,
    response_wait_timeout: Duration,
    require_auth: bool,
    auth_scheme: Option<String>,
}

impl ManagerListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_ids: Arc<ConnectionIdGen>,
        validator: Arc<dyn CredentialValidator>,
        clock: Arc<dyn SysTime>,
        load_listener_port: u16,
        keepalive_interval: Duration,
        response_wait_timeout: Duration,
        require_auth: bool,
        auth_scheme: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ManagerRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
            connection_ids,
            validator,
            clock,
            load_listener_port,
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
                    warn!(error = %e, "client-manager listener accept failed");
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
                    format!("duplicate client-manager id '{client_id}'"),
                ));
            }
            Ok(())
        };

        let handshake = match perform_handshake(
            &mut reader,
            &mut writer,
            Role::ClientManager,
            self.validator.as_ref(),
            // client-manager-hello carries no credentials field at all (§4.1
            // message catalog), so the require-auth gate never applies here —
            // only the scheme check would, and managers don't offer one either.
            false,
            self.auth_scheme.as_deref(),
            &admission_check,
            self.response_wait_timeout,
            self.clock.as_ref(),
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(remote = %addr, error = %e, "client-manager handshake failed");
                return;
            }
        };

        let max_clients_this_host = handshake.max_clients_this_host.unwrap_or(0);

        let session = Session::new(
            self.connection_ids.next(),
            handshake.client_id,
            addr,
            Role::ClientManager,
            false,
            reader,
            writer,
            self.clock.as_ref(),
        );

        let conn: Arc<dyn RegisteredConnection> = session.clone();
        if let Err(e) = self.registry.register(conn, max_clients_this_host) {
            warn!(client_id = %session.client_id, error = %e, "duplicate client-manager id refused");
            return;
        }
        self.sessions.lock().insert(session.client_id.clone(), session.clone());

        log!(client_id = %session.client_id, connection_id = session.connection_id, max_clients_this_host, "client manager connected");

        session.run(self.clone(), self.keepalive_interval).await;
    }

    fn session_for(&self, client_id: &str) -> CoreResult<Arc<Session>> {
        self.sessions
            .lock()
            .get(client_id)
            .cloned()
            .ok_or_else(|| CoreError::Protocol(format!("no such client manager '{client_id}'")))
    }

    /// §4.7 `start_clients(n)`: fails locally, without contacting the
    /// manager, if `n` would exceed the host's declared capacity. On a
    /// successful response, records the increment in the registry.
    pub async fn start_clients(&self, client_id: &str, count: u32) -> CoreResult<StartClientResponse> {
        let available = self.registry.available_capacity(client_id)?;
        if count > available {
            return Err(CoreError::Capacity(format!(
                "starting {count} more load clients on '{client_id}' would exceed its declared capacity (only {available} remain)"
            )));
        }

        let session = self.session_for(client_id)?;
        let request = StartClientRequest {
            count,
            load_listener_port: self.load_listener_port,
        };
        let response = match session
            .send_request(MessageBody::StartClientRequest(request), self.response_wait_timeout)
            .await
        {
            Ok(envelope) => match envelope.body {
                MessageBody::StartClientResponse(r) => r,
                other => {
                    return Err(CoreError::Protocol(format!(
                        "expected start-client-response, got {:?}",
                        other
                    )))
                }
            },
            Err(CoreError::Timeout) => StartClientResponse {
                code: ResultCode::NoResponse,
                message: "no response from client manager within the configured wait".into(),
            },
            Err(e) => return Err(CoreError::Local(e.to_string())),
        };

        if response.code.is_success() {
            self.registry.record_started(client_id, count)?;
        }
        Ok(response)
    }

    /// §4.7 `stop_clients(n)`: `n <= 0` means "stop all"; otherwise `n` must
    /// not exceed the host's currently recorded started count.
    pub async fn stop_clients(&self, client_id: &str, count: i32) -> CoreResult<StopClientResponse> {
        if count > 0 {
            let started = self.registry.started_count(client_id)?;
            if count as u32 > started {
                return Err(CoreError::Capacity(format!(
                    "cannot stop {count} load clients on '{client_id}': only {started} are recorded as started"
                )));
            }
        }

        let session = self.session_for(client_id)?;
        let request = StopClientRequest { count };
        let response = match session
            .send_request(MessageBody::StopClientRequest(request), self.response_wait_timeout)
            .await
        {
            Ok(envelope) => match envelope.body {
                MessageBody::StopClientResponse(r) => r,
                other => {
                    return Err(CoreError::Protocol(format!(
                        "expected stop-client-response, got {:?}",
                        other
                    )))
                }
            },
            Err(CoreError::Timeout) => StopClientResponse {
                code: ResultCode::NoResponse,
                message: "no response from client manager within the configured wait".into(),
            },
            Err(e) => return Err(CoreError::Local(e.to_string())),
        };

        if response.code.is_success() {
            let stopped = if count <= 0 { 0 } else { count as u32 };
            self.registry.record_stopped(client_id, stopped)?;
        }
        Ok(response)
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
impl UnsolicitedHandler for ManagerListener {
    /// §4.7: "The manager session's receive loop accepts only one
    /// unsolicited message type: a status-response with
    /// client-state=shutting-down, which triggers normal disconnect. Any
    /// other unsolicited message is a protocol violation and the connection
    /// is closed with a shutdown message."
    async fn on_unsolicited(&self, session: Arc<Session>, envelope: Envelope) {
        match envelope.body {
            MessageBody::StatusResponse(status)
                if status.code == StatusCode::Success && status.client_state == ClientState::ShuttingDown =>
            {
                log!(client_id = %session.client_id, "client manager reported shutting down");
                session.request_close();
            }
            other => {
                warn!(client_id = %session.client_id, body = ?other, "protocol violation on client-manager session, closing");
                let _ = session
                    .send_notification(MessageBody::ServerShutdown(crate::wire::message::ServerShutdown))
                    .await;
                session.request_close();
            }
        }
    }

    async fn on_connection_lost(&self, session: Arc<Session>) {
        self.registry.unregister(&session.client_id);
        self.sessions.lock().remove(&session.client_id);
        log!(client_id = %session.client_id, "client manager connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_all_is_encoded_as_non_positive_count() {
        let request = StopClientRequest { count: 0 };
        assert!(request.count <= 0);
        let request = StopClientRequest { count: -1 };
        assert!(request.count <= 0);
    }
}
