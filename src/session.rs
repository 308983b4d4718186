//! hermes-sshappbackend/src/session.rs
//! The session runtime (§4.D): a long-lived responder loop over a connected
//! transport, generic over a [`Backend`] implementation.
//!
//! Only the agent (`agent::runtime::Runtime`) runs this loop, answering the
//! controller's commands and requests. The controller side has its own
//! dispatch loop (`controller::registry::Registry::run`), since its inbound
//! traffic is a different shape entirely — notifications to act on directly,
//! plus replies to its own outstanding requests routed through a non-critical
//! reply channel (§4.F) rather than answered here.

use crate::error::{HermesError, Result};
use crate::wire::common::{self, CheckMethod, Message, ProxyClientConnection, ProxyTuple, StatusCode};
use crate::wire::data::{self, ProxyInfo};
use crate::wire::framing::{self, Frame};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Outcome of a simple ok/err operation (Start, Stop, BackendStatusRequest).
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub ok: bool,
    pub message: String,
}

impl BackendResult {
    pub fn ok() -> Self {
        BackendResult { ok: true, message: String::new() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        BackendResult { ok: false, message: message.into() }
    }
}

/// Outcome of AddProxy/RemoveProxy. `proxy_id` is only populated by AddProxy
/// on success. `active` means "the proxy is still running after this
/// operation" (§9.4/5 — unified sign convention, see DESIGN.md).
#[derive(Debug, Clone)]
pub struct ProxyOutcome {
    pub proxy_id: Option<u16>,
    pub active: bool,
    pub ok: bool,
}

/// Outcome of CheckClientParameters/CheckServerParameters.
#[derive(Debug, Clone)]
pub struct ParamCheck {
    pub valid: bool,
    pub message: String,
}

/// The external control contract (§6), implemented once per role
/// (`controller::registry::Registry` or `agent::runtime::Runtime`).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start_backend(&self, args: Vec<u8>) -> BackendResult;
    async fn stop_backend(&self) -> BackendResult;
    async fn backend_status(&self) -> BackendResult;

    async fn start_proxy(&self, tuple: ProxyTuple) -> ProxyOutcome;
    /// Answers the common-family `RemoveProxy(tuple)` (tag 3), matched by
    /// destination port and protocol since the caller doesn't know the
    /// agent-assigned `proxy_id` at this wire layer (§9 notes the same
    /// fragility the controller's `destination_port` match has).
    async fn stop_proxy(&self, tuple: ProxyTuple) -> ProxyOutcome;
    /// Answers the data-family `RemoveProxy { proxy_id }` (tag 102) — the
    /// path `controller::registry::Registry::stop_proxy` actually uses
    /// (REDESIGN FLAG §9.2), keyed directly by the id the agent assigned.
    async fn stop_proxy_by_id(&self, proxy_id: u16) -> ProxyOutcome;
    async fn get_all_client_connections(&self) -> Vec<ProxyClientConnection>;

    async fn check_parameters_for_connections(&self, tuple: ProxyTuple) -> ParamCheck;
    async fn check_parameters_for_backend(&self, args: Vec<u8>) -> ParamCheck;

    /// Agent notified the controller a new client connected to a proxy it
    /// exposes. No reply; the controller dials `tuple.source_ip:source_port`.
    async fn on_tcp_connection_opened(&self, proxy_id: u16, connection_id: u16);
    async fn on_tcp_connection_closed(&self, proxy_id: u16, connection_id: u16);
    async fn on_tcp_proxy_data(&self, proxy_id: u16, connection_id: u16, payload: &[u8]);
    async fn on_udp_proxy_data(&self, proxy_id: u16, client_ip: IpAddr, client_port: u16, payload: &[u8]);

    /// Pure lookups answering the data-family request messages (§4.G last
    /// paragraph): `GetProxyStatus`, `GetAllClientConnections` (per-proxy),
    /// `ResolveProxy`, `ResolveConnection`.
    async fn get_proxy_status(&self, proxy_id: u16) -> bool;
    async fn get_connection_ids(&self, proxy_id: u16) -> Vec<u16>;
    async fn resolve_proxy(&self, proxy_id: u16) -> Option<ProxyInfo>;
    async fn resolve_connection(&self, proxy_id: u16, connection_id: u16) -> Option<(IpAddr, u16)>;
}

/// Runs the responder loop until the transport closes or a read error
/// occurs. Decode errors on individual messages are logged and the loop
/// continues (§4.D, §7); a transport-level read error terminates it.
pub async fn run_session<B, S>(backend: &B, mut stream: S) -> Result<()>
where
    B: Backend,
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (frame, payload) = match framing::read_frame(&mut stream).await {
            Ok(v) => v,
            Err(HermesError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("session transport closed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = dispatch_one(backend, &mut stream, frame, &payload).await {
            warn!(error = %e, "error handling inbound message, continuing session");
        }
    }
}

async fn dispatch_one<B, S>(backend: &B, stream: &mut S, frame: Frame, payload: &[u8]) -> Result<()>
where
    B: Backend,
    S: AsyncWrite + Unpin,
{
    match frame {
        Frame::Common(msg) => dispatch_common(backend, stream, msg).await,
        Frame::Data(msg) => dispatch_data(backend, stream, msg, payload).await,
    }
}

async fn dispatch_common<B, S>(backend: &B, stream: &mut S, msg: Message) -> Result<()>
where
    B: Backend,
    S: AsyncWrite + Unpin,
{
    match msg {
        Message::Start { args } => {
            let result = backend.start_backend(args).await;
            let reply = Message::BackendStatusResponse {
                running: result.ok,
                status: status_code(result.ok),
                message: result.message,
            };
            common::write(stream, &reply).await
        }
        Message::Stop => {
            let result = backend.stop_backend().await;
            // `running = !ok` is an intentional, preserved inversion (§9.3):
            // a successful Stop reports running=false, a failed one true.
            let reply = Message::BackendStatusResponse {
                running: !result.ok,
                status: status_code(result.ok),
                message: result.message,
            };
            common::write(stream, &reply).await
        }
        Message::BackendStatusRequest => {
            let result = backend.backend_status().await;
            let reply = Message::BackendStatusResponse {
                running: result.ok,
                status: status_code(result.ok),
                message: result.message,
            };
            common::write(stream, &reply).await
        }
        Message::AddProxy(tuple) => {
            let outcome = backend.start_proxy(tuple).await;
            // The agent replies with the data-family ProxyStatusResponse
            // (tag 101), not the common-family one (tag 12): only the
            // former carries the freshly assigned proxy_id (§4.D, §9.4/5).
            let reply = data::Message::ProxyStatusResponse {
                proxy_id: outcome.proxy_id.unwrap_or(0),
                active: outcome.active,
            };
            data::write(stream, &reply).await
        }
        Message::RemoveProxy(tuple) => {
            let outcome = backend.stop_proxy(tuple).await;
            let reply = data::Message::ProxyStatusResponse {
                proxy_id: outcome.proxy_id.unwrap_or(0),
                active: outcome.active,
            };
            data::write(stream, &reply).await
        }
        Message::ProxyConnectionsRequest => {
            let connections = backend.get_all_client_connections().await;
            common::write(stream, &Message::ProxyConnectionsResponse { connections }).await
        }
        Message::CheckClientParameters(tuple) => {
            let check = backend.check_parameters_for_connections(tuple).await;
            let reply = Message::CheckParametersResponse {
                method: CheckMethod::Client,
                valid: check.valid,
                message: check.message,
            };
            common::write(stream, &reply).await
        }
        Message::CheckServerParameters { args } => {
            let check = backend.check_parameters_for_backend(args).await;
            let reply = Message::CheckParametersResponse {
                method: CheckMethod::Server,
                valid: check.valid,
                message: check.message,
            };
            common::write(stream, &reply).await
        }
        // Replies and list requests with no inbound handler in this role
        // (e.g. an agent receiving ProxyInstanceResponse) are forwarded
        // nowhere by this loop; the controller's own non-critical channel
        // intercepts its outbound request's reply before it would reach
        // here in that role's loop instance.
        Message::CheckParametersResponse { .. }
        | Message::BackendStatusResponse { .. }
        | Message::ProxyConnectionsResponse { .. }
        | Message::ProxyStatusResponse { .. }
        | Message::ProxyStatusRequest(_)
        | Message::ProxyInstanceResponse { .. }
        | Message::ProxyInstanceRequest => {
            Err(HermesError::TypecastMismatch("unsolicited reply-shaped message in responder loop"))
        }
    }
}

async fn dispatch_data<B, S>(backend: &B, stream: &mut S, msg: data::Message, payload: &[u8]) -> Result<()>
where
    B: Backend,
    S: AsyncWrite + Unpin,
{
    match msg {
        data::Message::TcpConnectionOpened { proxy_id, connection_id } => {
            backend.on_tcp_connection_opened(proxy_id, connection_id).await;
            Ok(())
        }
        data::Message::TcpConnectionClosed { proxy_id, connection_id } => {
            backend.on_tcp_connection_closed(proxy_id, connection_id).await;
            Ok(())
        }
        data::Message::TcpProxyData { proxy_id, connection_id, .. } => {
            backend.on_tcp_proxy_data(proxy_id, connection_id, payload).await;
            Ok(())
        }
        data::Message::UdpProxyData { proxy_id, client_ip, client_port, .. } => {
            backend.on_udp_proxy_data(proxy_id, client_ip, client_port, payload).await;
            Ok(())
        }
        // The redesigned controller->agent stop path (§9.2): keyed by
        // proxy_id directly, replied to with the data-family
        // ProxyStatusResponse the same as AddProxy.
        data::Message::RemoveProxy { proxy_id } => {
            let outcome = backend.stop_proxy_by_id(proxy_id).await;
            let reply = data::Message::ProxyStatusResponse { proxy_id, active: outcome.active };
            data::write(stream, &reply).await
        }
        data::Message::ProxyStatusRequest { proxy_id } => {
            let active = backend.get_proxy_status(proxy_id).await;
            data::write(stream, &data::Message::ProxyStatusResponse { proxy_id, active }).await
        }
        data::Message::ProxyConnectionsRequest { proxy_id } => {
            let connection_ids = backend.get_connection_ids(proxy_id).await;
            data::write(stream, &data::Message::ProxyConnectionsResponse { connection_ids }).await
        }
        data::Message::ProxyInformationRequest { proxy_id } => {
            let info = backend.resolve_proxy(proxy_id).await;
            data::write(stream, &data::Message::ProxyInformationResponse { info }).await
        }
        data::Message::ProxyConnectionInformationRequest { proxy_id, connection_id } => {
            let client = backend.resolve_connection(proxy_id, connection_id).await;
            data::write(stream, &data::Message::ProxyConnectionInformationResponse { client }).await
        }
        // Reply-shaped tags (ProxyStatusResponse, ProxyInstanceResponse,
        // ProxyConnectionsResponse, ProxyInformationResponse,
        // ProxyConnectionInformationResponse) never arrive unsolicited in
        // this loop; they answer the controller's own outbound requests,
        // which the controller routes through its own reply channel, not
        // this dispatcher.
        _ => Err(HermesError::TypecastMismatch(
            "unsolicited reply-shaped data-family message in agent responder loop",
        )),
    }
}

fn status_code(ok: bool) -> StatusCode {
    if ok { StatusCode::Success } else { StatusCode::Failure }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::io::duplex;

    #[derive(Default)]
    struct RecordingBackend {
        opened: Mutex<Vec<(u16, u16)>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn start_backend(&self, args: Vec<u8>) -> BackendResult {
            if args == b"Hello from automated testing" {
                BackendResult::ok()
            } else {
                BackendResult::failure("unexpected args")
            }
        }
        async fn stop_backend(&self) -> BackendResult {
            BackendResult::ok()
        }
        async fn backend_status(&self) -> BackendResult {
            BackendResult::ok()
        }
        async fn start_proxy(&self, _tuple: ProxyTuple) -> ProxyOutcome {
            ProxyOutcome { proxy_id: Some(0), active: true, ok: true }
        }
        async fn stop_proxy(&self, _tuple: ProxyTuple) -> ProxyOutcome {
            ProxyOutcome { proxy_id: None, active: false, ok: true }
        }
        async fn stop_proxy_by_id(&self, _proxy_id: u16) -> ProxyOutcome {
            ProxyOutcome { proxy_id: None, active: false, ok: true }
        }
        async fn get_all_client_connections(&self) -> Vec<ProxyClientConnection> {
            Vec::new()
        }
        async fn check_parameters_for_connections(&self, _tuple: ProxyTuple) -> ParamCheck {
            ParamCheck { valid: true, message: "Hello from automated testing".to_string() }
        }
        async fn check_parameters_for_backend(&self, _args: Vec<u8>) -> ParamCheck {
            ParamCheck { valid: true, message: String::new() }
        }
        async fn on_tcp_connection_opened(&self, proxy_id: u16, connection_id: u16) {
            self.opened.lock().unwrap().push((proxy_id, connection_id));
        }
        async fn on_tcp_connection_closed(&self, _proxy_id: u16, _connection_id: u16) {}
        async fn on_tcp_proxy_data(&self, _proxy_id: u16, _connection_id: u16, _payload: &[u8]) {}
        async fn on_udp_proxy_data(&self, _proxy_id: u16, _client_ip: IpAddr, _client_port: u16, _payload: &[u8]) {}
        async fn get_proxy_status(&self, _proxy_id: u16) -> bool {
            false
        }
        async fn get_connection_ids(&self, _proxy_id: u16) -> Vec<u16> {
            Vec::new()
        }
        async fn resolve_proxy(&self, _proxy_id: u16) -> Option<ProxyInfo> {
            None
        }
        async fn resolve_connection(&self, _proxy_id: u16, _connection_id: u16) -> Option<(IpAddr, u16)> {
            None
        }
    }

    #[tokio::test]
    async fn start_reports_success_with_literal_scenario_args() {
        let backend = RecordingBackend::default();
        let (mut client, server) = duplex(4096);

        let request = common::encode(&Message::Start { args: b"Hello from automated testing".to_vec() });
        tokio::io::AsyncWriteExt::write_all(&mut client, &request).await.unwrap();

        let session_task = tokio::spawn(async move {
            let mut stream = server;
            let (frame, _) = framing::read_frame(&mut stream).await.unwrap();
            dispatch_one(&RecordingBackend::default(), &mut stream, frame, &[]).await.unwrap();
            stream
        });

        let _server = session_task.await.unwrap();

        let mut reply_tag = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply_tag).await.unwrap();
        assert_eq!(reply_tag[0], common::BACKEND_STATUS_RESPONSE_ID);
    }

    #[tokio::test]
    async fn add_proxy_replies_with_active_true_on_success() {
        let backend = RecordingBackend::default();
        let (mut client, mut server) = duplex(4096);
        let tuple = ProxyTuple {
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 139)),
            source_port: 19132,
            dest_port: 19132,
            protocol: crate::wire::types::Protocol::Tcp,
        };
        let request = common::encode(&Message::AddProxy(tuple.clone()));
        tokio::io::AsyncWriteExt::write_all(&mut client, &request).await.unwrap();

        let (frame, _) = framing::read_frame(&mut server).await.unwrap();
        dispatch_one(&backend, &mut server, frame, &[]).await.unwrap();

        let mut reply_tag = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply_tag).await.unwrap();
        assert_eq!(reply_tag[0], data::PROXY_STATUS_RESPONSE_ID);
    }

    #[tokio::test]
    async fn tcp_connection_opened_notification_records_no_reply() {
        let backend = RecordingBackend::default();
        let (mut client, mut server) = duplex(4096);
        let request = data::encode(&data::Message::TcpConnectionOpened { proxy_id: 0, connection_id: 0 });
        tokio::io::AsyncWriteExt::write_all(&mut client, &request).await.unwrap();

        let (frame, payload) = framing::read_frame(&mut server).await.unwrap();
        dispatch_one(&backend, &mut server, frame, &payload).await.unwrap();

        assert_eq!(*backend.opened.lock().unwrap(), vec![(0, 0)]);
    }
}
