//! hermes-sshappbackend/src/agent/runtime.rs
//! Agent-side proxy runtime (§4.G): listens for local TCP/UDP traffic on
//! each proxy's destination port and mirrors it back to the controller as
//! `TCPProxyData`/`UDPProxyData` notifications. Implements [`session::Backend`].
//! Grounded on `remote-code/main.go` and `backendutil_custom/application.go`
//! for the dispatch shape; the actual listen/accept/relay logic has no
//! direct Go counterpart since `remote-code/main.go`'s `StartProxy` is a
//! hardcoded stub there (`return 0, true, nil`) and is built from §4.G's
//! prose description instead.

use crate::error::Result;
use crate::session::{Backend, BackendResult, ParamCheck, ProxyOutcome};
use crate::wire::common::{ProxyClientConnection, ProxyTuple};
use crate::wire::data::{self, Message as DataMessage, ProxyInfo};
use crate::wire::types::Protocol;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Forwards whole buffers into the single writer task that owns the real
/// socket, the same "funnel every write through one task" discipline
/// `controller::registry::TransportWriter` uses, so the accept-loop and
/// receive-loop tasks below can push notifications at any time without
/// racing the responder loop's own direct replies for the one underlying
/// transport (§5).
#[derive(Clone)]
struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let len = buf.len();
        let _ = self.tx.send(buf.to_vec());
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Composes a real read half with a [`ChannelWriter`] so the pair satisfies
/// `AsyncRead + AsyncWrite` and can be handed to `session::run_session`
/// directly, even though writes made through it are actually serialized
/// against the runtime's own background push notifications by the single
/// writer task spawned in [`split_transport`].
pub struct AgentTransport<R> {
    read: R,
    write: ChannelWriter,
}

impl<R: AsyncRead + Unpin> AsyncRead for AgentTransport<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl<R: Unpin> AsyncWrite for AgentTransport<R> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

struct TcpProxyState {
    def: ProxyTuple,
    listener_task: tokio::task::JoinHandle<()>,
    connections: DashMap<u16, Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>>,
    next_connection_id: AtomicU16,
}

struct UdpProxyState {
    def: ProxyTuple,
    socket: Arc<UdpSocket>,
    recv_task: tokio::task::JoinHandle<()>,
}

/// Agent-side mirror of `controller::registry::Registry`: the proxy tables
/// (§3) and the listen/accept/relay machinery that answers the controller's
/// control-plane requests (§4.G).
pub struct Runtime {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    next_proxy_id: AtomicU16,
    tcp_proxies: DashMap<u16, TcpProxyState>,
    udp_proxies: DashMap<u16, UdpProxyState>,
}

/// Spawns the single writer task over `stream`'s write half and returns the
/// runtime plus the composed duplex transport `session::run_session` reads
/// and replies through.
pub fn prepare<S>(stream: S) -> (Arc<Runtime>, AgentTransport<tokio::io::ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!(error = %e, "agent transport write failed, stopping writer");
                return;
            }
        }
    });

    let runtime = Arc::new(Runtime {
        writer_tx: tx.clone(),
        next_proxy_id: AtomicU16::new(0),
        tcp_proxies: DashMap::new(),
        udp_proxies: DashMap::new(),
    });
    let transport = AgentTransport { read: read_half, write: ChannelWriter { tx } };
    (runtime, transport)
}

impl Runtime {
    fn send(&self, bytes: Vec<u8>) {
        let _ = self.writer_tx.send(bytes);
    }

    async fn start_tcp_proxy(self: &Arc<Self>, def: ProxyTuple, proxy_id: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", def.dest_port))
            .await
            .map_err(crate::error::HermesError::BindFailed)?;
        let this = self.clone();
        let listener_task = tokio::spawn(async move { this.tcp_accept_loop(listener, proxy_id).await });

        self.tcp_proxies.insert(
            proxy_id,
            TcpProxyState {
                def,
                listener_task,
                connections: DashMap::new(),
                next_connection_id: AtomicU16::new(0),
            },
        );
        Ok(())
    }

    async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener, proxy_id: u16) {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, proxy_id, "tcp accept failed, stopping listener");
                    return;
                }
            };

            let Some(state) = self.tcp_proxies.get(&proxy_id) else { return };
            let connection_id = state.next_connection_id.fetch_add(1, Ordering::SeqCst);
            drop(state);

            let (mut read_half, write_half) = stream.into_split();
            if let Some(state) = self.tcp_proxies.get(&proxy_id) {
                state.connections.insert(connection_id, Arc::new(Mutex::new(write_half)));
            } else {
                return;
            }

            self.send(data::encode(&DataMessage::TcpConnectionOpened { proxy_id, connection_id }));
            info!(proxy_id, connection_id, "tcp connection opened");

            let this = self.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65535];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            this.send(data::encode(&DataMessage::TcpProxyData {
                                proxy_id,
                                connection_id,
                                data_length: n as u16,
                            }));
                            this.send(buf[..n].to_vec());
                        }
                        Err(_) => break,
                    }
                }

                if let Some(state) = this.tcp_proxies.get(&proxy_id) {
                    state.connections.remove(&connection_id);
                }
                this.send(data::encode(&DataMessage::TcpConnectionClosed { proxy_id, connection_id }));
                debug!(proxy_id, connection_id, "tcp connection closed");
            });
        }
    }

    async fn start_udp_proxy(self: &Arc<Self>, def: ProxyTuple, proxy_id: u16) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", def.dest_port))
                .await
                .map_err(crate::error::HermesError::BindFailed)?,
        );
        let this = self.clone();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move { this.udp_receive_loop(recv_socket, proxy_id).await });

        self.udp_proxies.insert(proxy_id, UdpProxyState { def, socket, recv_task });
        Ok(())
    }

    async fn udp_receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, proxy_id: u16) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, client) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, proxy_id, "udp socket closed");
                    return;
                }
            };
            self.send(data::encode(&DataMessage::UdpProxyData {
                proxy_id,
                client_ip: client.ip(),
                client_port: client.port(),
                data_length: n as u16,
            }));
            self.send(buf[..n].to_vec());
        }
    }

    async fn stop_proxy_internal(&self, proxy_id: u16) -> bool {
        if let Some((_, state)) = self.tcp_proxies.remove(&proxy_id) {
            state.listener_task.abort();
            for entry in state.connections.iter() {
                let mut conn = entry.value().lock().await;
                let _ = conn.shutdown().await;
            }
            return true;
        }
        if let Some((_, state)) = self.udp_proxies.remove(&proxy_id) {
            state.recv_task.abort();
            return true;
        }
        false
    }
}

/// Implemented for `Arc<Runtime>` rather than `Runtime` directly: starting a
/// proxy spawns accept/receive-loop tasks that outlive the call and need
/// their own owning handle on the runtime, so every entry point here needs
/// an `Arc` to clone, not just a borrow.
#[async_trait]
impl Backend for Arc<Runtime> {
    async fn start_backend(&self, _args: Vec<u8>) -> BackendResult {
        BackendResult::ok()
    }

    async fn stop_backend(&self) -> BackendResult {
        for entry in self.tcp_proxies.iter() {
            entry.value().listener_task.abort();
        }
        for entry in self.udp_proxies.iter() {
            entry.value().recv_task.abort();
        }
        self.tcp_proxies.clear();
        self.udp_proxies.clear();
        BackendResult::ok()
    }

    async fn backend_status(&self) -> BackendResult {
        BackendResult::ok()
    }

    async fn start_proxy(&self, tuple: ProxyTuple) -> ProxyOutcome {
        let proxy_id = self.next_proxy_id.fetch_add(1, Ordering::SeqCst);
        let result = match tuple.protocol {
            Protocol::Tcp => self.start_tcp_proxy(tuple.clone(), proxy_id).await,
            Protocol::Udp => self.start_udp_proxy(tuple.clone(), proxy_id).await,
        };
        match result {
            Ok(()) => ProxyOutcome { proxy_id: Some(proxy_id), active: true, ok: true },
            Err(e) => {
                warn!(error = %e, proxy_id, "failed to start proxy");
                ProxyOutcome { proxy_id: None, active: false, ok: false }
            }
        }
    }

    /// Answers the common-family `RemoveProxy(tuple)` (tag 3) by matching on
    /// destination port and protocol, since this path carries no agent-
    /// assigned id (§9, same fragility noted for the controller's original
    /// `destination_port` match).
    async fn stop_proxy(&self, tuple: ProxyTuple) -> ProxyOutcome {
        let found = match tuple.protocol {
            Protocol::Tcp => self.tcp_proxies.iter().find(|e| e.value().def.dest_port == tuple.dest_port).map(|e| *e.key()),
            Protocol::Udp => self.udp_proxies.iter().find(|e| e.value().def.dest_port == tuple.dest_port).map(|e| *e.key()),
        };
        match found {
            Some(proxy_id) => {
                let stopped = self.stop_proxy_internal(proxy_id).await;
                ProxyOutcome { proxy_id: Some(proxy_id), active: !stopped, ok: stopped }
            }
            None => ProxyOutcome { proxy_id: None, active: false, ok: false },
        }
    }

    async fn stop_proxy_by_id(&self, proxy_id: u16) -> ProxyOutcome {
        let stopped = self.stop_proxy_internal(proxy_id).await;
        ProxyOutcome { proxy_id: Some(proxy_id), active: !stopped, ok: stopped }
    }

    async fn get_all_client_connections(&self) -> Vec<ProxyClientConnection> {
        // The agent has no client-facing source address to report here —
        // it's the controller's dial, not the agent's accept, that knows
        // the original client; this is answered on the controller side from
        // its own mirror state, never forwarded to the agent (§4.F/§4.G).
        Vec::new()
    }

    async fn check_parameters_for_connections(&self, tuple: ProxyTuple) -> ParamCheck {
        if tuple.dest_port == 0 {
            ParamCheck { valid: false, message: "destination port must be nonzero".to_string() }
        } else {
            ParamCheck { valid: true, message: String::new() }
        }
    }

    async fn check_parameters_for_backend(&self, _args: Vec<u8>) -> ParamCheck {
        ParamCheck { valid: true, message: String::new() }
    }

    async fn on_tcp_connection_opened(&self, _proxy_id: u16, _connection_id: u16) {}
    async fn on_tcp_connection_closed(&self, _proxy_id: u16, _connection_id: u16) {}
    async fn on_tcp_proxy_data(&self, _proxy_id: u16, _connection_id: u16, _payload: &[u8]) {}

    /// `WriteToUDP` equivalent: replies to the originating client through
    /// the listening socket itself, no translation needed server-side
    /// (§4.G).
    async fn on_udp_proxy_data(&self, proxy_id: u16, client_ip: IpAddr, client_port: u16, payload: &[u8]) {
        let Some(state) = self.udp_proxies.get(&proxy_id) else {
            warn!(proxy_id, "UDPProxyData for unknown proxy");
            return;
        };
        let socket = state.socket.clone();
        drop(state);
        if let Err(e) = socket.send_to(payload, (client_ip, client_port)).await {
            warn!(error = %e, proxy_id, %client_ip, client_port, "failed to write udp reply");
        }
    }

    async fn get_proxy_status(&self, proxy_id: u16) -> bool {
        self.tcp_proxies.contains_key(&proxy_id) || self.udp_proxies.contains_key(&proxy_id)
    }

    async fn get_connection_ids(&self, proxy_id: u16) -> Vec<u16> {
        match self.tcp_proxies.get(&proxy_id) {
            Some(state) => state.connections.iter().map(|e| *e.key()).collect(),
            None => Vec::new(),
        }
    }

    async fn resolve_proxy(&self, proxy_id: u16) -> Option<ProxyInfo> {
        if let Some(state) = self.tcp_proxies.get(&proxy_id) {
            return Some(ProxyInfo {
                ip: state.def.ip,
                source_port: state.def.source_port,
                dest_port: state.def.dest_port,
                protocol: Protocol::Tcp,
            });
        }
        self.udp_proxies.get(&proxy_id).map(|state| ProxyInfo {
            ip: state.def.ip,
            source_port: state.def.source_port,
            dest_port: state.def.dest_port,
            protocol: Protocol::Udp,
        })
    }

    async fn resolve_connection(&self, proxy_id: u16, connection_id: u16) -> Option<(IpAddr, u16)> {
        let state = self.tcp_proxies.get(&proxy_id)?;
        let conn = state.connections.get(&connection_id)?;
        let conn = conn.lock().await;
        conn.peer_addr().ok().map(|a| (a.ip(), a.port()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn start_proxy_allocates_monotonic_ids_and_binds_listener() {
        let (client, _server) = duplex(4096);
        let (runtime, _transport) = prepare(client);

        let port = free_port();
        let tuple = ProxyTuple {
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            source_port: port,
            dest_port: port,
            protocol: Protocol::Tcp,
        };
        let outcome = runtime.start_proxy(tuple).await;
        assert_eq!(outcome.proxy_id, Some(0));
        assert!(outcome.active);

        let port2 = free_port();
        let tuple2 = ProxyTuple {
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            source_port: port2,
            dest_port: port2,
            protocol: Protocol::Tcp,
        };
        let outcome2 = runtime.start_proxy(tuple2).await;
        assert_eq!(outcome2.proxy_id, Some(1));
    }

    #[tokio::test]
    async fn stop_proxy_by_id_removes_entry() {
        let (client, _server) = duplex(4096);
        let (runtime, _transport) = prepare(client);
        let port = free_port();
        let tuple = ProxyTuple {
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            source_port: port,
            dest_port: port,
            protocol: Protocol::Tcp,
        };
        let outcome = runtime.start_proxy(tuple).await;
        let proxy_id = outcome.proxy_id.unwrap();
        assert!(runtime.get_proxy_status(proxy_id).await);

        let stop_outcome = runtime.stop_proxy_by_id(proxy_id).await;
        assert!(!stop_outcome.active);
        assert!(!runtime.get_proxy_status(proxy_id).await);
    }

    #[tokio::test]
    async fn resolve_proxy_returns_none_for_unknown_id() {
        let (client, _server) = duplex(4096);
        let (runtime, _transport) = prepare(client);
        assert_eq!(runtime.resolve_proxy(99).await, None);
    }
}
