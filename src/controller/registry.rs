//! hermes-sshappbackend/src/controller/registry.rs
//! Controller-side proxy registry (§4.F): tracks per-proxy TCP connection
//! tables, dials local targets, pumps bytes to/from them, and serializes
//! control request/reply correlation over the shared session transport.
//! Grounded on `local-code/main.go`'s `SSHAppBackend`.

use crate::error::{HermesError, Result};
use crate::wire::common::{self, Message as CommonMessage, ProxyClientConnection, ProxyTuple};
use crate::wire::data::{self, Message as DataMessage};
use crate::wire::framing::{self, Frame};
use crate::wire::types::Protocol;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

struct TcpProxyMirror {
    def: ProxyTuple,
    connections: DashMap<u16, Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>>,
}

struct UdpProxyMirror {
    def: ProxyTuple,
}

/// Bridges the session transport's serialized writer with the read loop's
/// reply routing. All writes — control requests, replies, and data frames —
/// funnel through one task so the multiplexed stream never sees interleaved
/// partial writes from concurrent relay tasks (§5).
struct TransportWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl TransportWriter {
    fn spawn<W: AsyncWrite + Unpin + Send + 'static>(mut writer: W) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(error = %e, "session transport write failed, stopping writer");
                    return;
                }
            }
        });
        TransportWriter { tx }
    }

    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).map_err(|_| HermesError::TransportClosed)
    }
}

/// Controller-side mediator for one backend session: the proxy mirrors
/// (§3), the non-critical reply channel (§4.F), and the dispatch loop that
/// reads notifications off the reverse-socket transport.
pub struct Registry {
    writer: TransportWriter,
    /// Serializes request/reply pairing: held across "write request, await
    /// reply" so at most one controller->agent control request is
    /// outstanding at a time (§4.F, §5).
    reply_lock: Mutex<()>,
    reply_rx: Mutex<mpsc::Receiver<Frame>>,
    reply_tx: mpsc::Sender<Frame>,
    tcp_proxies: DashMap<u16, TcpProxyMirror>,
    udp_proxies: DashMap<u16, UdpProxyMirror>,
}

impl Registry {
    pub fn new<W: AsyncWrite + Unpin + Send + 'static>(writer: W) -> Arc<Self> {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        Arc::new(Registry {
            writer: TransportWriter::spawn(writer),
            reply_lock: Mutex::new(()),
            reply_rx: Mutex::new(reply_rx),
            reply_tx,
            tcp_proxies: DashMap::new(),
            udp_proxies: DashMap::new(),
        })
    }

    /// Reads frames off `reader` until the transport closes. Notifications
    /// (106/107/108/109) are handled directly; every other message is a
    /// reply to one of our own outbound requests and is forwarded into the
    /// non-critical reply channel non-blockingly (§4.F).
    pub async fn run<R: AsyncRead + Unpin>(self: &Arc<Self>, mut reader: R) -> Result<()> {
        loop {
            let (frame, payload) = match framing::read_frame(&mut reader).await {
                Ok(v) => v,
                Err(HermesError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("session transport closed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "error decoding inbound frame, continuing session");
                    continue;
                }
            };

            match frame {
                Frame::Data(DataMessage::TcpConnectionOpened { proxy_id, connection_id }) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.on_tcp_connection_opened(proxy_id, connection_id).await });
                }
                Frame::Data(DataMessage::TcpConnectionClosed { proxy_id, connection_id }) => {
                    self.on_tcp_connection_closed(proxy_id, connection_id).await;
                }
                Frame::Data(DataMessage::TcpProxyData { proxy_id, connection_id, .. }) => {
                    self.on_tcp_proxy_data(proxy_id, connection_id, &payload).await;
                }
                Frame::Data(DataMessage::UdpProxyData { .. }) => {
                    // No controller-side UDP mirror dial path exists yet
                    // (§4.H note: the translation cache is designed-in but
                    // unused by the current data flow); logged and dropped.
                    debug!("received UdpProxyData with no controller-side consumer wired up");
                }
                other => {
                    let _ = self.reply_tx.try_send(other);
                }
            }
        }
    }

    async fn await_common_reply(&self, request: CommonMessage) -> Result<CommonMessage> {
        let _guard = self.reply_lock.lock().await;
        self.writer.send(common::encode(&request))?;
        let mut rx = self.reply_rx.lock().await;
        match rx.recv().await {
            Some(Frame::Common(msg)) => Ok(msg),
            Some(Frame::Data(_)) => Err(HermesError::TypecastMismatch("expected common-family reply, got data-family")),
            None => Err(HermesError::TransportClosed),
        }
    }

    async fn await_data_reply(&self, request: DataMessage) -> Result<DataMessage> {
        let _guard = self.reply_lock.lock().await;
        self.writer.send(data::encode(&request))?;
        let mut rx = self.reply_rx.lock().await;
        match rx.recv().await {
            Some(Frame::Data(msg)) => Ok(msg),
            Some(Frame::Common(_)) => Err(HermesError::TypecastMismatch("expected data-family reply, got common-family")),
            None => Err(HermesError::TransportClosed),
        }
    }

    /// `StartBackend` (§6 external control contract): sends `Start`, awaits
    /// `BackendStatusResponse`.
    pub async fn start_backend(&self, args: Vec<u8>) -> Result<()> {
        let reply = self.await_common_reply(CommonMessage::Start { args }).await?;
        match reply {
            CommonMessage::BackendStatusResponse { running: true, .. } => Ok(()),
            CommonMessage::BackendStatusResponse { message, .. } => {
                Err(HermesError::BootstrapFailed { reason: message })
            }
            _ => Err(HermesError::TypecastMismatch("unexpected reply to Start")),
        }
    }

    pub async fn stop_backend(&self) -> Result<()> {
        let reply = self.await_common_reply(CommonMessage::Stop).await?;
        match reply {
            CommonMessage::BackendStatusResponse { .. } => Ok(()),
            _ => Err(HermesError::TypecastMismatch("unexpected reply to Stop")),
        }
    }

    /// `StartProxy` (§6): forwards `AddProxy` to the agent, reads the
    /// assigned `proxy_id` from the data-family `ProxyStatusResponse`
    /// reply (§4.D table note — the agent replies with the data family,
    /// not the common-family `ProxyStatusResponse`, since only it carries
    /// the freshly assigned id), and registers the mirror entry (§3).
    pub async fn start_proxy(self: &Arc<Self>, def: ProxyTuple) -> Result<u16> {
        let reply = self.await_data_reply_after_common(CommonMessage::AddProxy(def.clone())).await?;
        match reply {
            DataMessage::ProxyStatusResponse { proxy_id, active: true } => {
                match def.protocol {
                    Protocol::Tcp => {
                        self.tcp_proxies.insert(
                            proxy_id,
                            TcpProxyMirror { def, connections: DashMap::new() },
                        );
                    }
                    Protocol::Udp => {
                        self.udp_proxies.insert(proxy_id, UdpProxyMirror { def });
                    }
                }
                Ok(proxy_id)
            }
            DataMessage::ProxyStatusResponse { active: false, .. } => {
                Err(HermesError::BootstrapFailed { reason: "failed to initialize proxy in remote code".to_string() })
            }
            _ => Err(HermesError::TypecastMismatch("unexpected reply to AddProxy")),
        }
    }

    /// A request/reply pair where the request is common-family but the
    /// reply is data-family (AddProxy's actual wire behavior, §4.D).
    async fn await_data_reply_after_common(&self, request: CommonMessage) -> Result<DataMessage> {
        let _guard = self.reply_lock.lock().await;
        self.writer.send(common::encode(&request))?;
        let mut rx = self.reply_rx.lock().await;
        match rx.recv().await {
            Some(Frame::Data(msg)) => Ok(msg),
            Some(Frame::Common(_)) => Err(HermesError::TypecastMismatch("expected data-family reply, got common-family")),
            None => Err(HermesError::TransportClosed),
        }
    }

    /// `StopProxy` (§6). Keys by `proxy_id` end-to-end (REDESIGN FLAG,
    /// §9.2) rather than the original's fragile `destination_port` match:
    /// the controller already knows `proxy_id` from `start_proxy`'s reply.
    /// Closes every mirrored connection, notifies the agent of each close,
    /// then sends the data-family `RemoveProxy{proxy_id}` and checks the
    /// returned `active` flag (true = still running = the remove failed,
    /// the controller's original sign convention, unified per §9.4/5).
    pub async fn stop_proxy(self: &Arc<Self>, proxy_id: u16, protocol: Protocol) -> Result<()> {
        if protocol == Protocol::Tcp {
            if let Some((_, mirror)) = self.tcp_proxies.remove(&proxy_id) {
                for entry in mirror.connections.iter() {
                    let connection_id = *entry.key();
                    let _ = self.writer.send(data::encode(&DataMessage::TcpConnectionClosed {
                        proxy_id,
                        connection_id,
                    }));
                }
            }
        } else {
            self.udp_proxies.remove(&proxy_id);
        }

        let reply = self.await_data_reply(DataMessage::RemoveProxy { proxy_id }).await?;
        match reply {
            DataMessage::ProxyStatusResponse { active: false, .. } => Ok(()),
            DataMessage::ProxyStatusResponse { active: true, .. } => {
                Err(HermesError::BootstrapFailed { reason: "failed to stop proxy: still running".to_string() })
            }
            _ => Err(HermesError::TypecastMismatch("unexpected reply to RemoveProxy")),
        }
    }

    pub async fn check_parameters_for_connections(&self, tuple: ProxyTuple) -> Result<(bool, String)> {
        let reply = self.await_common_reply(CommonMessage::CheckClientParameters(tuple)).await?;
        parse_check_reply(reply)
    }

    pub async fn check_parameters_for_backend(&self, args: Vec<u8>) -> Result<(bool, String)> {
        let reply = self.await_common_reply(CommonMessage::CheckServerParameters { args }).await?;
        parse_check_reply(reply)
    }

    pub async fn get_all_client_connections(&self) -> Result<Vec<ProxyClientConnection>> {
        let reply = self.await_common_reply(CommonMessage::ProxyConnectionsRequest).await?;
        match reply {
            CommonMessage::ProxyConnectionsResponse { connections } => Ok(connections),
            _ => Err(HermesError::TypecastMismatch("unexpected reply to ProxyConnectionsRequest")),
        }
    }

    /// Agent notified us a client connected to a TCP proxy it exposes.
    /// Dials `source_ip:source_port` and spawns the relay task that pumps
    /// bytes from the dial back to the agent as `TCPProxyData` frames
    /// (§4.F).
    async fn on_tcp_connection_opened(self: Arc<Self>, proxy_id: u16, connection_id: u16) {
        let Some(mirror) = self.tcp_proxies.get(&proxy_id) else {
            warn!(proxy_id, "received TCPConnectionOpened for unknown proxy");
            return;
        };
        let target = (mirror.def.ip, mirror.def.source_port);
        drop(mirror);

        let stream = match TcpStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                let err = HermesError::DialFailed(e);
                warn!(error = %err, proxy_id, connection_id, "failed to dial proxy target");
                return;
            }
        };
        let (mut read_half, write_half) = stream.into_split();

        if let Some(mirror) = self.tcp_proxies.get(&proxy_id) {
            mirror.connections.insert(connection_id, Arc::new(Mutex::new(write_half)));
        } else {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let header = data::encode(&DataMessage::TcpProxyData {
                            proxy_id,
                            connection_id,
                            data_length: n as u16,
                        });
                        if this.writer.send(header).is_err() {
                            break;
                        }
                        if this.writer.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
                    Err(_) => break,
                }
            }

            if let Some(mirror) = this.tcp_proxies.get(&proxy_id) {
                mirror.connections.remove(&connection_id);
            }
            let _ = this.writer.send(data::encode(&DataMessage::TcpConnectionClosed { proxy_id, connection_id }));
        });
    }

    async fn on_tcp_connection_closed(&self, proxy_id: u16, connection_id: u16) {
        if let Some(mirror) = self.tcp_proxies.get(&proxy_id) {
            if let Some((_, conn)) = mirror.connections.remove(&connection_id) {
                let mut conn = conn.lock().await;
                let _ = conn.shutdown().await;
            }
        }
    }

    async fn on_tcp_proxy_data(&self, proxy_id: u16, connection_id: u16, payload: &[u8]) {
        let Some(mirror) = self.tcp_proxies.get(&proxy_id) else {
            warn!(proxy_id, connection_id, "TCPProxyData for unknown proxy");
            return;
        };
        let Some(conn) = mirror.connections.get(&connection_id) else {
            warn!(proxy_id, connection_id, "TCPProxyData for unknown connection");
            return;
        };
        let conn = conn.clone();
        drop(mirror);
        let mut conn = conn.lock().await;
        if let Err(e) = conn.write_all(payload).await {
            warn!(error = %e, proxy_id, connection_id, "failed to write to mirrored connection");
        }
    }
}

fn parse_check_reply(reply: CommonMessage) -> Result<(bool, String)> {
    match reply {
        CommonMessage::CheckParametersResponse { valid, message, .. } => Ok((valid, message)),
        _ => Err(HermesError::TypecastMismatch("unexpected reply to parameter check")),
    }
}
