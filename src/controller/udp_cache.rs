//! hermes-sshappbackend/src/controller/udp_cache.rs
//! UDP port-translation cache (§4.H): one ephemeral local UDP socket per
//! `(origin_ip, origin_port)`, all talking to the same fixed target address,
//! with idle eviction. Grounded on the teacher's `cache.rs` DashMap/TTL
//! shape and on `porttranslation/translation.go`'s per-client-socket design.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives datagrams that arrive back on a translated socket and need to be
/// delivered to whichever client originated that flow.
#[async_trait::async_trait]
pub trait ReplySink: Send + Sync {
    async fn write_from(&self, origin_ip: IpAddr, origin_port: u16, data: Vec<u8>);
}

const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

struct Entry {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
    recv_task: JoinHandle<()>,
}

/// Keyed by the address of the entity that will receive replies
/// (`origin_ip`, `origin_port`); every entry's socket is "connected" to the
/// same `target` so a plain `send`/`recv` suffices.
pub struct UdpTranslationCache {
    target: SocketAddr,
    sink: Arc<dyn ReplySink>,
    entries: DashMap<IpAddr, Arc<DashMap<u16, Entry>>>,
}

impl UdpTranslationCache {
    pub fn new(target: SocketAddr, sink: Arc<dyn ReplySink>) -> Self {
        UdpTranslationCache { target, sink, entries: DashMap::new() }
    }

    /// Sends `data` to `target` on behalf of `(origin_ip, origin_port)`,
    /// lazily opening a translated socket and a background receive task the
    /// first time this pair is seen.
    pub async fn write_to(&self, origin_ip: IpAddr, origin_port: u16, data: &[u8]) -> std::io::Result<()> {
        // Clone the per-IP map out of the outer DashMap and let that guard
        // drop here, before any awaits — holding it across the bind/connect/
        // send below would hold the outer shard lock across blocking I/O,
        // which §5 explicitly rules out.
        let per_ip = self
            .entries
            .entry(origin_ip)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();

        if !per_ip.contains_key(&origin_port) {
            let bind_addr = if origin_ip.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(self.target).await?;
            let socket = Arc::new(socket);

            let recv_task = spawn_receive_loop(socket.clone(), origin_ip, origin_port, self.sink.clone());
            per_ip.insert(origin_port, Entry { socket, last_activity: Instant::now(), recv_task });
        }

        let socket = {
            let mut entry = per_ip.get_mut(&origin_port).expect("just inserted above");
            entry.last_activity = Instant::now();
            entry.socket.clone()
        };
        socket.send(data).await?;
        Ok(())
    }

    /// Closes and removes every entry idle for more than 3 minutes; drops
    /// any origin IP left with no surviving ports (§4.H, §8).
    pub fn cleanup_ports(&self) {
        let now = Instant::now();
        for ip_entry in self.entries.iter() {
            let ports = ip_entry.value();
            ports.retain(|_, entry| {
                let alive = now.duration_since(entry.last_activity) < IDLE_TIMEOUT;
                if !alive {
                    entry.recv_task.abort();
                    debug!(port = ?entry.socket.local_addr().ok(), "evicting idle udp translation entry");
                }
                alive
            });
        }
        self.entries.retain(|_, ports| !ports.is_empty());
    }

    /// Closes and drops every entry unconditionally, e.g. on session teardown.
    pub fn stop_all_ports(&self) {
        for ip_entry in self.entries.iter() {
            for port_entry in ip_entry.value().iter() {
                port_entry.recv_task.abort();
            }
        }
        self.entries.clear();
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.iter().map(|ip| ip.value().len()).sum()
    }

    #[cfg(test)]
    fn backdate(&self, ip: IpAddr, port: u16, age: Duration) {
        if let Some(per_ip) = self.entries.get(&ip) {
            if let Some(mut entry) = per_ip.get_mut(&port) {
                entry.last_activity = Instant::now() - age;
            }
        }
    }
}

fn spawn_receive_loop(
    socket: Arc<UdpSocket>,
    origin_ip: IpAddr,
    origin_port: u16,
    sink: Arc<dyn ReplySink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => sink.write_from(origin_ip, origin_port, buf[..n].to_vec()).await,
                Err(e) => {
                    warn!(error = %e, %origin_ip, origin_port, "udp translation socket closed");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::net::UdpSocket as StdUdp;

    struct RecordingSink {
        received: Mutex<Vec<(IpAddr, u16, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl ReplySink for RecordingSink {
        async fn write_from(&self, origin_ip: IpAddr, origin_port: u16, data: Vec<u8>) {
            self.received.lock().unwrap().push((origin_ip, origin_port, data));
        }
    }

    async fn echo_target() -> SocketAddr {
        let sock = StdUdp::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else { return };
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn write_to_opens_one_socket_per_origin_and_relays_replies() {
        let target = echo_target().await;
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let cache = UdpTranslationCache::new(target, sink.clone());

        let origin = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        cache.write_to(origin, 40000, b"ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.entry_count(), 1);
        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], (origin, 40000, b"ping".to_vec()));
    }

    #[tokio::test]
    async fn cleanup_evicts_entries_idle_past_three_minutes() {
        let target = echo_target().await;
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let cache = UdpTranslationCache::new(target, sink);

        let origin = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        cache.write_to(origin, 5000, b"x").await.unwrap();
        assert_eq!(cache.entry_count(), 1);

        cache.backdate(origin, 5000, Duration::from_secs(200));
        cache.cleanup_ports();

        assert_eq!(cache.entry_count(), 0);
        assert!(cache.entries.get(&origin).is_none());
    }

    #[tokio::test]
    async fn stop_all_ports_clears_every_entry() {
        let target = echo_target().await;
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let cache = UdpTranslationCache::new(target, sink);
        cache.write_to(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 1, b"a").await.unwrap();
        cache.write_to(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5)), 1, b"b").await.unwrap();
        cache.stop_all_ports();
        assert_eq!(cache.entry_count(), 0);
    }
}
