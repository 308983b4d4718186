//! hermes-sshappbackend/src/controller/bootstrap.rs
//! Controller-side SSH bootstrap (§4.E): connect, probe CPU architecture,
//! upload/verify the agent binary, open a reverse Unix-socket listener, and
//! spawn the agent. Grounded on `local-code/main.go`'s `StartBackend`.

use crate::error::{HermesError, Result};
use async_trait::async_trait;
use md5::{Digest, Md5};
use rust_embed::RustEmbed;
use russh::client::{self, Msg};
use russh::keys::{PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Compiled agent binaries for each supported remote CPU architecture,
/// embedded at compile time (§9 "Embedded agent binaries").
#[derive(RustEmbed)]
#[folder = "remote-bin/"]
struct RemoteBinaries;

const REMOTE_BINARY_PATH: &str = "/tmp/sshappbackend.runtime";

/// `SSHAppBackendData` in `local-code/main.go`: the SSH backend's own
/// config, parsed from the JSON blob handed to `start_backend` (§6, ambient
/// "Configuration" stack).
#[derive(Debug, Clone, Deserialize)]
pub struct SshBackendConfig {
    pub ip: String,
    pub port: u16,
    pub username: String,
    #[serde(rename = "privateKey")]
    pub private_key_pem: String,
    #[serde(rename = "listenOnIPs", default)]
    pub listen_on_ips: Vec<String>,
}

impl TryFrom<&[u8]> for SshBackendConfig {
    type Error = HermesError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let mut config: SshBackendConfig = serde_json::from_slice(bytes)
            .map_err(|e| HermesError::BootstrapFailed { reason: format!("invalid config json: {e}") })?;

        if config.ip.is_empty() || config.username.is_empty() || config.private_key_pem.is_empty() {
            return Err(HermesError::BootstrapFailed {
                reason: "ip, username and privateKey are required".to_string(),
            });
        }
        if config.listen_on_ips.is_empty() {
            config.listen_on_ips = vec!["0.0.0.0".to_string()];
        }
        Ok(config)
    }
}

/// CPU architecture as reported by `uname -m`, mapped to one of the four
/// embedded agent binaries (§4.E step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuArch {
    Amd64,
    Arm64,
    Arm,
    I386,
}

impl CpuArch {
    fn from_uname(raw: &str) -> Result<Self> {
        let arch = raw.trim();
        match arch {
            "x86_64" => Ok(CpuArch::Amd64),
            "aarch64" => Ok(CpuArch::Arm64),
            "arm" => Ok(CpuArch::Arm),
            other if other.len() == 4 && other.starts_with('i') && other.ends_with("86") => {
                Ok(CpuArch::I386)
            }
            other => Err(HermesError::BootstrapFailed {
                reason: format!("CPU architecture not compiled/supported currently: {other}"),
            }),
        }
    }

    fn asset_name(self) -> &'static str {
        match self {
            CpuArch::Amd64 => "rt-amd64",
            CpuArch::Arm64 => "rt-arm64",
            CpuArch::Arm => "rt-arm",
            CpuArch::I386 => "rt-386",
        }
    }
}

/// Verifies the host key presented during SSH key exchange. The default
/// implementation accepts any key unconditionally, matching the original
/// source's `ssh.InsecureIgnoreHostKey()` (§9 open question 1 — flagged,
/// not fixed by default). `KnownHosts` is the recommended alternative for
/// deployments that want real verification.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, server_key: &PublicKey) -> bool;
}

/// Insecure default: accepts any host key. Named loudly so nobody reaches
/// for it by accident.
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, _server_key: &PublicKey) -> bool {
        true
    }
}

/// Pins a fixed set of acceptable host key fingerprints.
pub struct KnownHosts {
    pub accepted_fingerprints: Vec<String>,
}

impl HostKeyVerifier for KnownHosts {
    fn verify(&self, server_key: &PublicKey) -> bool {
        let fingerprint = server_key.fingerprint(Default::default()).to_string();
        self.accepted_fingerprints.iter().any(|f| f == &fingerprint)
    }
}

struct ClientHandler {
    verifier: Arc<dyn HostKeyVerifier>,
    forwarded_tx: mpsc::UnboundedSender<Channel<Msg>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(self.verifier.verify(server_public_key))
    }

    /// Accepts the single reverse Unix-socket connection opened by the
    /// remote `streamlocal-forward@openssh.com` request (§4.E step 5/7).
    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        _socket_path: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = self.forwarded_tx.send(channel);
        Ok(())
    }
}

/// Everything bootstrap hands back to the caller: the reverse-socket
/// transport stream (for `controller::registry::Registry`) and a handle to
/// the background agent-respawn loop so the caller can observe/cancel it.
pub struct BootstrapOutcome<S> {
    pub transport: S,
    pub respawn_loop: tokio::task::JoinHandle<()>,
}

/// Runs the full bootstrap sequence (§4.E) and returns the reverse-socket
/// transport stream once the agent has connected back and answered `Start`
/// successfully.
pub async fn bootstrap(
    config: &SshBackendConfig,
    verifier: Arc<dyn HostKeyVerifier>,
    log_level: &str,
) -> Result<BootstrapOutcome<impl AsyncRead + AsyncWrite + Unpin>> {
    info!(ip = %config.ip, "SSHAppBackend is initializing...");

    let (forwarded_tx, mut forwarded_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler { verifier, forwarded_tx };
    let ssh_config = Arc::new(client::Config::default());

    let mut handle = client::connect(ssh_config, (config.ip.as_str(), config.port), handler)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("ssh dial failed: {e}") })?;

    let key = PrivateKey::from_openssh(&config.private_key_pem)
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("invalid private key: {e}") })?;

    let authenticated = handle
        .authenticate_publickey(&config.username, Arc::new(key))
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("ssh auth failed: {e}") })?;
    if !authenticated.success() {
        return Err(HermesError::BootstrapFailed { reason: "ssh public key authentication rejected".to_string() });
    }

    debug!("SSHAppBackend has connected successfully.");
    debug!("Getting CPU architecture...");

    let uname = exec_capture(&mut handle, "uname -m").await?;
    let arch = CpuArch::from_uname(&uname)?;
    let asset_name = arch.asset_name();

    debug!("Checking if we need to copy the application...");
    upload_agent_if_stale(&mut handle, asset_name).await?;

    debug!("Initializing Unix socket...");
    let socket_path = format!("/tmp/sock-{}.sock", rand::random::<u64>());
    request_streamlocal_forward(&mut handle, &socket_path).await?;

    debug!("Starting process...");
    let respawn_handle = handle.clone();
    let remote_command = format!(
        "HERMES_LOG_LEVEL=\"{}\" HERMES_API_SOCK=\"{}\" {}",
        log_level, socket_path, REMOTE_BINARY_PATH
    );
    let respawn_loop = tokio::spawn(agent_respawn_loop(respawn_handle, remote_command));

    debug!("Started process. Waiting for Unix socket connection...");
    let channel = forwarded_rx
        .recv()
        .await
        .ok_or_else(|| HermesError::BootstrapFailed { reason: "ssh connection closed before agent connected back".to_string() })?;
    let transport = channel.into_stream();

    debug!("Detected connection. Sending initialization command...");
    let mut transport = transport;
    crate::wire::common::write(&mut transport, &crate::wire::common::Message::Start { args: Vec::new() }).await?;
    let (frame, _) = crate::wire::framing::read_frame(&mut transport).await?;
    match frame {
        crate::wire::framing::Frame::Common(crate::wire::common::Message::BackendStatusResponse {
            running,
            message,
            ..
        }) if running => {
            info!("SSHAppBackend has initialized successfully.");
        }
        crate::wire::framing::Frame::Common(crate::wire::common::Message::BackendStatusResponse { message, .. }) => {
            let reason = if message.is_empty() {
                "failed to initialize backend in remote code".to_string()
            } else {
                format!("failed to initialize backend in remote code: {message}")
            };
            return Err(HermesError::BootstrapFailed { reason });
        }
        other => {
            return Err(HermesError::BootstrapFailed {
                reason: format!("received unexpected reply to Start: tag {}", other.tag()),
            });
        }
    }

    Ok(BootstrapOutcome { transport, respawn_loop })
}

/// Runs `command` on the remote host in a loop, restarting it with a
/// warning on every exit (§4.E step 6). Backs off exponentially, bounded at
/// 30s, between restarts — an addition over the original source, which has
/// no backoff at all (§9 "Agent restart loop").
async fn agent_respawn_loop<H: client::Handler>(handle: client::Handle<H>, command: String) {
    let mut backoff = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        match run_remote_command(&handle, &command).await {
            Ok(()) => {
                warn!("remote agent process exited. Restarting...");
                backoff = Duration::from_millis(500);
            }
            Err(e) => {
                warn!(error = %e, "remote agent process failed to start");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

async fn run_remote_command<H: client::Handler>(handle: &client::Handle<H>, command: &str) -> Result<()> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to open session: {e}") })?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to exec remote agent: {e}") })?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { .. }) | Some(ChannelMsg::Eof) | None => return Ok(()),
            Some(ChannelMsg::Data { .. }) | Some(ChannelMsg::ExtendedData { .. }) => continue,
            _ => continue,
        }
    }
}

async fn exec_capture<H: client::Handler>(handle: &mut client::Handle<H>, command: &str) -> Result<String> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to create session: {e}") })?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to run {command}: {e}") })?;

    let mut output = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(ChannelMsg::ExitStatus { .. }) => break,
            _ => continue,
        }
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// `[ -f /tmp/sshappbackend.runtime ] && md5sum ... | cut -d " " -f 1`;
/// compares against the embedded binary's MD5 and uploads via SFTP only if
/// stale or missing (§4.E step 4). MD5 is strictly an up-to-date check, not
/// a trust boundary (§9.6) — kept rather than swapped for SHA-256 since it
/// doesn't change any wire-observable behavior.
async fn upload_agent_if_stale<H: client::Handler>(handle: &mut client::Handle<H>, asset_name: &str) -> Result<()> {
    let binary = RemoteBinaries::get(asset_name).ok_or_else(|| HermesError::BootstrapFailed {
        reason: format!("embedded agent binary {asset_name} not found"),
    })?;
    let local_md5 = {
        let mut hasher = Md5::new();
        hasher.update(binary.data.as_ref());
        hasher.finalize()
    };

    let probe = exec_capture(
        handle,
        &format!("[ -f {REMOTE_BINARY_PATH} ] && md5sum {REMOTE_BINARY_PATH} | cut -d \" \" -f 1"),
    )
    .await?;
    let probe = probe.trim();

    let up_to_date = if probe.is_empty() {
        false
    } else {
        match hex::decode(probe) {
            Ok(remote_md5) => remote_md5 == local_md5.as_slice(),
            Err(_) => false,
        }
    };

    if up_to_date {
        debug!("Skipping copying as there's a copy on disk already.");
        return Ok(());
    }

    debug!("Copying binary...");
    upload_via_sftp(handle, binary.data.as_ref()).await?;
    debug!("Done copying file.");
    Ok(())
}

async fn upload_via_sftp<H: client::Handler>(handle: &mut client::Handle<H>, binary: &[u8]) -> Result<()> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to open sftp channel: {e}") })?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to request sftp subsystem: {e}") })?;

    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to start sftp session: {e}") })?;

    use tokio::io::AsyncWriteExt;
    let mut file = sftp
        .create(REMOTE_BINARY_PATH)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to create remote file: {e}") })?;
    file.write_all(binary)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to write remote file: {e}") })?;
    file.sync_all()
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to flush remote file: {e}") })?;
    sftp.set_metadata(
        REMOTE_BINARY_PATH,
        russh_sftp::protocol::FileAttributes {
            permissions: Some(0o755),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to chmod remote file: {e}") })?;

    Ok(())
}

/// Requests the OpenSSH `streamlocal-forward@openssh.com` global request so
/// the remote host will forward connections on `socket_path` back to us as
/// `forwarded-streamlocal` channels (§4.E step 5), picked up by
/// `ClientHandler::server_channel_open_forwarded_streamlocal`.
async fn request_streamlocal_forward<H: client::Handler>(handle: &mut client::Handle<H>, socket_path: &str) -> Result<()> {
    handle
        .request_streamlocal_forward(socket_path)
        .await
        .map_err(|e| HermesError::BootstrapFailed { reason: format!("failed to listen on socket: {e}") })?;
    Ok(())
}

/// Locks the entire `StartBackend` sequence against concurrent retries on
/// the same config; mirrors the teacher's pattern of a single mutex
/// guarding a whole multi-step operation (`FFI_ROUTER_LOCK` in `state.rs`).
pub static BOOTSTRAP_SERIALIZER: Mutex<()> = Mutex::const_new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_listen_on_ips_when_absent() {
        let json = br#"{"ip":"10.0.0.1","port":22,"username":"root","privateKey":"key-bytes"}"#;
        let config = SshBackendConfig::try_from(&json[..]).unwrap();
        assert_eq!(config.listen_on_ips, vec!["0.0.0.0".to_string()]);
    }

    #[test]
    fn config_rejects_missing_required_fields() {
        let json = br#"{"ip":"","port":22,"username":"root","privateKey":"key"}"#;
        assert!(SshBackendConfig::try_from(&json[..]).is_err());
    }

    #[test]
    fn cpu_arch_maps_uname_output() {
        assert_eq!(CpuArch::from_uname("x86_64\n").unwrap(), CpuArch::Amd64);
        assert_eq!(CpuArch::from_uname("aarch64\n").unwrap(), CpuArch::Arm64);
        assert_eq!(CpuArch::from_uname("arm\n").unwrap(), CpuArch::Arm);
        assert_eq!(CpuArch::from_uname("i686\n").unwrap(), CpuArch::I386);
        assert!(CpuArch::from_uname("riscv64\n").is_err());
    }

    #[test]
    fn accept_any_host_key_accepts_everything() {
        // Smoke test only: constructing a real PublicKey needs key material
        // we don't have in a unit test; behavior is exercised indirectly by
        // not rejecting any bootstrap in integration tests.
        let _verifier = AcceptAnyHostKey;
    }
}
