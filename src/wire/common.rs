//! hermes-sshappbackend/src/wire/common.rs
//! Codec A: the 15 control messages exchanged between a backend session and
//! whatever sits on the other end of the control socket (§4.A).
//!
//! All multi-byte integers are big-endian. Strings are raw bytes, never
//! NUL-terminated. IP addresses are `{version: u8 in {4,6}, bytes}`; tags
//! 4 and 13 use `\r`-separated, `\n`-terminated list framing.

use crate::error::{HermesError, Result};
use crate::wire::types::{
    LIST_SEPARATOR, LIST_TERMINATOR, Protocol, read_exact_async, read_u16_async, read_u8_async,
    write_u16,
};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

pub const START_ID: u8 = 0;
pub const STOP_ID: u8 = 1;
pub const ADD_PROXY_ID: u8 = 2;
pub const REMOVE_PROXY_ID: u8 = 3;
pub const PROXY_CONNECTIONS_RESPONSE_ID: u8 = 4;
pub const CHECK_CLIENT_PARAMETERS_ID: u8 = 5;
pub const CHECK_SERVER_PARAMETERS_ID: u8 = 6;
pub const CHECK_PARAMETERS_RESPONSE_ID: u8 = 7;
pub const PROXY_CONNECTIONS_REQUEST_ID: u8 = 8;
pub const BACKEND_STATUS_RESPONSE_ID: u8 = 9;
pub const BACKEND_STATUS_REQUEST_ID: u8 = 10;
pub const PROXY_STATUS_REQUEST_ID: u8 = 11;
pub const PROXY_STATUS_RESPONSE_ID: u8 = 12;
pub const PROXY_INSTANCE_RESPONSE_ID: u8 = 13;
pub const PROXY_INSTANCE_REQUEST_ID: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Failure,
}

impl StatusCode {
    fn to_byte(self) -> u8 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Failure => 1,
        }
    }

    fn from_byte(b: u8) -> Self {
        if b == 0 { StatusCode::Success } else { StatusCode::Failure }
    }
}

/// Shared layout used by AddProxy, RemoveProxy, CheckClientParameters, and
/// ProxyStatusRequest (§4.A): `ipver, ip, srcport, dstport, proto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTuple {
    pub ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: Protocol,
}

/// One element of a tag-4 list: `server_ipver, server_ip, srcport, dstport,
/// client_ipver, client_ip, clientport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyClientConnection {
    pub server_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub client_ip: IpAddr,
    pub client_port: u16,
}

/// One element of a tag-13 list: `ipver, ip, srcport, dstport, proto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInstance {
    pub ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMethod {
    Client,
    Server,
}

impl CheckMethod {
    fn to_byte(self) -> u8 {
        match self {
            CheckMethod::Client => CHECK_CLIENT_PARAMETERS_ID,
            CheckMethod::Server => CHECK_SERVER_PARAMETERS_ID,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            CHECK_CLIENT_PARAMETERS_ID => Ok(CheckMethod::Client),
            CHECK_SERVER_PARAMETERS_ID => Ok(CheckMethod::Server),
            other => Err(HermesError::InvalidProtocolMethod(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Start { args: Vec<u8> },
    Stop,
    AddProxy(ProxyTuple),
    RemoveProxy(ProxyTuple),
    ProxyConnectionsResponse { connections: Vec<ProxyClientConnection> },
    CheckClientParameters(ProxyTuple),
    CheckServerParameters { args: Vec<u8> },
    CheckParametersResponse { method: CheckMethod, valid: bool, message: String },
    ProxyConnectionsRequest,
    BackendStatusResponse { running: bool, status: StatusCode, message: String },
    BackendStatusRequest,
    ProxyStatusRequest(ProxyTuple),
    ProxyStatusResponse { tuple: ProxyTuple, active: bool },
    ProxyInstanceResponse { proxies: Vec<ProxyInstance> },
    ProxyInstanceRequest,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Start { .. } => START_ID,
            Message::Stop => STOP_ID,
            Message::AddProxy(_) => ADD_PROXY_ID,
            Message::RemoveProxy(_) => REMOVE_PROXY_ID,
            Message::ProxyConnectionsResponse { .. } => PROXY_CONNECTIONS_RESPONSE_ID,
            Message::CheckClientParameters(_) => CHECK_CLIENT_PARAMETERS_ID,
            Message::CheckServerParameters { .. } => CHECK_SERVER_PARAMETERS_ID,
            Message::CheckParametersResponse { .. } => CHECK_PARAMETERS_RESPONSE_ID,
            Message::ProxyConnectionsRequest => PROXY_CONNECTIONS_REQUEST_ID,
            Message::BackendStatusResponse { .. } => BACKEND_STATUS_RESPONSE_ID,
            Message::BackendStatusRequest => BACKEND_STATUS_REQUEST_ID,
            Message::ProxyStatusRequest(_) => PROXY_STATUS_REQUEST_ID,
            Message::ProxyStatusResponse { .. } => PROXY_STATUS_RESPONSE_ID,
            Message::ProxyInstanceResponse { .. } => PROXY_INSTANCE_RESPONSE_ID,
            Message::ProxyInstanceRequest => PROXY_INSTANCE_REQUEST_ID,
        }
    }
}

fn encode_tuple(out: &mut Vec<u8>, tuple: &ProxyTuple) {
    crate::wire::types::encode_ip(tuple.ip, out);
    write_u16(out, tuple.source_port);
    write_u16(out, tuple.dest_port);
    out.push(tuple.protocol.to_byte());
}

fn encode_client_connection(out: &mut Vec<u8>, conn: &ProxyClientConnection) {
    crate::wire::types::encode_ip(conn.server_ip, out);
    write_u16(out, conn.source_port);
    write_u16(out, conn.dest_port);
    crate::wire::types::encode_ip(conn.client_ip, out);
    write_u16(out, conn.client_port);
}

fn encode_instance(out: &mut Vec<u8>, inst: &ProxyInstance) {
    crate::wire::types::encode_ip(inst.ip, out);
    write_u16(out, inst.source_port);
    write_u16(out, inst.dest_port);
    out.push(inst.protocol.to_byte());
}

/// Encodes a whole message (tag included) to a fresh buffer.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = vec![msg.tag()];
    match msg {
        Message::Start { args } => {
            write_u16(&mut out, args.len() as u16);
            out.extend_from_slice(args);
        }
        Message::Stop => {}
        Message::AddProxy(t) | Message::RemoveProxy(t) | Message::CheckClientParameters(t) => {
            encode_tuple(&mut out, t)
        }
        Message::ProxyConnectionsResponse { connections } => {
            for (i, conn) in connections.iter().enumerate() {
                if i > 0 {
                    out.push(LIST_SEPARATOR);
                }
                encode_client_connection(&mut out, conn);
            }
            out.push(LIST_TERMINATOR);
        }
        Message::CheckServerParameters { args } => {
            write_u16(&mut out, args.len() as u16);
            out.extend_from_slice(args);
        }
        Message::CheckParametersResponse { method, valid, message } => {
            out.push(method.to_byte());
            out.push(if *valid { 1 } else { 0 });
            write_u16(&mut out, message.len() as u16);
            out.extend_from_slice(message.as_bytes());
        }
        Message::ProxyConnectionsRequest => {}
        Message::BackendStatusResponse { running, status, message } => {
            out.push(if *running { 1 } else { 0 });
            out.push(status.to_byte());
            write_u16(&mut out, message.len() as u16);
            out.extend_from_slice(message.as_bytes());
        }
        Message::BackendStatusRequest => {}
        Message::ProxyStatusRequest(t) => encode_tuple(&mut out, t),
        Message::ProxyStatusResponse { tuple, active } => {
            encode_tuple(&mut out, tuple);
            out.push(if *active { 1 } else { 0 });
        }
        Message::ProxyInstanceResponse { proxies } => {
            for (i, inst) in proxies.iter().enumerate() {
                if i > 0 {
                    out.push(LIST_SEPARATOR);
                }
                encode_instance(&mut out, inst);
            }
            out.push(LIST_TERMINATOR);
        }
        Message::ProxyInstanceRequest => {}
    }
    out
}

pub async fn write<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&encode(msg)).await?;
    Ok(())
}

async fn read_tuple<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ProxyTuple> {
    let ip = read_ip_required(reader).await?;
    let source_port = read_u16_async(reader).await?;
    let dest_port = read_u16_async(reader).await?;
    let protocol = Protocol::from_byte(read_u8_async(reader).await?)?;
    Ok(ProxyTuple { ip, source_port, dest_port, protocol })
}

async fn read_ip_required<R: AsyncRead + Unpin>(reader: &mut R) -> Result<IpAddr> {
    let ver = read_u8_async(reader).await?;
    read_ip_with_version(reader, ver).await
}

async fn read_ip_with_version<R: AsyncRead + Unpin>(reader: &mut R, ver: u8) -> Result<IpAddr> {
    match ver {
        4 => {
            let bytes = read_exact_async::<4, _>(reader).await?;
            Ok(IpAddr::from(bytes))
        }
        6 => {
            let bytes = read_exact_async::<16, _>(reader).await?;
            Ok(IpAddr::from(bytes))
        }
        other => Err(HermesError::InvalidIpVersion(other)),
    }
}

/// Reads one tag-4 list element. Returns `Ok(None)` when the next byte in
/// the IP-version position is the list terminator (§4.A "List framing").
async fn read_client_connection<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ProxyClientConnection>> {
    let ver = read_u8_async(reader).await?;
    if ver == LIST_TERMINATOR {
        return Ok(None);
    }
    let server_ip = read_ip_with_version(reader, ver).await?;
    let source_port = read_u16_async(reader).await?;
    let dest_port = read_u16_async(reader).await?;
    let client_ip = read_ip_required(reader).await?;
    let client_port = read_u16_async(reader).await?;
    Ok(Some(ProxyClientConnection {
        server_ip,
        source_port,
        dest_port,
        client_ip,
        client_port,
    }))
}

async fn read_instance<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<ProxyInstance>> {
    let ver = read_u8_async(reader).await?;
    if ver == LIST_TERMINATOR {
        return Ok(None);
    }
    let ip = read_ip_with_version(reader, ver).await?;
    let source_port = read_u16_async(reader).await?;
    let dest_port = read_u16_async(reader).await?;
    let protocol = Protocol::from_byte(read_u8_async(reader).await?)?;
    Ok(Some(ProxyInstance { ip, source_port, dest_port, protocol }))
}

/// Whether the byte in a list's delimiter slot says to read another element
/// or that the list is done.
enum ListDelimiter {
    Continue,
    Stop,
}

/// Reads the delimiter following a list element: `\r` continues the list,
/// `\n` terminates it cleanly — the original encoder overwrites the last
/// element's `\r` with `\n` rather than appending a separate terminator
/// byte (§4.A). Any other byte is the malformed case (§7
/// `ListDelimiterInvalid`, recoverable): logged and treated as an early
/// terminator so the caller still returns what it decoded so far, matching
/// `unmarshal.go`'s `(partial, errorReturn)` — a `Result<Message>` can't
/// carry a partial value alongside an error, so the error is surfaced via
/// logging instead of the return type.
async fn read_list_delimiter<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ListDelimiter> {
    let delim = read_u8_async(reader).await?;
    match delim {
        LIST_SEPARATOR => Ok(ListDelimiter::Continue),
        LIST_TERMINATOR => Ok(ListDelimiter::Stop),
        other => {
            let err = HermesError::ListDelimiterInvalid(other);
            warn!(error = %err, "truncating list at invalid delimiter, returning elements decoded so far");
            Ok(ListDelimiter::Stop)
        }
    }
}

/// Decodes a whole message including the tag byte, given the already-read
/// tag. The framing demultiplexer (§4.C) reads the tag to decide codec A
/// vs B, then calls this with it.
pub async fn decode<R: AsyncRead + Unpin>(tag: u8, reader: &mut R) -> Result<Message> {
    match tag {
        START_ID => {
            let len = read_u16_async(reader).await? as usize;
            let mut args = vec![0u8; len];
            reader.read_exact(&mut args).await?;
            Ok(Message::Start { args })
        }
        STOP_ID => Ok(Message::Stop),
        ADD_PROXY_ID => Ok(Message::AddProxy(read_tuple(reader).await?)),
        REMOVE_PROXY_ID => Ok(Message::RemoveProxy(read_tuple(reader).await?)),
        PROXY_CONNECTIONS_RESPONSE_ID => {
            let mut connections = Vec::new();
            loop {
                match read_client_connection(reader).await? {
                    None => break,
                    Some(conn) => {
                        connections.push(conn);
                        match read_list_delimiter(reader).await? {
                            ListDelimiter::Continue => continue,
                            ListDelimiter::Stop => break,
                        }
                    }
                }
            }
            Ok(Message::ProxyConnectionsResponse { connections })
        }
        CHECK_CLIENT_PARAMETERS_ID => Ok(Message::CheckClientParameters(read_tuple(reader).await?)),
        CHECK_SERVER_PARAMETERS_ID => {
            let len = read_u16_async(reader).await? as usize;
            let mut args = vec![0u8; len];
            reader.read_exact(&mut args).await?;
            Ok(Message::CheckServerParameters { args })
        }
        CHECK_PARAMETERS_RESPONSE_ID => {
            let method = CheckMethod::from_byte(read_u8_async(reader).await?)?;
            let valid = read_u8_async(reader).await? == 1;
            let msglen = read_u16_async(reader).await? as usize;
            let mut msg_bytes = vec![0u8; msglen];
            reader.read_exact(&mut msg_bytes).await?;
            let message = String::from_utf8_lossy(&msg_bytes).into_owned();
            Ok(Message::CheckParametersResponse { method, valid, message })
        }
        PROXY_CONNECTIONS_REQUEST_ID => Ok(Message::ProxyConnectionsRequest),
        BACKEND_STATUS_RESPONSE_ID => {
            let running = read_u8_async(reader).await? == 1;
            let status = StatusCode::from_byte(read_u8_async(reader).await?);
            let msglen = read_u16_async(reader).await? as usize;
            let mut msg_bytes = vec![0u8; msglen];
            reader.read_exact(&mut msg_bytes).await?;
            let message = String::from_utf8_lossy(&msg_bytes).into_owned();
            Ok(Message::BackendStatusResponse { running, status, message })
        }
        BACKEND_STATUS_REQUEST_ID => Ok(Message::BackendStatusRequest),
        PROXY_STATUS_REQUEST_ID => Ok(Message::ProxyStatusRequest(read_tuple(reader).await?)),
        PROXY_STATUS_RESPONSE_ID => {
            let tuple = read_tuple(reader).await?;
            let active = read_u8_async(reader).await? == 1;
            Ok(Message::ProxyStatusResponse { tuple, active })
        }
        PROXY_INSTANCE_RESPONSE_ID => {
            let mut proxies = Vec::new();
            loop {
                match read_instance(reader).await? {
                    None => break,
                    Some(inst) => {
                        proxies.push(inst);
                        match read_list_delimiter(reader).await? {
                            ListDelimiter::Continue => continue,
                            ListDelimiter::Stop => break,
                        }
                    }
                }
            }
            Ok(Message::ProxyInstanceResponse { proxies })
        }
        PROXY_INSTANCE_REQUEST_ID => Ok(Message::ProxyInstanceRequest),
        other => Err(HermesError::InvalidTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{Ipv4Addr, Ipv6Addr};

    async fn round_trip(msg: Message) {
        let bytes = encode(&msg);
        assert!(bytes[0] < crate::wire::types::DATA_FAMILY_START);
        let mut cursor = Cursor::new(&bytes[1..]);
        let decoded = decode(bytes[0], &mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn start_round_trips() {
        round_trip(Message::Start { args: b"Hello from automated testing".to_vec() }).await;
        round_trip(Message::Start { args: vec![] }).await;
    }

    #[tokio::test]
    async fn add_proxy_round_trips_both_ip_versions_and_protocols() {
        round_trip(Message::AddProxy(ProxyTuple {
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 139)),
            source_port: 19132,
            dest_port: 19132,
            protocol: Protocol::Tcp,
        }))
        .await;
        round_trip(Message::AddProxy(ProxyTuple {
            ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            source_port: 25565,
            dest_port: 25565,
            protocol: Protocol::Udp,
        }))
        .await;
    }

    #[tokio::test]
    async fn proxy_connections_response_round_trips_and_preserves_order() {
        let connections = vec![
            ProxyClientConnection {
                server_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 19132,
                dest_port: 19132,
                client_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                client_port: 12321,
            },
            ProxyClientConnection {
                server_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 19132,
                dest_port: 19132,
                client_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 168)),
                client_port: 23457,
            },
            ProxyClientConnection {
                server_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 19132,
                dest_port: 19132,
                client_ip: IpAddr::V4(Ipv4Addr::new(68, 42, 203, 47)),
                client_port: 38721,
            },
        ];
        round_trip(Message::ProxyConnectionsResponse { connections: connections.clone() }).await;
        round_trip(Message::ProxyConnectionsResponse { connections: vec![] }).await;
    }

    #[tokio::test]
    async fn empty_list_is_tag_then_terminator_only() {
        let bytes = encode(&Message::ProxyInstanceResponse { proxies: vec![] });
        assert_eq!(bytes, vec![PROXY_INSTANCE_RESPONSE_ID, LIST_TERMINATOR]);
    }

    #[tokio::test]
    async fn list_encoding_has_no_trailing_separator_before_terminator() {
        // elem \r elem \n, not elem \r elem \r \n — the last element's
        // delimiter slot is the terminator itself, never a separate byte.
        let ids = vec![
            ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 1,
                dest_port: 2,
                protocol: Protocol::Tcp,
            },
            ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 3,
                dest_port: 4,
                protocol: Protocol::Udp,
            },
        ];
        let bytes = encode(&Message::ProxyInstanceResponse { proxies: ids });
        let mut separators = 0;
        for &b in &bytes[1..bytes.len() - 1] {
            if b == LIST_SEPARATOR {
                separators += 1;
            }
        }
        assert_eq!(separators, 1, "two elements need exactly one separator between them");
        assert_eq!(*bytes.last().unwrap(), LIST_TERMINATOR);
        assert_ne!(bytes[bytes.len() - 2], LIST_SEPARATOR, "no separator immediately before the terminator");
    }

    #[tokio::test]
    async fn invalid_delimiter_truncates_list_instead_of_discarding_it() {
        let mut bytes = vec![PROXY_INSTANCE_RESPONSE_ID];
        encode_instance(
            &mut bytes,
            &ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 1,
                dest_port: 2,
                protocol: Protocol::Tcp,
            },
        );
        bytes.push(0xFF); // malformed delimiter: neither '\r' nor '\n'
        let mut cursor = Cursor::new(&bytes[1..]);
        let decoded = decode(bytes[0], &mut cursor).await.unwrap();
        match decoded {
            Message::ProxyInstanceResponse { proxies } => assert_eq!(proxies.len(), 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn proxy_instance_response_round_trips() {
        let proxies = vec![
            ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 168)),
                source_port: 25565,
                dest_port: 25565,
                protocol: Protocol::Tcp,
            },
            ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                source_port: 19132,
                dest_port: 19132,
                protocol: Protocol::Udp,
            },
            ProxyInstance {
                ip: IpAddr::V4(Ipv4Addr::new(68, 42, 203, 47)),
                source_port: 22,
                dest_port: 2222,
                protocol: Protocol::Tcp,
            },
        ];
        round_trip(Message::ProxyInstanceResponse { proxies }).await;
    }

    #[tokio::test]
    async fn check_parameters_response_round_trips_with_and_without_message() {
        round_trip(Message::CheckParametersResponse {
            method: CheckMethod::Client,
            valid: true,
            message: "Hello from automated testing".to_string(),
        })
        .await;
        round_trip(Message::CheckParametersResponse {
            method: CheckMethod::Server,
            valid: false,
            message: String::new(),
        })
        .await;
        let bytes = encode(&Message::CheckParametersResponse {
            method: CheckMethod::Client,
            valid: true,
            message: "Hello from automated testing".to_string(),
        });
        assert_eq!(bytes[1], CHECK_CLIENT_PARAMETERS_ID);
    }

    #[tokio::test]
    async fn backend_status_response_round_trips() {
        round_trip(Message::BackendStatusResponse {
            running: true,
            status: StatusCode::Success,
            message: String::new(),
        })
        .await;
        round_trip(Message::BackendStatusResponse {
            running: false,
            status: StatusCode::Failure,
            message: "failed to dial TCP".to_string(),
        })
        .await;
    }

    #[tokio::test]
    async fn tag_partition_is_below_100_for_every_common_message() {
        let msgs = vec![
            Message::Stop,
            Message::BackendStatusRequest,
            Message::ProxyConnectionsRequest,
            Message::ProxyInstanceRequest,
        ];
        for m in msgs {
            assert!(encode(&m)[0] < crate::wire::types::DATA_FAMILY_START);
        }
    }

    #[tokio::test]
    async fn empty_list_decodes_with_no_error() {
        let bytes = vec![PROXY_CONNECTIONS_RESPONSE_ID, LIST_TERMINATOR];
        let mut cursor = Cursor::new(&bytes[1..]);
        let decoded = decode(bytes[0], &mut cursor).await.unwrap();
        assert_eq!(decoded, Message::ProxyConnectionsResponse { connections: vec![] });
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let mut cursor = Cursor::new(&[][..]);
        let err = decode(255, &mut cursor).await.unwrap_err();
        assert!(matches!(err, HermesError::InvalidTag(255)));
    }
}
