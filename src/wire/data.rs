//! hermes-sshappbackend/src/wire/data.rs
//! Codec B: the 14 data-plane messages used by the SSH remote agent
//! (§4.B), tags 100–113.
//!
//! Tags 108 (`TCPProxyData`) and 109 (`UDPProxyData`) are data frames: this
//! codec returns only the fixed header. The framing demultiplexer (§4.C)
//! reads `data_length` additional raw bytes for those two afterward.

use crate::error::{HermesError, Result};
use crate::wire::types::{Protocol, read_exact_async, read_u16_async, read_u8_async, write_u16};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const PROXY_STATUS_REQUEST_ID: u8 = 100;
pub const PROXY_STATUS_RESPONSE_ID: u8 = 101;
pub const REMOVE_PROXY_ID: u8 = 102;
pub const PROXY_INSTANCE_RESPONSE_ID: u8 = 103;
pub const PROXY_CONNECTIONS_REQUEST_ID: u8 = 104;
pub const PROXY_CONNECTIONS_RESPONSE_ID: u8 = 105;
pub const TCP_CONNECTION_OPENED_ID: u8 = 106;
pub const TCP_CONNECTION_CLOSED_ID: u8 = 107;
pub const TCP_PROXY_DATA_ID: u8 = 108;
pub const UDP_PROXY_DATA_ID: u8 = 109;
pub const PROXY_INFORMATION_REQUEST_ID: u8 = 110;
pub const PROXY_INFORMATION_RESPONSE_ID: u8 = 111;
pub const PROXY_CONNECTION_INFORMATION_REQUEST_ID: u8 = 112;
pub const PROXY_CONNECTION_INFORMATION_RESPONSE_ID: u8 = 113;

/// True for any tag whose header is followed on the wire by `data_length`
/// raw payload bytes not part of the decoded struct (§4.B, §4.C).
pub fn is_data_frame(tag: u8) -> bool {
    tag == TCP_PROXY_DATA_ID || tag == UDP_PROXY_DATA_ID
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ProxyStatusRequest { proxy_id: u16 },
    ProxyStatusResponse { proxy_id: u16, active: bool },
    RemoveProxy { proxy_id: u16 },
    ProxyInstanceResponse { proxy_ids: Vec<u16> },
    ProxyConnectionsRequest { proxy_id: u16 },
    ProxyConnectionsResponse { connection_ids: Vec<u16> },
    TcpConnectionOpened { proxy_id: u16, connection_id: u16 },
    TcpConnectionClosed { proxy_id: u16, connection_id: u16 },
    /// Header only; the payload of length `data_length` follows on the wire
    /// and is read separately by the framing demultiplexer.
    TcpProxyData { proxy_id: u16, connection_id: u16, data_length: u16 },
    UdpProxyData {
        proxy_id: u16,
        client_ip: IpAddr,
        client_port: u16,
        data_length: u16,
    },
    ProxyInformationRequest { proxy_id: u16 },
    ProxyInformationResponse { info: Option<ProxyInfo> },
    ProxyConnectionInformationRequest { proxy_id: u16, connection_id: u16 },
    ProxyConnectionInformationResponse { client: Option<(IpAddr, u16)> },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::ProxyStatusRequest { .. } => PROXY_STATUS_REQUEST_ID,
            Message::ProxyStatusResponse { .. } => PROXY_STATUS_RESPONSE_ID,
            Message::RemoveProxy { .. } => REMOVE_PROXY_ID,
            Message::ProxyInstanceResponse { .. } => PROXY_INSTANCE_RESPONSE_ID,
            Message::ProxyConnectionsRequest { .. } => PROXY_CONNECTIONS_REQUEST_ID,
            Message::ProxyConnectionsResponse { .. } => PROXY_CONNECTIONS_RESPONSE_ID,
            Message::TcpConnectionOpened { .. } => TCP_CONNECTION_OPENED_ID,
            Message::TcpConnectionClosed { .. } => TCP_CONNECTION_CLOSED_ID,
            Message::TcpProxyData { .. } => TCP_PROXY_DATA_ID,
            Message::UdpProxyData { .. } => UDP_PROXY_DATA_ID,
            Message::ProxyInformationRequest { .. } => PROXY_INFORMATION_REQUEST_ID,
            Message::ProxyInformationResponse { .. } => PROXY_INFORMATION_RESPONSE_ID,
            Message::ProxyConnectionInformationRequest { .. } => {
                PROXY_CONNECTION_INFORMATION_REQUEST_ID
            }
            Message::ProxyConnectionInformationResponse { .. } => {
                PROXY_CONNECTION_INFORMATION_RESPONSE_ID
            }
        }
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = vec![msg.tag()];
    match msg {
        Message::ProxyStatusRequest { proxy_id }
        | Message::RemoveProxy { proxy_id }
        | Message::ProxyConnectionsRequest { proxy_id }
        | Message::ProxyInformationRequest { proxy_id } => write_u16(&mut out, *proxy_id),
        Message::ProxyStatusResponse { proxy_id, active } => {
            write_u16(&mut out, *proxy_id);
            out.push(if *active { 1 } else { 0 });
        }
        Message::ProxyInstanceResponse { proxy_ids } => {
            write_u16(&mut out, proxy_ids.len() as u16);
            for id in proxy_ids {
                write_u16(&mut out, *id);
            }
        }
        Message::ProxyConnectionsResponse { connection_ids } => {
            write_u16(&mut out, connection_ids.len() as u16);
            for id in connection_ids {
                write_u16(&mut out, *id);
            }
        }
        Message::TcpConnectionOpened { proxy_id, connection_id }
        | Message::TcpConnectionClosed { proxy_id, connection_id } => {
            write_u16(&mut out, *proxy_id);
            write_u16(&mut out, *connection_id);
        }
        Message::TcpProxyData { proxy_id, connection_id, data_length } => {
            write_u16(&mut out, *proxy_id);
            write_u16(&mut out, *connection_id);
            write_u16(&mut out, *data_length);
        }
        Message::UdpProxyData { proxy_id, client_ip, client_port, data_length } => {
            write_u16(&mut out, *proxy_id);
            crate::wire::types::encode_ip(*client_ip, &mut out);
            write_u16(&mut out, *client_port);
            write_u16(&mut out, *data_length);
        }
        Message::ProxyInformationResponse { info } => match info {
            None => out.push(0),
            Some(info) => {
                out.push(1);
                crate::wire::types::encode_ip(info.ip, &mut out);
                write_u16(&mut out, info.source_port);
                write_u16(&mut out, info.dest_port);
                out.push(info.protocol.to_byte());
            }
        },
        Message::ProxyConnectionInformationRequest { proxy_id, connection_id } => {
            write_u16(&mut out, *proxy_id);
            write_u16(&mut out, *connection_id);
        }
        Message::ProxyConnectionInformationResponse { client } => match client {
            None => out.push(0),
            Some((ip, port)) => {
                out.push(1);
                crate::wire::types::encode_ip(*ip, &mut out);
                write_u16(&mut out, *port);
            }
        },
    }
    out
}

pub async fn write<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&encode(msg)).await?;
    Ok(())
}

async fn read_ip<R: AsyncRead + Unpin>(reader: &mut R) -> Result<IpAddr> {
    let ver = read_u8_async(reader).await?;
    match ver {
        4 => Ok(IpAddr::from(read_exact_async::<4, _>(reader).await?)),
        6 => Ok(IpAddr::from(read_exact_async::<16, _>(reader).await?)),
        other => Err(HermesError::InvalidIpVersion(other)),
    }
}

/// Decodes the fixed header for `tag`. For 108/109 the caller (the framing
/// demultiplexer) still owes a `data_length`-byte payload read afterward.
pub async fn decode<R: AsyncRead + Unpin>(tag: u8, reader: &mut R) -> Result<Message> {
    match tag {
        PROXY_STATUS_REQUEST_ID => Ok(Message::ProxyStatusRequest {
            proxy_id: read_u16_async(reader).await?,
        }),
        PROXY_STATUS_RESPONSE_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let active = read_u8_async(reader).await? == 1;
            Ok(Message::ProxyStatusResponse { proxy_id, active })
        }
        REMOVE_PROXY_ID => Ok(Message::RemoveProxy {
            proxy_id: read_u16_async(reader).await?,
        }),
        PROXY_INSTANCE_RESPONSE_ID => {
            let count = read_u16_async(reader).await?;
            let mut proxy_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                proxy_ids.push(read_u16_async(reader).await?);
            }
            Ok(Message::ProxyInstanceResponse { proxy_ids })
        }
        PROXY_CONNECTIONS_REQUEST_ID => Ok(Message::ProxyConnectionsRequest {
            proxy_id: read_u16_async(reader).await?,
        }),
        PROXY_CONNECTIONS_RESPONSE_ID => {
            let count = read_u16_async(reader).await?;
            let mut connection_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                connection_ids.push(read_u16_async(reader).await?);
            }
            Ok(Message::ProxyConnectionsResponse { connection_ids })
        }
        TCP_CONNECTION_OPENED_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let connection_id = read_u16_async(reader).await?;
            Ok(Message::TcpConnectionOpened { proxy_id, connection_id })
        }
        TCP_CONNECTION_CLOSED_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let connection_id = read_u16_async(reader).await?;
            Ok(Message::TcpConnectionClosed { proxy_id, connection_id })
        }
        TCP_PROXY_DATA_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let connection_id = read_u16_async(reader).await?;
            let data_length = read_u16_async(reader).await?;
            Ok(Message::TcpProxyData { proxy_id, connection_id, data_length })
        }
        UDP_PROXY_DATA_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let client_ip = read_ip(reader).await?;
            let client_port = read_u16_async(reader).await?;
            let data_length = read_u16_async(reader).await?;
            Ok(Message::UdpProxyData { proxy_id, client_ip, client_port, data_length })
        }
        PROXY_INFORMATION_REQUEST_ID => Ok(Message::ProxyInformationRequest {
            proxy_id: read_u16_async(reader).await?,
        }),
        PROXY_INFORMATION_RESPONSE_ID => {
            let exists = read_u8_async(reader).await?;
            if exists == 0 {
                return Ok(Message::ProxyInformationResponse { info: None });
            }
            let ip = read_ip(reader).await?;
            let source_port = read_u16_async(reader).await?;
            let dest_port = read_u16_async(reader).await?;
            let protocol = Protocol::from_byte(read_u8_async(reader).await?)?;
            Ok(Message::ProxyInformationResponse {
                info: Some(ProxyInfo { ip, source_port, dest_port, protocol }),
            })
        }
        PROXY_CONNECTION_INFORMATION_REQUEST_ID => {
            let proxy_id = read_u16_async(reader).await?;
            let connection_id = read_u16_async(reader).await?;
            Ok(Message::ProxyConnectionInformationRequest { proxy_id, connection_id })
        }
        PROXY_CONNECTION_INFORMATION_RESPONSE_ID => {
            let exists = read_u8_async(reader).await?;
            if exists == 0 {
                return Ok(Message::ProxyConnectionInformationResponse { client: None });
            }
            let ip = read_ip(reader).await?;
            let port = read_u16_async(reader).await?;
            Ok(Message::ProxyConnectionInformationResponse { client: Some((ip, port)) })
        }
        other => Err(HermesError::InvalidTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    async fn round_trip(msg: Message) {
        let bytes = encode(&msg);
        assert!(bytes[0] >= crate::wire::types::DATA_FAMILY_START);
        let mut cursor = Cursor::new(&bytes[1..]);
        let decoded = decode(bytes[0], &mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn status_messages_round_trip() {
        round_trip(Message::ProxyStatusRequest { proxy_id: 7 }).await;
        round_trip(Message::ProxyStatusResponse { proxy_id: 7, active: true }).await;
        round_trip(Message::ProxyStatusResponse { proxy_id: 7, active: false }).await;
    }

    #[tokio::test]
    async fn id_list_messages_round_trip_all_lengths() {
        for n in 0..4usize {
            let ids: Vec<u16> = (0..n as u16).collect();
            round_trip(Message::ProxyInstanceResponse { proxy_ids: ids.clone() }).await;
            round_trip(Message::ProxyConnectionsResponse { connection_ids: ids }).await;
        }
    }

    #[tokio::test]
    async fn tcp_notifications_round_trip() {
        round_trip(Message::TcpConnectionOpened { proxy_id: 0, connection_id: 0 }).await;
        round_trip(Message::TcpConnectionClosed { proxy_id: 3, connection_id: 9 }).await;
    }

    #[tokio::test]
    async fn tcp_proxy_data_header_round_trips() {
        round_trip(Message::TcpProxyData { proxy_id: 0, connection_id: 0, data_length: 4 }).await;
    }

    #[tokio::test]
    async fn udp_proxy_data_round_trips_both_ip_versions() {
        round_trip(Message::UdpProxyData {
            proxy_id: 1,
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            client_port: 53,
            data_length: 12,
        })
        .await;
    }

    #[tokio::test]
    async fn proxy_information_response_round_trips_present_and_absent() {
        round_trip(Message::ProxyInformationResponse { info: None }).await;
        round_trip(Message::ProxyInformationResponse {
            info: Some(ProxyInfo {
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 168)),
                source_port: 25565,
                dest_port: 25565,
                protocol: Protocol::Tcp,
            }),
        })
        .await;
    }

    #[tokio::test]
    async fn proxy_connection_information_response_round_trips() {
        round_trip(Message::ProxyConnectionInformationResponse { client: None }).await;
        round_trip(Message::ProxyConnectionInformationResponse {
            client: Some((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4000)),
        })
        .await;
    }

    #[test]
    fn data_frames_are_tagged_correctly() {
        assert!(is_data_frame(TCP_PROXY_DATA_ID));
        assert!(is_data_frame(UDP_PROXY_DATA_ID));
        assert!(!is_data_frame(TCP_CONNECTION_OPENED_ID));
    }

    #[test]
    fn tag_partition_is_at_or_above_100_for_every_data_message() {
        let msgs = vec![
            Message::ProxyConnectionsRequest { proxy_id: 1 },
            Message::ProxyInformationRequest { proxy_id: 1 },
        ];
        for m in msgs {
            assert!(encode(&m)[0] >= crate::wire::types::DATA_FAMILY_START);
        }
    }
}
