//! hermes-sshappbackend/src/wire/framing.rs
//! The demultiplexer that sits in front of codecs A and B (§4.C).
//!
//! A single control socket carries both message families. This module reads
//! the one-byte tag, routes to [`common`] or [`data`] by the tag-space
//! partition, and for the two data-frame messages (TCPProxyData,
//! UDPProxyData) also reads the raw payload that follows the header.

use crate::error::Result;
use crate::wire::types::DATA_FAMILY_START;
use crate::wire::{common, data};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Either family of message, tagged so callers can match without caring
/// which codec produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Common(common::Message),
    Data(data::Message),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Common(m) => m.tag(),
            Frame::Data(m) => m.tag(),
        }
    }
}

/// Reads one full frame off `reader`: the tag byte, the codec-specific
/// header, and — for TCPProxyData/UDPProxyData — the trailing payload.
/// Returns the payload alongside the header since it isn't part of either
/// `Message` enum (§4.B, §4.C).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Frame, Vec<u8>)> {
    let mut tag_buf = [0u8; 1];
    reader.read_exact(&mut tag_buf).await?;
    let tag = tag_buf[0];

    if tag < DATA_FAMILY_START {
        let msg = common::decode(tag, reader).await?;
        return Ok((Frame::Common(msg), Vec::new()));
    }

    let msg = data::decode(tag, reader).await?;
    let payload = match &msg {
        data::Message::TcpProxyData { data_length, .. }
        | data::Message::UdpProxyData { data_length, .. } => {
            let mut buf = vec![0u8; *data_length as usize];
            reader.read_exact(&mut buf).await?;
            buf
        }
        _ => Vec::new(),
    };
    Ok((Frame::Data(msg), payload))
}

/// Writes a frame, appending `payload` verbatim after the header for the two
/// data-frame message kinds. `payload` is ignored for every other message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    payload: &[u8],
) -> Result<()> {
    match frame {
        Frame::Common(msg) => common::write(writer, msg).await,
        Frame::Data(msg) => {
            data::write(writer, msg).await?;
            if data::is_data_frame(msg.tag()) {
                use tokio::io::AsyncWriteExt;
                writer.write_all(payload).await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn routes_common_tag_below_partition() {
        let bytes = common::encode(&common::Message::Stop);
        let mut cursor = Cursor::new(bytes);
        let (frame, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, Frame::Common(common::Message::Stop));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn routes_data_tag_at_or_above_partition() {
        let bytes = data::encode(&data::Message::ProxyStatusRequest { proxy_id: 4 });
        let mut cursor = Cursor::new(bytes);
        let (frame, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, Frame::Data(data::Message::ProxyStatusRequest { proxy_id: 4 }));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn tcp_proxy_data_frame_reads_trailing_payload() {
        let header = data::encode(&data::Message::TcpProxyData {
            proxy_id: 0,
            connection_id: 0,
            data_length: 4,
        });
        let mut bytes = header;
        bytes.extend_from_slice(b"ping");
        let mut cursor = Cursor::new(bytes);
        let (frame, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(
            frame,
            Frame::Data(data::Message::TcpProxyData { proxy_id: 0, connection_id: 0, data_length: 4 })
        );
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn udp_proxy_data_frame_reads_trailing_payload() {
        let header = data::encode(&data::Message::UdpProxyData {
            proxy_id: 2,
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 4000,
            data_length: 3,
        });
        let mut bytes = header;
        bytes.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(bytes);
        let (_, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"abc");
    }

    #[tokio::test]
    async fn write_frame_round_trips_through_read_frame() {
        let msg = data::Message::TcpProxyData { proxy_id: 1, connection_id: 2, data_length: 5 };
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Data(msg.clone()), b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let (frame, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, Frame::Data(msg));
        assert_eq!(payload, b"hello");
    }
}
