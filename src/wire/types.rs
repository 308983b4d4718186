//! hermes-sshappbackend/src/wire/types.rs
//! Shared on-wire value types for both message families (§4.A/§4.B).

use crate::error::{HermesError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// List-framing separator and terminator bytes (§4.A "List framing").
pub const LIST_SEPARATOR: u8 = 0x0D;
pub const LIST_TERMINATOR: u8 = 0x0A;

/// Tag-space partition: tags below this belong to the common codec (A),
/// tags at or above it belong to the data codec (B). Load-bearing for the
/// framing demultiplexer (§4.C).
pub const DATA_FAMILY_START: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn to_byte(self) -> u8 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            _ => Err(HermesError::InvalidProtocol(b)),
        }
    }
}

/// `{version: u8 in {4,6}, bytes: [u8; 4 or 16]}` per §4.A.
///
/// The version byte doubles as the list-framing sentinel position (§4.A):
/// encoders must never emit a version other than 4 or 6, or the decoder's
/// `0x0A` sentinel check for list termination becomes ambiguous (§9.7).
pub fn encode_ip(addr: IpAddr, out: &mut Vec<u8>) {
    match addr {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

/// Returns `Ok(None)` when the version byte is the list-termination
/// sentinel (`0x0A`) rather than a real version — callers doing list
/// decoding use this to detect end-of-list without a separate peek.
pub fn decode_ip(buf: &[u8], pos: &mut usize, allow_sentinel: bool) -> Result<Option<IpAddr>> {
    let ver = read_u8(buf, pos)?;
    if allow_sentinel && ver == LIST_TERMINATOR {
        return Ok(None);
    }
    match ver {
        4 => {
            let bytes = read_exact::<4>(buf, pos)?;
            Ok(Some(IpAddr::V4(Ipv4Addr::from(bytes))))
        }
        6 => {
            let bytes = read_exact::<16>(buf, pos)?;
            Ok(Some(IpAddr::V6(Ipv6Addr::from(bytes))))
        }
        other => Err(HermesError::InvalidIpVersion(other)),
    }
}

pub fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    if *pos >= buf.len() {
        return Err(HermesError::Truncated {
            expected: *pos + 1,
            got: buf.len(),
        });
    }
    let b = buf[*pos];
    *pos += 1;
    Ok(b)
}

pub fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    if *pos + 2 > buf.len() {
        return Err(HermesError::Truncated {
            expected: *pos + 2,
            got: buf.len(),
        });
    }
    let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

pub fn read_exact<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    if *pos + N > buf.len() {
        return Err(HermesError::Truncated {
            expected: *pos + N,
            got: buf.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*pos..*pos + N]);
    *pos += N;
    Ok(out)
}

pub fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *pos + len > buf.len() {
        return Err(HermesError::Truncated {
            expected: *pos + len,
            got: buf.len(),
        });
    }
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Turns a short-read `UnexpectedEof` into the structured `Truncated` kind
/// (§7) rather than letting it surface as an opaque I/O error.
fn truncated_or_io(err: std::io::Error, expected: usize) -> HermesError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        HermesError::Truncated { expected, got: 0 }
    } else {
        HermesError::Io(err)
    }
}

pub async fn read_u8_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    reader.read_u8().await.map_err(|e| truncated_or_io(e, 1))
}

pub async fn read_u16_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
    reader.read_u16().await.map_err(|e| truncated_or_io(e, 2))
}

pub async fn read_exact_async<const N: usize, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| truncated_or_io(e, N))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_round_trip_v4() {
        let mut buf = Vec::new();
        encode_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 139)), &mut buf);
        let mut pos = 0;
        let decoded = decode_ip(&buf, &mut pos, false).unwrap().unwrap();
        assert_eq!(decoded, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 139)));
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn ip_round_trip_v6() {
        let addr = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let mut buf = Vec::new();
        encode_ip(addr, &mut buf);
        let mut pos = 0;
        assert_eq!(decode_ip(&buf, &mut pos, false).unwrap().unwrap(), addr);
    }

    #[test]
    fn sentinel_terminates_list_position() {
        let buf = [LIST_TERMINATOR];
        let mut pos = 0;
        assert!(decode_ip(&buf, &mut pos, true).unwrap().is_none());
    }

    #[test]
    fn invalid_version_without_sentinel_allowance_errors() {
        let buf = [LIST_TERMINATOR];
        let mut pos = 0;
        assert!(decode_ip(&buf, &mut pos, false).is_err());
    }
}
