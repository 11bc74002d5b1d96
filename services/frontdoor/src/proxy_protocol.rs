//! PROXY protocol v2 header used between the multiplexer and its backends.
//!
//! Backends only ever see loopback connections from the multiplexer, so the
//! multiplexer prepends a binary PROXY v2 header carrying the real client
//! address. Backends parse it before applying the whitelist.
//!
//! Wire format (HAProxy PROXY protocol v2):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (big endian)
//! - variable: source address, destination address, source port, destination port

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// PROXY protocol v2 signature (12 bytes).
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Fixed part of the header: signature + version/command + family + length.
pub const FIXED_LEN: usize = 16;

/// Version 2, PROXY command.
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2, LOCAL command (connection made by the proxy itself).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;

const IPV4_ADDR_LEN: usize = 12;
const IPV6_ADDR_LEN: usize = 36;

/// Client and listener addresses carried by a PROXY v2 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address.
    pub source: SocketAddr,
    /// Public address the client connected to.
    pub destination: SocketAddr,
}

/// Result of parsing a (possibly partial) buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full header was parsed; `len` bytes were consumed.
    Complete {
        header: Option<ProxyHeader>,
        len: usize,
    },
    /// The buffer is a valid prefix of a header; read more.
    Incomplete,
    /// The buffer does not start with a PROXY v2 header.
    Invalid,
}

impl ProxyHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Encode the header.
    ///
    /// Mixed address families are folded to IPv4 when the IPv6 side is
    /// v4-mapped, and to IPv6 otherwise.
    pub fn encode(&self) -> Vec<u8> {
        let src_ip = self.source.ip().to_canonical();
        let dst_ip = self.destination.ip().to_canonical();

        let mut buf = Vec::with_capacity(FIXED_LEN + IPV6_ADDR_LEN);
        buf.extend_from_slice(&SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);

        match (src_ip, dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(AF_INET_STREAM);
                buf.extend_from_slice(&(IPV4_ADDR_LEN as u16).to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            (src, dst) => {
                buf.push(AF_INET6_STREAM);
                buf.extend_from_slice(&(IPV6_ADDR_LEN as u16).to_be_bytes());
                buf.extend_from_slice(&to_v6(src).octets());
                buf.extend_from_slice(&to_v6(dst).octets());
            }
        }

        buf.extend_from_slice(&self.source.port().to_be_bytes());
        buf.extend_from_slice(&self.destination.port().to_be_bytes());
        buf
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Parse a PROXY v2 header from the start of `data`.
///
/// A LOCAL command, or an address family other than TCP over IPv4/IPv6,
/// yields `Complete { header: None, .. }` so the caller can skip the header
/// and fall back to the socket peer address.
pub fn parse(data: &[u8]) -> ParseOutcome {
    let sig_len = data.len().min(SIGNATURE.len());
    if data[..sig_len] != SIGNATURE[..sig_len] {
        return ParseOutcome::Invalid;
    }
    if data.len() < FIXED_LEN {
        return ParseOutcome::Incomplete;
    }

    let version_command = data[12];
    let family = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;

    if version_command != VERSION_COMMAND_PROXY && version_command != VERSION_COMMAND_LOCAL {
        return ParseOutcome::Invalid;
    }

    let total = FIXED_LEN + addr_len;
    if data.len() < total {
        return ParseOutcome::Incomplete;
    }

    if version_command == VERSION_COMMAND_LOCAL {
        return ParseOutcome::Complete {
            header: None,
            len: total,
        };
    }

    let addrs = &data[FIXED_LEN..total];
    let header = match family {
        AF_INET_STREAM if addr_len >= IPV4_ADDR_LEN => {
            let src = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            Some(ProxyHeader::new(
                SocketAddr::new(IpAddr::V4(src), src_port),
                SocketAddr::new(IpAddr::V4(dst), dst_port),
            ))
        }
        AF_INET6_STREAM if addr_len >= IPV6_ADDR_LEN => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addrs[0..16]);
            dst.copy_from_slice(&addrs[16..32]);
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            Some(ProxyHeader::new(
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
            ))
        }
        _ => None,
    };

    ParseOutcome::Complete { header, len: total }
}
