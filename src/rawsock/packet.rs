//! IPv4 and TCP header construction and parsing.
//!
//! The kernel never sees a socket for the impersonated flow, so every
//! header byte is authored here, checksums included.

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::error::{Error, Result};

/// IPv4 header length; options are never emitted.
pub const IPV4_HEADER_LEN: usize = 20;

/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Advertised receive window on every segment.
pub const TCP_WINDOW: u16 = 65535;

const IPV4_DONT_FRAGMENT: u16 = 0x4000;
const IPV4_TTL: u8 = 64;
const IPPROTO_TCP: u8 = 6;

// Fixed identification field; the tunnel never fragments.
const IPV4_IDENT: u16 = 12345;

/// TCP flag bits.
pub mod tcp_flags {
    /// No more data from sender
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers
    pub const SYN: u8 = 0x02;
    /// Reset the connection
    pub const RST: u8 = 0x04;
    /// Push function
    pub const PSH: u8 = 0x08;
    /// Acknowledgment field significant
    pub const ACK: u8 = 0x10;
    /// Urgent pointer significant
    pub const URG: u8 = 0x20;
}

/// Internet checksum: 16-bit one's complement sum with end-around carry.
///
/// An odd trailing byte is padded high.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(*odd) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Build a 20-byte IPv4 header with DF set and both checksums filled.
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    payload_len: usize,
) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];

    header[0] = 0x45; // version 4, IHL 5
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&IPV4_IDENT.to_be_bytes());
    header[6..8].copy_from_slice(&IPV4_DONT_FRAGMENT.to_be_bytes());
    header[8] = IPV4_TTL;
    header[9] = IPPROTO_TCP;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let sum = checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());

    header
}

/// Build a TCP header; options are padded to a 4-byte boundary and the
/// checksum field is left zero for [`tcp_checksum`] to fill.
pub fn build_tcp_header(
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
) -> Vec<u8> {
    let padded_opts = options.len().div_ceil(4) * 4;
    let header_len = TCP_HEADER_LEN + padded_opts;
    let mut header = vec![0u8; header_len];

    header[0..2].copy_from_slice(&sport.to_be_bytes());
    header[2..4].copy_from_slice(&dport.to_be_bytes());
    header[4..8].copy_from_slice(&seq.to_be_bytes());
    header[8..12].copy_from_slice(&ack.to_be_bytes());
    header[12] = ((header_len / 4) as u8) << 4;
    header[13] = flags;
    header[14..16].copy_from_slice(&TCP_WINDOW.to_be_bytes());
    // checksum [16..18] and urgent pointer [18..20] stay zero
    header[TCP_HEADER_LEN..TCP_HEADER_LEN + options.len()].copy_from_slice(options);

    header
}

/// TCP checksum over the IPv4 pseudo-header plus the segment.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut data = Vec::with_capacity(12 + segment.len());
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
    data.push(0);
    data.push(IPPROTO_TCP);
    data.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    data.extend_from_slice(segment);

    checksum(&data)
}

/// Build a complete IPv4+TCP packet with both checksums filled.
#[allow(clippy::too_many_arguments)]
pub fn build_packet(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = build_tcp_header(sport, dport, seq, ack, flags, options);

    let mut segment = Vec::with_capacity(tcp.len() + payload.len());
    segment.extend_from_slice(&tcp);
    segment.extend_from_slice(payload);
    let sum = tcp_checksum(src, dst, &segment);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());

    let ip = build_ipv4_header(src, dst, tcp.len() + payload.len());

    let mut packet = Vec::with_capacity(ip.len() + tcp.len() + payload.len());
    packet.extend_from_slice(&ip);
    packet.extend_from_slice(&tcp);
    packet.extend_from_slice(payload);
    packet
}

/// Verify the checksum of a received IPv4 header.
pub fn verify_ipv4_checksum(header: &[u8]) -> bool {
    header.len() >= IPV4_HEADER_LEN && checksum(&header[..IPV4_HEADER_LEN]) == 0
}

/// Verify the pseudo-header checksum of a received TCP segment.
pub fn verify_tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    tcp_checksum(src, dst, segment) == 0
}

/// A parsed inbound TCP datagram.
#[derive(Debug, Clone)]
pub struct TcpDatagram {
    /// Source address
    pub src: Ipv4Addr,
    /// Source port
    pub sport: u16,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Destination port
    pub dport: u16,
    /// Raw sequence number
    pub seq: u32,
    /// Raw acknowledgment number
    pub ack: u32,
    /// TCP flag bits
    pub flags: u8,
    /// Segment payload
    pub payload: Bytes,
}

/// Parse a raw IPv4 frame into a [`TcpDatagram`].
///
/// Non-TCP packets and truncated frames surface as [`Error::Parse`] so the
/// caller can discard and count them.
pub fn parse_packet(buf: &[u8]) -> Result<TcpDatagram> {
    if buf.len() < IPV4_HEADER_LEN + TCP_HEADER_LEN {
        return Err(Error::parse(format!("frame too small: {} bytes", buf.len())));
    }

    let ihl = usize::from(buf[0] & 0x0F) * 4;
    if ihl < IPV4_HEADER_LEN || ihl > buf.len() {
        return Err(Error::parse(format!("invalid IHL: {}", ihl)));
    }
    if buf[9] != IPPROTO_TCP {
        return Err(Error::parse(format!("not TCP: protocol {}", buf[9])));
    }

    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

    let tcp = &buf[ihl..];
    if tcp.len() < TCP_HEADER_LEN {
        return Err(Error::parse("frame too small for TCP header"));
    }

    let data_offset = usize::from(tcp[12] >> 4) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > tcp.len() {
        return Err(Error::parse(format!("invalid TCP data offset: {}", data_offset)));
    }

    Ok(TcpDatagram {
        src,
        sport: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst,
        dport: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13],
        payload: Bytes::copy_from_slice(&tcp[data_offset..]),
    })
}
