//! Auxiliary codecs: the UDP address record and the hex dump.
//!
//! A UDP address record is at most 19 bytes: a one-byte family tag
//! (1 = IPv4, 2 = IPv6), the port in network byte order, then the raw
//! address octets (4 or 16). The reactor appends one to every delivered
//! datagram and accepts one on every outgoing datagram.

use byteorder::{BigEndian, ByteOrder};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const UDP_ADDRESS_SIZE: usize = 19;
pub const UDP_V4_RECORD: usize = 1 + 2 + 4;
pub const UDP_V6_RECORD: usize = 1 + 2 + 16;

pub const FAMILY_V4: u8 = 1;
pub const FAMILY_V6: u8 = 2;

/// Encode `addr` into `out`, returning the number of bytes written.
pub fn encode_udp_address(addr: &SocketAddr, out: &mut [u8; UDP_ADDRESS_SIZE]) -> usize {
    BigEndian::write_u16(&mut out[1..3], addr.port());
    match addr.ip() {
        IpAddr::V4(ip) => {
            out[0] = FAMILY_V4;
            out[3..7].copy_from_slice(&ip.octets());
            UDP_V4_RECORD
        }
        IpAddr::V6(ip) => {
            out[0] = FAMILY_V6;
            out[3..19].copy_from_slice(&ip.octets());
            UDP_V6_RECORD
        }
    }
}

/// Decode a record from the front of `rec`. Returns the address and the
/// record length consumed, or `None` for an unknown tag or a short buffer.
pub fn decode_udp_address(rec: &[u8]) -> Option<(SocketAddr, usize)> {
    match rec.first()? {
        &FAMILY_V4 if rec.len() >= UDP_V4_RECORD => {
            let port = BigEndian::read_u16(&rec[1..3]);
            let mut oct = [0u8; 4];
            oct.copy_from_slice(&rec[3..7]);
            Some((SocketAddr::new(IpAddr::V4(Ipv4Addr::from(oct)), port), UDP_V4_RECORD))
        }
        &FAMILY_V6 if rec.len() >= UDP_V6_RECORD => {
            let port = BigEndian::read_u16(&rec[1..3]);
            let mut oct = [0u8; 16];
            oct.copy_from_slice(&rec[3..19]);
            Some((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(oct)), port), UDP_V6_RECORD))
        }
        _ => None,
    }
}

/// Split a delivered UDP buffer into its payload (the first `payload_len`
/// bytes) and the peer address recorded after it.
pub fn split_udp_payload(data: &[u8], payload_len: usize) -> Option<(&[u8], SocketAddr)> {
    if payload_len > data.len() {
        return None;
    }
    let (payload, rec) = data.split_at(payload_len);
    let (addr, _) = decode_udp_address(rec)?;
    Some((payload, addr))
}

const LINE_SIZE: usize = 16;

fn dump_line(line: usize, data: &[u8], out: &mut String) {
    let _ = write!(out, "{:08x}: ", line * LINE_SIZE);
    for i in 0..LINE_SIZE {
        if i % 8 == 0 {
            out.push(' ');
        }
        if i >= data.len() {
            out.push_str("  ");
        } else {
            let _ = write!(out, "{:02x}", data[i]);
        }
        if i % 2 != 0 {
            out.push(' ');
        }
    }
    out.push_str("  ");
    for i in 0..LINE_SIZE {
        if i >= data.len() {
            out.push(' ');
        } else {
            let c = data[i];
            out.push(if (32..127).contains(&c) { c as char } else { '.' });
        }
    }
    out.push('\n');
    if line % LINE_SIZE == LINE_SIZE - 1 {
        out.push('\n');
    }
}

/// Render `data` as a classic offset / hex / ASCII dump.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    let full = data.len() / LINE_SIZE;
    for line in 0..full {
        dump_line(line, &data[line * LINE_SIZE..(line + 1) * LINE_SIZE], &mut out);
    }
    if data.len() > full * LINE_SIZE {
        dump_line(full, &data[full * LINE_SIZE..], &mut out);
    }
    out
}
