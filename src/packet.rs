// Copyright (c) 2025 The RANMARK Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! IPv4, TCP and UDP header parsing and rewriting.
//!
//! Header structs are plain value types holding host-order fields; the
//! wire-to-host conversion happens on `parse` and the host-to-wire
//! conversion on `write_to`. Mutating a header in a packet buffer is
//! always parse, mutate, recompute checksum, write back, in that order.

use std::net::Ipv4Addr;

use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::error::Error;
use crate::FiveTuple;
use crate::Result;

/// IPv4 header length. IP options are not supported, so `ihl` is fixed.
pub const IPV4_HDR_LEN: usize = 20;

/// TCP header length, excluding options.
pub const TCP_HDR_LEN: usize = 20;

/// UDP header length.
pub const UDP_HDR_LEN: usize = 8;

/// IPv4 protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// IPv4 protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// TCP option kinds recognised by the ACK-path rewriter.
pub(crate) const TCP_OPT_EOL: u8 = 0;
pub(crate) const TCP_OPT_NOP: u8 = 1;

/// Experimental AccECN option carrying ECN0/CE/ECN1 byte counters.
pub(crate) const TCP_OPT_ACCECN0: u8 = 172;

/// Experimental AccECN option carrying ECN1/CE/ECN0 byte counters.
pub(crate) const TCP_OPT_ACCECN1: u8 = 174;

/// The four IP-ECN codepoints carried in the low two bits of the IPv4 ToS
/// byte. See RFC 3168 Section 5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcnCodepoint {
    /// Not ECN-capable transport.
    NotEct = 0,

    /// ECN-capable transport, the L4S (scalable) flavour.
    Ect1 = 1,

    /// ECN-capable transport, the classic flavour.
    Ect0 = 2,

    /// Congestion experienced.
    Ce = 3,
}

impl EcnCodepoint {
    /// Extract the ECN codepoint from an IPv4 ToS byte.
    pub fn from_tos(tos: u8) -> Self {
        match tos & 0x03 {
            0 => EcnCodepoint::NotEct,
            1 => EcnCodepoint::Ect1,
            2 => EcnCodepoint::Ect0,
            _ => EcnCodepoint::Ce,
        }
    }

    /// Whether the codepoint classifies the flow into the L4S queue.
    ///
    /// CE keeps the ECT(1) bit set, so an upstream-marked L4S packet still
    /// classifies as L4S.
    pub fn is_l4s(self) -> bool {
        matches!(self, EcnCodepoint::Ect1 | EcnCodepoint::Ce)
    }
}

/// IPv4 header in host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet header length in 32-bit words. Always 5 here.
    pub ihl: u8,

    /// Type of service byte; the low two bits are the ECN field.
    pub tos: u8,

    /// Total packet length, headers plus payload.
    pub tot_len: u16,

    /// Identification field.
    pub id: u16,

    /// Flags and fragment offset.
    pub frag_off: u16,

    /// Time to live.
    pub ttl: u8,

    /// Transport protocol number.
    pub protocol: u8,

    /// Header checksum, as read from the wire or last computed.
    pub check: u16,

    /// Source address.
    pub saddr: Ipv4Addr,

    /// Destination address.
    pub daddr: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse an IPv4 header from the start of `buf`.
    ///
    /// `buf` must hold the whole packet: `tot_len` is validated against
    /// its length so later checksum passes can trust it.
    pub fn parse(buf: &[u8]) -> Result<Ipv4Header> {
        if buf.len() < IPV4_HDR_LEN {
            return Err(Error::MalformedPacket);
        }

        let mut b = buf;
        let ver_ihl = b.read_u8()?;
        if ver_ihl >> 4 != 4 || ver_ihl & 0x0F != 5 {
            return Err(Error::MalformedPacket);
        }

        let hdr = Ipv4Header {
            ihl: ver_ihl & 0x0F,
            tos: b.read_u8()?,
            tot_len: b.read_u16()?,
            id: b.read_u16()?,
            frag_off: b.read_u16()?,
            ttl: b.read_u8()?,
            protocol: b.read_u8()?,
            check: b.read_u16()?,
            saddr: b.read_ipv4_addr()?,
            daddr: b.read_ipv4_addr()?,
        };
        if (hdr.tot_len as usize) < IPV4_HDR_LEN || buf.len() < hdr.tot_len as usize {
            return Err(Error::MalformedPacket);
        }
        Ok(hdr)
    }

    /// Write the header to the start of `buf` in wire order, including the
    /// current `check` field.
    pub fn write_to(&self, mut buf: &mut [u8]) -> Result<()> {
        buf.write_u8(4 << 4 | self.ihl)?;
        buf.write_u8(self.tos)?;
        buf.write_u16(self.tot_len)?;
        buf.write_u16(self.id)?;
        buf.write_u16(self.frag_off)?;
        buf.write_u8(self.ttl)?;
        buf.write_u8(self.protocol)?;
        buf.write_u16(self.check)?;
        buf.write_ipv4_addr(&self.saddr)?;
        buf.write_ipv4_addr(&self.daddr)?;
        Ok(())
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// The ECN codepoint of the packet.
    pub fn ecn(&self) -> EcnCodepoint {
        EcnCodepoint::from_tos(self.tos)
    }

    /// Compute the IPv4 header checksum over all 16-bit header words,
    /// excluding the checksum field itself. Returns the one's complement
    /// of the one's-complement sum.
    pub fn header_checksum(&self) -> u16 {
        let mut sum = 0u16;
        sum = ones_add(sum, (4u16 << 12) | ((self.ihl as u16) << 8) | self.tos as u16);
        sum = ones_add(sum, self.tot_len);
        sum = ones_add(sum, self.id);
        sum = ones_add(sum, self.frag_off);
        sum = ones_add(sum, ((self.ttl as u16) << 8) | self.protocol as u16);
        let saddr = u32::from(self.saddr);
        sum = ones_add(sum, (saddr >> 16) as u16);
        sum = ones_add(sum, saddr as u16);
        let daddr = u32::from(self.daddr);
        sum = ones_add(sum, (daddr >> 16) as u16);
        sum = ones_add(sum, daddr as u16);
        !sum
    }
}

/// TCP header in host byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,

    /// Destination port.
    pub dst_port: u16,

    /// Sequence number.
    pub seq: u32,

    /// Acknowledgement number.
    pub ack_seq: u32,

    /// Data offset in 32-bit words.
    pub doff: u8,

    /// The four bits between the data offset and the flag byte. The
    /// lowest of them is overwritten by the AccECN r.cep encoding.
    pub res1: u8,

    /// Congestion window reduced.
    pub cwr: bool,

    /// ECN echo.
    pub ece: bool,

    /// Urgent pointer significant.
    pub urg: bool,

    /// Acknowledgement field significant.
    pub ack: bool,

    /// Push function.
    pub psh: bool,

    /// Reset the connection.
    pub rst: bool,

    /// Synchronise sequence numbers.
    pub syn: bool,

    /// No more data from sender.
    pub fin: bool,

    /// Advertised receive window.
    pub window: u16,

    /// Checksum, as read from the wire or last computed.
    pub check: u16,

    /// Urgent pointer.
    pub urg_ptr: u16,
}

impl TcpHeader {
    /// Parse a TCP header from the start of the transport portion of a
    /// packet (`buf` begins right after the IPv4 header).
    pub fn parse(buf: &[u8]) -> Result<TcpHeader> {
        if buf.len() < TCP_HDR_LEN {
            return Err(Error::MalformedPacket);
        }

        let mut b = buf;
        let mut hdr = TcpHeader {
            src_port: b.read_u16()?,
            dst_port: b.read_u16()?,
            seq: b.read_u32()?,
            ack_seq: b.read_u32()?,
            ..TcpHeader::default()
        };
        let off_res = b.read_u8()?;
        hdr.doff = off_res >> 4;
        hdr.res1 = off_res & 0x0F;
        let flags = b.read_u8()?;
        hdr.cwr = flags & 0x80 != 0;
        hdr.ece = flags & 0x40 != 0;
        hdr.urg = flags & 0x20 != 0;
        hdr.ack = flags & 0x10 != 0;
        hdr.psh = flags & 0x08 != 0;
        hdr.rst = flags & 0x04 != 0;
        hdr.syn = flags & 0x02 != 0;
        hdr.fin = flags & 0x01 != 0;
        hdr.window = b.read_u16()?;
        hdr.check = b.read_u16()?;
        hdr.urg_ptr = b.read_u16()?;

        if hdr.doff < 5 || buf.len() < hdr.doff as usize * 4 {
            return Err(Error::MalformedPacket);
        }
        Ok(hdr)
    }

    /// Write the fixed part of the header to the start of `buf` in wire
    /// order, including the current `check` field. Option bytes following
    /// the fixed header are not touched.
    pub fn write_to(&self, mut buf: &mut [u8]) -> Result<()> {
        buf.write_u16(self.src_port)?;
        buf.write_u16(self.dst_port)?;
        buf.write_u32(self.seq)?;
        buf.write_u32(self.ack_seq)?;
        buf.write_u8(self.doff << 4 | (self.res1 & 0x0F))?;
        buf.write_u8(self.flags_byte())?;
        buf.write_u16(self.window)?;
        buf.write_u16(self.check)?;
        buf.write_u16(self.urg_ptr)?;
        Ok(())
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.doff as usize * 4
    }

    fn flags_byte(&self) -> u8 {
        (self.cwr as u8) << 7
            | (self.ece as u8) << 6
            | (self.urg as u8) << 5
            | (self.ack as u8) << 4
            | (self.psh as u8) << 3
            | (self.rst as u8) << 2
            | (self.syn as u8) << 1
            | self.fin as u8
    }
}

/// UDP header in host byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,

    /// Destination port.
    pub dst_port: u16,

    /// Length of UDP header plus payload.
    pub len: u16,

    /// Checksum.
    pub check: u16,
}

impl UdpHeader {
    /// Parse a UDP header from the start of the transport portion of a
    /// packet.
    pub fn parse(buf: &[u8]) -> Result<UdpHeader> {
        if buf.len() < UDP_HDR_LEN {
            return Err(Error::MalformedPacket);
        }

        let mut b = buf;
        Ok(UdpHeader {
            src_port: b.read_u16()?,
            dst_port: b.read_u16()?,
            len: b.read_u16()?,
            check: b.read_u16()?,
        })
    }
}

/// The transport header of a decoded packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

/// A decoded downlink SDU or uplink PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPacket {
    /// The IPv4 header.
    pub ipv4: Ipv4Header,

    /// The transport header.
    pub transport: TransportHeader,

    /// Canonical flow identifier.
    pub five_tuple: FiveTuple,

    /// The flow identifier with source and destination swapped, used to
    /// match an uplink ACK to its downlink flow.
    pub ack_five_tuple: FiveTuple,

    /// The ECN codepoint from the ToS byte.
    pub ecn: EcnCodepoint,

    /// Transport payload length in bytes.
    pub payload_len: u16,
}

/// Decode the IPv4 and transport headers at the start of `buf`.
///
/// Returns `MalformedPacket` for short or inconsistent buffers and
/// `UnsupportedProtocol` for transports other than TCP and UDP (the IPv4
/// header itself parsed fine in that case).
pub fn decode(buf: &[u8]) -> Result<DecodedPacket> {
    let ipv4 = Ipv4Header::parse(buf)?;
    let transport_buf = &buf[ipv4.header_len()..ipv4.tot_len as usize];

    let (transport, ports, hdr_len) = match ipv4.protocol {
        IPPROTO_TCP => {
            let tcp = TcpHeader::parse(transport_buf)?;
            let hdr_len = tcp.header_len();
            (TransportHeader::Tcp(tcp), (tcp.src_port, tcp.dst_port), hdr_len)
        }
        IPPROTO_UDP => {
            let udp = UdpHeader::parse(transport_buf)?;
            (TransportHeader::Udp(udp), (udp.src_port, udp.dst_port), UDP_HDR_LEN)
        }
        _ => return Err(Error::UnsupportedProtocol),
    };
    if transport_buf.len() < hdr_len {
        return Err(Error::MalformedPacket);
    }

    let five_tuple = FiveTuple {
        src_addr: ipv4.saddr,
        dst_addr: ipv4.daddr,
        src_port: ports.0,
        dst_port: ports.1,
        protocol: ipv4.protocol,
    };
    Ok(DecodedPacket {
        ipv4,
        transport,
        five_tuple,
        ack_five_tuple: five_tuple.ack_side(),
        ecn: ipv4.ecn(),
        payload_len: (transport_buf.len() - hdr_len) as u16,
    })
}

/// Compute the TCP checksum: the IPv4 pseudo-header, the TCP header with
/// the checksum field zeroed, and the option and payload bytes taken from
/// `packet`, summed as 16-bit big-endian words with end-around carry. A
/// trailing odd byte is padded with zero. Returns the one's complement of
/// the sum.
pub fn compute_tcp_checksum(ipv4: &Ipv4Header, tcp: &TcpHeader, packet: &[u8]) -> u16 {
    let mut sum = 0u16;

    // Pseudo-header.
    let saddr = u32::from(ipv4.saddr);
    sum = ones_add(sum, (saddr >> 16) as u16);
    sum = ones_add(sum, saddr as u16);
    let daddr = u32::from(ipv4.daddr);
    sum = ones_add(sum, (daddr >> 16) as u16);
    sum = ones_add(sum, daddr as u16);
    sum = ones_add(sum, ipv4.protocol as u16);
    sum = ones_add(sum, ipv4.tot_len - ipv4.header_len() as u16);

    // Fixed TCP header, checksum skipped.
    sum = ones_add(sum, tcp.src_port);
    sum = ones_add(sum, tcp.dst_port);
    sum = ones_add(sum, (tcp.seq >> 16) as u16);
    sum = ones_add(sum, tcp.seq as u16);
    sum = ones_add(sum, (tcp.ack_seq >> 16) as u16);
    sum = ones_add(sum, tcp.ack_seq as u16);
    sum = ones_add(
        sum,
        ((tcp.doff as u16) << 12) | ((tcp.res1 as u16) << 8) | tcp.flags_byte() as u16,
    );
    sum = ones_add(sum, tcp.window);
    sum = ones_add(sum, tcp.urg_ptr);

    // Options and payload.
    let start = ipv4.header_len() + TCP_HDR_LEN;
    let end = ipv4.tot_len as usize;
    let mut chunks = packet[start..end].chunks_exact(2);
    for pair in &mut chunks {
        sum = ones_add(sum, ((pair[0] as u16) << 8) | pair[1] as u16);
    }
    if let [last] = chunks.remainder() {
        sum = ones_add(sum, (*last as u16) << 8);
    }

    !sum
}

/// Refresh the IPv4 checksum of `hdr` and write it back to the start of
/// `buf`.
pub fn write_ipv4(buf: &mut [u8], hdr: &mut Ipv4Header) -> Result<()> {
    hdr.check = hdr.header_checksum();
    hdr.write_to(buf)
}

/// Recompute the TCP checksum of `tcp` over the packet in `buf` and write
/// the fixed header back after the IPv4 header. Option bytes already in
/// `buf` are covered by the checksum as-is, so rewrite them first.
pub fn write_tcp(buf: &mut [u8], ipv4: &Ipv4Header, tcp: &mut TcpHeader) -> Result<()> {
    tcp.check = compute_tcp_checksum(ipv4, tcp, buf);
    tcp.write_to(&mut buf[ipv4.header_len()..])
}

/// One's-complement 16-bit addition with end-around carry.
fn ones_add(sum: u16, n: u16) -> u16 {
    let s = sum as u32 + n as u32;
    if s > 0xFFFF {
        (s as u16) + 1
    } else {
        s as u16
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    /// Validate a packet's IPv4 checksum the receiver way: the
    /// one's-complement sum over all header words, checksum included,
    /// must be 0xFFFF.
    fn ipv4_sum_is_valid(hdr: &Ipv4Header) -> bool {
        ones_add(!hdr.header_checksum(), hdr.check) == 0xFFFF
    }

    #[test]
    fn parse_tcp_packet() -> Result<()> {
        let pkt = build_tcp(&TcpPacket {
            seq: 0x0102_0304,
            ack_seq: 0x0a0b_0c0d,
            ack: true,
            payload_len: 100,
            ..TcpPacket::default()
        });
        let decoded = decode(&pkt)?;

        assert_eq!(decoded.ipv4.protocol, IPPROTO_TCP);
        assert_eq!(decoded.ipv4.tot_len as usize, pkt.len());
        assert_eq!(decoded.ecn, EcnCodepoint::Ect0);
        assert_eq!(decoded.payload_len, 100);
        assert_eq!(decoded.five_tuple.src_port, 5000);
        assert_eq!(decoded.five_tuple.dst_port, 80);
        assert_eq!(decoded.ack_five_tuple.src_port, 80);
        assert_eq!(decoded.ack_five_tuple.dst_port, 5000);
        assert_eq!(decoded.ack_five_tuple.src_addr, decoded.five_tuple.dst_addr);

        let tcp = match decoded.transport {
            TransportHeader::Tcp(tcp) => tcp,
            _ => unreachable!(),
        };
        assert_eq!(tcp.seq, 0x0102_0304);
        assert_eq!(tcp.ack_seq, 0x0a0b_0c0d);
        assert!(tcp.ack);
        assert!(!tcp.syn);
        Ok(())
    }

    #[test]
    fn parse_udp_packet() -> Result<()> {
        let pkt = build_udp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            9000,
            443,
            EcnCodepoint::Ect1,
            64,
        );
        let decoded = decode(&pkt)?;
        assert_eq!(decoded.ecn, EcnCodepoint::Ect1);
        assert_eq!(decoded.payload_len, 64);
        assert!(matches!(decoded.transport, TransportHeader::Udp(_)));
        Ok(())
    }

    #[test]
    fn checksum_round_trip() -> Result<()> {
        // Parse, identity-mutate, recompute checksums and write back: the
        // packet must come out byte-identical.
        let pkt = build_tcp(&TcpPacket {
            payload_len: 33,
            options: vec![TCP_OPT_NOP; 4],
            ..TcpPacket::default()
        });
        let mut out = pkt.clone();
        let mut ipv4 = Ipv4Header::parse(&out)?;
        let mut tcp = TcpHeader::parse(&out[ipv4.header_len()..])?;
        write_ipv4(&mut out, &mut ipv4)?;
        write_tcp(&mut out, &ipv4, &mut tcp)?;
        assert_eq!(pkt, out);
        Ok(())
    }

    #[test]
    fn ipv4_checksum_validates() -> Result<()> {
        let pkt = build_tcp(&TcpPacket::default());
        let ipv4 = Ipv4Header::parse(&pkt)?;
        assert_eq!(ipv4.check, ipv4.header_checksum());
        assert!(ipv4_sum_is_valid(&ipv4));
        Ok(())
    }

    #[test]
    fn tcp_checksum_validates() -> Result<()> {
        // The stored checksum must equal a fresh computation, including
        // over packets with an odd payload length.
        for payload_len in [0, 1, 100, 1459] {
            let pkt = build_tcp(&TcpPacket {
                payload_len,
                ..TcpPacket::default()
            });
            let ipv4 = Ipv4Header::parse(&pkt)?;
            let tcp = TcpHeader::parse(&pkt[ipv4.header_len()..])?;
            assert_eq!(tcp.check, compute_tcp_checksum(&ipv4, &tcp, &pkt));
        }
        Ok(())
    }

    #[test]
    fn malformed_packets() {
        // Truncated header.
        assert_eq!(decode(&[0x45, 0x00]), Err(Error::MalformedPacket));

        // Not IPv4, or IP options present.
        let mut pkt = build_tcp(&TcpPacket::default());
        pkt[0] = 0x65;
        assert_eq!(decode(&pkt), Err(Error::MalformedPacket));
        pkt[0] = 0x46;
        assert_eq!(decode(&pkt), Err(Error::MalformedPacket));

        // tot_len beyond the buffer.
        let pkt = build_tcp(&TcpPacket::default());
        assert_eq!(decode(&pkt[..pkt.len() - 1]), Err(Error::MalformedPacket));

        // Bogus TCP data offset.
        let mut pkt = build_tcp(&TcpPacket::default());
        pkt[IPV4_HDR_LEN + 12] = 2 << 4;
        assert_eq!(decode(&pkt), Err(Error::MalformedPacket));
    }

    #[test]
    fn unsupported_protocol() {
        let mut pkt = build_udp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            EcnCodepoint::NotEct,
            8,
        );
        pkt[9] = 47; // GRE
        let mut ipv4 = Ipv4Header::parse(&pkt).unwrap();
        write_ipv4(&mut pkt, &mut ipv4).unwrap();
        assert_eq!(decode(&pkt), Err(Error::UnsupportedProtocol));
        // The IPv4 header itself still parses for the pass-through path.
        assert!(Ipv4Header::parse(&pkt).is_ok());
    }

    #[test]
    fn ce_remark_refreshes_checksum() -> Result<()> {
        let mut pkt = build_udp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            9000,
            443,
            EcnCodepoint::Ect0,
            16,
        );
        let mut ipv4 = Ipv4Header::parse(&pkt)?;
        ipv4.tos |= EcnCodepoint::Ce as u8;
        write_ipv4(&mut pkt, &mut ipv4)?;

        let reparsed = Ipv4Header::parse(&pkt)?;
        assert_eq!(reparsed.ecn(), EcnCodepoint::Ce);
        assert_eq!(reparsed.check, reparsed.header_checksum());
        assert!(ipv4_sum_is_valid(&reparsed));
        Ok(())
    }
}
