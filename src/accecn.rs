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

//! AccECN feedback synthesis on uplink ACKs.
//!
//! The entity's marking decisions never touch downlink TCP segments;
//! instead the CE share accrued per flow is folded into the flow's uplink
//! ACKs: the ACE counter goes into the `res1`/`cwr`/`ece` header bits and
//! the per-class byte counters overwrite an AccECN TCP option in place.
//! The sender then reacts as if the path had CE-marked that share of its
//! bytes.

use crate::codec::Encoder;
use crate::flow::FlowState;
use crate::packet::EcnCodepoint;
use crate::packet::Ipv4Header;
use crate::packet::TcpHeader;
use crate::packet::TCP_HDR_LEN;
use crate::packet::TCP_OPT_ACCECN0;
use crate::packet::TCP_OPT_ACCECN1;
use crate::packet::TCP_OPT_EOL;
use crate::packet::TCP_OPT_NOP;
use crate::Result;

/// Nominal segment size the acknowledged byte span is divided into.
const ACK_SEGMENT_SIZE: u64 = 1336;

/// Initial value of the ACE counter; encoded CE packet counts sit on top
/// of it.
const CE_PKT_BASE: u64 = 5;

/// CE packets a flow must accrue before its ACKs carry feedback.
const MIN_CE_PKTS: u64 = 5;

/// The option byte counters are 24 bits wide.
const COUNTER_MOD: u64 = 1 << 24;

/// Counter values to fold into one uplink ACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccEcnCounters {
    /// CE packet count; the low three bits feed the ACE header field.
    pub ce_pkt: u64,

    /// CE byte counter, 24 bits.
    pub ce_bytes: u32,

    /// ECT(0) byte counter, 24 bits.
    pub ecn0_bytes: u32,

    /// ECT(1) byte counter, 24 bits.
    pub ecn1_bytes: u32,
}

/// Derive the counters for an uplink ACK of `ack_seq` on a flow whose
/// downlink accounting is in `flow`. `ecn` is the codepoint of the ACK
/// packet itself and selects the sampled class.
///
/// Returns `None` while feedback is gated: no ACK baseline yet, fewer
/// than [`MIN_CE_PKTS`] CE packets accrued, or no packet of the sampled
/// class seen.
pub fn derive_counters(
    flow: &FlowState,
    ack_seq: u32,
    ecn: EcnCodepoint,
) -> Option<AccEcnCounters> {
    if flow.ack_raw == u32::MAX {
        return None;
    }
    let acked = (ack_seq as u64).checked_sub(flow.ack_raw as u64)?;

    let (sampled_bytes, sampled_pkts, l4s) = match ecn {
        EcnCodepoint::Ect0 => (flow.bytes_with_ecn0, flow.pkts_with_ecn0, false),
        EcnCodepoint::Ect1 => (flow.bytes_with_ecn1, flow.pkts_with_ecn1, true),
        _ => return None,
    };
    if sampled_pkts == 0 || flow.pkts_with_ce < MIN_CE_PKTS {
        return None;
    }
    let denom = sampled_bytes.saturating_add(flow.bytes_with_ce);
    if denom == 0 {
        return None;
    }

    // ce_pkt = total_pkt * bytes_ce / (bytes_sampled + bytes_ce), floored,
    // with an extra tenth taken for the scalable class. Integer arithmetic
    // keeps the floor exact.
    let total_pkt = acked / ACK_SEGMENT_SIZE;
    let divisor = denom as u128 * if l4s { 10 } else { 1 };
    let marked = (total_pkt as u128 * flow.bytes_with_ce as u128 / divisor) as u64;
    let ce_pkt = marked + CE_PKT_BASE;

    let ce_bytes = (marked * ACK_SEGMENT_SIZE % COUNTER_MOD) as u32;
    let sampled = (acked as i64 - ce_bytes as i64).rem_euclid(COUNTER_MOD as i64) as u32;

    // The class that was not sampled reports its floor value of one.
    Some(if l4s {
        AccEcnCounters {
            ce_pkt,
            ce_bytes,
            ecn0_bytes: 1,
            ecn1_bytes: sampled,
        }
    } else {
        AccEcnCounters {
            ce_pkt,
            ce_bytes,
            ecn0_bytes: sampled,
            ecn1_bytes: 1,
        }
    })
}

/// Fold `counters` into the ACK: the low three bits of `ce_pkt` replace
/// the `res1`/`cwr`/`ece` header bits, and the first AccECN option found
/// in the option list is overwritten with the byte counters in its
/// kind's order. Returns whether an option was rewritten; the caller
/// recomputes the TCP checksum either way.
pub fn rewrite(
    buf: &mut [u8],
    ipv4: &Ipv4Header,
    tcp: &mut TcpHeader,
    counters: &AccEcnCounters,
) -> Result<bool> {
    tcp.res1 = ((counters.ce_pkt >> 2) & 1) as u8;
    tcp.cwr = counters.ce_pkt & 0x2 != 0;
    tcp.ece = counters.ce_pkt & 0x1 != 0;

    let start = ipv4.header_len() + TCP_HDR_LEN;
    let end = ipv4.header_len() + tcp.header_len();
    let mut i = start;
    while i < end {
        match buf[i] {
            TCP_OPT_NOP => i += 1,
            TCP_OPT_EOL => break,
            kind @ (TCP_OPT_ACCECN0 | TCP_OPT_ACCECN1) => {
                if i + 11 > end {
                    break;
                }
                let mut b = &mut buf[i + 2..i + 11];
                let ordered = if kind == TCP_OPT_ACCECN1 {
                    [counters.ecn1_bytes, counters.ce_bytes, counters.ecn0_bytes]
                } else {
                    [counters.ecn0_bytes, counters.ce_bytes, counters.ecn1_bytes]
                };
                for counter in ordered {
                    b.write_u24(counter)?;
                }
                return Ok(true);
            }
            _ => {
                if i + 1 >= end {
                    break;
                }
                let len = buf[i + 1] as usize;
                if len < 2 {
                    break;
                }
                i += len;
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testing::{build_tcp, TcpPacket};
    use crate::packet::{compute_tcp_checksum, write_tcp};
    use crate::DrbId;

    fn flow_with(
        bytes_ecn0: u64,
        bytes_ecn1: u64,
        bytes_ce: u64,
        pkts_ce: u64,
        ack_raw: u32,
    ) -> FlowState {
        FlowState {
            drb_id: DrbId(1),
            bytes_with_ecn0: bytes_ecn0,
            bytes_with_ecn1: bytes_ecn1,
            bytes_with_ce: bytes_ce,
            pkts_with_ecn0: (bytes_ecn0 > 0) as u64 * 10,
            pkts_with_ecn1: (bytes_ecn1 > 0) as u64 * 10,
            pkts_with_ce: pkts_ce,
            ack_raw,
            rtt: Default::default(),
            in_flight: Default::default(),
        }
    }

    #[test]
    fn classic_counters() {
        // 16 032 acked bytes at a CE share of one sixth: 12 nominal
        // segments, 2 of them CE, on top of the base of 5.
        let flow = flow_with(13_360, 0, 2_672, 6, 0);
        let counters = derive_counters(&flow, 16_032, EcnCodepoint::Ect0).unwrap();
        assert_eq!(
            counters,
            AccEcnCounters {
                ce_pkt: 7,
                ce_bytes: 2_672,
                ecn0_bytes: 13_360,
                ecn1_bytes: 1,
            }
        );
    }

    #[test]
    fn l4s_counters_take_a_tenth() {
        let flow = flow_with(0, 13_360, 2_672, 6, 0);
        let counters = derive_counters(&flow, 160_320, EcnCodepoint::Ect1).unwrap();
        // 120 nominal segments at portion (1/6)/10 -> 2 CE segments.
        assert_eq!(counters.ce_pkt, 7);
        assert_eq!(counters.ce_bytes, 2_672);
        assert_eq!(counters.ecn0_bytes, 1);
        assert_eq!(counters.ecn1_bytes, (160_320 - 2_672) % (1 << 24));
    }

    #[test]
    fn feedback_is_gated() {
        // No baseline.
        let flow = flow_with(13_360, 0, 2_672, 6, u32::MAX);
        assert!(derive_counters(&flow, 16_032, EcnCodepoint::Ect0).is_none());

        // Too few CE packets.
        let flow = flow_with(13_360, 0, 2_672, 4, 0);
        assert!(derive_counters(&flow, 16_032, EcnCodepoint::Ect0).is_none());

        // No packet of the sampled class.
        let flow = flow_with(0, 0, 2_672, 6, 0);
        assert!(derive_counters(&flow, 16_032, EcnCodepoint::Ect0).is_none());

        // CE and Not-ECT ACKs carry nothing.
        let flow = flow_with(13_360, 0, 2_672, 6, 0);
        assert!(derive_counters(&flow, 16_032, EcnCodepoint::Ce).is_none());
        assert!(derive_counters(&flow, 16_032, EcnCodepoint::NotEct).is_none());
    }

    #[test]
    fn rewrite_option_kind_174() {
        // Option list: NOP, then kind 174 length 11.
        let mut options = vec![TCP_OPT_NOP, TCP_OPT_ACCECN1, 11];
        options.extend_from_slice(&[0; 9]);
        let mut pkt = build_tcp(&TcpPacket {
            ack: true,
            ack_seq: 16_032,
            ecn: EcnCodepoint::Ect0,
            options,
            ..TcpPacket::default()
        });
        let ipv4 = Ipv4Header::parse(&pkt).unwrap();
        let mut tcp = TcpHeader::parse(&pkt[ipv4.header_len()..]).unwrap();

        let counters = AccEcnCounters {
            ce_pkt: 7,
            ce_bytes: 2_672,
            ecn0_bytes: 13_360,
            ecn1_bytes: 1,
        };
        assert!(rewrite(&mut pkt, &ipv4, &mut tcp, &counters).unwrap());
        assert_eq!(tcp.res1, 1);
        assert!(tcp.cwr);
        assert!(tcp.ece);

        write_tcp(&mut pkt, &ipv4, &mut tcp).unwrap();

        // Kind 174 carries ECN1, CE, ECN0 in that order.
        let opt = &pkt[ipv4.header_len() + TCP_HDR_LEN + 1..];
        assert_eq!(opt[0], TCP_OPT_ACCECN1);
        assert_eq!(opt[1], 11);
        assert_eq!(&opt[2..5], &[0, 0, 1]);
        assert_eq!(&opt[5..8], &[0x00, 0x0A, 0x70]);
        assert_eq!(&opt[8..11], &[0x00, 0x34, 0x30]);

        // The rewritten packet checksums clean.
        let reparsed = TcpHeader::parse(&pkt[ipv4.header_len()..]).unwrap();
        assert_eq!(reparsed.check, compute_tcp_checksum(&ipv4, &reparsed, &pkt));
    }

    #[test]
    fn rewrite_option_kind_172_reverses_order() {
        let mut options = vec![TCP_OPT_ACCECN0, 11];
        options.extend_from_slice(&[0; 9]);
        options.push(TCP_OPT_NOP);
        let mut pkt = build_tcp(&TcpPacket {
            ack: true,
            options,
            ..TcpPacket::default()
        });
        let ipv4 = Ipv4Header::parse(&pkt).unwrap();
        let mut tcp = TcpHeader::parse(&pkt[ipv4.header_len()..]).unwrap();

        let counters = AccEcnCounters {
            ce_pkt: 6,
            ce_bytes: 1_336,
            ecn0_bytes: 14_696,
            ecn1_bytes: 1,
        };
        assert!(rewrite(&mut pkt, &ipv4, &mut tcp, &counters).unwrap());
        // ce_pkt = 6 = 0b110.
        assert_eq!(tcp.res1, 1);
        assert!(tcp.cwr);
        assert!(!tcp.ece);

        // Kind 172 carries ECN0, CE, ECN1 in that order.
        let opt = &pkt[ipv4.header_len() + TCP_HDR_LEN..];
        assert_eq!(&opt[2..5], &[0x00, 0x39, 0x68]);
        assert_eq!(&opt[5..8], &[0x00, 0x05, 0x38]);
        assert_eq!(&opt[8..11], &[0, 0, 1]);
    }

    #[test]
    fn rewrite_skips_foreign_options() {
        // MSS (kind 2, length 4), then window scale (kind 3, length 3),
        // then NOP, then the AccECN option.
        let mut options = vec![2, 4, 0x05, 0xB4, 3, 3, 7, TCP_OPT_NOP];
        options.extend_from_slice(&[TCP_OPT_ACCECN1, 11]);
        options.extend_from_slice(&[0; 9]);
        options.push(TCP_OPT_NOP);
        let mut pkt = build_tcp(&TcpPacket {
            ack: true,
            options: options.clone(),
            ..TcpPacket::default()
        });
        let ipv4 = Ipv4Header::parse(&pkt).unwrap();
        let mut tcp = TcpHeader::parse(&pkt[ipv4.header_len()..]).unwrap();

        let counters = AccEcnCounters {
            ce_pkt: 5,
            ce_bytes: 0,
            ecn0_bytes: 100,
            ecn1_bytes: 1,
        };
        assert!(rewrite(&mut pkt, &ipv4, &mut tcp, &counters).unwrap());

        // The foreign options are untouched.
        let opt = &pkt[ipv4.header_len() + TCP_HDR_LEN..];
        assert_eq!(&opt[..8], &options[..8]);
        assert_eq!(&opt[10..13], &[0, 0, 1]);
    }

    #[test]
    fn rewrite_without_accecn_option() {
        // An option list with no AccECN option: header bits still move,
        // no bytes rewritten.
        let options = vec![TCP_OPT_NOP, TCP_OPT_NOP, TCP_OPT_EOL, 0];
        let mut pkt = build_tcp(&TcpPacket {
            ack: true,
            options,
            ..TcpPacket::default()
        });
        let before = pkt.clone();
        let ipv4 = Ipv4Header::parse(&pkt).unwrap();
        let mut tcp = TcpHeader::parse(&pkt[ipv4.header_len()..]).unwrap();

        let counters = AccEcnCounters {
            ce_pkt: 7,
            ce_bytes: 0,
            ecn0_bytes: 0,
            ecn1_bytes: 1,
        };
        assert!(!rewrite(&mut pkt, &ipv4, &mut tcp, &counters).unwrap());
        assert_eq!(pkt, before);
        assert_eq!(tcp.res1, 1);
    }
}
