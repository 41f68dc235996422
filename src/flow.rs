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

//! Per-flow state keyed by five-tuple.
//!
//! Entries are created lazily on first packet sighting and retained for
//! the lifetime of the entity. Each entry carries the ECN byte and packet
//! counters feeding the AccECN rewrite, the ACK baseline, the SYN-based
//! initial RTT estimate, and the FIFO of in-flight TCP segments.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::DrbId;
use crate::FiveTuple;

/// Initial RTT estimate for a TCP flow, seeded from the ingress times of
/// the SYN and the first non-SYN segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct RttEstimate {
    ingress_of_syn: Option<Instant>,
    ingress_of_second: Option<Instant>,
    estimated_rtt: Option<Duration>,
}

impl RttEstimate {
    /// Stamp the ingress time of a SYN segment. A retransmitted SYN
    /// re-stamps the seed.
    pub fn on_syn(&mut self, now: Instant) {
        self.ingress_of_syn = Some(now);
    }

    /// Stamp the first non-SYN segment and derive the estimate.
    pub fn on_data(&mut self, now: Instant) {
        if self.ingress_of_second.is_none() {
            if let Some(syn) = self.ingress_of_syn {
                self.ingress_of_second = Some(now);
                self.estimated_rtt = Some(now.saturating_duration_since(syn));
            }
        }
    }

    /// The current estimate, if both seeds were observed.
    pub fn estimate(&self) -> Option<Duration> {
        self.estimated_rtt
    }
}

/// A TCP segment observed on the downlink and not yet covered by a
/// cumulative ACK.
#[derive(Clone, Copy, Debug)]
pub struct InFlightRecord {
    /// TCP sequence number.
    pub seq_num: u32,

    /// End sequence number, `seq_num + payload_len` modulo 2^32.
    pub end_seq_num: u32,

    /// Payload length in bytes.
    pub payload_len: u16,

    /// Total IP packet length.
    pub ip_total_len: u16,

    /// When the segment entered the entity.
    pub tx_time: Instant,

    /// Whether the sequence range had been seen before.
    pub is_retransmission: bool,
}

/// FIFO of in-flight segments for one TCP flow, ordered by ascending end
/// sequence number under in-order transmission.
#[derive(Debug, Default)]
pub struct InFlightQueue {
    records: VecDeque<InFlightRecord>,

    /// Next sequence number expected from the sender.
    next_expected_seq: u32,

    /// Total data segments observed.
    pub total_packets_sent: u64,

    /// Total segments covered by cumulative ACKs.
    pub total_packets_acked: u64,

    /// Total retransmissions observed.
    pub total_retransmissions: u64,

    /// Ingress time of the most recent data segment.
    pub last_tx_time: Option<Instant>,

    /// Arrival time of the most recent covering ACK.
    pub last_ack_time: Option<Instant>,
}

impl InFlightQueue {
    /// Record a downlink data segment.
    pub fn on_sent(&mut self, seq: u32, payload_len: u16, ip_total_len: u16, now: Instant) {
        let is_retransmission = self.total_packets_sent > 0 && seq_lt(seq, self.next_expected_seq);
        let end_seq_num = seq.wrapping_add(payload_len as u32);

        self.records.push_back(InFlightRecord {
            seq_num: seq,
            end_seq_num,
            payload_len,
            ip_total_len,
            tx_time: now,
            is_retransmission,
        });
        if is_retransmission {
            self.total_retransmissions += 1;
        } else if seq_lt(self.next_expected_seq, end_seq_num) || self.total_packets_sent == 0 {
            self.next_expected_seq = end_seq_num;
        }
        self.total_packets_sent += 1;
        self.last_tx_time = Some(now);
    }

    /// Pop every record covered by the cumulative acknowledgement
    /// `ack_seq` and return an RTT sample from the newest covered
    /// original transmission, if any. Retransmissions yield no sample.
    pub fn on_ack(&mut self, ack_seq: u32, now: Instant) -> Option<Duration> {
        let mut rtt = None;
        let mut covered = false;
        while let Some(front) = self.records.front() {
            if !seq_leq(front.end_seq_num, ack_seq) {
                break;
            }
            if !front.is_retransmission {
                rtt = Some(now.saturating_duration_since(front.tx_time));
            }
            self.records.pop_front();
            self.total_packets_acked += 1;
            covered = true;
        }
        if covered {
            self.last_ack_time = Some(now);
        }
        rtt
    }

    /// Number of segments currently in flight.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no segments are in flight.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate the in-flight records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &InFlightRecord> {
        self.records.iter()
    }
}

/// `a < b` in TCP sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in TCP sequence space.
fn seq_leq(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Marking state for one flow.
#[derive(Debug)]
pub struct FlowState {
    /// The bearer currently carrying the flow.
    pub drb_id: DrbId,

    /// Payload bytes accounted to ECT(0).
    pub bytes_with_ecn0: u64,

    /// Payload bytes accounted to ECT(1).
    pub bytes_with_ecn1: u64,

    /// Payload bytes accounted to CE, marked here or upstream.
    pub bytes_with_ce: u64,

    /// Packets accounted to ECT(0).
    pub pkts_with_ecn0: u64,

    /// Packets accounted to ECT(1).
    pub pkts_with_ecn1: u64,

    /// Packets accounted to CE.
    pub pkts_with_ce: u64,

    /// Baseline TCP acknowledgement number: one less than the lowest
    /// valid ACK observed on the uplink. `ack_seq - ack_raw` is the byte
    /// span the AccECN counters are spread over.
    pub ack_raw: u32,

    /// Initial RTT estimate from the handshake timing.
    pub rtt: RttEstimate,

    /// In-flight segment FIFO.
    pub in_flight: InFlightQueue,
}

impl FlowState {
    fn new(drb_id: DrbId) -> Self {
        FlowState {
            drb_id,
            bytes_with_ecn0: 0,
            bytes_with_ecn1: 0,
            bytes_with_ce: 0,
            pkts_with_ecn0: 0,
            pkts_with_ecn1: 0,
            pkts_with_ce: 0,
            ack_raw: u32::MAX,
            rtt: RttEstimate::default(),
            in_flight: InFlightQueue::default(),
        }
    }

    /// Account a packet to ECT(0).
    pub fn account_ecn0(&mut self, payload_bytes: u64) {
        self.bytes_with_ecn0 = self.bytes_with_ecn0.saturating_add(payload_bytes);
        self.pkts_with_ecn0 = self.pkts_with_ecn0.saturating_add(1);
    }

    /// Account a packet to ECT(1).
    pub fn account_ecn1(&mut self, payload_bytes: u64) {
        self.bytes_with_ecn1 = self.bytes_with_ecn1.saturating_add(payload_bytes);
        self.pkts_with_ecn1 = self.pkts_with_ecn1.saturating_add(1);
    }

    /// Account a packet to CE.
    pub fn account_ce(&mut self, payload_bytes: u64) {
        self.bytes_with_ce = self.bytes_with_ce.saturating_add(payload_bytes);
        self.pkts_with_ce = self.pkts_with_ce.saturating_add(1);
    }

    /// Lower the ACK baseline: a strictly smaller, non-zero ACK moves the
    /// baseline down to one below it. The baseline never rises.
    pub fn lower_ack_raw(&mut self, ack_seq: u32) {
        if ack_seq > 0 && ack_seq < self.ack_raw {
            self.ack_raw = ack_seq - 1;
        }
    }
}

/// Per-entity table of flow state, keyed by canonical five-tuple.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: FxHashMap<FiveTuple, FlowState>,
}

impl FlowTable {
    /// Look up the flow, creating it on first sighting, and bind it to
    /// the bearer currently mapped for its QoS flow.
    pub fn bind(&mut self, five_tuple: FiveTuple, drb_id: DrbId) -> &mut FlowState {
        let flow = self
            .flows
            .entry(five_tuple)
            .or_insert_with(|| FlowState::new(drb_id));
        flow.drb_id = drb_id;
        flow
    }

    /// Look up a flow without creating it.
    pub fn get_mut(&mut self, five_tuple: &FiveTuple) -> Option<&mut FlowState> {
        self.flows.get_mut(five_tuple)
    }

    /// Number of tracked flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
