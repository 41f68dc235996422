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

//! The per-PDU-session Mark Entity.
//!
//! One entity owns the downlink (SDU to PDU) path, the uplink (PDU to
//! SDU) path, and the radio feedback sink of one UE PDU session. The
//! packet paths run on the session's executor; the feedback sink is
//! called from a separate executor, so all shared state sits behind one
//! per-entity lock that every handler holds for its duration. Packets
//! are forwarded to the notifiers after the lock is released.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::accecn;
use crate::bearer::Bearer;
use crate::bearer::DeliveryStatusFeedback;
use crate::error::Error;
use crate::flow::FlowTable;
use crate::mark::MarkController;
use crate::packet;
use crate::packet::DecodedPacket;
use crate::packet::EcnCodepoint;
use crate::packet::TcpHeader;
use crate::packet::TransportHeader;
use crate::rate::RatePredictor;
use crate::rwnd::RwndController;
use crate::DrbId;
use crate::FiveTuple;
use crate::MarkConfig;
use crate::MarkRxSduNotifier;
use crate::MarkTxPduNotifier;
use crate::QosFlowId;
use crate::Result;
use crate::RlcMode;
use crate::MARK_PROB_MAX;

/// Counters of one entity's packet and feedback traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntityStats {
    /// Downlink SDUs handled.
    pub tx_pkts: u64,

    /// Uplink PDUs handled.
    pub rx_pkts: u64,

    /// Packets forwarded untouched because they did not parse.
    pub malformed_pkts: u64,

    /// Packets forwarded untouched because of a non-TCP/UDP transport.
    pub unsupported_pkts: u64,

    /// Feedback walks cut short by sequence wrap ambiguity.
    pub wrap_ambiguities: u64,

    /// Feedback messages received.
    pub feedback_events: u64,
}

/// State shared between the packet paths and the feedback executor.
struct EntityState {
    /// QoS flow to bearer mapping.
    qfi_to_drb: FxHashMap<QosFlowId, DrbId>,

    /// Bearers of the session.
    bearers: FxHashMap<DrbId, Bearer>,

    /// Per-flow state.
    flows: FlowTable,

    /// Uplink receive-window controller.
    rwnd: RwndController,

    /// Mark sampling RNG.
    rng: StdRng,

    /// Number of active UEs sharing the cell, set by the management
    /// plane.
    nof_ue: usize,

    /// Traffic counters.
    stats: EntityStats,
}

/// The congestion-signalling entity of one UE PDU session.
pub struct MarkEntity {
    /// Log prefix identifying the session.
    trace_id: String,

    /// Liveness window for the per-class presence flags.
    liveness_window: Duration,

    /// Dequeue-rate predictor.
    predictor: RatePredictor,

    /// CE-mark probability controller.
    controller: MarkController,

    state: Mutex<EntityState>,

    /// Downstream sink of the downlink path.
    tx_pdu_notifier: Arc<dyn MarkTxPduNotifier>,

    /// Upstream sink of the uplink path.
    rx_sdu_notifier: Arc<dyn MarkRxSduNotifier>,
}

impl MarkEntity {
    /// Create the entity for one PDU session.
    pub fn new(
        ue_index: u32,
        pdu_session_id: u8,
        config: MarkConfig,
        tx_pdu_notifier: Arc<dyn MarkTxPduNotifier>,
        rx_sdu_notifier: Arc<dyn MarkRxSduNotifier>,
    ) -> Self {
        Self::with_rng(
            ue_index,
            pdu_session_id,
            config,
            tx_pdu_notifier,
            rx_sdu_notifier,
            StdRng::from_entropy(),
        )
    }

    pub(crate) fn with_rng(
        ue_index: u32,
        pdu_session_id: u8,
        config: MarkConfig,
        tx_pdu_notifier: Arc<dyn MarkTxPduNotifier>,
        rx_sdu_notifier: Arc<dyn MarkRxSduNotifier>,
        rng: StdRng,
    ) -> Self {
        MarkEntity {
            trace_id: format!("ue{}-ps{}", ue_index, pdu_session_id),
            liveness_window: config.liveness_window(),
            predictor: RatePredictor::new(config.rate_window()),
            controller: MarkController::new(
                config.l4s_delay_target_us(),
                config.classic_queue_budget(),
            ),
            state: Mutex::new(EntityState {
                qfi_to_drb: FxHashMap::default(),
                bearers: FxHashMap::default(),
                flows: FlowTable::default(),
                rwnd: RwndController::new(
                    config.rwnd_gamma(),
                    config.rwnd_alpha(),
                    config.min_rwnd(),
                ),
                rng,
                nof_ue: 1,
                stats: EntityStats::default(),
            }),
            tx_pdu_notifier,
            rx_sdu_notifier,
        }
    }

    /// Add a bearer to the session with the default SN width.
    pub fn add_drb(&self, drb_id: DrbId, rlc_mode: RlcMode) {
        let mut state = self.state.lock().unwrap();
        state
            .bearers
            .insert(drb_id, Bearer::new(drb_id, rlc_mode));
        debug!("{} added {} rlc_mode={:?}", self.trace_id, drb_id, rlc_mode);
    }

    /// Set the PDCP SN width of a bearer. `sn_bits` must be 12 or 18.
    pub fn set_pdcp_sn_size(&self, drb_id: DrbId, sn_bits: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .bearers
            .get_mut(&drb_id)
            .ok_or(Error::UnknownBearer)?
            .set_sn_size(sn_bits)
    }

    /// Map a QoS flow onto a bearer.
    pub fn add_mapping(&self, qfi: QosFlowId, drb_id: DrbId) {
        let mut state = self.state.lock().unwrap();
        state.qfi_to_drb.insert(qfi, drb_id);
    }

    /// Set the number of active UEs sharing the cell.
    pub fn set_nof_ue(&self, nof_ue: usize) {
        self.state.lock().unwrap().nof_ue = nof_ue;
    }

    /// A snapshot of the traffic counters.
    pub fn stats(&self) -> EntityStats {
        self.state.lock().unwrap().stats
    }

    /// Downlink entry: observe the SDU, run the mark sampler, append it
    /// to its bearer's queue, and forward it to the lower layer.
    ///
    /// A missing QoS-flow mapping or bearer is a configuration error.
    /// Packets that do not parse are forwarded untouched.
    pub fn handle_sdu(&self, mut sdu: Vec<u8>, qfi: QosFlowId, now: Instant) -> Result<()> {
        trace!("{} tx sdu {} len={}", self.trace_id, qfi, sdu.len());
        {
            let state = &mut *self.state.lock().unwrap();
            let drb_id = *state.qfi_to_drb.get(&qfi).ok_or(Error::UnknownQosFlow)?;
            if !state.bearers.contains_key(&drb_id) {
                return Err(Error::UnknownBearer);
            }
            state.stats.tx_pkts += 1;

            match packet::decode(&sdu) {
                Ok(decoded) => match decoded.transport {
                    TransportHeader::Tcp(tcp) => {
                        self.sample_tcp_sdu(state, &decoded, &tcp, drb_id, now)
                    }
                    TransportHeader::Udp(_) => {
                        self.sample_udp_sdu(state, &mut sdu, &decoded, drb_id, now)
                    }
                },
                Err(Error::UnsupportedProtocol) => {
                    state.stats.unsupported_pkts += 1;
                    // The IPv4 header itself parsed, so the SDU still
                    // lands in the bearer queue for rate accounting.
                    if let Ok(ipv4) = packet::Ipv4Header::parse(&sdu) {
                        if let Some(bearer) = state.bearers.get_mut(&drb_id) {
                            bearer.push_sdu(ipv4.tot_len as u32, FiveTuple::default(), now);
                        }
                    }
                }
                Err(_) => {
                    state.stats.malformed_pkts += 1;
                    debug!("{} malformed tx sdu {}", self.trace_id, qfi);
                }
            }
        }
        self.tx_pdu_notifier.on_new_pdu(sdu, qfi);
        Ok(())
    }

    /// Uplink entry: rewrite the receive window and AccECN feedback of
    /// TCP ACKs, then forward the PDU to the upper layer. Everything
    /// else passes through untouched.
    pub fn handle_pdu(&self, mut pdu: Vec<u8>, qfi: QosFlowId, now: Instant) {
        trace!("{} rx pdu {} len={}", self.trace_id, qfi, pdu.len());
        {
            let state = &mut *self.state.lock().unwrap();
            state.stats.rx_pkts += 1;

            match packet::decode(&pdu) {
                Ok(decoded) => {
                    if let TransportHeader::Tcp(tcp) = decoded.transport {
                        self.rewrite_uplink_ack(state, &mut pdu, &decoded, tcp, now);
                    }
                }
                Err(Error::UnsupportedProtocol) => state.stats.unsupported_pkts += 1,
                Err(_) => {
                    state.stats.malformed_pkts += 1;
                    debug!("{} malformed rx pdu {}", self.trace_id, qfi);
                }
            }
        }
        self.rx_sdu_notifier.on_new_sdu(pdu, qfi);
    }

    /// Radio feedback sink. Called from a separate executor; does not
    /// touch the packet paths beyond the entity lock.
    pub fn handle_feedback(&self, feedback: DeliveryStatusFeedback, drb_id: DrbId, now: Instant) {
        debug!("{} feedback for {}: {:?}", self.trace_id, drb_id, feedback);
        let state = &mut *self.state.lock().unwrap();
        state.stats.feedback_events += 1;
        let nof_ue = state.nof_ue;

        let bearer = match state.bearers.get_mut(&drb_id) {
            Some(bearer) => bearer,
            None => {
                error!("{} feedback for unknown {}", self.trace_id, drb_id);
                return;
            }
        };
        let outcome = bearer.apply_feedback(feedback, now);
        if outcome.tx_advanced {
            self.predictor.predict(bearer);
            self.controller.update(bearer, nof_ue);
        }
        if outcome.ambiguous {
            state.stats.wrap_ambiguities += 1;
        }
    }

    /// Mark sampling for a downlink TCP segment. The CE decision only
    /// moves the flow counters here; the signal reaches the sender via
    /// the AccECN rewrite of its uplink ACKs.
    fn sample_tcp_sdu(
        &self,
        state: &mut EntityState,
        decoded: &DecodedPacket,
        tcp: &TcpHeader,
        drb_id: DrbId,
        now: Instant,
    ) {
        let (mark_l4s, mark_classic) = match state.bearers.get(&drb_id) {
            Some(bearer) => (bearer.flow_state.mark_l4s, bearer.flow_state.mark_classic),
            None => return,
        };
        let draw: u32 = state.rng.gen_range(0..MARK_PROB_MAX);
        let payload = decoded.payload_len as u64;

        let flow = state.flows.bind(decoded.five_tuple, drb_id);
        if tcp.syn {
            // Handshake segments are never sampled; they seed the
            // initial RTT estimate.
            flow.rtt.on_syn(now);
        } else {
            flow.rtt.on_data(now);
            match decoded.ecn {
                EcnCodepoint::Ect1 => {
                    if draw < mark_l4s {
                        flow.account_ce(payload);
                    } else {
                        flow.account_ecn1(payload);
                    }
                }
                EcnCodepoint::Ect0 => {
                    if draw < mark_classic {
                        flow.account_ce(payload);
                    } else {
                        flow.account_ecn0(payload);
                    }
                }
                EcnCodepoint::Ce => flow.account_ce(payload),
                EcnCodepoint::NotEct => {}
            }
        }
        if payload > 0 {
            flow.in_flight
                .on_sent(tcp.seq, decoded.payload_len, decoded.ipv4.tot_len, now);
        }

        let bearer = match state.bearers.get_mut(&drb_id) {
            Some(bearer) => bearer,
            None => return,
        };
        bearer.push_sdu(decoded.ipv4.tot_len as u32, decoded.five_tuple, now);
        if !tcp.syn {
            if decoded.ecn.is_l4s() {
                bearer.flow_state.note_l4s(now);
            } else {
                bearer.flow_state.note_classic(now);
            }
        }
        bearer.flow_state.expire(now, self.liveness_window);
    }

    /// Mark sampling for a downlink UDP datagram. A CE decision remarks
    /// the ToS byte in place, there being no ACK path to defer to.
    fn sample_udp_sdu(
        &self,
        state: &mut EntityState,
        buf: &mut [u8],
        decoded: &DecodedPacket,
        drb_id: DrbId,
        now: Instant,
    ) {
        let (mark_l4s, mark_classic) = match state.bearers.get(&drb_id) {
            Some(bearer) => (bearer.flow_state.mark_l4s, bearer.flow_state.mark_classic),
            None => return,
        };
        let draw: u32 = state.rng.gen_range(0..MARK_PROB_MAX);
        let payload = decoded.payload_len as u64;

        let flow = state.flows.bind(decoded.five_tuple, drb_id);
        let mut remark = false;
        match decoded.ecn {
            EcnCodepoint::Ect1 => {
                if draw < mark_l4s {
                    flow.account_ce(payload);
                    remark = true;
                } else {
                    flow.account_ecn1(payload);
                }
            }
            EcnCodepoint::Ect0 => {
                if draw < mark_classic {
                    flow.account_ce(payload);
                    remark = true;
                } else {
                    flow.account_ecn0(payload);
                }
            }
            EcnCodepoint::Ce => flow.account_ce(payload),
            EcnCodepoint::NotEct => {}
        }
        if remark {
            let mut ipv4 = decoded.ipv4;
            ipv4.tos |= EcnCodepoint::Ce as u8;
            if packet::write_ipv4(buf, &mut ipv4).is_err() {
                state.stats.malformed_pkts += 1;
            }
        }

        let bearer = match state.bearers.get_mut(&drb_id) {
            Some(bearer) => bearer,
            None => return,
        };
        bearer.push_sdu(decoded.ipv4.tot_len as u32, decoded.five_tuple, now);
        if decoded.ecn.is_l4s() {
            bearer.flow_state.note_l4s(now);
        } else {
            bearer.flow_state.note_classic(now);
        }
        bearer.flow_state.expire(now, self.liveness_window);
    }

    /// The uplink ACK path: match the ACK to its downlink flow, pop the
    /// in-flight FIFO, run the receive-window law, fold in AccECN
    /// feedback, and recompute the checksum.
    fn rewrite_uplink_ack(
        &self,
        state: &mut EntityState,
        buf: &mut [u8],
        decoded: &DecodedPacket,
        mut tcp: TcpHeader,
        now: Instant,
    ) {
        if !tcp.ack {
            return;
        }
        let flow = match state.flows.get_mut(&decoded.ack_five_tuple) {
            Some(flow) => flow,
            None => return,
        };
        let drb_id = flow.drb_id;
        flow.lower_ack_raw(tcp.ack_seq);
        if let Some(rtt) = flow.in_flight.on_ack(tcp.ack_seq, now) {
            trace!(
                "{} {} ack rtt_sample={:?} in_flight={}",
                self.trace_id,
                decoded.ack_five_tuple,
                rtt,
                flow.in_flight.len()
            );
        }
        let counters = accecn::derive_counters(flow, tcp.ack_seq, decoded.ecn);

        let (pred_qdelay, pred_rate) = match state.bearers.get(&drb_id) {
            Some(bearer) => (
                bearer.flow_state.predicted_qdelay,
                bearer.flow_state.predicted_dequeue_rate,
            ),
            None => (0.0, 0.0),
        };
        tcp.window = state.rwnd.update(pred_qdelay, pred_rate);

        let mut ok = true;
        if let Some(counters) = counters {
            ok &= accecn::rewrite(buf, &decoded.ipv4, &mut tcp, &counters).is_ok();
        }
        ok &= packet::write_tcp(buf, &decoded.ipv4, &mut tcp).is_ok();
        if !ok {
            state.stats.malformed_pkts += 1;
        }
    }
}
