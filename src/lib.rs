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

//! RANMARK is an in-path congestion-signalling module for the user plane
//! of a 5G radio access network.
//!
//! One [`MarkEntity`] sits per UE PDU session between the upper
//! convergence layer and the radio link layer. It observes every
//! downlink IP packet, estimates the per-bearer radio dequeue rate and
//! the queuing delay of the packets standing in the bearer's ingress
//! queue, and steers end-host congestion control from that estimate:
//!
//! * downlink UDP datagrams are CE-marked in place with a probability
//!   set per bearer and flow class;
//! * downlink TCP segments are left untouched, and the marking decision
//!   is instead folded into the flow's uplink ACKs as synthetic AccECN
//!   feedback;
//! * the advertised TCP receive window on the uplink is rewritten by a
//!   delay-and-throughput control law.
//!
//! The module is driven by three inputs: downlink SDUs
//! ([`MarkEntity::handle_sdu`]), uplink PDUs ([`MarkEntity::handle_pdu`])
//! and asynchronous radio delivery reports
//! ([`MarkEntity::handle_feedback`]).

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

/// The exclusive upper bound of the mark sampler's uniform draw. A mark
/// threshold of `MARK_PROB_MAX` marks every packet; zero marks none.
pub const MARK_PROB_MAX: u32 = i32::MAX as u32;

/// Result of marking operations.
pub type Result<T> = std::result::Result<T, error::Error>;

/// An identifier of a data radio bearer within one UE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrbId(pub u8);

impl std::fmt::Display for DrbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "drb{}", self.0)
    }
}

/// An identifier of a QoS flow within one PDU session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QosFlowId(pub u8);

impl std::fmt::Display for QosFlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "qfi{}", self.0)
    }
}

/// RLC transfer mode a bearer is configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RlcMode {
    /// Acknowledged mode.
    Am,

    /// Unacknowledged mode.
    Um,
}

/// Canonical TCP/UDP flow identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Source address.
    pub src_addr: Ipv4Addr,

    /// Destination address.
    pub dst_addr: Ipv4Addr,

    /// Source port.
    pub src_port: u16,

    /// Destination port.
    pub dst_port: u16,

    /// Transport protocol number.
    pub protocol: u8,
}

impl FiveTuple {
    /// The same flow as seen from the opposite direction: an uplink ACK
    /// carries the downlink flow's tuple with source and destination
    /// swapped.
    pub fn ack_side(&self) -> FiveTuple {
        FiveTuple {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

impl Default for FiveTuple {
    fn default() -> Self {
        FiveTuple {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
        }
    }
}

impl std::fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{} proto={}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

/// Configuration of a [`MarkEntity`].
///
/// The defaults match the deployed controller; the set methods exist for
/// lab experiments.
#[derive(Clone, Debug)]
pub struct MarkConfig {
    /// Trailing window of transmitted records the rate prediction runs
    /// over.
    rate_window: usize,

    /// Queuing-delay target of the L4S class in microseconds.
    l4s_delay_target_us: f64,

    /// Standing-queue budget of the classic class in bytes, shared
    /// across active UEs.
    classic_queue_budget: u32,

    /// How long a flow class stays "present" on a bearer after its last
    /// packet.
    liveness_window: Duration,

    /// Gain of the receive-window control law.
    rwnd_gamma: f64,

    /// Weight of the receive-window throughput term.
    rwnd_alpha: f64,

    /// Lower saturation of the advertised receive window.
    min_rwnd: u16,
}

impl MarkConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        MarkConfig {
            rate_window: 50,
            l4s_delay_target_us: 10_000.0,
            classic_queue_budget: 1500 * 150,
            liveness_window: Duration::from_secs(1),
            rwnd_gamma: 0.1,
            rwnd_alpha: 0.5,
            min_rwnd: 1,
        }
    }

    /// Set the rate prediction window, in records.
    pub fn set_rate_window(&mut self, window: usize) {
        self.rate_window = window.max(1);
    }

    /// Set the L4S queuing-delay target in milliseconds.
    pub fn set_l4s_delay_target(&mut self, target_ms: u64) {
        self.l4s_delay_target_us = (target_ms * 1000) as f64;
    }

    /// Set the classic standing-queue budget in bytes.
    pub fn set_classic_queue_budget(&mut self, budget: u32) {
        self.classic_queue_budget = budget;
    }

    /// Set the class liveness window in milliseconds.
    pub fn set_liveness_window(&mut self, window_ms: u64) {
        self.liveness_window = Duration::from_millis(window_ms);
    }

    pub(crate) fn rate_window(&self) -> usize {
        self.rate_window
    }

    pub(crate) fn l4s_delay_target_us(&self) -> f64 {
        self.l4s_delay_target_us
    }

    pub(crate) fn classic_queue_budget(&self) -> u32 {
        self.classic_queue_budget
    }

    pub(crate) fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    pub(crate) fn rwnd_gamma(&self) -> f64 {
        self.rwnd_gamma
    }

    pub(crate) fn rwnd_alpha(&self) -> f64 {
        self.rwnd_alpha
    }

    pub(crate) fn min_rwnd(&self) -> u16 {
        self.min_rwnd
    }
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink of the downlink path: the entity hands every processed SDU to
/// the lower layer as a PDU through this notifier.
pub trait MarkTxPduNotifier: Send + Sync {
    /// Invoked for each generated PDU.
    fn on_new_pdu(&self, pdu: Vec<u8>, qfi: QosFlowId);
}

/// Sink of the uplink path: the entity hands every processed PDU to the
/// upper layer as an SDU through this notifier.
pub trait MarkRxSduNotifier: Send + Sync {
    /// Invoked for each generated SDU.
    fn on_new_sdu(&self, sdu: Vec<u8>, qfi: QosFlowId);
}

pub use crate::bearer::DeliveryStatusFeedback;
pub use crate::entity::EntityStats;
pub use crate::entity::MarkEntity;
pub use crate::error::Error;
pub use crate::packet::EcnCodepoint;

mod accecn;
mod bearer;
mod codec;
pub mod entity;
pub mod error;
mod flow;
mod mark;
pub mod packet;
mod rate;
mod rwnd;
