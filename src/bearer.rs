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

//! Per-bearer ingress queue and radio feedback application.
//!
//! Every downlink SDU appends one record to the bearer's queue; records
//! are never removed within the entity's lifetime. Two cursors split the
//! queue: `[0, next_delivery_id)` is confirmed delivered,
//! `[next_delivery_id, next_tx_id)` is confirmed transmitted, and
//! `[next_tx_id, len)` is the standing queue. Radio feedback walks the
//! queue forward from a cursor, stamping timestamps and dequeue-rate
//! measurements, and never moves a cursor backwards.

use std::time::Instant;

use log::*;

use crate::error::Error;
use crate::mark::DrbFlowState;
use crate::DrbId;
use crate::FiveTuple;
use crate::Result;
use crate::RlcMode;

/// Feedback measuring intervals shorter than this are too noisy for a
/// rate sample; the previous sample is reused instead.
const MIN_RATE_INTERVAL_US: f64 = 1000.0;

/// Highest PDCP sequence numbers reported by the radio layer for one
/// bearer. A zero field means "no update".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStatusFeedback {
    /// Highest SN handed to the air interface.
    pub highest_pdcp_sn_transmitted: u32,

    /// Highest SN confirmed received by the UE.
    pub highest_pdcp_sn_delivered: u32,

    /// Highest retransmitted SN handed to the air interface.
    pub highest_pdcp_sn_retransmitted: u32,

    /// Highest retransmitted SN confirmed received by the UE.
    pub highest_pdcp_sn_delivered_retransmitted: u32,
}

/// What one feedback message did to the bearer.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeedbackOutcome {
    /// The TX cursor moved, so prediction and marking must rerun.
    pub tx_advanced: bool,

    /// A reported SN sat exactly half the sequence space away from a
    /// queue record and its walk was cut short.
    pub ambiguous: bool,
}

/// One downlink SDU in the bearer's ingress queue, with the timestamps
/// and estimates accumulated over its life.
#[derive(Clone, Copy, Debug)]
pub struct QueueRecord {
    /// Assigned PDCP sequence number, modulo the configured SN space.
    pub pdcp_sn: u32,

    /// IP total length of the SDU in bytes.
    pub size: u32,

    /// When the SDU entered the entity.
    pub ingress_time: Instant,

    /// When the radio layer reported it transmitted.
    pub transmitted_time: Option<Instant>,

    /// When the radio layer reported it delivered to the UE.
    pub delivered_time: Option<Instant>,

    /// Standing queue size at prediction time, bytes.
    pub standing_queue_size: f64,

    /// Dequeue rate measured when the transmitted report arrived,
    /// bytes/us.
    pub cal_dequeue_rate: f64,

    /// Predicted dequeue rate, bytes/us.
    pub pred_dequeue_rate: f64,

    /// Estimated dequeue rate error at prediction time, bytes/us.
    pub est_dequeue_rate_error: f64,

    /// Realised queuing delay, us.
    pub queue_delay: f64,

    /// Predicted queuing delay, us.
    pub est_queue_delay: f64,

    /// Realised minus predicted dequeue rate.
    pub dequeue_rate_error: f64,

    /// Realised minus predicted queuing delay.
    pub queue_delay_error: f64,

    /// The flow the SDU belongs to.
    pub five_tuple: FiveTuple,
}

/// State of one data radio bearer.
#[derive(Debug)]
pub struct Bearer {
    /// Bearer identity.
    pub drb_id: DrbId,

    /// RLC mode the bearer was configured with.
    pub rlc_mode: RlcMode,

    /// PDCP SN width in bits, 12 or 18.
    sn_bits: u8,

    /// SN modulus, `2^sn_bits`.
    sn_max: u32,

    /// Ingress queue, append-only.
    pub(crate) records: Vec<QueueRecord>,

    /// Index of the first record not yet confirmed transmitted.
    pub(crate) next_tx_id: usize,

    /// Index of the first record not yet confirmed delivered.
    pub(crate) next_delivery_id: usize,

    /// Monotonic SN counter for the next appended record.
    pub(crate) next_pdcp_sn: u32,

    /// Flow presence and marking probabilities for this bearer.
    pub flow_state: DrbFlowState,
}

impl Bearer {
    /// Create a bearer with the default 12-bit SN space.
    pub fn new(drb_id: DrbId, rlc_mode: RlcMode) -> Self {
        Bearer {
            drb_id,
            rlc_mode,
            sn_bits: 12,
            sn_max: 1 << 12,
            records: Vec::new(),
            next_tx_id: 0,
            next_delivery_id: 0,
            next_pdcp_sn: 0,
            flow_state: DrbFlowState::default(),
        }
    }

    /// Set the PDCP SN width. Only 12 and 18 bit spaces exist.
    pub fn set_sn_size(&mut self, sn_bits: u8) -> Result<()> {
        if sn_bits != 12 && sn_bits != 18 {
            return Err(Error::InvalidConfig(format!(
                "pdcp sn size {} not in {{12, 18}}",
                sn_bits
            )));
        }
        self.sn_bits = sn_bits;
        self.sn_max = 1 << sn_bits;
        Ok(())
    }

    /// PDCP SN width in bits.
    pub fn sn_bits(&self) -> u8 {
        self.sn_bits
    }

    /// Append a downlink SDU and return its assigned PDCP SN.
    pub fn push_sdu(&mut self, size: u32, five_tuple: FiveTuple, now: Instant) -> u32 {
        let pdcp_sn = self.next_pdcp_sn % self.sn_max;
        self.next_pdcp_sn = self.next_pdcp_sn.wrapping_add(1);
        self.records.push(QueueRecord {
            pdcp_sn,
            size,
            ingress_time: now,
            transmitted_time: None,
            delivered_time: None,
            standing_queue_size: 0.0,
            cal_dequeue_rate: 0.0,
            pred_dequeue_rate: 0.0,
            est_dequeue_rate_error: 0.0,
            queue_delay: 0.0,
            est_queue_delay: 0.0,
            dequeue_rate_error: 0.0,
            queue_delay_error: 0.0,
            five_tuple,
        });
        pdcp_sn
    }

    /// Apply one feedback message. The TX walks run before the delivery
    /// walks so `next_delivery_id <= next_tx_id` holds at every point.
    pub fn apply_feedback(&mut self, feedback: DeliveryStatusFeedback, now: Instant) -> FeedbackOutcome {
        let mut outcome = FeedbackOutcome::default();

        if feedback.highest_pdcp_sn_retransmitted != 0 {
            let (advanced, ambiguous) =
                self.apply_tx_walk(feedback.highest_pdcp_sn_retransmitted, now);
            outcome.tx_advanced |= advanced;
            outcome.ambiguous |= ambiguous;
        }
        if feedback.highest_pdcp_sn_transmitted != 0 {
            let (advanced, ambiguous) =
                self.apply_tx_walk(feedback.highest_pdcp_sn_transmitted, now);
            outcome.tx_advanced |= advanced;
            outcome.ambiguous |= ambiguous;
        }
        if feedback.highest_pdcp_sn_delivered_retransmitted != 0 {
            outcome.ambiguous |=
                self.apply_delivery_walk(feedback.highest_pdcp_sn_delivered_retransmitted, now);
        }
        if feedback.highest_pdcp_sn_delivered != 0 {
            outcome.ambiguous |= self.apply_delivery_walk(feedback.highest_pdcp_sn_delivered, now);
        }
        outcome
    }

    /// Sum of record sizes not yet reported transmitted, bytes.
    pub fn standing_queue_size(&self) -> f64 {
        self.records[self.next_tx_id..]
            .iter()
            .map(|r| r.size as f64)
            .sum()
    }

    /// The queue records, oldest first.
    pub fn records(&self) -> &[QueueRecord] {
        &self.records
    }

    /// Index of the first record not yet confirmed transmitted.
    pub fn next_tx_id(&self) -> usize {
        self.next_tx_id
    }

    /// Index of the first record not yet confirmed delivered.
    pub fn next_delivery_id(&self) -> usize {
        self.next_delivery_id
    }

    /// Whether `sn` is covered by a report of `reported` as the highest
    /// transmitted/delivered SN, under modular comparison with a
    /// half-range window. A distance of exactly half the SN space cannot
    /// be told apart from its wrap-around image.
    fn sn_covered(&self, sn: u32, reported: u32) -> Result<bool> {
        let dist = (reported.wrapping_add(self.sn_max).wrapping_sub(sn)) % self.sn_max;
        if dist == self.sn_max / 2 {
            return Err(Error::SequenceWrapAmbiguous);
        }
        Ok(dist < self.sn_max / 2)
    }

    /// The walk end index starting at `from`: one past the last record
    /// covered by `reported`. The second value flags wrap ambiguity.
    fn walk_end(&self, from: usize, reported: u32) -> (usize, bool) {
        let mut i = from;
        while i < self.records.len() {
            match self.sn_covered(self.records[i].pdcp_sn, reported) {
                Ok(true) => i += 1,
                Ok(false) => break,
                Err(_) => {
                    warn!(
                        "{} feedback sn {} is half the sn space away from sn {}",
                        self.drb_id, reported, self.records[i].pdcp_sn
                    );
                    return (i, true);
                }
            }
        }
        (i, false)
    }

    /// Stamp transmitted times and dequeue-rate measurements over the
    /// records covered by `reported`, then advance the TX cursor.
    fn apply_tx_walk(&mut self, reported: u32, now: Instant) -> (bool, bool) {
        let (end, ambiguous) = self.walk_end(self.next_tx_id, reported);

        // Dequeue rate over the advance range: bytes confirmed by this
        // report over the time since the previous report. Until a first
        // report has been applied there is no interval to measure.
        let mut rate = 0.0;
        if self.next_tx_id > 0 {
            let total_size: f64 = self.records[self.next_tx_id..end]
                .iter()
                .map(|r| r.size as f64)
                .sum();
            let prev = &self.records[self.next_tx_id - 1];
            let total_time = prev
                .transmitted_time
                .map(|t| now.saturating_duration_since(t).as_micros() as f64)
                .unwrap_or(0.0);
            rate = if total_time < MIN_RATE_INTERVAL_US {
                prev.cal_dequeue_rate
            } else {
                total_size / total_time
            };
        }

        for record in &mut self.records[self.next_tx_id..end] {
            record.transmitted_time = Some(now);
            record.cal_dequeue_rate = rate;
            if record.pred_dequeue_rate > 0.0 {
                record.dequeue_rate_error = record.cal_dequeue_rate - record.pred_dequeue_rate;
            }
            record.queue_delay = now.saturating_duration_since(record.ingress_time).as_micros() as f64;
            if record.est_queue_delay > 0.0 {
                record.queue_delay_error = record.queue_delay - record.est_queue_delay;
            }
            trace!(
                "{} sn={} dequeue_rate_cal={} dequeue_rate_pred={} queue_delay={}",
                self.drb_id,
                record.pdcp_sn,
                record.cal_dequeue_rate,
                record.pred_dequeue_rate,
                record.queue_delay
            );
        }

        let advanced = end > self.next_tx_id;
        if advanced {
            self.next_tx_id = end;
        }
        (advanced, ambiguous)
    }

    /// Stamp delivered times over the records covered by `reported`, then
    /// advance the delivery cursor. The walk never outruns the TX cursor.
    fn apply_delivery_walk(&mut self, reported: u32, now: Instant) -> bool {
        let (end, ambiguous) = self.walk_end(self.next_delivery_id, reported);
        let end = end.min(self.next_tx_id);

        for record in &mut self.records[self.next_delivery_id..end] {
            record.delivered_time = Some(now);
        }
        if end > self.next_delivery_id {
            self.next_delivery_id = end;
        }
        ambiguous
    }
}
