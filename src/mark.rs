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

//! CE-mark probability control.
//!
//! Each bearer carries one threshold per flow class, compared against a
//! uniform draw in `[0, MARK_PROB_MAX)` for every sampled packet. The
//! controller reruns whenever radio feedback advances the TX cursor and
//! converts the current rate prediction into fresh thresholds.

use std::time::Duration;
use std::time::Instant;

use log::*;

use crate::bearer::Bearer;
use crate::MARK_PROB_MAX;

/// Numerator of the classic mark probability: one MSS worth of bits with
/// a 1.75 damping factor.
const CLASSIC_GAIN: f64 = 1460.0 * 8.0 * 1.75;

/// Flow presence and marking state of one bearer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DrbFlowState {
    /// Mark threshold for L4S packets.
    pub mark_l4s: u32,

    /// Mark threshold for classic packets.
    pub mark_classic: u32,

    /// Whether an L4S flow is live on the bearer.
    pub have_l4s: bool,

    /// Whether a classic flow is live on the bearer.
    pub have_classic: bool,

    /// When an L4S packet was last seen.
    pub l4s_last_seen: Option<Instant>,

    /// When a classic packet was last seen.
    pub classic_last_seen: Option<Instant>,

    /// Dequeue rate required to drain the standing queue within the L4S
    /// delay target, bytes/us.
    pub required_dequeue_rate: f64,

    /// Latest predicted dequeue rate, bytes/us.
    pub predicted_dequeue_rate: f64,

    /// Latest predicted dequeue rate error, bytes/us.
    pub predicted_error: f64,

    /// Latest predicted standing-queue delay, us.
    pub predicted_qdelay: f64,
}

impl DrbFlowState {
    /// Note a live L4S packet.
    pub fn note_l4s(&mut self, now: Instant) {
        self.have_l4s = true;
        self.l4s_last_seen = Some(now);
    }

    /// Note a live classic packet.
    pub fn note_classic(&mut self, now: Instant) {
        self.have_classic = true;
        self.classic_last_seen = Some(now);
    }

    /// Clear presence flags whose class has been quiet for longer than
    /// the liveness window.
    pub fn expire(&mut self, now: Instant, window: Duration) {
        if self
            .l4s_last_seen
            .map_or(true, |t| now.saturating_duration_since(t) > window)
        {
            self.have_l4s = false;
        }
        if self
            .classic_last_seen
            .map_or(true, |t| now.saturating_duration_since(t) > window)
        {
            self.have_classic = false;
        }
    }
}

/// Converts the rate prediction of a bearer into per-class CE-mark
/// thresholds.
#[derive(Clone, Copy, Debug)]
pub struct MarkController {
    /// Queuing-delay target for the L4S class, us.
    l4s_delay_target_us: f64,

    /// Standing-queue budget for the classic class in bytes, shared
    /// across active UEs.
    classic_queue_budget: u32,
}

impl MarkController {
    pub fn new(l4s_delay_target_us: f64, classic_queue_budget: u32) -> Self {
        MarkController {
            l4s_delay_target_us,
            classic_queue_budget,
        }
    }

    /// Recompute both thresholds from the tail record's prediction. The
    /// two classes are controlled independently; a class without live
    /// flows keeps its previous threshold.
    pub fn update(&self, bearer: &mut Bearer, nof_ue: usize) {
        let tail = match bearer.records().last() {
            Some(tail) => *tail,
            None => return,
        };
        let required = tail.standing_queue_size / self.l4s_delay_target_us;
        let predicted = tail.pred_dequeue_rate;
        let error = tail.est_dequeue_rate_error;
        let qdelay = tail.est_queue_delay;

        let state = &mut bearer.flow_state;
        state.required_dequeue_rate = required;
        state.predicted_dequeue_rate = predicted;
        state.predicted_error = error;
        state.predicted_qdelay = qdelay;
        debug!(
            "{} required_dequeue_rate={} predicted_dequeue_rate={} predicted_error={} \
             est_queue_delay={} queue_size={}",
            bearer.drb_id, required, predicted, error, qdelay, tail.standing_queue_size
        );

        if state.have_l4s {
            state.mark_l4s = if required > predicted + error {
                MARK_PROB_MAX
            } else if required < predicted - error {
                0
            } else if error > 0.0 {
                (((required - predicted + error) / (2.0 * error)) * MARK_PROB_MAX as f64) as u32
            } else {
                // The prediction is exact and sits on the requirement.
                MARK_PROB_MAX / 2
            };
        }

        if state.have_classic {
            let threshold = self.classic_queue_budget / nof_ue.max(1) as u32;
            state.mark_classic = if tail.standing_queue_size > threshold as f64 {
                if predicted > 0.0 && qdelay > 0.0 {
                    let p = CLASSIC_GAIN / (2.0 * predicted * qdelay);
                    ((p * p).min(1.0) * MARK_PROB_MAX as f64) as u32
                } else {
                    0
                }
            } else {
                0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::Bearer;
    use crate::DrbId;
    use crate::FiveTuple;
    use crate::RlcMode;

    /// A bearer whose tail record carries the given prediction.
    fn predicted_bearer(
        standing: f64,
        pred_rate: f64,
        pred_error: f64,
        est_delay: f64,
    ) -> Bearer {
        let mut bearer = Bearer::new(DrbId(1), RlcMode::Am);
        bearer.push_sdu(1500, FiveTuple::default(), Instant::now());
        let tail = bearer.records.last_mut().unwrap();
        tail.standing_queue_size = standing;
        tail.pred_dequeue_rate = pred_rate;
        tail.est_dequeue_rate_error = pred_error;
        tail.est_queue_delay = est_delay;
        bearer
    }

    fn controller() -> MarkController {
        MarkController::new(10_000.0, 1500 * 150)
    }

    #[test]
    fn l4s_marks_everything_when_rate_falls_short() {
        // Q = 200 kB over a 10 ms target needs 20 B/us; the radio
        // delivers 10 +- 1.
        let mut bearer = predicted_bearer(200_000.0, 10.0, 1.0, 20_000.0);
        bearer.flow_state.note_l4s(Instant::now());
        controller().update(&mut bearer, 1);
        assert_eq!(bearer.flow_state.mark_l4s, MARK_PROB_MAX);
        assert_eq!(bearer.flow_state.required_dequeue_rate, 20.0);
    }

    #[test]
    fn l4s_marks_nothing_when_rate_is_ample() {
        let mut bearer = predicted_bearer(50_000.0, 10.0, 1.0, 5_000.0);
        bearer.flow_state.note_l4s(Instant::now());
        controller().update(&mut bearer, 1);
        assert_eq!(bearer.flow_state.mark_l4s, 0);
    }

    #[test]
    fn l4s_ramps_linearly_inside_the_error_band() {
        // required == predicted: the ramp midpoint.
        let mut bearer = predicted_bearer(100_000.0, 10.0, 2.0, 10_000.0);
        bearer.flow_state.note_l4s(Instant::now());
        controller().update(&mut bearer, 1);
        let half = MARK_PROB_MAX / 2;
        let mark = bearer.flow_state.mark_l4s;
        assert!(mark > half - 2 && mark < half + 2, "mark = {}", mark);
    }

    #[test]
    fn classic_idle_below_queue_budget() {
        let mut bearer = predicted_bearer(10_000.0, 10.0, 1.0, 1_000.0);
        bearer.flow_state.note_classic(Instant::now());
        bearer.flow_state.mark_classic = 12345;
        controller().update(&mut bearer, 1);
        assert_eq!(bearer.flow_state.mark_classic, 0);
    }

    #[test]
    fn classic_squares_the_probability_above_budget() {
        let mut bearer = predicted_bearer(300_000.0, 1.0, 0.1, 50_000.0);
        bearer.flow_state.note_classic(Instant::now());
        controller().update(&mut bearer, 1);

        let p = CLASSIC_GAIN / (2.0 * 1.0 * 50_000.0);
        let expected = ((p * p) * MARK_PROB_MAX as f64) as u32;
        assert_eq!(bearer.flow_state.mark_classic, expected);
        assert!(bearer.flow_state.mark_classic > 0);
    }

    #[test]
    fn classic_budget_splits_across_ues() {
        // 300 kB standing: above the budget only once it is split
        // between two UEs.
        let mut bearer = predicted_bearer(150_000.0, 1.0, 0.1, 50_000.0);
        bearer.flow_state.note_classic(Instant::now());
        controller().update(&mut bearer, 1);
        assert_eq!(bearer.flow_state.mark_classic, 0);

        controller().update(&mut bearer, 2);
        assert!(bearer.flow_state.mark_classic > 0);
    }

    #[test]
    fn thresholds_stay_in_probability_bounds() {
        let cases = [
            (0.0, 0.0, 0.0, 0.0),
            (1e9, 0.001, 0.0, 1e9),
            (1e9, 1000.0, 1e-12, 0.001),
            (200_000.0, 10.0, 1.0, 20_000.0),
            (1.0, 1e9, 1e9, 1.0),
        ];
        for (standing, rate, error, delay) in cases {
            let mut bearer = predicted_bearer(standing, rate, error, delay);
            let now = Instant::now();
            bearer.flow_state.note_l4s(now);
            bearer.flow_state.note_classic(now);
            controller().update(&mut bearer, 1);
            assert!(bearer.flow_state.mark_l4s <= MARK_PROB_MAX);
            assert!(bearer.flow_state.mark_classic <= MARK_PROB_MAX);
        }
    }

    #[test]
    fn liveness_flags_decay() {
        let now = Instant::now();
        let window = Duration::from_secs(1);
        let mut state = DrbFlowState::default();

        state.note_l4s(now);
        state.note_classic(now);
        state.expire(now + Duration::from_millis(500), window);
        assert!(state.have_l4s);
        assert!(state.have_classic);

        state.note_classic(now + Duration::from_millis(800));
        state.expire(now + Duration::from_millis(1500), window);
        assert!(!state.have_l4s);
        assert!(state.have_classic);

        state.expire(now + Duration::from_millis(2500), window);
        assert!(!state.have_classic);
    }
}
