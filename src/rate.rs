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

//! Dequeue-rate prediction.
//!
//! The next-packet dequeue rate is predicted as the mean of the realised
//! rate over a trailing window of transmitted records, with the standard
//! deviation over the same window as the error estimate. From the
//! prediction, the standing queue's expected drain delay follows.

use crate::bearer::Bearer;

/// Predicts the dequeue rate and standing-queue delay of a bearer.
#[derive(Clone, Copy, Debug)]
pub struct RatePredictor {
    /// Number of trailing transmitted records the statistics run over.
    window: usize,
}

impl RatePredictor {
    pub fn new(window: usize) -> Self {
        RatePredictor { window }
    }

    /// Recompute the prediction after the TX cursor advanced and store it
    /// on the queue's tail record: `pred_dequeue_rate` and
    /// `est_dequeue_rate_error` from the windowed statistics, then
    /// `standing_queue_size` and `est_queue_delay` for the packets still
    /// standing in the queue.
    pub fn predict(&self, bearer: &mut Bearer) {
        if bearer.records.is_empty() {
            return;
        }
        let next_tx_id = bearer.next_tx_id;
        if next_tx_id == 0 {
            return;
        }

        let start = next_tx_id.saturating_sub(self.window);
        let samples = next_tx_id - start;
        let mean = bearer.records[start..next_tx_id]
            .iter()
            .map(|r| r.cal_dequeue_rate)
            .sum::<f64>()
            / samples as f64;
        let variance = bearer.records[start..next_tx_id]
            .iter()
            .map(|r| {
                let d = mean - r.cal_dequeue_rate;
                d * d
            })
            .sum::<f64>()
            / samples as f64;
        let std_dev = variance.sqrt();

        let standing_queue_size = bearer.standing_queue_size();
        let est_queue_delay = if mean > 0.0 {
            standing_queue_size / mean
        } else {
            0.0
        };

        if let Some(tail) = bearer.records.last_mut() {
            tail.pred_dequeue_rate = mean;
            tail.est_dequeue_rate_error = std_dev;
            tail.standing_queue_size = standing_queue_size;
            tail.est_queue_delay = est_queue_delay;
        }
    }
}
