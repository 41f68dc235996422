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

//! Receive-window control on the uplink ACK path.
//!
//! The advertised TCP window is steered by a delay-and-throughput law:
//! the delay term shrinks the window in proportion to how far the
//! predicted queuing delay has drifted above its running minimum, and the
//! throughput term grants headroom while the predicted dequeue rate sits
//! below its running maximum.

/// Delay and throughput window controller for one entity.
#[derive(Clone, Copy, Debug)]
pub struct RwndController {
    /// Current window, fractional between updates.
    rwnd: f64,

    /// Running minimum of the predicted queuing delay, us.
    min_rtt: f64,

    /// Running maximum of the predicted dequeue rate, bytes/us.
    max_tput: f64,

    /// Update gain.
    gamma: f64,

    /// Weight of the throughput headroom term.
    alpha: f64,

    /// Lower saturation of the advertised window.
    min_window: u16,
}

impl RwndController {
    pub fn new(gamma: f64, alpha: f64, min_window: u16) -> Self {
        RwndController {
            rwnd: 100.0,
            min_rtt: 10.0,
            max_tput: 1000.0,
            gamma,
            alpha,
            min_window,
        }
    }

    /// Run one control step against the bearer's current predictions and
    /// return the window to advertise.
    ///
    /// With no positive delay prediction yet, the delay ratio is taken as
    /// one and the step reduces to the throughput term.
    pub fn update(&mut self, pred_qdelay: f64, pred_rate: f64) -> u16 {
        if pred_qdelay > 0.0 {
            self.min_rtt = self.min_rtt.min(pred_qdelay);
        }
        self.max_tput = self.max_tput.max(pred_rate);

        let delay_term = if pred_qdelay > 0.0 {
            self.rwnd * self.min_rtt / pred_qdelay
        } else {
            self.rwnd
        };
        let tput_term = self.alpha * (1.0 - pred_rate / self.max_tput);
        self.rwnd = (1.0 - self.gamma) * self.rwnd + self.gamma * (delay_term + tput_term);

        if self.rwnd < self.min_window as f64 {
            self.min_window
        } else {
            self.rwnd.min(u16::MAX as f64) as u16
        }
    }

    /// The current fractional window.
    pub fn window(&self) -> f64 {
        self.rwnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_step() {
        // One step from the initial state: delay twice the minimum and
        // rate at half the maximum.
        // 0.9*100 + 0.1*(10/20)*100 + 0.1*0.5*(1 - 500/1000) = 95.025
        let mut ctrl = RwndController::new(0.1, 0.5, 1);
        let advertised = ctrl.update(20.0, 500.0);
        assert!((ctrl.window() - 95.025).abs() < 1e-9);
        assert_eq!(advertised, 95);
    }

    #[test]
    fn window_tracks_running_extrema() {
        let mut ctrl = RwndController::new(0.1, 0.5, 1);
        ctrl.update(5.0, 2000.0);
        ctrl.update(20.0, 500.0);
        // min_rtt dropped to 5 and max_tput rose to 2000.
        let before = ctrl.window();
        let steady = (1.0 - 0.1) * before
            + 0.1 * (before * 5.0 / 20.0 + 0.5 * (1.0 - 500.0 / 2000.0));
        ctrl.update(20.0, 500.0);
        assert!((ctrl.window() - steady).abs() < 1e-9);
    }

    #[test]
    fn window_saturates_low() {
        let mut ctrl = RwndController::new(0.1, 0.5, 1);
        // Persistent large delay starves the window down to the floor.
        let mut advertised = u16::MAX;
        for _ in 0..2000 {
            advertised = ctrl.update(1e9, 1000.0);
        }
        assert_eq!(advertised, 1);
    }

    #[test]
    fn missing_delay_prediction_keeps_window() {
        let mut ctrl = RwndController::new(0.1, 0.5, 1);
        // No delay prediction and rate at the maximum: both terms are
        // neutral, so the window must not move.
        let advertised = ctrl.update(0.0, 1000.0);
        assert!((ctrl.window() - 100.0).abs() < 1e-9);
        assert_eq!(advertised, 100);
    }
}
