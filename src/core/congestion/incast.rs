//! Incast 检测
//! Incast detection for adaptive subflow suppression.
//!
//! A round is one completed alpha window of the initial subflow. When every established
//! subflow sits at the minimum window for `incast_threshold` consecutive rounds the
//! connection falls back to its initial subflow. Suppression ends once the initial
//! subflow has grown above the floor without marks or recovery for `exit_threshold`
//! consecutive rounds.

use crate::config::AdaptiveSubflowConfig;
use tracing::debug;

/// The part of a subflow's state the detector looks at.
/// 检测器关心的子流状态。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubflowSample {
    pub established: bool,
    pub cwnd_packets: u32,
    pub marked_fraction: f64,
    /// In fast recovery or timeout recovery.
    pub recovering: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IncastDetector {
    congested_rounds: u32,
    clean_rounds: u32,
}

impl IncastDetector {
    pub fn detected(&self, config: &AdaptiveSubflowConfig) -> bool {
        self.congested_rounds >= config.incast_threshold.max(1)
    }

    /// Accounts for one round. `samples[0]` is the initial subflow.
    ///
    /// 统计一轮。`samples[0]` 为初始子流。
    pub fn on_round(&mut self, config: &AdaptiveSubflowConfig, min_cwnd_packets: u32, samples: &[SubflowSample]) {
        let Some(initial) = samples.first() else {
            return;
        };
        if self.detected(config) {
            let clean = initial.cwnd_packets > min_cwnd_packets
                && initial.marked_fraction == 0.0
                && !initial.recovering;
            if clean {
                self.clean_rounds += 1;
            } else {
                self.clean_rounds = 0;
            }
            if self.clean_rounds >= config.exit_threshold {
                self.clean_rounds = 0;
                self.congested_rounds = 0;
                debug!("Incast cleared, re-enabling extra subflows");
            }
            return;
        }

        let established = samples.iter().filter(|s| s.established).count();
        let collapsed = established >= 2
            && samples
                .iter()
                .filter(|s| s.established)
                .all(|s| s.cwnd_packets <= min_cwnd_packets && !s.recovering);
        if collapsed {
            self.congested_rounds += 1;
            if self.detected(config) {
                debug!(rounds = self.congested_rounds, "Incast detected, suppressing extra subflows");
            }
        } else {
            self.congested_rounds = 0;
        }
    }
}
