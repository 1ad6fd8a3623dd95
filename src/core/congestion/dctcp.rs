//! DCTCP 风格的 ECN 响应
//! DCTCP-style response to ECN echoes.

use crate::config::{EcnConfig, EcnReduction, EcnResponse};
use tracing::debug;

/// Per-subflow DCTCP estimator.
/// 每个子流的 DCTCP 估计器。
#[derive(Debug, Clone)]
pub struct DctcpState {
    alpha: f64,
    marked_acks: u32,
    total_acks: u32,
    /// `alpha` is refreshed once an ACK passes this sequence.
    alpha_update_seq: u32,
    /// No reduction until `highest_ack + 1` passes this sequence.
    reduce_seq: u32,
    last_fraction: f64,
    ece_seen: bool,
}

impl Default for DctcpState {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            marked_acks: 0,
            total_acks: 0,
            alpha_update_seq: 0,
            reduce_seq: 0,
            last_fraction: 0.0,
            ece_seen: false,
        }
    }
}

impl DctcpState {
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Fraction of ACKs that echoed congestion in the last completed window.
    pub fn last_fraction(&self) -> f64 {
        self.last_fraction
    }

    /// Whether the most recent ACK carried ECE.
    pub fn ece_seen(&self) -> bool {
        self.ece_seen
    }

    /// Accounts for one ACK. Once `ack` passes the end of the observed window,
    /// `alpha` moves toward the marked fraction by weight `g` and a new window starts
    /// at `tx_seq`.
    ///
    /// Returns whether a window completed.
    ///
    /// 统计一个 ACK。当 `ack` 越过观察窗口末端时，按权重 `g` 更新 `alpha` 并从 `tx_seq` 开始新窗口。
    pub fn on_ack(&mut self, ack: u32, ece: bool, tx_seq: u32, weight: f64) -> bool {
        self.total_acks += 1;
        if ece {
            self.marked_acks += 1;
        }
        self.ece_seen = ece;
        if ack > self.alpha_update_seq {
            let fraction = if self.total_acks > 0 {
                f64::from(self.marked_acks) / f64::from(self.total_acks)
            } else {
                0.0
            };
            self.last_fraction = fraction;
            self.alpha = ((1.0 - weight) * self.alpha + weight * fraction).min(1.0);
            self.marked_acks = 0;
            self.total_acks = 0;
            self.alpha_update_seq = tx_seq;
            debug!(alpha = self.alpha, fraction, "Updated DCTCP alpha");
            return true;
        }
        false
    }

    /// Whether the last ACK should shrink the window, given the reduction policy.
    /// 根据削减策略判断上一个 ACK 是否应当缩小窗口。
    pub fn should_reduce(&self, config: &EcnConfig, highest_ack: u32) -> bool {
        if !config.enabled || !self.ece_seen {
            return false;
        }
        match config.reduction {
            EcnReduction::PerWindow => self.reduce_seq < highest_ack + 1,
            EcnReduction::PerAck => true,
        }
    }

    /// Applies the reduction and returns the new `(cwnd, ssthresh)`. Further
    /// per-window reductions wait until `tx_seq` is acknowledged.
    ///
    /// 执行削减并返回新的 `(cwnd, ssthresh)`。
    pub fn reduce(
        &mut self,
        response: EcnResponse,
        cwnd: u32,
        mss: u32,
        min_cwnd_packets: u32,
        tx_seq: u32,
    ) -> (u32, u32) {
        let factor = match response {
            EcnResponse::Dctcp => 1.0 - self.alpha / 2.0,
            EcnResponse::Backoff { gamma, beta } => 1.0 - f64::from(gamma) / f64::from(beta.max(1)),
        };
        let scaled = (f64::from(cwnd) * factor).max(0.0) as u32;
        let cwnd = scaled.max(min_cwnd_packets.max(1) * mss);
        let ssthresh = mss.max(cwnd);
        self.reduce_seq = tx_seq;
        (cwnd, ssthresh)
    }

    /// `(ssthresh, cwnd)` on entering fast recovery when the threshold follows alpha:
    /// `ssthresh = max(2 * MSS, cwnd * (1 - alpha / 2))`, inflated by three segments.
    ///
    /// 按 alpha 计算进入快速恢复时的 `(ssthresh, cwnd)`。
    pub fn fast_retransmit_window(&self, cwnd: u32, mss: u32) -> (u32, u32) {
        let scaled = (f64::from(cwnd) * (1.0 - self.alpha / 2.0)).max(0.0) as u32;
        let ssthresh = scaled.max(2 * mss);
        (ssthresh, ssthresh.saturating_add(3 * mss))
    }

    /// Restarts the observation window after a timeout rewound `tx_seq`.
    /// 超时回退 `tx_seq` 后重新开始观察窗口。
    pub fn on_timeout(&mut self, tx_seq: u32) {
        self.alpha_update_seq = tx_seq;
        self.reduce_seq = tx_seq;
    }
}
