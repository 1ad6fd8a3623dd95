//! An estimator for the round-trip time (RTT).
//! RTT 估算器。

use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const MAX_BACKOFF_MULTIPLIER: u32 = 64;

/// One transmission awaiting acknowledgment.
#[derive(Debug, Clone)]
struct SentRecord {
    seq: u32,
    len: u32,
    sent_at: Instant,
    retransmitted: bool,
}

impl SentRecord {
    fn end(&self) -> u32 {
        self.seq + self.len
    }
}

/// An estimator for the round-trip time (RTT), based on RFC 6298, with Karn's rule
/// and an exponential backoff multiplier.
///
/// 一个基于 RFC 6298 的 RTT 估算器，带有 Karn 规则和指数退避乘数。
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// The smoothed round-trip time, in seconds.
    /// 平滑的往返时间（秒）。
    srtt: f64,
    /// The round-trip time variation, in seconds.
    /// 往返时间变化量（秒）。
    rttvar: f64,
    /// The retransmission timeout before backoff.
    /// 退避前的重传超时时间。
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    /// Backoff multiplier, doubled on every timeout and reset by a new ACK.
    /// 退避乘数，每次超时翻倍，新的 ACK 将其重置。
    multiplier: u32,
    history: VecDeque<SentRecord>,
}

impl RttEstimator {
    /// Creates a new RTT estimator with a given initial RTO.
    ///
    /// 使用给定的初始 RTO 创建一个新的 RTT 估算器。
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: initial_rto,
            min_rto,
            max_rto,
            multiplier: 1,
            history: VecDeque::new(),
        }
    }

    /// Returns the current RTO value, backoff included.
    ///
    /// 返回当前的 RTO 值（包括退避）。
    pub fn rto(&self) -> Duration {
        (self.rto * self.multiplier).min(self.max_rto)
    }

    /// The smoothed RTT, zero before the first sample.
    /// 平滑 RTT，在第一个样本之前为零。
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt)
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Records a transmission of `[seq, seq + len)`. Sending a range that overlaps an
    /// outstanding record marks that record as retransmitted so it yields no sample.
    ///
    /// 记录 `[seq, seq + len)` 的一次发送。与未确认记录重叠的发送会将其标记为重传。
    pub fn on_sent(&mut self, seq: u32, len: u32, now: Instant) {
        let end = seq + len.max(1);
        let mut overlapped = false;
        for record in self.history.iter_mut() {
            if record.seq < end && seq < record.end() {
                record.retransmitted = true;
                overlapped = true;
            }
        }
        if !overlapped {
            self.history.push_back(SentRecord {
                seq,
                len: len.max(1),
                sent_at: now,
                retransmitted: false,
            });
        }
    }

    /// Processes a cumulative acknowledgment. Records fully covered by `ack` are
    /// dropped; the newest of them that was sent only once produces an RTT sample.
    /// Any progress resets the backoff multiplier.
    ///
    /// 处理累积确认。被 `ack` 完全覆盖的记录被丢弃；其中最新的、只发送过一次的记录产生 RTT 样本。
    pub fn on_acked(&mut self, ack: u32, now: Instant) -> Option<Duration> {
        let mut sample = None;
        let mut progressed = false;
        while let Some(front) = self.history.front() {
            if front.end() > ack {
                break;
            }
            progressed = true;
            if let Some(record) = self.history.pop_front() {
                if !record.retransmitted {
                    sample = Some(now.saturating_duration_since(record.sent_at));
                }
            }
        }
        if progressed {
            self.multiplier = 1;
        }
        if let Some(rtt) = sample {
            self.update(rtt);
        }
        sample
    }

    /// Doubles the backoff multiplier.
    /// 将退避乘数翻倍。
    pub fn double_backoff(&mut self) {
        self.multiplier = (self.multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
    }

    /// Forgets outstanding transmissions, used when a subflow rewinds after a timeout.
    /// 忘记未确认的发送记录，在子流超时回退时使用。
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Updates the RTT estimator with a new sample.
    ///
    /// 使用一个新的样本更新 RTT 估算器。
    pub fn update(&mut self, rtt_sample: Duration) {
        let rtt_sample_f64 = rtt_sample.as_secs_f64();

        if self.srtt == 0.0 {
            // First sample
            self.srtt = rtt_sample_f64;
            self.rttvar = rtt_sample_f64 / 2.0;
        } else {
            let delta = (self.srtt - rtt_sample_f64).abs();
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * delta;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt_sample_f64;
        }

        let rto_f64 = self.srtt + (4.0 * self.rttvar);
        self.rto = Duration::from_secs_f64(rto_f64).clamp(self.min_rto, self.max_rto);
    }
}
