//! 耦合拥塞控制引擎
//! Coupled Congestion Control Engine
//!
//! 职责：
//! - 定义耦合拥塞控制算法的统一接口
//! - 实现慢启动、拥塞避免增长以及快速重传时的阈值计算
//! - 所有子流的窗口在每次增长决策前汇总
//!
//! Every subflow keeps its own `cwnd` and `ssthresh`, but congestion-avoidance growth
//! is computed from a snapshot of all subflows so that the aggregate stays no more
//! aggressive than a single-path flow.

use crate::config::{CongestionAlgorithm, CongestionControlConfig};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Duration;
use tracing::{debug, trace};

pub mod dctcp;
pub mod incast;


/// Weight of the integer fully coupled increase.
pub const A: u64 = 1;
/// Divisor of the fully coupled decrease.
pub const B: u32 = 2;
/// Fixed-point scale of the `CoupledInc` alpha.
pub const A_SCALE: u64 = 512;

/// 单个子流窗口状态的快照
/// Snapshot of one subflow's window state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowView {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub mss: u32,
    pub srtt: Duration,
    pub in_fast_recovery: bool,
    /// Fraction of bytes that carried an ECN echo in the last window.
    /// 上一个窗口中携带 ECN 回显的字节比例。
    pub marked_fraction: f64,
}

impl WindowView {
    /// The window counted toward the aggregate: `ssthresh` while in fast recovery,
    /// since `cwnd` is inflated then.
    ///
    /// 计入总窗口的窗口值：快速恢复期间使用 `ssthresh`。
    pub fn effective_window(&self) -> u32 {
        if self.in_fast_recovery {
            self.ssthresh
        } else {
            self.cwnd
        }
    }
}

/// 一次新 ACK 的增长上下文
/// Growth context for one new ACK
#[derive(Debug, Clone, Copy)]
pub struct AckContext<'a> {
    /// Position of the acknowledged subflow in `views`.
    pub index: usize,
    pub views: &'a [WindowView],
    pub acked_bytes: u32,
    /// Sum of the effective windows of `views`.
    pub total_window: u32,
}

impl AckContext<'_> {
    pub fn this(&self) -> &WindowView {
        &self.views[self.index]
    }

    /// `acked_bytes` capped at one MSS, used by the scaled family.
    fn capped_acked(&self) -> u64 {
        u64::from(self.acked_bytes.min(self.this().mss))
    }

    /// The uncoupled integer increment `acked·MSS/cwnd`.
    fn tcp_increment(&self) -> u64 {
        let this = self.this();
        self.capped_acked() * u64::from(this.mss) / u64::from(this.cwnd.max(1))
    }
}

/// 耦合拥塞控制算法 trait
/// Coupled congestion control algorithm trait
pub trait CongestionController: std::fmt::Debug + Send {
    /// 算法名称
    /// Algorithm name
    fn name(&self) -> &'static str;

    /// 拥塞避免阶段的窗口增量（字节），调用者将其下限设为 1 字节
    /// Congestion-avoidance increment in bytes. The caller floors it at one byte.
    fn increase(&mut self, ctx: &AckContext<'_>) -> f64;

    /// 快速重传时新的慢启动阈值
    /// Slow-start threshold after a fast-retransmit loss.
    fn loss_threshold(&self, index: usize, views: &[WindowView], flight_size: u32) -> u32 {
        let mss = views[index].mss;
        (2 * mss).max(flight_size / 2)
    }

    /// 拥塞事件（快速重传、RTO）或子流集合变化时调用
    /// Called on congestion events (fast retransmit, RTO) and when the subflow set changes.
    fn on_congestion_event(&mut self, _views: &[WindowView]) {}

    /// Current coupling factor, 1.0 for algorithms without one.
    fn alpha(&self) -> f64 {
        1.0
    }
}

/// 所有子流有效窗口之和
/// Sum of the effective windows of all subflows.
pub fn total_window(views: &[WindowView]) -> u32 {
    views
        .iter()
        .map(WindowView::effective_window)
        .fold(0, u32::saturating_add)
}

fn rtt_micros(view: &WindowView) -> f64 {
    let micros = view.srtt.as_micros() as f64;
    if micros == 0.0 { 1.0 } else { micros }
}

/// `α = total·max(cwnd_i/rtt_i²)/(Σ cwnd_i/rtt_i)²`, RTT in microseconds.
///
/// 链接增长的 α，RTT 以微秒计。
pub fn linked_alpha(views: &[WindowView]) -> f64 {
    let mut max_term = 0.0_f64;
    let mut sum = 0.0_f64;
    for view in views {
        let rtt = rtt_micros(view);
        let cwnd = f64::from(view.cwnd);
        max_term = max_term.max(cwnd / (rtt * rtt));
        sum += cwnd / rtt;
    }
    if sum == 0.0 {
        return 1.0;
    }
    f64::from(total_window(views)) * max_term / (sum * sum)
}

/// Generalized alpha for exponent `epsilon`, RTT in milliseconds. It equals
/// [`linked_alpha`] up to the RTT unit when `epsilon` is 1.
///
/// 指数为 `epsilon` 的广义 alpha。
pub fn epsilon_alpha(views: &[WindowView], epsilon: f64) -> f64 {
    if views.len() <= 1 {
        return 1.0;
    }
    let mut max_term = 0.0_f64;
    let mut sum = 0.0_f64;
    for view in views {
        let millis = view.srtt.as_millis() as f64;
        let rtt = if millis == 0.0 { 1.0 } else { millis };
        let cwnd = f64::from(view.effective_window());
        max_term = max_term.max(cwnd.powf(epsilon / 2.0) / rtt);
        sum += cwnd / rtt;
    }
    if sum == 0.0 {
        return 1.0;
    }
    let exponent = 1.0 / (1.0 - epsilon / 2.0);
    f64::from(total_window(views)) * max_term.powf(exponent) / sum.powf(exponent)
}

/// Fixed-point alpha of `CoupledInc`, scaled by [`A_SCALE`]. RTT in units of 10 µs.
///
/// `CoupledInc` 的定点 alpha，按 [`A_SCALE`] 缩放。
pub fn scaled_alpha(views: &[WindowView]) -> u64 {
    let mut max_term = 0_u128;
    let mut sum = 0_u128;
    let mut cwnd_sum = 0_u128;
    for view in views {
        let rtt = (view.srtt.as_micros() / 10).max(1);
        let cwnd = u128::from(view.effective_window());
        let mss = u128::from(view.mss);
        max_term = max_term.max(cwnd * mss * mss / rtt / rtt);
        sum += cwnd * mss / rtt;
        cwnd_sum += cwnd;
    }
    if sum == 0 {
        return A_SCALE;
    }
    let alpha = u128::from(A_SCALE) * cwnd_sum * max_term / sum / sum;
    u64::try_from(alpha).unwrap_or(u64::MAX)
}

/// Standard additive increase, one MSS per window.
#[derive(Debug, Default)]
pub struct Uncoupled;

impl CongestionController for Uncoupled {
    fn name(&self) -> &'static str {
        "Uncoupled"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        let this = ctx.this();
        f64::from(this.mss) * f64::from(this.mss) / f64::from(this.cwnd)
    }
}

/// One MSS per aggregate window.
#[derive(Debug, Default)]
pub struct FullyCoupled;

impl CongestionController for FullyCoupled {
    fn name(&self) -> &'static str {
        "FullyCoupled"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        let mss = f64::from(ctx.this().mss);
        mss * mss / f64::from(ctx.total_window)
    }

    fn loss_threshold(&self, index: usize, views: &[WindowView], _flight_size: u32) -> u32 {
        let view = &views[index];
        let reduced = view.cwnd.saturating_sub(total_window(views) / 2);
        (2 * view.mss).max(reduced)
    }
}

/// Linked increases with an optional cap at the uncoupled increment.
#[derive(Debug)]
pub struct LinkedIncreases {
    alpha: f64,
    alpha_per_ack: bool,
    rtt_compensated: bool,
}

impl LinkedIncreases {
    pub fn new(alpha_per_ack: bool, rtt_compensated: bool) -> Self {
        Self {
            alpha: 1.0,
            alpha_per_ack,
            rtt_compensated,
        }
    }
}

impl CongestionController for LinkedIncreases {
    fn name(&self) -> &'static str {
        if self.rtt_compensated {
            "RttCompensator"
        } else {
            "LinkedIncreases"
        }
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        if self.alpha_per_ack {
            self.alpha = linked_alpha(ctx.views);
        }
        let this = ctx.this();
        let mss_sq = f64::from(this.mss) * f64::from(this.mss);
        let coupled = self.alpha * mss_sq / f64::from(ctx.total_window);
        if self.rtt_compensated {
            coupled.min(mss_sq / f64::from(this.cwnd))
        } else {
            coupled
        }
    }

    fn on_congestion_event(&mut self, views: &[WindowView]) {
        self.alpha = linked_alpha(views);
        debug!(alpha = self.alpha, "Recomputed linked-increases alpha");
    }

    fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// `MSS²/total` without a coupling factor.
#[derive(Debug, Default)]
pub struct Xca;

impl CongestionController for Xca {
    fn name(&self) -> &'static str {
        "Xca"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        let mss = f64::from(ctx.this().mss);
        mss * mss / f64::from(ctx.total_window)
    }
}

/// Increase slowed by the fraction of ECN-echoed bytes in the last window.
#[derive(Debug)]
pub struct EcnScaled {
    coupled: bool,
}

impl CongestionController for EcnScaled {
    fn name(&self) -> &'static str {
        if self.coupled {
            "FastIncreases"
        } else {
            "FastUncoupled"
        }
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        let this = ctx.this();
        let mss_sq = f64::from(this.mss) * f64::from(this.mss);
        let divisor = if self.coupled {
            ctx.total_window
        } else {
            this.cwnd
        };
        (1.0 - this.marked_fraction) * mss_sq / f64::from(divisor)
    }
}

/// Integer uncoupled increase, `acked·MSS/cwnd` with `acked` capped at one MSS.
#[derive(Debug, Default)]
pub struct ScaledUncoupled;

impl CongestionController for ScaledUncoupled {
    fn name(&self) -> &'static str {
        "ScaledUncoupled"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        ctx.tcp_increment() as f64
    }
}

/// Scalable TCP style increase.
#[derive(Debug, Default)]
pub struct CoupledScalable;

impl CongestionController for CoupledScalable {
    fn name(&self) -> &'static str {
        "CoupledScalable"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        ctx.capped_acked() as f64 * 0.01
    }

    fn loss_threshold(&self, index: usize, views: &[WindowView], _flight_size: u32) -> u32 {
        let view = &views[index];
        let reduced = view.cwnd.saturating_sub(total_window(views) >> 3);
        (2 * view.mss).max(reduced)
    }
}

/// Integer fully coupled increase weighted by [`A`], decrease by `total/B`.
#[derive(Debug, Default)]
pub struct CoupledFully;

impl CongestionController for CoupledFully {
    fn name(&self) -> &'static str {
        "CoupledFully"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        let mss = u64::from(ctx.this().mss);
        let coupled = ctx.capped_acked() * mss * A / u64::from(ctx.total_window.max(1));
        coupled.min(ctx.tcp_increment()) as f64
    }

    fn loss_threshold(&self, index: usize, views: &[WindowView], _flight_size: u32) -> u32 {
        let view = &views[index];
        let reduced = view.cwnd.saturating_sub(total_window(views) / B);
        (2 * view.mss).max(reduced)
    }
}

/// Fixed-point linked increase with probabilistic rounding.
#[derive(Debug)]
pub struct CoupledInc {
    a_scaled: u64,
    alpha_per_ack: bool,
    rng: StdRng,
}

impl CongestionController for CoupledInc {
    fn name(&self) -> &'static str {
        "CoupledInc"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        if self.alpha_per_ack {
            self.a_scaled = scaled_alpha(ctx.views);
        }
        let this = ctx.this();
        let mss = u64::from(this.mss);
        let scaled = ctx.capped_acked() * mss * self.a_scaled / u64::from(ctx.total_window.max(1));
        let mut increment = scaled / A_SCALE;
        if self.rng.random_range(0..A_SCALE) < scaled % A_SCALE {
            increment += 1;
        }
        let increment = increment.min(ctx.tcp_increment());
        let cwnd = u64::from(this.cwnd);
        if (cwnd + increment) / mss != cwnd / mss {
            self.a_scaled = scaled_alpha(ctx.views);
        }
        increment as f64
    }

    fn on_congestion_event(&mut self, views: &[WindowView]) {
        self.a_scaled = scaled_alpha(views);
    }

    fn alpha(&self) -> f64 {
        self.a_scaled as f64 / A_SCALE as f64
    }
}

/// Generalized coupling with exponent `epsilon`, probabilistic rounding.
#[derive(Debug)]
pub struct CoupledEpsilon {
    alpha: f64,
    epsilon: f64,
    alpha_per_ack: bool,
    rng: StdRng,
}

impl CoupledEpsilon {
    fn refresh_alpha(&mut self, views: &[WindowView]) {
        if self.epsilon > 0.0 && self.epsilon < 2.0 {
            self.alpha = epsilon_alpha(views, self.epsilon);
        }
    }
}

impl CongestionController for CoupledEpsilon {
    fn name(&self) -> &'static str {
        "CoupledEpsilon"
    }

    fn increase(&mut self, ctx: &AckContext<'_>) -> f64 {
        if self.alpha_per_ack {
            self.refresh_alpha(ctx.views);
        }
        let this = ctx.this();
        let mss = f64::from(this.mss);
        let cwnd = f64::from(this.cwnd);
        let exact = ctx.capped_acked() as f64 * mss * self.alpha
            * (self.alpha * cwnd).powf(1.0 - self.epsilon)
            / f64::from(ctx.total_window.max(1)).powf(2.0 - self.epsilon);
        let mut increment = exact.floor() as u64;
        if self.rng.random::<f64>() < exact - exact.floor() {
            increment += 1;
        }
        let increment = increment.min(ctx.tcp_increment());
        let mss_bytes = u64::from(this.mss);
        if (u64::from(this.cwnd) + increment) / mss_bytes != u64::from(this.cwnd) / mss_bytes {
            self.refresh_alpha(ctx.views);
        }
        increment as f64
    }

    fn on_congestion_event(&mut self, views: &[WindowView]) {
        self.refresh_alpha(views);
    }

    fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// Builds the controller for the configured algorithm.
///
/// 根据配置的算法构建控制器。
pub fn build_controller(config: &CongestionControlConfig, seed: u64) -> Box<dyn CongestionController> {
    let rng = StdRng::seed_from_u64(seed);
    match config.algorithm {
        CongestionAlgorithm::Uncoupled => Box::new(Uncoupled),
        CongestionAlgorithm::FullyCoupled => Box::new(FullyCoupled),
        CongestionAlgorithm::LinkedIncreases => {
            Box::new(LinkedIncreases::new(config.alpha_per_ack, false))
        }
        CongestionAlgorithm::RttCompensator => {
            Box::new(LinkedIncreases::new(config.alpha_per_ack, true))
        }
        CongestionAlgorithm::ScaledUncoupled => Box::new(ScaledUncoupled),
        CongestionAlgorithm::CoupledScalable => Box::new(CoupledScalable),
        CongestionAlgorithm::CoupledFully => Box::new(CoupledFully),
        CongestionAlgorithm::CoupledInc => Box::new(CoupledInc {
            a_scaled: A_SCALE,
            alpha_per_ack: config.alpha_per_ack,
            rng,
        }),
        CongestionAlgorithm::CoupledEpsilon => Box::new(CoupledEpsilon {
            alpha: 1.0,
            epsilon: config.epsilon,
            alpha_per_ack: config.alpha_per_ack,
            rng,
        }),
        CongestionAlgorithm::FastUncoupled => Box::new(EcnScaled { coupled: false }),
        CongestionAlgorithm::FastIncreases => Box::new(EcnScaled { coupled: true }),
        CongestionAlgorithm::Xca => Box::new(Xca),
    }
}

/// 拥塞控制引擎：在控制器之上实现慢启动、下限和快速重传的窗口计算
/// Congestion engine: slow start, flooring and fast-retransmit window math on top of a
/// [`CongestionController`].
#[derive(Debug)]
pub struct CongestionEngine {
    controller: Box<dyn CongestionController>,
}

impl CongestionEngine {
    pub fn new(controller: Box<dyn CongestionController>) -> Self {
        Self { controller }
    }

    pub fn from_config(config: &CongestionControlConfig, seed: u64) -> Self {
        Self::new(build_controller(config, seed))
    }

    pub fn controller(&self) -> &dyn CongestionController {
        self.controller.as_ref()
    }

    /// Returns the new `cwnd` of `views[index]` after `acked_bytes` were newly
    /// acknowledged outside fast recovery.
    ///
    /// 返回在快速恢复之外新确认 `acked_bytes` 后 `views[index]` 的新 `cwnd`。
    pub fn open_window(&mut self, index: usize, views: &[WindowView], acked_bytes: u32) -> u32 {
        let view = views[index];
        if view.cwnd < view.ssthresh {
            trace!(cwnd = view.cwnd, "Slow start increment");
            return view.cwnd + view.mss;
        }
        let ctx = AckContext {
            index,
            views,
            acked_bytes,
            total_window: total_window(views).max(1),
        };
        let increment = self.controller.increase(&ctx).max(1.0);
        trace!(
            algorithm = self.controller.name(),
            cwnd = view.cwnd,
            increment,
            total_window = ctx.total_window,
            "Congestion avoidance increment"
        );
        view.cwnd.saturating_add(increment as u32)
    }

    /// Computes `(ssthresh, cwnd)` on entering fast recovery.
    ///
    /// 计算进入快速恢复时的 `(ssthresh, cwnd)`。
    pub fn enter_fast_recovery(
        &mut self,
        index: usize,
        views: &[WindowView],
        bytes_in_flight: u32,
    ) -> (u32, u32) {
        self.controller.on_congestion_event(views);
        let view = views[index];
        let flight_size = bytes_in_flight.min(view.cwnd);
        let ssthresh = self.controller.loss_threshold(index, views, flight_size);
        (ssthresh, ssthresh + 3 * view.mss)
    }

    /// Lets the controller refresh its coupling state after a timeout or a change in the
    /// subflow set.
    ///
    /// 超时或子流集合变化后让控制器刷新耦合状态。
    pub fn on_congestion_event(&mut self, views: &[WindowView]) {
        self.controller.on_congestion_event(views);
    }
}
