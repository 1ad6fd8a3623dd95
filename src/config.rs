//! 定义了连接和协议的可配置参数。
//! Defines configurable parameters for connections and the protocol.

use std::{net::Ipv4Addr, time::Duration};

/// A structure containing all configurable parameters for a connection.
///
/// 包含所有连接可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Reliability-related parameters.
    /// 可靠性相关参数。
    pub reliability: ReliabilityConfig,

    /// Congestion control-related parameters.
    /// 拥塞控制相关参数。
    pub congestion_control: CongestionControlConfig,

    /// Connection, path management and buffer-related parameters.
    /// 连接、路径管理和缓冲区相关参数。
    pub connection: ConnectionConfig,
}

/// Reliability-related parameters.
///
/// 可靠性相关参数。
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// The retransmission timeout used before the first RTT sample.
    /// 获得第一个RTT样本之前使用的重传超时。
    pub initial_rto: Duration,
    /// The minimum RTO value. The RTO will not be allowed to fall below this.
    /// 最小RTO值。RTO不允许低于此值。
    pub min_rto: Duration,
    /// Upper bound for the backed-off RTO.
    /// 退避后RTO的上限。
    pub max_rto: Duration,
    /// Number of duplicate ACKs that triggers fast retransmit.
    /// 触发快速重传的重复ACK数量。
    pub dup_ack_threshold: u32,
    /// Maximum retries for SYN and SYN-ACK segments.
    /// SYN 和 SYN-ACK 的最大重传次数。
    pub syn_retries: u8,
    /// Base retransmission delay for SYN and SYN-ACK. Doubled on every retry.
    /// SYN 和 SYN-ACK 的基础重传延迟，每次重试翻倍。
    pub syn_timeout: Duration,
    /// Maximum retries for FIN segments.
    /// FIN 报文段的最大重传次数。
    pub control_frame_max_retries: u8,
    /// How long a subflow lingers in TIME_WAIT before it is closed.
    /// 子流在 TIME_WAIT 中停留的时间。
    pub time_wait: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            dup_ack_threshold: 3,
            syn_retries: 3,
            syn_timeout: Duration::from_secs(1),
            control_frame_max_retries: 5,
            time_wait: Duration::from_secs(1),
        }
    }
}

/// The window-increase policy shared by all subflows of a connection.
///
/// 连接所有子流共享的窗口增长策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    /// Independent Reno per subflow: `MSS²/cwnd`.
    Uncoupled,
    /// `MSS²/total`, the aggregate behaves like one Reno flow.
    FullyCoupled,
    /// Linked increases: `α·MSS²/total`.
    #[default]
    LinkedIncreases,
    /// Linked increases capped at the uncoupled increment.
    RttCompensator,
    /// Scaled integer variant of the uncoupled increase.
    ScaledUncoupled,
    /// Scalable TCP style: `acked·0.01`.
    CoupledScalable,
    /// Integer fully coupled increase with weight `A`.
    CoupledFully,
    /// Fixed-point linked increase with an `A_SCALE` scaled alpha.
    CoupledInc,
    /// Generalized coupling with a tunable exponent.
    CoupledEpsilon,
    /// Uncoupled increase slowed by the DCTCP marked fraction.
    FastUncoupled,
    /// Fully coupled increase slowed by the DCTCP marked fraction.
    FastIncreases,
    /// `MSS²/total` without alpha.
    Xca,
}

/// When the ECN window reduction is applied.
///
/// ECN 窗口缩减的应用时机。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcnReduction {
    /// At most once per window of data.
    /// 每个数据窗口最多一次。
    #[default]
    PerWindow,
    /// On every ACK echoing congestion.
    /// 每个回显拥塞的 ACK 都缩减。
    PerAck,
}

/// How far the window shrinks when a reduction is applied.
///
/// 执行削减时窗口缩小的幅度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcnResponse {
    /// `cwnd * (1 - alpha / 2)`.
    #[default]
    Dctcp,
    /// ECN-like fixed backoff, `cwnd * (1 - gamma / beta)`, independent of alpha.
    /// 类 ECN 的固定退避，与 alpha 无关。
    Backoff {
        /// Packets assumed to be queued in the network.
        gamma: u32,
        /// Backoff divisor, larger than `gamma`.
        beta: u32,
    },
}

/// Thresholds of adaptive subflow suppression. While an incast is detected only the
/// initial subflow carries new data and contributes to the coupled window.
///
/// 自适应子流抑制的阈值。检测到 incast 时只有初始子流发送新数据并参与耦合窗口计算。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveSubflowConfig {
    /// Consecutive congested alpha windows after which an incast is declared.
    /// 连续多少个拥塞的 alpha 窗口后判定为 incast。
    pub incast_threshold: u32,
    /// Consecutive clean windows on the initial subflow that end suppression.
    /// 初始子流连续多少个无拥塞窗口后结束抑制。
    pub exit_threshold: u32,
}

impl Default for AdaptiveSubflowConfig {
    fn default() -> Self {
        Self {
            incast_threshold: 10,
            exit_threshold: 8,
        }
    }
}

/// ECN / DCTCP parameters.
///
/// ECN / DCTCP 参数。
#[derive(Debug, Clone)]
pub struct EcnConfig {
    /// Whether CE marks are echoed and ECE echoes shrink the window.
    pub enabled: bool,
    /// Weight `g` of the marked-fraction moving average.
    pub weight: f64,
    /// Reduction timing policy.
    pub reduction: EcnReduction,
    /// Reduction size policy.
    /// 削减幅度策略。
    pub response: EcnResponse,
    /// Scale the fast-retransmit threshold by alpha, `max(2 * MSS, cwnd * (1 - alpha / 2))`,
    /// instead of asking the coupling algorithm.
    /// 快速重传阈值按 alpha 缩放，而不是交给耦合算法计算。
    pub fast_retransmit_by_alpha: bool,
    /// Fall back to the initial subflow during incast. Disabled when `None`.
    pub adaptive_subflows: Option<AdaptiveSubflowConfig>,
}

impl Default for EcnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: 1.0 / 16.0,
            reduction: EcnReduction::PerWindow,
            response: EcnResponse::Dctcp,
            fast_retransmit_by_alpha: false,
            adaptive_subflows: None,
        }
    }
}

/// Congestion control-related parameters.
///
/// 拥塞控制相关参数。
#[derive(Debug, Clone)]
pub struct CongestionControlConfig {
    /// The coupling algorithm.
    /// 耦合算法。
    pub algorithm: CongestionAlgorithm,
    /// Maximum segment size in bytes.
    /// 最大报文段大小（字节）。
    pub mss: u32,
    /// The initial congestion window size in segments.
    /// 初始拥塞窗口大小（以报文段为单位）。
    pub initial_cwnd_packets: u32,
    /// The minimum congestion window size in segments.
    /// 最小拥塞窗口大小（以报文段为单位）。
    pub min_cwnd_packets: u32,
    /// The initial slow start threshold in bytes.
    /// 初始慢启动阈值（字节）。
    pub initial_ssthresh: u32,
    /// Exponent of the epsilon coupling family.
    /// epsilon 耦合族的指数。
    pub epsilon: f64,
    /// Recompute alpha before every window increase rather than only on congestion
    /// events.
    /// 在每次窗口增长前重新计算 alpha，而不只是在拥塞事件时。
    pub alpha_per_ack: bool,
    /// ECN / DCTCP behaviour.
    pub ecn: EcnConfig,
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        Self {
            algorithm: CongestionAlgorithm::LinkedIncreases,
            mss: 1400,
            initial_cwnd_packets: 1,
            min_cwnd_packets: 1,
            initial_ssthresh: 65535,
            epsilon: 1.0,
            alpha_per_ack: true,
            ecn: EcnConfig::default(),
        }
    }
}

/// How additional subflows are discovered once the first subflow is up.
///
/// 第一个子流建立后如何发现额外的子流。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathManager {
    /// Only the initial subflow.
    /// 仅初始子流。
    #[default]
    Default,
    /// Advertise local addresses and join every usable address pair.
    /// 通告本地地址并在每对可用地址间建立子流。
    FullMesh,
    /// Open extra subflows between the same addresses on different source ports.
    /// 在相同地址之间使用不同源端口打开额外子流。
    NDiffPorts,
}

/// Connection and buffer-related parameters.
///
/// 连接和缓冲区相关参数。
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Path management mode.
    /// 路径管理模式。
    pub path_manager: PathManager,
    /// Maximum number of subflows per connection, including the initial one.
    /// 每个连接的最大子流数（包括初始子流）。
    pub max_subflows: u8,
    /// Upper bound of the random delay between opening extra subflows.
    /// 打开额外子流之间随机延迟的上限。
    pub subflow_spawn_gap: Duration,
    /// Upper bound of the random delay between FINs on different subflows.
    /// 不同子流 FIN 之间随机延迟的上限。
    pub fin_stagger_max: Duration,
    /// Local addresses advertised with ADD_ADDR in full-mesh mode.
    /// 全网状模式下通过 ADD_ADDR 通告的本地地址。
    pub local_addresses: Vec<Ipv4Addr>,
    /// The receive window advertised in every segment.
    /// 每个报文段中通告的接收窗口。
    pub advertised_window: u16,
    /// Multiplier applied to the peer's advertised window.
    /// 应用于对端通告窗口的乘数。
    pub rwnd_scale: u32,
    /// The capacity of the user-side send buffer in bytes.
    /// 用户端发送缓冲区的容量（以字节为单位）。
    pub send_buffer_capacity_bytes: usize,
    /// Seed for tokens, initial sequence numbers and staggering delays. Random when unset.
    /// 令牌、初始序列号和错开延迟的随机种子。未设置时随机。
    pub rng_seed: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            path_manager: PathManager::Default,
            max_subflows: 8,
            subflow_spawn_gap: Duration::from_micros(50),
            fin_stagger_max: Duration::from_micros(50),
            local_addresses: Vec::new(),
            advertised_window: u16::MAX,
            rwnd_scale: 1,
            send_buffer_capacity_bytes: 1024 * 1024,
            rng_seed: None,
        }
    }
}
