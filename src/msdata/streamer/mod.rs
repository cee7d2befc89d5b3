//! 行情流客户端模块
//!
//! 维护到上游tick提供方的单条流式连接：市场时段感知的连接监督、
//! 快速通道/指数退避双轨重连、并发断开日志去重。

pub mod config;
pub mod connection;
pub mod message;

pub use config::TickStreamConfig;
pub use connection::{ConnectionManager, ConnectionOutcome, DisconnectReason};
pub use message::TICK_STREAM_TARGET;

use crate::mscommon::error::{AppError, Result};
use crate::mscommon::market_hours::MarketHoursClock;
use crate::mscommon::models::Tick;
use crate::mscommon::config::constants::{WS_FAST_RECONNECT_SECS, WS_MAX_BACKOFF_SECS};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 重连延迟策略
///
/// 上一条连接建立成功且收到过tick：2秒快速通道。
/// 从未建立/握手被拒/认证类失败：指数退避 2 -> 4 -> 8 -> ... 封顶60秒。
/// 限流错误沿用指数退避，绝不比指数更激进。
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 成功连接并收到过数据后的重连延迟（快速通道）
    pub fn on_healthy_disconnect(&mut self) -> Duration {
        self.consecutive_failures = 0;
        Duration::from_secs(WS_FAST_RECONNECT_SECS)
    }

    /// 连接失败或无数据断开后的重连延迟（指数退避）
    pub fn on_failure(&mut self) -> Duration {
        let exp = self.consecutive_failures.min(5); // 2*2^5 = 64 > 60，封顶前最后一档
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = (WS_FAST_RECONNECT_SECS * 2u64.pow(exp)).min(WS_MAX_BACKOFF_SECS);
        Duration::from_secs(delay)
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// 并发断开日志去重
///
/// 快路径先查原子标志，命中锁后再次确认，保证并发关闭只产出一条汇总日志。
struct DisconnectLogGuard {
    logged: AtomicBool,
    lock: Mutex<()>,
}

impl DisconnectLogGuard {
    fn new() -> Self {
        Self {
            logged: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// 新连接建立后重置
    fn reset(&self) {
        self.logged.store(false, Ordering::Release);
    }

    /// 汇总记录一次断开事件，重复调用被抑制
    fn log_once(&self, outcome: &ConnectionOutcome, connection_secs: u64) {
        if self.logged.load(Ordering::Acquire) {
            return; // 快路径
        }
        let _guard = self.lock.lock().unwrap();
        if self.logged.swap(true, Ordering::AcqRel) {
            return; // 获锁后二次确认
        }
        warn!(
            target: TICK_STREAM_TARGET,
            reason = ?outcome.reason,
            ticks_received = outcome.ticks_received,
            connection_secs,
            "行情流连接断开"
        );
    }
}

/// 行情流客户端
///
/// `run`在市场时段感知的监督循环内维护连接，直到收到关闭信号或遇到致命错误。
pub struct TickStreamClient {
    config: TickStreamConfig,
    clock: Arc<MarketHoursClock>,
    running: Arc<AtomicBool>,
}

impl TickStreamClient {
    pub fn new(
        config: TickStreamConfig,
        clock: Arc<MarketHoursClock>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            clock,
            running,
        }
    }

    /// 启动客户端主循环
    ///
    /// 外层监督循环按市场时段闸门连接；内层重试循环在每次重连前
    /// 重新评估时钟，闭市即退回外层休眠。
    pub async fn run(
        &self,
        tick_tx: mpsc::Sender<Tick>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let manager = ConnectionManager::new(self.config.clone());
        let disconnect_log = DisconnectLogGuard::new();
        let mut policy = ReconnectPolicy::new();

        info!(
            target: TICK_STREAM_TARGET,
            symbol = %self.config.symbol,
            "行情流客户端启动"
        );

        // 外层监督循环
        while self.running.load(Ordering::Relaxed) {
            self.clock.block_until_open(&self.running).await;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            info!(target: TICK_STREAM_TARGET, "市场开盘，开始建立连接");

            // 内层重试循环
            'retry: while self.running.load(Ordering::Relaxed) {
                // 每次重连前重新评估市场时段
                if !self.clock.is_open(Utc::now()) {
                    info!(target: TICK_STREAM_TARGET, "市场已闭市，退出重试循环");
                    break 'retry;
                }

                let connect_started = std::time::Instant::now();
                match manager.connect().await {
                    Ok(ws) => {
                        disconnect_log.reset();
                        let outcome = manager
                            .run_message_loop(ws, tick_tx.clone(), &self.clock, shutdown_rx.clone())
                            .await;
                        disconnect_log.log_once(&outcome, connect_started.elapsed().as_secs());

                        match outcome.reason {
                            DisconnectReason::AuthenticationFailed(msg) => {
                                error!(target: TICK_STREAM_TARGET, reason = %msg, "认证失败，行情流客户端退出");
                                return Err(AppError::AuthenticationFailed(msg));
                            }
                            DisconnectReason::Shutdown => return Ok(()),
                            DisconnectReason::RateLimited(_) => {
                                let delay = policy.on_failure();
                                warn!(
                                    target: TICK_STREAM_TARGET,
                                    delay_secs = delay.as_secs(),
                                    consecutive = policy.failures(),
                                    "被限流，退避后重连"
                                );
                                sleep(delay).await;
                            }
                            _ => {
                                // 收到过数据的连接走2秒快速通道（附加小抖动），否则退避
                                let delay = if outcome.ticks_received > 0 {
                                    let jitter_ms = rand::thread_rng().gen_range(0..250);
                                    policy.on_healthy_disconnect() + Duration::from_millis(jitter_ms)
                                } else {
                                    policy.on_failure()
                                };
                                info!(
                                    target: TICK_STREAM_TARGET,
                                    delay_ms = delay.as_millis() as u64,
                                    fast_lane = outcome.ticks_received > 0,
                                    "准备重连"
                                );
                                sleep(delay).await;
                            }
                        }
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            error!(target: TICK_STREAM_TARGET, error = %e, "连接致命错误，行情流客户端退出");
                            return Err(e);
                        }
                        let delay = policy.on_failure();
                        warn!(
                            target: TICK_STREAM_TARGET,
                            error = %e,
                            delay_secs = delay.as_secs(),
                            consecutive = policy.failures(),
                            "连接失败，退避后重试"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        info!(target: TICK_STREAM_TARGET, "行情流客户端已停止");
        Ok(())
    }
}
