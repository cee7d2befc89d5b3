//! WebSocket连接管理
//!
//! 单连接的建立、订阅、消息循环与保活。心跳15秒一次，Pong须在5秒内返回；
//! 健康检查5秒一次，开盘期间15秒无tick即判定连接假死并主动断开。

use crate::mscommon::config::constants::{
    WS_HEALTH_CHECK_INTERVAL_SECS, WS_PING_INTERVAL_SECS, WS_PONG_TIMEOUT_SECS,
    WS_STALL_THRESHOLD_SECS,
};
use crate::mscommon::error::{AppError, Result};
use crate::mscommon::market_hours::MarketHoursClock;
use crate::mscommon::models::Tick;
use crate::msdata::streamer::config::{create_subscribe_message, TickStreamConfig};
use crate::msdata::streamer::message::{parse_stream_message, TICK_STREAM_TARGET};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 单次连接的结束方式与统计
#[derive(Debug)]
pub struct ConnectionOutcome {
    /// 本次连接收到的tick数量，决定重连走快速通道还是退避
    pub ticks_received: u64,
    /// 结束原因
    pub reason: DisconnectReason,
}

#[derive(Debug)]
pub enum DisconnectReason {
    /// 服务端关闭或读错误，正常重连
    StreamClosed(String),
    /// 开盘期间无数据超时，健康检查主动断开
    Stalled,
    /// Pong超时
    PongTimeout,
    /// 收到关闭信号
    Shutdown,
    /// 服务端限流
    RateLimited(String),
    /// 认证失败，致命
    AuthenticationFailed(String),
}

/// 连接管理器
pub struct ConnectionManager {
    config: TickStreamConfig,
}

impl ConnectionManager {
    pub fn new(config: TickStreamConfig) -> Self {
        Self { config }
    }

    /// 建立连接并发送订阅消息
    pub async fn connect(&self) -> Result<WsStream> {
        let url = self.config.full_url();
        debug!(target: TICK_STREAM_TARGET, symbol = %self.config.symbol, "连接行情流WebSocket");

        let (mut ws, response) = connect_async(url).await.map_err(classify_connect_error)?;

        debug!(
            target: TICK_STREAM_TARGET,
            status = %response.status(),
            "WebSocket握手成功"
        );

        let sub_msg = create_subscribe_message(&[self.config.symbol.clone()]);
        ws.send(Message::Text(sub_msg))
            .await
            .map_err(|e| AppError::WebSocketError(format!("发送订阅消息失败: {}", e)))?;
        info!(target: TICK_STREAM_TARGET, symbol = %self.config.symbol, "订阅请求已发送");

        Ok(ws)
    }

    /// 核心消息循环
    ///
    /// 解析后的tick送入`tick_tx`；返回连接结束原因与统计。
    pub async fn run_message_loop(
        &self,
        mut ws: WsStream,
        tick_tx: mpsc::Sender<Tick>,
        clock: &MarketHoursClock,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> ConnectionOutcome {
        let mut ticks_received: u64 = 0;
        let mut last_tick_at = Instant::now();
        let mut ping_sent_at: Option<Instant> = None;

        let mut ping_interval =
            tokio::time::interval(std::time::Duration::from_secs(WS_PING_INTERVAL_SECS));
        let mut health_interval =
            tokio::time::interval(std::time::Duration::from_secs(WS_HEALTH_CHECK_INTERVAL_SECS));
        // 首次立即触发的节拍跳过
        ping_interval.tick().await;
        health_interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws.close(None).await;
                        return ConnectionOutcome { ticks_received, reason: DisconnectReason::Shutdown };
                    }
                }

                _ = ping_interval.tick() => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        error!(target: TICK_STREAM_TARGET, error = %e, "发送Ping失败");
                        return ConnectionOutcome {
                            ticks_received,
                            reason: DisconnectReason::StreamClosed(format!("ping发送失败: {}", e)),
                        };
                    }
                    ping_sent_at = Some(Instant::now());
                }

                _ = health_interval.tick() => {
                    // Pong超时检查：Ping发出5秒内必须有Pong
                    if let Some(sent_at) = ping_sent_at {
                        if sent_at.elapsed().as_secs() >= WS_PONG_TIMEOUT_SECS {
                            warn!(target: TICK_STREAM_TARGET, "Pong超时，主动断开连接");
                            let _ = ws.close(None).await;
                            return ConnectionOutcome { ticks_received, reason: DisconnectReason::PongTimeout };
                        }
                    }
                    // 假死检查：开盘期间15秒无tick即断开触发重连
                    if clock.is_open(Utc::now())
                        && last_tick_at.elapsed().as_secs() >= WS_STALL_THRESHOLD_SECS
                    {
                        warn!(
                            target: TICK_STREAM_TARGET,
                            stalled_secs = last_tick_at.elapsed().as_secs(),
                            "开盘期间连接无数据，判定假死并断开"
                        );
                        let _ = ws.close(None).await;
                        return ConnectionOutcome { ticks_received, reason: DisconnectReason::Stalled };
                    }
                }

                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match parse_stream_message(&text) {
                                Ok(Some(tick)) => {
                                    ticks_received += 1;
                                    last_tick_at = Instant::now();
                                    if ticks_received == 1 {
                                        info!(
                                            target: TICK_STREAM_TARGET,
                                            symbol = %tick.symbol,
                                            price = tick.price,
                                            "收到首个tick"
                                        );
                                    }
                                    if tick_tx.send(tick).await.is_err() {
                                        // 聚合器已停止，连接没有继续存在的意义
                                        let _ = ws.close(None).await;
                                        return ConnectionOutcome {
                                            ticks_received,
                                            reason: DisconnectReason::Shutdown,
                                        };
                                    }
                                }
                                Ok(None) => {}
                                Err(AppError::RateLimited(msg)) => {
                                    let _ = ws.close(None).await;
                                    return ConnectionOutcome {
                                        ticks_received,
                                        reason: DisconnectReason::RateLimited(msg),
                                    };
                                }
                                Err(AppError::AuthenticationFailed(msg)) => {
                                    let _ = ws.close(None).await;
                                    return ConnectionOutcome {
                                        ticks_received,
                                        reason: DisconnectReason::AuthenticationFailed(msg),
                                    };
                                }
                                Err(e) => {
                                    warn!(target: TICK_STREAM_TARGET, error = %e, "消息解析失败，已跳过");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = ws.send(Message::Pong(payload)).await {
                                error!(target: TICK_STREAM_TARGET, error = %e, "发送Pong失败");
                                return ConnectionOutcome {
                                    ticks_received,
                                    reason: DisconnectReason::StreamClosed(format!("pong发送失败: {}", e)),
                                };
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            ping_sent_at = None;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return ConnectionOutcome {
                                ticks_received,
                                reason: DisconnectReason::StreamClosed(format!("服务端关闭: {:?}", frame)),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ConnectionOutcome {
                                ticks_received,
                                reason: DisconnectReason::StreamClosed(format!("读取错误: {}", e)),
                            };
                        }
                        None => {
                            return ConnectionOutcome {
                                ticks_received,
                                reason: DisconnectReason::StreamClosed("流已结束".to_string()),
                            };
                        }
                    }
                }
            }
        }
    }
}

/// 连接阶段错误分类：401/403为认证失败，429为限流，其余为普通WebSocket错误
fn classify_connect_error(e: tokio_tungstenite::tungstenite::Error) -> AppError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match &e {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                AppError::AuthenticationFailed(format!("握手被拒绝: HTTP {}", status))
            } else if status.as_u16() == 429 {
                AppError::RateLimited(format!("握手被限流: HTTP {}", status))
            } else {
                AppError::WebSocketError(format!("握手失败: HTTP {}", status))
            }
        }
        _ => AppError::WebSocketError(format!("连接失败: {}", e)),
    }
}
