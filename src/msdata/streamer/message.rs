//! 行情流消息解析
//!
//! 区分三类消息：tick数据、服务端状态通知、服务端错误。
//! 错误按可重试性分类上抛，状态通知只记日志。

use crate::mscommon::error::{AppError, Result};
use crate::mscommon::models::{RawStreamTick, Tick};
use chrono::Utc;
use tracing::{info, warn};

/// 行情流日志目标
pub const TICK_STREAM_TARGET: &str = "行情流";

/// 解析单条流消息
///
/// 返回Ok(Some(tick))为有效tick；Ok(None)为状态/确认类消息；
/// Err为服务端明确报错（按可重试性分类）。
pub fn parse_stream_message(payload: &str) -> Result<Option<Tick>> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| AppError::ParseError(format!("非JSON消息: {} ({})", truncate(payload, 200), e)))?;

    // 服务端错误消息，按内容分类
    if let Some(err_msg) = value.get("error").and_then(|v| v.as_str()) {
        return Err(classify_server_error(err_msg));
    }

    // 状态/确认消息，记日志后跳过
    if value.get("status").is_some() || value.get("message").is_some() {
        info!(target: TICK_STREAM_TARGET, raw = %truncate(payload, 200), "收到服务端状态消息");
        return Ok(None);
    }

    let raw: RawStreamTick = serde_json::from_value(value)?;

    // 无成交价时回退到买一/卖一价
    let price = match raw.price.or(raw.bid_price).or(raw.ask_price) {
        Some(p) if p > 0.0 => p,
        Some(p) => {
            warn!(target: TICK_STREAM_TARGET, price = p, "丢弃非正价格的tick");
            return Ok(None);
        }
        None => {
            warn!(target: TICK_STREAM_TARGET, raw = %truncate(payload, 200), "消息缺少价格字段，已丢弃");
            return Ok(None);
        }
    };

    if raw.symbol.is_empty() {
        warn!(target: TICK_STREAM_TARGET, raw = %truncate(payload, 200), "消息缺少品种字段，已丢弃");
        return Ok(None);
    }

    let timestamp_ms = match raw.timestamp {
        // 上游时间戳可能为秒或毫秒，按量级归一化到毫秒
        Some(t) if t > 10_000_000_000 => t,
        Some(t) if t > 0 => t * 1000,
        _ => Utc::now().timestamp_millis(),
    };

    Ok(Some(Tick {
        symbol: raw.symbol,
        price,
        volume: raw.volume.max(0.0),
        timestamp_ms,
    }))
}

fn classify_server_error(err_msg: &str) -> AppError {
    let lower = err_msg.to_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
        AppError::RateLimited(err_msg.to_string())
    } else if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid api")
        || lower.contains("api_token")
    {
        AppError::AuthenticationFailed(err_msg.to_string())
    } else {
        AppError::WebSocketError(err_msg.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
