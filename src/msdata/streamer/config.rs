//! 行情流配置与订阅消息构建

use serde_json::json;

/// 行情流客户端配置
#[derive(Debug, Clone)]
pub struct TickStreamConfig {
    /// WebSocket端点URL（不含凭证）
    pub url: String,
    /// 上游API凭证
    pub api_key: String,
    /// 订阅的标的品种
    pub symbol: String,
}

impl TickStreamConfig {
    /// 完整连接URL，凭证以查询参数附加
    pub fn full_url(&self) -> String {
        if self.api_key.is_empty() {
            self.url.clone()
        } else {
            format!("{}?api_token={}", self.url, self.api_key)
        }
    }
}

/// 创建订阅消息: {"action":"subscribe","symbols":[SYMBOL]}
pub fn create_subscribe_message(symbols: &[String]) -> String {
    json!({
        "action": "subscribe",
        "symbols": symbols,
    })
    .to_string()
}
