//! 情绪引擎配置模块
//!
//! 运行时配置全部来自环境变量，启动时一次性加载并校验。
//! 调参常量集中在constants子模块。

use crate::mscommon::error::{AppError, Result};
use std::collections::HashMap;
use std::env;

/// 系统调参常量
pub mod constants {
    /// 新闻分数每分钟衰减率（3.83%/分钟）
    pub const MINUTE_DECAY_RATE: f64 = 0.0383;

    /// 新闻分数每秒衰减率
    pub const SECOND_DECAY_RATE: f64 = MINUTE_DECAY_RATE / 60.0;

    /// 综合分权重：新闻 / reddit / 技术面 / 分析师
    pub const WEIGHT_NEWS: f64 = 0.35;
    pub const WEIGHT_REDDIT: f64 = 0.20;
    pub const WEIGHT_TECHNICAL: f64 = 0.25;
    pub const WEIGHT_ANALYST: f64 = 0.20;

    /// 技术面混合权重：基础分80% + 微动量20%
    pub const TECHNICAL_BASE_WEIGHT: f64 = 0.8;
    pub const TECHNICAL_MICRO_WEIGHT: f64 = 0.2;

    /// 微动量回看窗口（秒）与缩放系数
    pub const MICRO_MOMENTUM_WINDOW: usize = 30;
    pub const MICRO_MOMENTUM_SCALE: f64 = 15.0;

    /// 单篇文章影响上限
    pub const MAX_ARTICLE_IMPACT: f64 = 25.0;

    /// 未识别品种使用的市场权重
    pub const MARKET_WEIGHT: f64 = 0.30;

    /// 秒级快照新鲜度窗口默认值（秒），可被SNAPSHOT_FRESHNESS_SECS覆盖
    pub const DEFAULT_SNAPSHOT_FRESHNESS_SECS: i64 = 70;

    /// 待评分队列容量（每来源）
    pub const TO_SCORE_QUEUE_CAPACITY: usize = 100;

    /// 保存队列容量（每来源）
    pub const TO_SAVE_QUEUE_CAPACITY: usize = 500;

    /// 全局已评分影响队列容量
    pub const SCORED_IMPACTS_CAPACITY: usize = 500;

    /// 已完成K线交接队列容量（聚合器 -> composer）
    pub const CANDLE_QUEUE_CAPACITY: usize = 16;

    /// 数据库写入队列容量
    pub const DB_WRITE_QUEUE_CAPACITY: usize = 1000;

    /// 滚动成交缓冲每满多少笔出一根K线
    pub const TICKS_PER_VOLUME_CANDLE: usize = 100;

    /// 秒聚合循环节拍（毫秒）
    pub const AGGREGATION_TICK_MS: u64 = 100;

    /// 去重缓存TTL（秒）与容量上限
    pub const DEDUP_CACHE_TTL_SECS: u64 = 3600;
    pub const DEDUP_CACHE_MAX_ENTRIES: usize = 5000;

    /// 保存硬截止（秒），从入队时刻起算
    pub const SAVE_DEADLINE_SECS: i64 = 60;

    /// 新闻HTTP拉取超时（秒）
    pub const NEWS_FETCH_TIMEOUT_SECS: u64 = 3;

    /// 观察名单轮询最小间隔（秒/每品种）
    pub const WATCHLIST_MIN_INTERVAL_SECS: u64 = 40;

    /// RSS单源轮询最小间隔（秒）
    pub const RSS_FEED_MIN_INTERVAL_SECS: u64 = 60;

    /// 市场新闻轮询最小间隔（秒）
    pub const MARKET_NEWS_MIN_INTERVAL_SECS: u64 = 5;

    /// WebSocket心跳间隔与Pong超时（秒）
    pub const WS_PING_INTERVAL_SECS: u64 = 15;
    pub const WS_PONG_TIMEOUT_SECS: u64 = 5;

    /// 健康检查间隔与无数据判死阈值（秒）
    pub const WS_HEALTH_CHECK_INTERVAL_SECS: u64 = 5;
    pub const WS_STALL_THRESHOLD_SECS: u64 = 15;

    /// 重连：快速通道延迟与指数退避上限（秒）
    pub const WS_FAST_RECONNECT_SECS: u64 = 2;
    pub const WS_MAX_BACKOFF_SECS: u64 = 60;

    /// 市场关闭时重新检查间隔上限（秒）
    pub const MARKET_RECHECK_MAX_SECS: u64 = 300;
}

/// 成分股观察名单（40只权重股）
pub const WATCHLIST: [&str; 40] = [
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "AVGO",
    "COST", "NFLX", "AMD", "PEP", "ADBE", "CSCO", "CMCSA", "INTC",
    "TMUS", "QCOM", "INTU", "TXN", "AMGN", "HON", "AMAT", "SBUX",
    "ISRG", "BKNG", "ADP", "GILD", "ADI", "VRTX", "MDLZ", "REGN",
    "LRCX", "PANW", "MU", "PYPL", "SNPS", "KLAC", "CDNS", "MELI",
];

/// 大市值成分股的显式权重，其余成分股使用小权重
const LARGE_CAP_WEIGHTS: [(&str, f64); 8] = [
    ("AAPL", 0.14),
    ("MSFT", 0.13),
    ("GOOGL", 0.08),
    ("AMZN", 0.07),
    ("NVDA", 0.06),
    ("META", 0.04),
    ("TSLA", 0.03),
    ("AVGO", 0.03),
];

/// 小市值成分股的统一权重
const SMALL_CAP_WEIGHT: f64 = 0.004;

/// 标的构成：品种、展示名与成分权重表
///
/// 权重在进程生命周期内不可变，成分权重 + 市场桶之和约等于1.0。
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub display_name: String,
    weights: HashMap<String, f64>,
}

impl Instrument {
    pub fn new(symbol: String, display_name: String) -> Self {
        let mut weights = HashMap::with_capacity(WATCHLIST.len());
        for ticker in WATCHLIST {
            weights.insert(ticker.to_string(), SMALL_CAP_WEIGHT);
        }
        for (ticker, w) in LARGE_CAP_WEIGHTS {
            weights.insert(ticker.to_string(), w);
        }
        Self {
            symbol,
            display_name,
            weights,
        }
    }

    /// 成分权重，未识别的品种落入市场桶
    pub fn weight_for(&self, symbol: &str) -> f64 {
        self.weights
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(constants::MARKET_WEIGHT)
    }

    /// 成分权重 + 市场桶之和
    pub fn weights_sum(&self) -> f64 {
        self.weights.values().sum::<f64>() + constants::MARKET_WEIGHT
    }
}

/// 情绪评分后端选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerKind {
    /// 单次批量HTTP调用，延迟低
    Fast,
    /// 逐篇调用，精度高
    Accurate,
}

/// 情绪引擎运行时配置
#[derive(Debug, Clone)]
pub struct SentimentConfig {
    pub instrument_symbol: String,
    pub tick_stream_api_key: String,
    /// 行情流URL，可覆盖用于测试
    pub tick_stream_url: String,
    pub scorer_kind: ScorerKind,
    pub sentiment_api_key_fast: String,
    pub sentiment_api_key_accurate: String,
    pub company_news_api_key: String,
    pub market_news_api_key: String,
    pub enable_company_news: bool,
    pub enable_market_news: bool,
    pub enable_rss_news: bool,
    pub rss_feeds_config_path: String,
    pub skip_market_hours: bool,
    /// SQLite数据库文件路径
    pub database_path: String,
    /// 秒级快照新鲜度窗口（秒）
    pub snapshot_freshness_secs: i64,
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl SentimentConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        let scorer_kind = match env_or("SENTIMENT_PROVIDER", "fast").to_lowercase().as_str() {
            "fast" => ScorerKind::Fast,
            "accurate" => ScorerKind::Accurate,
            other => {
                return Err(AppError::ConfigError(format!(
                    "无效的SENTIMENT_PROVIDER: {}（应为 fast 或 accurate）",
                    other
                )))
            }
        };

        let snapshot_freshness_secs = env_or(
            "SNAPSHOT_FRESHNESS_SECS",
            &constants::DEFAULT_SNAPSHOT_FRESHNESS_SECS.to_string(),
        )
        .parse::<i64>()
        .map_err(|e| AppError::ConfigError(format!("无效的SNAPSHOT_FRESHNESS_SECS: {}", e)))?;

        let config = Self {
            instrument_symbol: env_or("INSTRUMENT_SYMBOL", "QLD"),
            tick_stream_api_key: env_or("TICK_STREAM_API_KEY", ""),
            tick_stream_url: env_or("TICK_STREAM_URL", "wss://ws.tickstream.example.com/ws/us"),
            scorer_kind,
            sentiment_api_key_fast: env_or("SENTIMENT_API_KEY_FAST", ""),
            sentiment_api_key_accurate: env_or("SENTIMENT_API_KEY_ACCURATE", ""),
            company_news_api_key: env_or("COMPANY_NEWS_API_KEY", ""),
            market_news_api_key: env_or("MARKET_NEWS_API_KEY", ""),
            enable_company_news: env_bool("ENABLE_COMPANY_NEWS", true),
            enable_market_news: env_bool("ENABLE_MARKET_NEWS", true),
            enable_rss_news: env_bool("ENABLE_RSS_NEWS", false),
            rss_feeds_config_path: env_or("RSS_FEEDS_CONFIG_PATH", "config/rss_feeds.json"),
            skip_market_hours: env_bool("SKIP_MARKET_HOURS_CHECK", false),
            database_path: env_or("DATABASE_URL", "sentiment_data.db"),
            snapshot_freshness_secs,
        };

        config.validate()?;
        Ok(config)
    }

    /// 校验配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.instrument_symbol.is_empty() {
            return Err(AppError::ConfigError("标的品种不能为空".to_string()));
        }
        if self.snapshot_freshness_secs <= 0 {
            return Err(AppError::ConfigError(
                "快照新鲜度窗口必须大于0".to_string(),
            ));
        }
        if self.database_path.is_empty() {
            return Err(AppError::ConfigError("数据库路径不能为空".to_string()));
        }
        Ok(())
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(
            self.instrument_symbol.clone(),
            "ProShares Ultra QQQ (2x Leveraged NASDAQ-100 ETF)".to_string(),
        )
    }
}

/// RSS订阅源配置文件：{"feeds": [{"url": .., "source": ..}]}
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RssFeedsConfig {
    pub feeds: Vec<RssFeedEntry>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RssFeedEntry {
    pub url: String,
    #[serde(default = "default_rss_source")]
    pub source: String,
}

fn default_rss_source() -> String {
    "RSS".to_string()
}

impl RssFeedsConfig {
    /// 从JSON文件加载RSS订阅源列表
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(AppError::IoError)?;
        let config: Self = serde_json::from_str(&content)?;
        if config.feeds.is_empty() {
            return Err(AppError::ConfigError(format!(
                "RSS订阅源列表为空: {}",
                path
            )));
        }
        Ok(config)
    }
}
