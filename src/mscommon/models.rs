use serde::{Deserialize, Serialize};

/// 上游行情流原始Tick消息
///
/// 格式: {"s": 品种, "p": 价格, "v": 成交量, "t": 毫秒时间戳}
/// 无成交价时可能只带买一/卖一价（bp/ap），解析时作为回退。
#[derive(Debug, Clone, Deserialize)]
pub struct RawStreamTick {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Option<f64>,
    #[serde(rename = "v", default)]
    pub volume: f64,
    #[serde(rename = "t")]
    pub timestamp: Option<i64>,
    #[serde(rename = "bp")]
    pub bid_price: Option<f64>,
    #[serde(rename = "ap")]
    pub ask_price: Option<f64>,
}

/// 解析后的应用内部Tick数据
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    /// 成交价格，恒为正
    pub price: f64,
    /// 成交量，非负
    pub volume: f64,
    /// 成交时间戳（毫秒）
    pub timestamp_ms: i64,
}

impl Tick {
    /// 所属整秒桶（UTC向下取整）
    pub fn bucket_second(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// 1秒K线 - 每个整秒桶恰好一根
#[derive(Debug, Clone)]
pub struct SecondCandle {
    pub symbol: String,
    /// 整秒桶时间戳（秒）
    pub bucket_second: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// 成交量合计
    pub volume: f64,
    /// Tick数量，恒 >= 1
    pub tick_count: i64,
}

impl SecondCandle {
    /// 从按到达顺序排列的tick序列构建1秒K线
    ///
    /// tick列表为空时无法构建（每根K线至少一笔成交）。
    pub fn from_ticks(symbol: &str, bucket_second: i64, ticks: &[Tick]) -> Option<Self> {
        let first = ticks.first()?;
        let mut high = first.price;
        let mut low = first.price;
        let mut volume = 0.0;
        for t in ticks {
            if t.price > high {
                high = t.price;
            }
            if t.price < low {
                low = t.price;
            }
            volume += t.volume;
        }
        Some(Self {
            symbol: symbol.to_string(),
            bucket_second,
            open: first.price,
            high,
            low,
            close: ticks.last()?.price,
            volume,
            tick_count: ticks.len() as i64,
        })
    }
}

/// 100笔成交K线 - 滚动缓冲每满100笔出一根
#[derive(Debug, Clone)]
pub struct TickCandle100 {
    pub symbol: String,
    /// 序列号，严格递增，跨进程重启续接
    pub sequence: i64,
    /// 首笔成交时间（毫秒）
    pub first_tick_time_ms: i64,
    /// 末笔成交时间（毫秒）
    pub last_tick_time_ms: i64,
    pub duration_seconds: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// 恒等于100
    pub tick_count: i64,
}

impl TickCandle100 {
    pub fn from_ticks(symbol: &str, sequence: i64, ticks: &[Tick]) -> Option<Self> {
        let first = ticks.first()?;
        let last = ticks.last()?;
        let mut high = first.price;
        let mut low = first.price;
        let mut volume = 0.0;
        for t in ticks {
            if t.price > high {
                high = t.price;
            }
            if t.price < low {
                low = t.price;
            }
            volume += t.volume;
        }
        Some(Self {
            symbol: symbol.to_string(),
            sequence,
            first_tick_time_ms: first.timestamp_ms,
            last_tick_time_ms: last.timestamp_ms,
            duration_seconds: (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0,
            open: first.price,
            high,
            low,
            close: last.price,
            volume,
            tick_count: ticks.len() as i64,
        })
    }
}

/// 新闻文章
///
/// 由采集器创建，打分后由评分worker补全sentiment/impact，
/// 保存worker落库后不再变更。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// 来源标签（company / market / rss源名）
    pub source: String,
    /// 关联品种，无明确品种时为 "MARKET"
    pub symbol: String,
    pub headline: String,
    pub summary: String,
    pub url: String,
    /// 发布时间（毫秒时间戳）
    pub publish_time_ms: i64,
    /// 稳定32位hex摘要，跨来源唯一
    pub hash: String,
    /// 情绪值 [-1, +1]
    pub sentiment: f64,
    /// 单篇影响 [-25, +25]
    pub impact: f64,
    pub weighted_contribution: f64,
    /// 入队时刻（毫秒时间戳），与created_at区分：保存可能延迟
    pub fetched_at_ms: i64,
}

/// 采集到、尚未评分的文章候选
#[derive(Debug, Clone)]
pub struct ArticleCandidate {
    pub source: String,
    pub symbol: String,
    pub headline: String,
    pub summary: String,
    pub url: String,
    pub publish_time_ms: i64,
    pub hash: String,
}

/// 分钟级分析行 - 由外部分钟分析器产出，本系统只读
#[derive(Debug, Clone)]
pub struct MinuteRow {
    pub id: i64,
    pub symbol: String,
    pub timestamp_ms: i64,
    pub composite: f64,
    pub news: f64,
    pub reddit: f64,
    pub technical: f64,
    pub analyst: f64,
    pub label: String,
    pub article_count: i64,
    pub cached_count: i64,
    pub new_count: i64,
    pub price_open: f64,
    pub price_high: f64,
    pub price_low: f64,
    pub price_close: f64,
    pub volume: f64,
    pub rsi: f64,
    pub macd: f64,
    pub volatility_index: f64,
}

/// 秒级快照 - 每个(品种, 整秒桶)至多一条，只追加
#[derive(Debug, Clone)]
pub struct SecondSnapshot {
    pub symbol: String,
    pub bucket_second: i64,
    pub composite: f64,
    pub news_cached: f64,
    pub technical_cached: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: i64,
}

/// 已评分影响 - 评分worker产出，composer在下一秒消费
#[derive(Debug, Clone, Copy)]
pub struct ScoredImpact {
    /// 单篇影响 [-25, +25]
    pub impact: f64,
    /// 评分完成时刻（毫秒时间戳）
    pub scored_at_ms: i64,
}

/// 保存任务 - 评分worker入队，保存worker落库
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub article: Article,
    /// 入队时刻（毫秒），超过60秒硬截止则丢弃
    pub enqueued_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, volume: f64, ts_ms: i64) -> Tick {
        Tick {
            symbol: "QLD".to_string(),
            price,
            volume,
            timestamp_ms: ts_ms,
        }
    }

    #[test]
    fn test_bucket_second_floor() {
        assert_eq!(tick(85.0, 1.0, 1_700_000_000_999).bucket_second(), 1_700_000_000);
        assert_eq!(tick(85.0, 1.0, 1_700_000_000_000).bucket_second(), 1_700_000_000);
    }

    #[test]
    fn test_second_candle_ohlc_invariants() {
        let ticks = vec![
            tick(85.10, 100.0, 1000),
            tick(85.30, 50.0, 1200),
            tick(84.90, 75.0, 1500),
            tick(85.05, 25.0, 1900),
        ];
        let candle = SecondCandle::from_ticks("QLD", 1, &ticks).unwrap();
        assert_eq!(candle.open, 85.10);
        assert_eq!(candle.close, 85.05);
        assert_eq!(candle.high, 85.30);
        assert_eq!(candle.low, 84.90);
        assert_eq!(candle.volume, 250.0);
        assert_eq!(candle.tick_count, 4);
        // 高低价包络
        assert!(candle.high >= candle.open.max(candle.close).max(candle.low));
        assert!(candle.low <= candle.open.min(candle.close).min(candle.high));
    }

    #[test]
    fn test_second_candle_empty() {
        assert!(SecondCandle::from_ticks("QLD", 1, &[]).is_none());
    }

    #[test]
    fn test_tick_candle_100_time_ordering() {
        let ticks: Vec<Tick> = (0..100).map(|i| tick(85.0 + i as f64 * 0.01, 10.0, 1000 + i * 37)).collect();
        let candle = TickCandle100::from_ticks("QLD", 7, &ticks).unwrap();
        assert_eq!(candle.tick_count, 100);
        assert!(candle.last_tick_time_ms >= candle.first_tick_time_ms);
        assert!((candle.duration_seconds - (99 * 37) as f64 / 1000.0).abs() < 1e-9);
        assert_eq!(candle.sequence, 7);
    }

    #[test]
    fn test_raw_tick_parse_with_bid_ask_fallback() {
        let raw: RawStreamTick =
            serde_json::from_str(r#"{"s":"QLD","bp":85.01,"ap":85.03,"v":10,"t":1700000000123}"#)
                .unwrap();
        assert!(raw.price.is_none());
        assert_eq!(raw.bid_price, Some(85.01));
        assert_eq!(raw.timestamp, Some(1700000000123));
    }
}
