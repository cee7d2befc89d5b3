//! 秒级情绪合成器模块
//!
//! 每根定稿的1秒K线触发一次合成：选取基准分、施加每秒衰减、
//! 吸收已评分影响、计算微动量并混合技术面，最终落一条秒级快照。
//! 合成逻辑为纯函数，线程壳只负责队列消费与持久化。

use crate::mscommon::config::constants::{
    MICRO_MOMENTUM_SCALE, MICRO_MOMENTUM_WINDOW, SECOND_DECAY_RATE, TECHNICAL_BASE_WEIGHT,
    TECHNICAL_MICRO_WEIGHT, WEIGHT_ANALYST, WEIGHT_NEWS, WEIGHT_REDDIT, WEIGHT_TECHNICAL,
};
use crate::mscommon::db::Database;
use crate::mscommon::models::{MinuteRow, ScoredImpact, SecondCandle, SecondSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 合成器日志目标
const COMPOSER_TARGET: &str = "情绪合成";

/// 新闻分残值阈值：绝对值低于此值归零，防止永久微小残留
const NEWS_FLUSH_THRESHOLD: f64 = 0.01;

/// 一次合成的全部输入
pub struct ComposeInputs<'a> {
    /// 最新分钟分析行（基准分来源之一）
    pub minute_row: Option<&'a MinuteRow>,
    /// 最新秒级快照（新鲜时优先作为基准）
    pub latest_snapshot: Option<&'a SecondSnapshot>,
    /// 最近快照收盘价，时间升序（微动量输入）
    pub recent_closes: &'a [f64],
    /// 本秒排空的已评分影响
    pub impacts: &'a [f64],
    /// 刚定稿的1秒K线
    pub candle: &'a SecondCandle,
    /// 当前墙钟秒
    pub now_second: i64,
    /// 快照新鲜度窗口（秒）
    pub freshness_secs: i64,
}

/// 合成一条秒级快照（纯函数）
pub fn compose_second(inputs: &ComposeInputs<'_>) -> SecondSnapshot {
    // 1. 基准选取：新鲜快照优先，否则退回分钟行
    let snapshot_fresh = inputs
        .latest_snapshot
        .map(|s| inputs.now_second - s.bucket_second < inputs.freshness_secs)
        .unwrap_or(false);

    let (base_news, base_technical) = if snapshot_fresh {
        let snap = inputs.latest_snapshot.unwrap();
        (snap.news_cached, snap.technical_cached)
    } else {
        match inputs.minute_row {
            Some(row) => (row.news, row.technical),
            None => (0.0, 0.0),
        }
    };

    // reddit与分析师分只随分钟行更新
    let (reddit, analyst) = match inputs.minute_row {
        Some(row) => (row.reddit, row.analyst),
        None => (0.0, 0.0),
    };

    // 2. 新闻衰减：每秒按(1 - r)压缩
    let mut news = base_news * (1.0 - SECOND_DECAY_RATE);

    // 3. 吸收本秒排空的影响并截断
    for impact in inputs.impacts {
        news += impact;
    }
    news = news.clamp(-100.0, 100.0);
    if news.abs() < NEWS_FLUSH_THRESHOLD {
        news = 0.0;
    }

    // 4. 微动量：至少30根近期K线才计算
    let micro = micro_momentum(inputs.recent_closes, inputs.candle.close);

    // 5. 技术面混合
    let technical =
        (base_technical * TECHNICAL_BASE_WEIGHT + micro * TECHNICAL_MICRO_WEIGHT).clamp(-100.0, 100.0);

    // 7. 综合分
    let composite = (news * WEIGHT_NEWS
        + reddit * WEIGHT_REDDIT
        + technical * WEIGHT_TECHNICAL
        + analyst * WEIGHT_ANALYST)
        .clamp(-100.0, 100.0);

    SecondSnapshot {
        symbol: inputs.candle.symbol.clone(),
        bucket_second: inputs.candle.bucket_second,
        composite,
        news_cached: news,
        technical_cached: technical,
        open: inputs.candle.open,
        high: inputs.candle.high,
        low: inputs.candle.low,
        close: inputs.candle.close,
        volume: inputs.candle.volume,
        tick_count: inputs.candle.tick_count,
    }
}

/// 30秒窗口价格速度指标
///
/// `recent_closes`时间升序；不足30根时返回0。
pub fn micro_momentum(recent_closes: &[f64], close_now: f64) -> f64 {
    if recent_closes.len() < MICRO_MOMENTUM_WINDOW {
        return 0.0;
    }
    let close_30s_ago = recent_closes[recent_closes.len() - MICRO_MOMENTUM_WINDOW];
    if close_30s_ago == 0.0 {
        return 0.0;
    }
    let pct = (close_now - close_30s_ago) / close_30s_ago * 100.0;
    (pct * MICRO_MOMENTUM_SCALE).clamp(-100.0, 100.0)
}

/// 秒级情绪合成线程
///
/// 按桶秒顺序消费K线，影响排空为非阻塞；关闭时先排空待处理K线队列再退出。
pub struct SentimentComposer {
    symbol: String,
    db: Arc<Database>,
    freshness_secs: i64,
    candle_rx: crossbeam_channel::Receiver<SecondCandle>,
    impacts_rx: crossbeam_channel::Receiver<ScoredImpact>,
    running: Arc<AtomicBool>,
}

impl SentimentComposer {
    pub fn new(
        symbol: String,
        db: Arc<Database>,
        freshness_secs: i64,
        candle_rx: crossbeam_channel::Receiver<SecondCandle>,
        impacts_rx: crossbeam_channel::Receiver<ScoredImpact>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            symbol,
            db,
            freshness_secs,
            candle_rx,
            impacts_rx,
            running,
        }
    }

    /// 在专属线程上启动合成循环
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("composer".to_string())
            .spawn(move || self.run())
            .expect("合成线程创建失败")
    }

    fn run(self) {
        info!(target: COMPOSER_TARGET, symbol = %self.symbol, "秒级情绪合成线程启动");
        let mut composed: u64 = 0;

        while self.running.load(Ordering::Relaxed) {
            match self.candle_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(candle) => {
                    self.compose_and_persist(candle);
                    composed += 1;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        // 关闭时排空待处理K线队列
        let mut drained = 0;
        while let Ok(candle) = self.candle_rx.try_recv() {
            self.compose_and_persist(candle);
            drained += 1;
        }

        info!(
            target: COMPOSER_TARGET,
            composed,
            drained,
            "秒级情绪合成线程停止"
        );
    }

    fn compose_and_persist(&self, candle: SecondCandle) {
        // 非阻塞排空已评分影响
        let mut impacts = Vec::new();
        while let Ok(scored) = self.impacts_rx.try_recv() {
            impacts.push(scored.impact);
        }
        if !impacts.is_empty() {
            let total: f64 = impacts.iter().sum();
            info!(
                target: COMPOSER_TARGET,
                count = impacts.len(),
                total_impact = total,
                "本秒吸收已评分影响"
            );
        }

        let minute_row = match self.db.latest_minute_row(&self.symbol) {
            Ok(row) => row,
            Err(e) => {
                warn!(target: COMPOSER_TARGET, error = %e, "读取最新分钟行失败，按无基准处理");
                None
            }
        };
        let latest_snapshot = match self.db.latest_snapshot(&self.symbol) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(target: COMPOSER_TARGET, error = %e, "读取最新快照失败，按无快照处理");
                None
            }
        };
        let recent_closes: Vec<f64> = match self.db.recent_snapshots(&self.symbol, 60) {
            Ok(snaps) => snaps.iter().map(|s| s.close).collect(),
            Err(e) => {
                warn!(target: COMPOSER_TARGET, error = %e, "读取近期快照失败，微动量置0");
                Vec::new()
            }
        };

        let now_second = chrono::Utc::now().timestamp();
        let snapshot = compose_second(&ComposeInputs {
            minute_row: minute_row.as_ref(),
            latest_snapshot: latest_snapshot.as_ref(),
            recent_closes: &recent_closes,
            impacts: &impacts,
            candle: &candle,
            now_second,
            freshness_secs: self.freshness_secs,
        });

        debug!(
            target: COMPOSER_TARGET,
            bucket_second = snapshot.bucket_second,
            composite = snapshot.composite,
            news = snapshot.news_cached,
            technical = snapshot.technical_cached,
            "合成完成"
        );

        match self.db.insert_second_snapshot_with_retry(&snapshot) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    target: COMPOSER_TARGET,
                    bucket_second = snapshot.bucket_second,
                    "该秒快照已存在，跳过"
                );
            }
            Err(e) => {
                // 写入失败只记日志，该秒已由聚合器标记处理，循环继续
                error!(
                    target: COMPOSER_TARGET,
                    bucket_second = snapshot.bucket_second,
                    error = %e,
                    "快照写入3次重试后失败"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(bucket: i64, close: f64) -> SecondCandle {
        SecondCandle {
            symbol: "QLD".to_string(),
            bucket_second: bucket,
            open: close,
            high: close,
            low: close,
            close,
            volume: 100.0,
            tick_count: 1,
        }
    }

    fn minute_row(news: f64, reddit: f64, technical: f64, analyst: f64) -> MinuteRow {
        MinuteRow {
            id: 1,
            symbol: "QLD".to_string(),
            timestamp_ms: 1_700_000_000_000,
            composite: 0.0,
            news,
            reddit,
            technical,
            analyst,
            label: "neutral".to_string(),
            article_count: 0,
            cached_count: 0,
            new_count: 0,
            price_open: 85.0,
            price_high: 85.0,
            price_low: 85.0,
            price_close: 85.0,
            volume: 0.0,
            rsi: 50.0,
            macd: 0.0,
            volatility_index: 20.0,
        }
    }

    #[test]
    fn test_base_from_minute_row_when_no_snapshot() {
        let row = minute_row(40.0, 25.0, 55.0, 30.0);
        let c = candle(1_700_000_000, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: None,
            recent_closes: &[],
            impacts: &[],
            candle: &c,
            now_second: 1_700_000_001,
            freshness_secs: 70,
        });

        let expected_news = 40.0 * (1.0 - SECOND_DECAY_RATE);
        assert!((snap.news_cached - expected_news).abs() < 1e-9);
        // 不足30根K线，微动量为0，技术面 = 0.8 * 55
        assert!((snap.technical_cached - 44.0).abs() < 1e-9);
        let expected_composite = expected_news * 0.35 + 25.0 * 0.20 + 44.0 * 0.25 + 30.0 * 0.20;
        assert!((snap.composite - expected_composite).abs() < 1e-9);
    }

    #[test]
    fn test_base_from_fresh_snapshot() {
        let row = minute_row(40.0, 25.0, 55.0, 30.0);
        let prev = SecondSnapshot {
            symbol: "QLD".to_string(),
            bucket_second: 1_700_000_000,
            composite: 36.0,
            news_cached: 52.35,
            technical_cached: 44.0,
            open: 85.0,
            high: 85.0,
            low: 85.0,
            close: 85.0,
            volume: 0.0,
            tick_count: 1,
        };
        let c = candle(1_700_000_001, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: Some(&prev),
            recent_closes: &[],
            impacts: &[],
            candle: &c,
            now_second: 1_700_000_001,
            freshness_secs: 70,
        });

        // 新鲜快照优先：基准新闻分取快照缓存而非分钟行
        let expected_news = 52.35 * (1.0 - SECOND_DECAY_RATE);
        assert!((snap.news_cached - expected_news).abs() < 1e-9);
        // reddit/分析师仍取分钟行
        let expected_composite =
            expected_news * 0.35 + 25.0 * 0.20 + (44.0 * 0.8) * 0.25 + 30.0 * 0.20;
        assert!((snap.composite - expected_composite).abs() < 1e-9);
    }

    #[test]
    fn test_stale_snapshot_falls_back_to_minute_row() {
        let row = minute_row(40.0, 0.0, 0.0, 0.0);
        let prev = SecondSnapshot {
            symbol: "QLD".to_string(),
            bucket_second: 1_700_000_000 - 200,
            composite: 0.0,
            news_cached: 99.0,
            technical_cached: 99.0,
            open: 85.0,
            high: 85.0,
            low: 85.0,
            close: 85.0,
            volume: 0.0,
            tick_count: 1,
        };
        let c = candle(1_700_000_000, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: Some(&prev),
            recent_closes: &[],
            impacts: &[],
            candle: &c,
            now_second: 1_700_000_000,
            freshness_secs: 70,
        });

        // 过期快照被忽略，基准取分钟行的40.0
        assert!((snap.news_cached - 40.0 * (1.0 - SECOND_DECAY_RATE)).abs() < 1e-9);
    }

    #[test]
    fn test_decay_law_compounds_to_documented_rate() {
        // 从N开始60秒无新影响，news应衰减到 N * (1-r)^60 ≈ N * 0.9624
        let n0 = 40.0f64;
        let mut news = n0;
        for _ in 0..60 {
            news *= 1.0 - SECOND_DECAY_RATE;
        }
        let expected = n0 * (1.0 - SECOND_DECAY_RATE).powi(60);
        assert!((news - expected).abs() < 1e-6);
        // 复利衰减与标称3.83%/分钟的偏差在文档容差内
        assert!((expected / n0 - 0.9617).abs() < 1e-3);
    }

    #[test]
    fn test_impacts_applied_after_decay() {
        let row = minute_row(39.75, 25.0, 55.0, 30.0);
        let c = candle(1_700_000_015, 85.0);
        // 权重0.14、情绪+0.9的成分股新闻：impact = clip(0.9*0.14*100, ±25) = 12.6
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: None,
            recent_closes: &[],
            impacts: &[12.6],
            candle: &c,
            now_second: 1_700_000_015,
            freshness_secs: 70,
        });
        let expected = 39.75 * (1.0 - SECOND_DECAY_RATE) + 12.6;
        assert!((snap.news_cached - expected).abs() < 1e-9);
        assert!(snap.news_cached > 52.0 && snap.news_cached < 52.5);
    }

    #[test]
    fn test_news_clipped_to_plus_minus_100() {
        let row = minute_row(95.0, 0.0, 0.0, 0.0);
        let c = candle(1_700_000_000, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: None,
            recent_closes: &[],
            impacts: &[25.0, 25.0],
            candle: &c,
            now_second: 1_700_000_000,
            freshness_secs: 70,
        });
        assert_eq!(snap.news_cached, 100.0);
        assert!(snap.composite <= 100.0);
    }

    #[test]
    fn test_tiny_news_residue_flushed_to_zero() {
        let row = minute_row(0.009, 0.0, 0.0, 0.0);
        let c = candle(1_700_000_000, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: None,
            recent_closes: &[],
            impacts: &[],
            candle: &c,
            now_second: 1_700_000_000,
            freshness_secs: 70,
        });
        assert_eq!(snap.news_cached, 0.0);
    }

    #[test]
    fn test_micro_momentum_requires_30_candles() {
        let closes: Vec<f64> = vec![85.0; 29];
        assert_eq!(micro_momentum(&closes, 86.0), 0.0);

        let closes: Vec<f64> = vec![85.0; 30];
        // 1%涨幅 * 15 = 15分... (85.85-85)/85*100 = 1.0%
        let m = micro_momentum(&closes, 85.85);
        assert!((m - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_micro_momentum_clipped() {
        let closes: Vec<f64> = vec![85.0; 30];
        // 10%瞬间涨幅远超界限，截断到100
        assert_eq!(micro_momentum(&closes, 93.5), 100.0);
        assert_eq!(micro_momentum(&closes, 76.5), -100.0);
    }

    #[test]
    fn test_smooth_decay_trajectory_is_monotonic() {
        // 端到端场景：基准(news=40, reddit=25, technical=55, analyst=30)，
        // 60秒恒定价格无新影响，news单调下降，composite随之单调下降
        let row = minute_row(40.0, 25.0, 55.0, 30.0);
        let mut prev_snapshot: Option<SecondSnapshot> = None;
        let mut composites = Vec::new();

        for s in 0..60i64 {
            let c = candle(1_700_000_000 + s, 85.0);
            let snap = compose_second(&ComposeInputs {
                minute_row: Some(&row),
                latest_snapshot: prev_snapshot.as_ref(),
                recent_closes: &[],
                impacts: &[],
                candle: &c,
                now_second: 1_700_000_000 + s,
                freshness_secs: 70,
            });
            composites.push((snap.news_cached, snap.composite));
            prev_snapshot = Some(snap);
        }

        for window in composites.windows(2) {
            assert!(window[1].0 < window[0].0, "news应单调下降");
            assert!(window[1].1 < window[0].1, "composite应单调下降");
        }
        // 60秒后news ≈ 40 * 0.9624
        let final_news = composites.last().unwrap().0;
        assert!((final_news - 40.0 * (1.0 - SECOND_DECAY_RATE).powi(60)).abs() < 1e-6);
    }

    #[test]
    fn test_first_second_technical_blend() {
        // 首秒无快照：technical = 0.8*55 + 0.2*0 = 44
        let row = minute_row(40.0, 25.0, 55.0, 30.0);
        let c = candle(1_700_000_000, 85.0);
        let snap = compose_second(&ComposeInputs {
            minute_row: Some(&row),
            latest_snapshot: None,
            recent_closes: &[],
            impacts: &[],
            candle: &c,
            now_second: 1_700_000_000,
            freshness_secs: 70,
        });
        assert!((snap.technical_cached - 44.0).abs() < 1e-9);
    }
}
