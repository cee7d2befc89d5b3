//! Tick聚合器模块
//!
//! 消费内存中的tick流，产出两个维度的K线：
//! 每个墙钟秒恰好一根1秒K线，每满100笔成交一根100笔K线。
//! tick缓冲、滚动缓冲与已处理秒集合由同一把互斥锁保护，聚合器独占所有权。

use crate::mscommon::config::constants::{AGGREGATION_TICK_MS, TICKS_PER_VOLUME_CANDLE};
use crate::mscommon::db::Database;
use crate::mscommon::error::Result;
use crate::mscommon::models::{SecondCandle, Tick, TickCandle100};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// 聚合器日志目标
const AGGREGATOR_TARGET: &str = "聚合器";

/// 已处理秒集合的保留窗口（秒）
const PROCESSED_RETENTION_SECS: i64 = 300;

/// 每多少次循环迭代修剪一次已处理秒集合
const PRUNE_EVERY_ITERATIONS: u64 = 60;

/// 聚合器内部状态，单锁保护
struct AggregatorState {
    /// 秒桶 -> 按到达顺序的tick列表
    second_buffer: BTreeMap<i64, Vec<Tick>>,
    /// 滚动100笔缓冲
    rolling_ticks: Vec<Tick>,
    /// 已出K线的秒桶集合
    processed_seconds: HashSet<i64>,
    /// 100笔K线序列号，严格递增
    candle_sequence: i64,
}

/// Tick聚合器
pub struct TickAggregator {
    symbol: String,
    state: Mutex<AggregatorState>,
    db: Arc<Database>,
    candle_tx: crossbeam_channel::Sender<SecondCandle>,
}

impl TickAggregator {
    /// 创建聚合器，100笔K线序列号从数据库续接
    pub fn new(
        symbol: String,
        db: Arc<Database>,
        candle_tx: crossbeam_channel::Sender<SecondCandle>,
    ) -> Result<Self> {
        let candle_sequence = db.max_candle_sequence(&symbol)?;
        if candle_sequence > 0 {
            info!(
                target: AGGREGATOR_TARGET,
                candle_sequence,
                "100笔K线序列号从数据库续接"
            );
        }
        Ok(Self {
            symbol,
            state: Mutex::new(AggregatorState {
                second_buffer: BTreeMap::new(),
                rolling_ticks: Vec::with_capacity(TICKS_PER_VOLUME_CANDLE * 2),
                processed_seconds: HashSet::new(),
                candle_sequence,
            }),
            db,
            candle_tx,
        })
    }

    /// 消息处理入口：tick入两个维度的缓冲
    ///
    /// 已处理秒的tick为迟到tick：1秒维度忽略，100笔维度照常计入。
    pub fn handle_tick(&self, tick: Tick) {
        let bucket = tick.bucket_second();
        let mut completed_candle: Option<TickCandle100> = None;

        {
            let mut state = self.state.lock().unwrap();

            if state.processed_seconds.contains(&bucket) {
                // 迟到tick日志只在verbose级别输出
                debug!(
                    target: AGGREGATOR_TARGET,
                    bucket_second = bucket,
                    price = tick.price,
                    "迟到tick：该秒已出K线，仅计入100笔维度"
                );
            } else {
                state
                    .second_buffer
                    .entry(bucket)
                    .or_insert_with(Vec::new)
                    .push(tick.clone());
            }

            state.rolling_ticks.push(tick);

            if state.rolling_ticks.len() >= TICKS_PER_VOLUME_CANDLE {
                // 切出最早的100笔，溢出部分留给下一窗口
                let window: Vec<Tick> =
                    state.rolling_ticks.drain(..TICKS_PER_VOLUME_CANDLE).collect();
                state.candle_sequence += 1;
                completed_candle =
                    TickCandle100::from_ticks(&self.symbol, state.candle_sequence, &window);
            }
        }

        // 持久化在锁外进行
        if let Some(candle) = completed_candle {
            info!(
                target: AGGREGATOR_TARGET,
                sequence = candle.sequence,
                close = candle.close,
                duration_s = candle.duration_seconds,
                "100笔K线完成"
            );
            if let Err(e) = self.db.queue_tick_candle(candle) {
                warn!(target: AGGREGATOR_TARGET, error = %e, "100笔K线入写入队列失败");
            }
        }
    }

    /// 定稿所有严格早于`now_second`且有tick的秒桶
    ///
    /// 每个定稿的秒生成一根1秒K线交给composer，并登记到已处理集合。
    /// 返回本次定稿的K线数量。
    pub fn finalize_up_to(&self, now_second: i64) -> usize {
        let candles: Vec<SecondCandle> = {
            let mut state = self.state.lock().unwrap();
            let ready: Vec<i64> = state
                .second_buffer
                .range(..now_second)
                .map(|(&k, _)| k)
                .collect();

            let mut finalized = Vec::with_capacity(ready.len());
            for bucket in ready {
                if let Some(ticks) = state.second_buffer.remove(&bucket) {
                    if let Some(candle) = SecondCandle::from_ticks(&self.symbol, bucket, &ticks) {
                        finalized.push(candle);
                    }
                    state.processed_seconds.insert(bucket);
                }
            }
            finalized
        };

        let count = candles.len();
        for candle in candles {
            match self.candle_tx.try_send(candle) {
                Ok(_) => {}
                Err(crossbeam_channel::TrySendError::Full(candle)) => {
                    // composer落后，丢弃但该秒保持已处理，不会产生重复K线
                    error!(
                        target: AGGREGATOR_TARGET,
                        bucket_second = candle.bucket_second,
                        "K线交接队列已满，丢弃该秒K线"
                    );
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                    debug!(target: AGGREGATOR_TARGET, "composer已停止，K线未交接");
                }
            }
        }
        count
    }

    /// 修剪已处理秒集合到最近5分钟
    fn prune_processed(&self, now_second: i64) {
        let cutoff = now_second - PROCESSED_RETENTION_SECS;
        let mut state = self.state.lock().unwrap();
        state.processed_seconds.retain(|&s| s >= cutoff);
    }

    /// 秒聚合循环：约100毫秒一个节拍
    pub async fn run_second_loop(&self, running: Arc<AtomicBool>) {
        info!(target: AGGREGATOR_TARGET, "秒聚合循环启动");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(AGGREGATION_TICK_MS));
        let mut iterations: u64 = 0;

        while running.load(Ordering::Relaxed) {
            interval.tick().await;
            iterations += 1;

            let now_second = Utc::now().timestamp();
            self.finalize_up_to(now_second);

            if iterations % PRUNE_EVERY_ITERATIONS == 0 {
                self.prune_processed(now_second);
            }
        }

        // 关闭时定稿所有在途秒桶（包括当前秒）
        let drained = self.finalize_up_to(i64::MAX);
        info!(
            target: AGGREGATOR_TARGET,
            drained,
            "秒聚合循环停止，在途秒桶已定稿"
        );
    }

    /// 已处理秒集合当前大小（监控用）
    pub fn processed_count(&self) -> usize {
        self.state.lock().unwrap().processed_seconds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mscommon::config::constants::CANDLE_QUEUE_CAPACITY;
    use std::path::PathBuf;

    fn setup(name: &str) -> (TickAggregator, crossbeam_channel::Receiver<SecondCandle>) {
        let db_path = PathBuf::from(format!("./target/test_agg_{}.db", name));
        if db_path.exists() {
            std::fs::remove_file(&db_path).unwrap();
        }
        let db = Arc::new(Database::new(&db_path).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(CANDLE_QUEUE_CAPACITY);
        let agg = TickAggregator::new("QLD".to_string(), db, tx).unwrap();
        (agg, rx)
    }

    fn tick(price: f64, ts_ms: i64) -> Tick {
        Tick {
            symbol: "QLD".to_string(),
            price,
            volume: 10.0,
            timestamp_ms: ts_ms,
        }
    }

    #[test]
    fn test_exactly_one_candle_per_second() {
        let (agg, rx) = setup("one_per_second");
        let base_s = 1_700_000_000i64;

        // 第0秒3笔，第1秒2笔
        agg.handle_tick(tick(85.00, base_s * 1000 + 100));
        agg.handle_tick(tick(85.10, base_s * 1000 + 500));
        agg.handle_tick(tick(85.05, base_s * 1000 + 900));
        agg.handle_tick(tick(85.20, (base_s + 1) * 1000 + 100));
        agg.handle_tick(tick(85.15, (base_s + 1) * 1000 + 800));

        // 墙钟推进到第2秒，两个桶都应定稿
        assert_eq!(agg.finalize_up_to(base_s + 2), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.bucket_second, base_s);
        assert_eq!(first.open, 85.00);
        assert_eq!(first.close, 85.05);
        assert_eq!(first.high, 85.10);
        assert_eq!(first.tick_count, 3);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.bucket_second, base_s + 1);
        assert_eq!(second.tick_count, 2);

        // 再次定稿同一范围不产生新K线
        assert_eq!(agg.finalize_up_to(base_s + 2), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_current_second_not_finalized() {
        let (agg, rx) = setup("current_second");
        let base_s = 1_700_000_000i64;
        agg.handle_tick(tick(85.00, base_s * 1000 + 100));

        // 墙钟仍在该秒，不定稿
        assert_eq!(agg.finalize_up_to(base_s), 0);
        assert!(rx.try_recv().is_err());

        // 下一秒才定稿
        assert_eq!(agg.finalize_up_to(base_s + 1), 1);
        assert_eq!(rx.try_recv().unwrap().bucket_second, base_s);
    }

    #[test]
    fn test_late_tick_ignored_for_second_dimension() {
        let (agg, rx) = setup("late_tick");
        let base_s = 1_700_000_000i64;

        agg.handle_tick(tick(85.00, base_s * 1000 + 100));
        assert_eq!(agg.finalize_up_to(base_s + 1), 1);
        let candle = rx.try_recv().unwrap();
        assert_eq!(candle.tick_count, 1);

        // 迟到tick：同一已处理秒
        agg.handle_tick(tick(85.50, base_s * 1000 + 900));
        assert_eq!(agg.finalize_up_to(base_s + 1), 0, "已处理秒不应再出K线");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_100_tick_candle_emitted_with_overflow() {
        let (agg, _rx) = setup("volume_candle");
        let base_ms = 1_700_000_000_000i64;

        // 103笔：一根100笔K线 + 3笔溢出留到下一窗口
        for i in 0..103 {
            agg.handle_tick(tick(85.0 + i as f64 * 0.01, base_ms + i * 50));
        }

        let state = agg.state.lock().unwrap();
        assert_eq!(state.candle_sequence, 1);
        assert_eq!(state.rolling_ticks.len(), 3);
        assert_eq!(state.rolling_ticks[0].price, 85.0 + 100.0 * 0.01);
    }

    #[test]
    fn test_late_tick_still_counts_toward_100_dimension() {
        let (agg, rx) = setup("late_100");
        let base_s = 1_700_000_000i64;

        // 99笔正常tick
        for i in 0..99 {
            agg.handle_tick(tick(85.0, base_s * 1000 + i * 10));
        }
        // 处理该秒
        agg.finalize_up_to(base_s + 1);
        let _ = rx.try_recv();

        // 迟到tick作为第100笔，应触发100笔K线
        agg.handle_tick(tick(85.5, base_s * 1000 + 999));
        let state = agg.state.lock().unwrap();
        assert_eq!(state.candle_sequence, 1, "迟到tick仍计入100笔维度");
        assert!(state.rolling_ticks.is_empty());
    }

    #[test]
    fn test_processed_set_pruning() {
        let (agg, _rx) = setup("prune");
        let base_s = 1_700_000_000i64;

        agg.handle_tick(tick(85.0, base_s * 1000));
        agg.handle_tick(tick(85.0, (base_s + 400) * 1000));
        agg.finalize_up_to(base_s + 401);
        assert_eq!(agg.processed_count(), 2);

        // 修剪窗口为5分钟，第一个桶应被清除
        agg.prune_processed(base_s + 401);
        assert_eq!(agg.processed_count(), 1);
    }
}
