//! 持久化保存worker模块
//!
//! 每个新闻来源一条专属线程，将该来源的保存队列排入文章存储。
//! 保存永不阻塞评分：任务到达本worker时影响已经生效。任务携带
//! 入队时刻，超过60秒硬截止即丢弃。

use crate::mscommon::config::constants::SAVE_DEADLINE_SECS;
use crate::mscommon::db::{classify_db_error, Database, DbErrorKind};
use crate::mscommon::error::AppError;
use crate::mscommon::models::{Article, SaveJob};
use crate::mscommon::sanitize::{
    safe_float, safe_url, sanitize_text, validate_publish_time_ms, MAX_HEADLINE_LEN,
    MAX_SUMMARY_LEN, MAX_URL_LEN,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 保存路径日志目标（按行过滤约定）
const SAVEQUEUE_TARGET: &str = "SAVEQUEUE";

/// 单次保存的重试计划：3次尝试，100/200/400毫秒退避
const SAVE_MAX_ATTEMPTS: u32 = 3;
const SAVE_INITIAL_BACKOFF_MS: u64 = 100;

/// 收到关闭信号后继续排空队列的时间预算
const DRAIN_BUDGET_SECS: u64 = 60;

/// 单worker结果计数，关闭时输出汇总
#[derive(Debug, Default, Clone, Copy)]
pub struct SaveSummary {
    pub success: u64,
    pub failed: u64,
    pub deadline_exceeded: u64,
}

/// 单个新闻来源的持久化保存worker
pub struct SaveWorker {
    tag: String,
    db: Arc<Database>,
    jobs_rx: crossbeam_channel::Receiver<SaveJob>,
    running: Arc<AtomicBool>,
}

impl SaveWorker {
    pub fn new(
        tag: String,
        db: Arc<Database>,
        jobs_rx: crossbeam_channel::Receiver<SaveJob>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tag,
            db,
            jobs_rx,
            running,
        }
    }

    /// 启动worker线程，join句柄返回最终计数
    pub fn spawn(self) -> thread::JoinHandle<SaveSummary> {
        let name = format!("save-{}", self.tag);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .expect("保存worker线程创建失败")
    }

    fn run(self) -> SaveSummary {
        info!(target: SAVEQUEUE_TARGET, source = %self.tag, "保存worker启动");
        let mut summary = SaveSummary::default();

        while self.running.load(Ordering::Relaxed) {
            match self.jobs_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(job) => self.process_job(job, &mut summary),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        // 关闭排空：最多继续保存60秒
        let drain_started = Instant::now();
        while drain_started.elapsed().as_secs() < DRAIN_BUDGET_SECS {
            match self.jobs_rx.try_recv() {
                Ok(job) => self.process_job(job, &mut summary),
                Err(_) => break,
            }
        }

        info!(
            target: SAVEQUEUE_TARGET,
            source = %self.tag,
            "保存worker停止: SUCCESS {} | FAILED {} | DEADLINE {}",
            summary.success,
            summary.failed,
            summary.deadline_exceeded
        );
        summary
    }

    fn process_job(&self, job: SaveJob, summary: &mut SaveSummary) {
        let now_ms = Utc::now().timestamp_millis();
        let wait_secs = (now_ms - job.enqueued_at_ms) / 1000;

        // 从入队时刻起算的硬截止；影响已经生效
        if wait_secs > SAVE_DEADLINE_SECS {
            summary.deadline_exceeded += 1;
            error!(
                target: SAVEQUEUE_TARGET,
                source = %self.tag,
                hash = hash_prefix(&job.article.hash),
                wait_secs,
                "DEADLINE_EXCEEDED 保存任务超时丢弃（影响已生效）"
            );
            return;
        }

        let article = sanitize_article(job.article, now_ms);

        if self.save_with_retries(&article, now_ms) {
            summary.success += 1;
        } else {
            summary.failed += 1;
        }
    }

    /// 按文章hash执行update_or_create。瞬时错误（busy/locked）与
    /// 唯一约束冲突（并发同键插入）指数退避后重试，永久错误立即失败。
    fn save_with_retries(&self, article: &Article, now_ms: i64) -> bool {
        let mut backoff_ms = SAVE_INITIAL_BACKOFF_MS;

        for attempt in 1..=SAVE_MAX_ATTEMPTS {
            match self.db.upsert_article(article, now_ms) {
                Ok(created) => {
                    info!(
                        target: "NEWSSAVING",
                        source = %self.tag,
                        hash = hash_prefix(&article.hash),
                        symbol = %article.symbol,
                        created,
                        "文章已落库"
                    );
                    return true;
                }
                Err(AppError::SqliteError(e)) => {
                    let kind = classify_db_error(&e);
                    match kind {
                        DbErrorKind::Transient | DbErrorKind::Integrity => {
                            if attempt < SAVE_MAX_ATTEMPTS {
                                warn!(
                                    target: "NEWSSAVING",
                                    source = %self.tag,
                                    hash = hash_prefix(&article.hash),
                                    attempt,
                                    kind = ?kind,
                                    error = %e,
                                    backoff_ms,
                                    "保存尝试失败，退避后重试"
                                );
                                thread::sleep(Duration::from_millis(backoff_ms));
                                backoff_ms *= 2;
                                continue;
                            }
                        }
                        DbErrorKind::Permanent => {
                            error!(
                                target: "NEWSSAVING",
                                source = %self.tag,
                                hash = hash_prefix(&article.hash),
                                error = %e,
                                "永久性数据库错误，不再重试"
                            );
                            return false;
                        }
                    }
                }
                Err(e) => {
                    if attempt < SAVE_MAX_ATTEMPTS {
                        warn!(
                            target: "NEWSSAVING",
                            source = %self.tag,
                            hash = hash_prefix(&article.hash),
                            attempt,
                            error = %e,
                            backoff_ms,
                            "保存尝试失败，退避后重试"
                        );
                        thread::sleep(Duration::from_millis(backoff_ms));
                        backoff_ms *= 2;
                        continue;
                    }
                }
            }
        }

        error!(
            target: "NEWSSAVING",
            source = %self.tag,
            hash = hash_prefix(&article.hash),
            "SAVE_FAILED_ALL_ATTEMPTS {}次尝试全部失败",
            SAVE_MAX_ATTEMPTS
        );
        false
    }
}

/// 落库前清洗所有字段：文本去除空字节与控制字符，浮点数NaN/Inf归零
/// 并截断，URL必须可打印，发布年份必须落在[1900, 2100]。
pub fn sanitize_article(mut article: Article, now_ms: i64) -> Article {
    article.headline = sanitize_text(&article.headline, "headline", MAX_HEADLINE_LEN);
    if article.headline.is_empty() {
        article.headline = format!("[无标题] 来自{}的文章", article.source);
    }

    article.summary = sanitize_text(&article.summary, "summary", MAX_SUMMARY_LEN);
    if article.summary.is_empty() {
        article.summary = article.headline.clone();
    }

    article.url = safe_url(&article.url, MAX_URL_LEN);
    article.symbol = article.symbol.trim().to_uppercase();
    if article.symbol.is_empty() {
        article.symbol = "MARKET".to_string();
    }

    article.publish_time_ms = validate_publish_time_ms(article.publish_time_ms, now_ms);
    article.sentiment = safe_float(article.sentiment, "sentiment", 0.0, -1.0, 1.0);
    article.impact = safe_float(article.impact, "impact", 0.0, -25.0, 25.0);
    article.weighted_contribution =
        safe_float(article.weighted_contribution, "weighted_contribution", 0.0, -1e10, 1e10);

    article
}

fn hash_prefix(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mscommon::models::SaveJob;
    use std::path::PathBuf;

    fn setup_db(name: &str) -> Arc<Database> {
        let db_path = PathBuf::from(format!("./target/test_save_{}.db", name));
        if db_path.exists() {
            std::fs::remove_file(&db_path).unwrap();
        }
        Arc::new(Database::new(&db_path).unwrap())
    }

    fn article(hash: &str) -> Article {
        Article {
            source: "company".to_string(),
            symbol: "AAPL".to_string(),
            headline: "Apple beats earnings".to_string(),
            summary: "Strong quarter".to_string(),
            url: "https://example.com/apple".to_string(),
            publish_time_ms: 1_700_000_000_000,
            hash: hash.to_string(),
            sentiment: 0.9,
            impact: 12.6,
            weighted_contribution: 12.6,
            fetched_at_ms: 1_700_000_050_000,
        }
    }

    #[test]
    fn test_sanitize_article_cleans_fields() {
        let mut a = article("h1");
        a.headline = "Fed\0 cuts".to_string();
        a.sentiment = f64::NAN;
        a.impact = 60.0;
        a.symbol = " aapl ".to_string();
        a.publish_time_ms = 99_999_999_999_999;

        let now_ms = 1_700_000_000_000;
        let clean = sanitize_article(a, now_ms);
        assert_eq!(clean.headline, "Fed cuts");
        assert_eq!(clean.sentiment, 0.0);
        assert_eq!(clean.impact, 25.0);
        assert_eq!(clean.symbol, "AAPL");
        assert_eq!(clean.publish_time_ms, now_ms);
    }

    #[test]
    fn test_sanitize_empty_symbol_falls_back_to_market() {
        let mut a = article("h2");
        a.symbol = "  ".to_string();
        let clean = sanitize_article(a, 1_700_000_000_000);
        assert_eq!(clean.symbol, "MARKET");
    }

    #[test]
    fn test_worker_saves_job_and_reports_summary() {
        let db = setup_db("worker");
        let (tx, rx) = crossbeam_channel::bounded(10);
        let running = Arc::new(AtomicBool::new(true));

        let worker = SaveWorker::new("company".to_string(), db.clone(), rx, running.clone());
        let handle = worker.spawn();

        let now_ms = Utc::now().timestamp_millis();
        tx.send(SaveJob {
            article: article("worker_hash"),
            enqueued_at_ms: now_ms,
        })
        .unwrap();

        // 留给worker处理时间后再关闭
        thread::sleep(Duration::from_millis(300));
        running.store(false, Ordering::Relaxed);
        let summary = handle.join().unwrap();

        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.deadline_exceeded, 0);
    }

    #[test]
    fn test_expired_job_dropped_with_deadline_counter() {
        let db = setup_db("deadline");
        let (tx, rx) = crossbeam_channel::bounded(10);
        let running = Arc::new(AtomicBool::new(true));

        let worker = SaveWorker::new("rss".to_string(), db.clone(), rx, running.clone());
        let handle = worker.spawn();

        // 2分钟前入队：已超过60秒截止
        let stale_ms = Utc::now().timestamp_millis() - 120_000;
        tx.send(SaveJob {
            article: article("stale_hash"),
            enqueued_at_ms: stale_ms,
        })
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        running.store(false, Ordering::Relaxed);
        let summary = handle.join().unwrap();

        assert_eq!(summary.deadline_exceeded, 1);
        assert_eq!(summary.success, 0);
    }
}
