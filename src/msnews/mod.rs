//! 新闻采集舰队模块
//!
//! 三个并行采集器（公司新闻API、市场新闻API、RSS拉取），每个采集器
//! 以1秒节拍轮换自己的单元列表，按hash去重后将未评分文章入队。
//! 评分worker调用可插拔的情绪提供方计算影响，影响先进全局队列供
//! composer即时消费，文章再入各来源的保存队列异步落库。

pub mod company;
pub mod dedup;
pub mod market;
pub mod rss;
pub mod save_worker;
pub mod scorer;

pub use company::CompanyNewsCollector;
pub use dedup::DedupCache;
pub use market::MarketNewsCollector;
pub use rss::RssCollector;
pub use save_worker::{SaveSummary, SaveWorker};
pub use scorer::{select_scorer, SentimentScorer};

use crate::mscommon::config::constants::MAX_ARTICLE_IMPACT;
use crate::mscommon::config::Instrument;
use crate::mscommon::error::Result;
use crate::mscommon::models::{Article, ArticleCandidate, SaveJob, ScoredImpact};
use crate::mscommon::sanitize::coerce_float;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// 新闻采集日志目标
pub const NEWS_TARGET: &str = "新闻采集";

/// hash计算纳入的标题前缀长度
const HEADLINE_PREFIX_LEN: usize = 64;

/// "今天"判定所用市场时区
const FILTER_TZ: &str = "America/New_York";

/// 新闻来源接口
///
/// 每次`poll_once`最多轮换一个单元（一个ticker/一个feed/一次市场查询），
/// 单元内部的最小轮询间隔与429退避由实现自行维护。
#[async_trait]
pub trait NewsSource: Send {
    /// 来源标签，用于文章归属与日志过滤
    fn tag(&self) -> &str;

    /// 轮换拉取一次，返回本次发现的候选文章（可为空）
    async fn poll_once(&mut self) -> Result<Vec<ArticleCandidate>>;
}

/// 稳定文章摘要：32位hex，取自 SHA-256(source ∥ URL ∥ 标题前缀) 的前16字节
///
/// 同源同文hash碰撞按重复处理；跨来源的同一故事允许独立计数。
pub fn article_hash(source: &str, url: &str, headline: &str) -> String {
    let prefix: String = headline.chars().take(HEADLINE_PREFIX_LEN).collect();
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(url.as_bytes());
    hasher.update(prefix.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// 判定发布时间是否落在"今天"（标的市场时区的日历日）
pub fn is_published_today(publish_time_ms: i64, now: DateTime<Utc>) -> bool {
    let tz: Tz = match FILTER_TZ.parse() {
        Ok(tz) => tz,
        Err(_) => return false,
    };
    let published = match Utc.timestamp_millis_opt(publish_time_ms).single() {
        Some(dt) => dt,
        None => return false,
    };
    published.with_timezone(&tz).date_naive() == now.with_timezone(&tz).date_naive()
}

/// 采集循环：1秒节拍驱动单个来源
///
/// 去重缓存由本循环独占（单写者无锁）；评分失败的hash经`unmark_rx`
/// 退回并从缓存移除，文章将在下次发现时重新入队。
pub async fn run_collector_loop(
    mut source: Box<dyn NewsSource>,
    to_score_tx: mpsc::Sender<ArticleCandidate>,
    mut unmark_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let tag = source.tag().to_string();
    info!(target: NEWS_TARGET, source = %tag, "采集循环启动");

    let mut dedup = DedupCache::new();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                // 评分失败退回的hash先解除登记
                while let Ok(hash) = unmark_rx.try_recv() {
                    dedup.remove(&hash);
                }

                let candidates = match source.poll_once().await {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!(target: NEWS_TARGET, source = %tag, error = %e, "拉取失败，继续下一轮");
                        continue;
                    }
                };

                let now = Utc::now();
                for candidate in candidates {
                    // 非今日文章丢弃（含无发布时间的文章，采集器已在上游丢弃）
                    if !is_published_today(candidate.publish_time_ms, now) {
                        debug!(
                            target: NEWS_TARGET,
                            source = %tag,
                            publish_time_ms = candidate.publish_time_ms,
                            "非今日文章，已过滤"
                        );
                        continue;
                    }

                    if dedup.check_and_insert(&candidate.hash) {
                        continue;
                    }

                    match to_score_tx.try_send(candidate) {
                        Ok(_) => {}
                        Err(mpsc::error::TrySendError::Full(candidate)) => {
                            // 队列满丢弃最新，同时解除登记以便之后重新发现
                            warn!(
                                target: NEWS_TARGET,
                                source = %tag,
                                headline = %candidate.headline,
                                "待评分队列已满，丢弃该文章"
                            );
                            dedup.remove(&candidate.hash);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!(target: NEWS_TARGET, source = %tag, "评分worker已停止，采集循环退出");
                            return;
                        }
                    }
                }
            }
        }
    }

    info!(target: NEWS_TARGET, source = %tag, "采集循环停止");
}

/// 评分worker共享的通道束
pub struct ScoringContext {
    pub tag: String,
    pub scorer: Arc<dyn SentimentScorer>,
    pub instrument: Arc<Instrument>,
    /// 全局已评分影响队列（发送端）
    pub impacts_tx: crossbeam_channel::Sender<ScoredImpact>,
    /// 同一队列的接收端，仅用于满时丢弃最旧
    pub impacts_rx: crossbeam_channel::Receiver<ScoredImpact>,
    /// 本来源的保存队列
    pub save_tx: crossbeam_channel::Sender<SaveJob>,
    /// 评分失败hash退回采集器
    pub unmark_tx: mpsc::UnboundedSender<String>,
}

/// 评分worker：逐篇消费候选文章
///
/// 影响在保存入队**之前**推入全局队列，保存路径的任何延迟都不会
/// 阻塞价格情绪信号。提供方超时不缓存0分，文章退回等待重新发现。
pub async fn run_scoring_worker(
    ctx: ScoringContext,
    mut to_score_rx: mpsc::Receiver<ArticleCandidate>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(target: NEWS_TARGET, source = %ctx.tag, scorer = ctx.scorer.name(), "评分worker启动");

    loop {
        let candidate = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            candidate = to_score_rx.recv() => match candidate {
                Some(c) => c,
                None => break,
            },
        };

        let text = if candidate.summary.is_empty() {
            candidate.headline.clone()
        } else {
            format!("{}. {}", candidate.headline, candidate.summary)
        };

        let sentiment = match ctx.scorer.score(&[text]).await {
            Ok(scores) if !scores.is_empty() => scores[0].clamp(-1.0, 1.0),
            Ok(_) => {
                warn!(target: NEWS_TARGET, source = %ctx.tag, "提供方返回空结果，文章退回");
                let _ = ctx.unmark_tx.send(candidate.hash);
                continue;
            }
            Err(e) => {
                // 结果未定义：不缓存0分，解除去重登记让文章重新被发现
                warn!(
                    target: NEWS_TARGET,
                    source = %ctx.tag,
                    error = %e,
                    headline = %candidate.headline,
                    "评分失败，文章将在下次发现时重试"
                );
                let _ = ctx.unmark_tx.send(candidate.hash);
                continue;
            }
        };

        let weight = ctx.instrument.weight_for(&candidate.symbol);
        let weighted_contribution = coerce_float(sentiment * 100.0 * weight);
        let impact = (sentiment * weight * 100.0).clamp(-MAX_ARTICLE_IMPACT, MAX_ARTICLE_IMPACT);
        let now_ms = Utc::now().timestamp_millis();

        info!(
            target: NEWS_TARGET,
            source = %ctx.tag,
            symbol = %candidate.symbol,
            sentiment,
            impact,
            "文章评分完成"
        );

        // 第一优先级：影响立即进全局队列，composer下一秒即可见
        push_impact(
            &ctx.impacts_tx,
            &ctx.impacts_rx,
            ScoredImpact {
                impact,
                scored_at_ms: now_ms,
            },
        );

        // 第二优先级：异步落库
        let article = Article {
            source: candidate.source,
            symbol: candidate.symbol,
            headline: candidate.headline,
            summary: candidate.summary,
            url: candidate.url,
            publish_time_ms: candidate.publish_time_ms,
            hash: candidate.hash,
            sentiment,
            impact,
            weighted_contribution,
            fetched_at_ms: now_ms,
        };
        let job = SaveJob {
            article,
            enqueued_at_ms: now_ms,
        };
        match ctx.save_tx.try_send(job) {
            Ok(_) => {}
            Err(crossbeam_channel::TrySendError::Full(job)) => {
                // 影响已计入情绪分，只损失落库
                let hash_prefix = &job.article.hash[..8.min(job.article.hash.len())];
                warn!(
                    target: "SAVEQUEUE",
                    source = %ctx.tag,
                    hash = hash_prefix,
                    "QUEUE_FULL 保存队列已满(500)，该文章不落库"
                );
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                debug!(target: "SAVEQUEUE", source = %ctx.tag, "保存worker已停止");
            }
        }
    }

    info!(target: NEWS_TARGET, source = %ctx.tag, "评分worker停止");
}

/// 影响入队：队列满时丢弃最旧的一条（损失体现为新闻分漂移，不致命）
fn push_impact(
    tx: &crossbeam_channel::Sender<ScoredImpact>,
    rx: &crossbeam_channel::Receiver<ScoredImpact>,
    impact: ScoredImpact,
) {
    match tx.try_send(impact) {
        Ok(_) => {}
        Err(crossbeam_channel::TrySendError::Full(impact)) => {
            let _ = rx.try_recv();
            if tx.try_send(impact).is_err() {
                warn!(target: NEWS_TARGET, "影响队列持续满载，该影响被丢弃");
            } else {
                warn!(target: NEWS_TARGET, "影响队列已满，丢弃最旧影响");
            }
        }
        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {}
    }
}
