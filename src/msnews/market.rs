//! 市场新闻采集器
//!
//! 单一"market"目标，最小轮询间隔5秒。查询窗口从上次查询时刻起算，
//! 间隔过大时回退到最近15分钟。

use crate::mscommon::config::constants::{MARKET_NEWS_MIN_INTERVAL_SECS, NEWS_FETCH_TIMEOUT_SECS};
use crate::mscommon::error::{AppError, Result};
use crate::mscommon::models::ArticleCandidate;
use crate::msnews::{article_hash, NewsSource, NEWS_TARGET};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 查询窗口回退上限（分钟）
const TIME_WINDOW_FALLBACK_MINUTES: i64 = 15;

/// 429后的整体退避时长
const RATE_LIMIT_BACKOFF_SECS: u64 = 60;

/// 市场新闻API返回的单篇文章
#[derive(Debug, Deserialize)]
struct MarketNewsItem {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    url: String,
    /// 发布时间（epoch秒）
    #[serde(default)]
    datetime: i64,
    #[serde(default)]
    symbol: Option<String>,
}

/// 市场新闻采集器
pub struct MarketNewsCollector {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    last_query: Option<Instant>,
    last_window_end: Option<DateTime<Utc>>,
    backoff_until: Option<Instant>,
}

impl MarketNewsCollector {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.marketnews.example.com/v1".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(NEWS_FETCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
            last_query: None,
            last_window_end: None,
            backoff_until: None,
        }
    }

    pub fn check_configured(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(AppError::ConfigError(
                "MARKET_NEWS_API_KEY未设置，市场新闻采集器不可用".to_string(),
            ));
        }
        Ok(())
    }

    /// 计算本次查询窗口起点
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let fallback = now - chrono::Duration::minutes(TIME_WINDOW_FALLBACK_MINUTES);
        match self.last_window_end {
            Some(end) if end > fallback => end,
            _ => fallback,
        }
    }
}

#[async_trait]
impl NewsSource for MarketNewsCollector {
    fn tag(&self) -> &str {
        "market"
    }

    async fn poll_once(&mut self) -> Result<Vec<ArticleCandidate>> {
        let now_instant = Instant::now();

        if let Some(until) = self.backoff_until {
            if now_instant < until {
                return Ok(Vec::new());
            }
            self.backoff_until = None;
        }

        if let Some(last) = self.last_query {
            if now_instant.duration_since(last).as_secs() < MARKET_NEWS_MIN_INTERVAL_SECS {
                return Ok(Vec::new());
            }
        }
        self.last_query = Some(now_instant);

        let now = Utc::now();
        let start = self.window_start(now);
        let url = format!(
            "{}/market-news?category=general&from={}&to={}&token={}",
            self.base_url,
            start.timestamp(),
            now.timestamp(),
            self.api_key
        );

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "market", error = %e, "拉取市场新闻失败");
                return Ok(Vec::new());
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            self.backoff_until =
                Some(Instant::now() + Duration::from_secs(RATE_LIMIT_BACKOFF_SECS));
            warn!(target: NEWS_TARGET, source = "market", "市场新闻API限流，退避");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            warn!(target: NEWS_TARGET, source = "market", status = %status, "市场新闻API返回错误");
            return Ok(Vec::new());
        }

        let items: Vec<MarketNewsItem> = match response.json().await {
            Ok(items) => items,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "market", error = %e, "市场新闻响应解析失败");
                return Ok(Vec::new());
            }
        };

        // 窗口推进只在成功拉取后发生
        self.last_window_end = Some(now);

        debug!(
            target: NEWS_TARGET,
            source = "market",
            found = items.len(),
            "市场新闻拉取完成"
        );

        let candidates = items
            .into_iter()
            .filter_map(|item| {
                if item.url.is_empty() || item.headline.is_empty() {
                    return None;
                }
                let symbol = item
                    .symbol
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_uppercase())
                    .unwrap_or_else(|| "MARKET".to_string());
                let hash = article_hash("market", &item.url, &item.headline);
                Some(ArticleCandidate {
                    source: "market".to_string(),
                    symbol,
                    headline: item.headline,
                    summary: item.summary,
                    url: item.url,
                    publish_time_ms: item.datetime * 1000,
                    hash,
                })
            })
            .collect();

        Ok(candidates)
    }
}
