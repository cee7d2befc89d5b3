//! 公司新闻采集器
//!
//! 以1秒节拍在40只成分股观察名单上轮换，每只股票的最小轮询间隔40秒。
//! 上游为company-news查询API，每次取最新3篇。

use crate::mscommon::config::constants::{NEWS_FETCH_TIMEOUT_SECS, WATCHLIST_MIN_INTERVAL_SECS};
use crate::mscommon::error::{AppError, Result};
use crate::mscommon::models::ArticleCandidate;
use crate::msnews::{article_hash, NewsSource, NEWS_TARGET};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 每次拉取处理的最新文章数
const TOP_ARTICLES_PER_POLL: usize = 3;

/// 429后对单个股票的退避时长
const UNIT_BACKOFF_SECS: u64 = 120;

/// 公司新闻API返回的单篇文章
#[derive(Debug, Deserialize)]
struct CompanyNewsItem {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    url: String,
    /// 发布时间（epoch秒）
    #[serde(default)]
    datetime: i64,
    /// 相关品种，缺省用查询的股票
    #[serde(default)]
    symbol: Option<String>,
}

/// 公司新闻采集器
pub struct CompanyNewsCollector {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    watchlist: Vec<String>,
    next_index: usize,
    last_polled: HashMap<String, Instant>,
    backoff_until: HashMap<String, Instant>,
}

impl CompanyNewsCollector {
    pub fn new(api_key: String, watchlist: Vec<String>) -> Self {
        Self::with_base_url(api_key, watchlist, "https://api.companynews.example.com/v1".to_string())
    }

    pub fn with_base_url(api_key: String, watchlist: Vec<String>, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(NEWS_FETCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
            watchlist,
            next_index: 0,
            last_polled: HashMap::new(),
            backoff_until: HashMap::new(),
        }
    }

    /// 轮换选出下一只可拉取的股票；本秒无可用单元时返回None
    fn next_symbol(&mut self) -> Option<String> {
        if self.watchlist.is_empty() {
            return None;
        }
        let now = Instant::now();
        let symbol = self.watchlist[self.next_index % self.watchlist.len()].clone();
        self.next_index = (self.next_index + 1) % self.watchlist.len();

        if let Some(&until) = self.backoff_until.get(&symbol) {
            if now < until {
                return None;
            }
        }
        if let Some(&last) = self.last_polled.get(&symbol) {
            if now.duration_since(last).as_secs() < WATCHLIST_MIN_INTERVAL_SECS {
                return None;
            }
        }
        Some(symbol)
    }
}

#[async_trait]
impl NewsSource for CompanyNewsCollector {
    fn tag(&self) -> &str {
        "company"
    }

    async fn poll_once(&mut self) -> Result<Vec<ArticleCandidate>> {
        let symbol = match self.next_symbol() {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        self.last_polled.insert(symbol.clone(), Instant::now());

        let today = chrono::Utc::now().date_naive();
        let yesterday = today - chrono::Duration::days(1);
        let url = format!(
            "{}/company-news?symbol={}&from={}&to={}&token={}",
            self.base_url, symbol, yesterday, today, self.api_key
        );

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                // 超时或网络错误：告警后继续轮换
                warn!(target: NEWS_TARGET, source = "company", symbol = %symbol, error = %e, "拉取公司新闻失败");
                return Ok(Vec::new());
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            // 对该股票退避，轮换继续
            self.backoff_until.insert(
                symbol.clone(),
                Instant::now() + Duration::from_secs(UNIT_BACKOFF_SECS),
            );
            warn!(target: NEWS_TARGET, source = "company", symbol = %symbol, "公司新闻API限流，该股票退避");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            warn!(target: NEWS_TARGET, source = "company", symbol = %symbol, status = %status, "公司新闻API返回错误");
            return Ok(Vec::new());
        }

        let items: Vec<CompanyNewsItem> = match response.json().await {
            Ok(items) => items,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "company", symbol = %symbol, error = %e, "公司新闻响应解析失败");
                return Ok(Vec::new());
            }
        };

        debug!(
            target: NEWS_TARGET,
            source = "company",
            symbol = %symbol,
            found = items.len(),
            "公司新闻拉取完成"
        );

        let candidates = items
            .into_iter()
            .take(TOP_ARTICLES_PER_POLL)
            .filter_map(|item| {
                if item.url.is_empty() || item.headline.is_empty() {
                    return None;
                }
                let article_symbol = item
                    .symbol
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| symbol.clone());
                let hash = article_hash("company", &item.url, &item.headline);
                Some(ArticleCandidate {
                    source: "company".to_string(),
                    symbol: article_symbol,
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

impl CompanyNewsCollector {
    /// 构造期校验：API key为空时该采集器不可用
    pub fn check_configured(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(AppError::ConfigError(
                "COMPANY_NEWS_API_KEY未设置，公司新闻采集器不可用".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> CompanyNewsCollector {
        CompanyNewsCollector::new(
            "key".to_string(),
            vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()],
        )
    }

    #[test]
    fn test_rotation_advances() {
        let mut c = collector();
        assert_eq!(c.next_symbol().unwrap(), "AAPL");
        assert_eq!(c.next_symbol().unwrap(), "MSFT");
        assert_eq!(c.next_symbol().unwrap(), "NVDA");
    }

    #[test]
    fn test_min_interval_skips_recent_unit() {
        let mut c = collector();
        let s = c.next_symbol().unwrap();
        c.last_polled.insert(s.clone(), Instant::now());
        // 轮换一整圈回到同一只股票时，40秒内应跳过
        let _ = c.next_symbol();
        let _ = c.next_symbol();
        assert!(c.next_symbol().is_none(), "40秒内重访同一股票应跳过");
    }

    #[test]
    fn test_backoff_skips_unit() {
        let mut c = collector();
        c.backoff_until.insert(
            "AAPL".to_string(),
            Instant::now() + Duration::from_secs(60),
        );
        assert!(c.next_symbol().is_none(), "退避中的股票应跳过");
        assert_eq!(c.next_symbol().unwrap(), "MSFT");
    }

    #[test]
    fn test_check_configured() {
        let c = CompanyNewsCollector::new(String::new(), vec![]);
        assert!(c.check_configured().is_err());
        assert!(collector().check_configured().is_ok());
    }
}
