//! RSS新闻采集器
//!
//! 订阅源列表来自JSON配置文件，每次轮换拉取一个feed，单feed最小间隔60秒。
//! 无发布时间的条目直接丢弃。

use crate::mscommon::config::constants::{NEWS_FETCH_TIMEOUT_SECS, RSS_FEED_MIN_INTERVAL_SECS};
use crate::mscommon::config::RssFeedEntry;
use crate::mscommon::error::{AppError, Result};
use crate::mscommon::models::ArticleCandidate;
use crate::msnews::{article_hash, NewsSource, NEWS_TARGET};
use async_trait::async_trait;
use chrono::DateTime;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; MarketSentimentBot/1.0)";

/// 429后对单个feed的退避时长
const FEED_BACKOFF_SECS: u64 = 300;

/// RSS采集器
pub struct RssCollector {
    client: reqwest::Client,
    feeds: Vec<RssFeedEntry>,
    next_index: usize,
    last_polled: HashMap<String, Instant>,
    backoff_until: HashMap<String, Instant>,
}

impl RssCollector {
    pub fn new(feeds: Vec<RssFeedEntry>) -> Result<Self> {
        if feeds.is_empty() {
            return Err(AppError::ConfigError("RSS订阅源列表为空".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(NEWS_FETCH_TIMEOUT_SECS))
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            feeds,
            next_index: 0,
            last_polled: HashMap::new(),
            backoff_until: HashMap::new(),
        })
    }

    /// 轮换选出下一个可拉取的feed
    fn next_feed(&mut self) -> Option<RssFeedEntry> {
        let now = Instant::now();
        let feed = self.feeds[self.next_index % self.feeds.len()].clone();
        self.next_index = (self.next_index + 1) % self.feeds.len();

        if let Some(&until) = self.backoff_until.get(&feed.url) {
            if now < until {
                return None;
            }
        }
        if let Some(&last) = self.last_polled.get(&feed.url) {
            if now.duration_since(last).as_secs() < RSS_FEED_MIN_INTERVAL_SECS {
                return None;
            }
        }
        Some(feed)
    }
}

#[async_trait]
impl NewsSource for RssCollector {
    fn tag(&self) -> &str {
        "rss"
    }

    async fn poll_once(&mut self) -> Result<Vec<ArticleCandidate>> {
        let feed = match self.next_feed() {
            Some(f) => f,
            None => return Ok(Vec::new()),
        };
        self.last_polled.insert(feed.url.clone(), Instant::now());

        let response = match self.client.get(&feed.url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "rss", feed = %feed.url, error = %e, "拉取RSS失败");
                return Ok(Vec::new());
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            self.backoff_until.insert(
                feed.url.clone(),
                Instant::now() + Duration::from_secs(FEED_BACKOFF_SECS),
            );
            warn!(target: NEWS_TARGET, source = "rss", feed = %feed.url, "RSS源限流，退避");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            warn!(target: NEWS_TARGET, source = "rss", feed = %feed.url, status = %status, "RSS源返回错误");
            return Ok(Vec::new());
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "rss", feed = %feed.url, error = %e, "读取RSS响应失败");
                return Ok(Vec::new());
            }
        };

        let channel = match rss::Channel::read_from(&body[..]) {
            Ok(c) => c,
            Err(e) => {
                warn!(target: NEWS_TARGET, source = "rss", feed = %feed.url, error = %e, "RSS解析失败");
                return Ok(Vec::new());
            }
        };

        debug!(
            target: NEWS_TARGET,
            source = "rss",
            feed = %feed.url,
            entries = channel.items().len(),
            "RSS拉取完成"
        );

        let candidates = channel
            .items()
            .iter()
            .filter_map(|item| {
                let headline = item.title()?.trim().to_string();
                let url = item.link()?.trim().to_string();
                if headline.is_empty() || url.is_empty() {
                    return None;
                }

                // 无发布时间的条目丢弃
                let publish_time_ms = parse_rss_date(item.pub_date()?)?;

                let summary = item
                    .description()
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| headline.clone());
                let hash = article_hash(&feed.source, &url, &headline);

                Some(ArticleCandidate {
                    source: feed.source.clone(),
                    symbol: "MARKET".to_string(),
                    headline,
                    summary,
                    url,
                    publish_time_ms,
                    hash,
                })
            })
            .collect();

        Ok(candidates)
    }
}

/// 解析RSS发布时间（RFC-2822优先，退回RFC-3339）
fn parse_rss_date(date_str: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Some(dt.timestamp_millis());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feeds() -> Vec<RssFeedEntry> {
        vec![
            RssFeedEntry {
                url: "https://a.example.com/rss".to_string(),
                source: "FeedA".to_string(),
            },
            RssFeedEntry {
                url: "https://b.example.com/rss".to_string(),
                source: "FeedB".to_string(),
            },
        ]
    }

    #[test]
    fn test_empty_feed_list_rejected() {
        assert!(RssCollector::new(Vec::new()).is_err());
    }

    #[test]
    fn test_feed_rotation() {
        let mut c = RssCollector::new(feeds()).unwrap();
        assert_eq!(c.next_feed().unwrap().source, "FeedA");
        assert_eq!(c.next_feed().unwrap().source, "FeedB");
        assert_eq!(c.next_feed().unwrap().source, "FeedA");
    }

    #[test]
    fn test_recently_polled_feed_skipped() {
        let mut c = RssCollector::new(feeds()).unwrap();
        let feed = c.next_feed().unwrap();
        c.last_polled.insert(feed.url, Instant::now());
        let _ = c.next_feed();
        // 回到FeedA，60秒内应跳过
        assert!(c.next_feed().is_none());
    }

    #[test]
    fn test_parse_rfc2822_date() {
        let ms = parse_rss_date("Wed, 15 Jul 2026 12:30:00 GMT").unwrap();
        assert!(ms > 0);
        let dt = DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-07-15T12:30:00+00:00");
    }

    #[test]
    fn test_parse_invalid_date_is_none() {
        assert!(parse_rss_date("not a date").is_none());
        assert!(parse_rss_date("").is_none());
    }

    #[test]
    fn test_channel_items_without_pub_date_are_dropped() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title><link>https://x</link><description>d</description>
<item><title>Has date</title><link>https://x/1</link><pubDate>Wed, 15 Jul 2026 12:30:00 GMT</pubDate></item>
<item><title>No date</title><link>https://x/2</link></item>
</channel></rss>"#;
        let channel = rss::Channel::read_from(xml.as_bytes()).unwrap();
        let kept: Vec<_> = channel
            .items()
            .iter()
            .filter_map(|item| {
                let _ = item.title()?;
                let _ = item.link()?;
                parse_rss_date(item.pub_date()?)
            })
            .collect();
        assert_eq!(kept.len(), 1);
    }
}
