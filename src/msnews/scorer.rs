//! 情绪提供方抽象模块
//!
//! 启动时二选一的可互换后端："fast"提供方每次请求发一个批量推理调用，
//! "accurate"提供方逐篇发起chat补全调用并做有界并发。
//! 两者都必须返回[-1, +1]内的值或明确失败；失败的评分永不缓存。

use crate::mscommon::config::ScorerKind;
use crate::mscommon::error::{AppError, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 评分日志目标
pub const SCORER_TARGET: &str = "情绪评分";

/// 每次尝试的超时：30秒、45秒、60秒递增
const ATTEMPT_TIMEOUTS_SECS: [u64; 3] = [30, 45, 60];

/// 失败尝试之间的退避：首次后5秒，第二次后10秒
const ATTEMPT_BACKOFF_SECS: [u64; 2] = [5, 10];

/// fast提供方的文本长度上限（模型输入限制）
const FAST_MAX_TEXT_LEN: usize = 512;

/// accurate提供方的文本长度上限
const ACCURATE_MAX_TEXT_LEN: usize = 8000;

/// accurate提供方的有界并发数
const ACCURATE_MAX_CONCURRENCY: usize = 4;

/// 文章情绪评分能力接口
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    /// 批量评分，每个返回值都落在[-1, +1]内
    ///
    /// 返回错误表示评分未定义：调用方必须丢弃文章（等待重新发现），
    /// 绝不能记录中性0分。
    async fn score(&self, texts: &[String]) -> Result<Vec<f64>>;

    fn name(&self) -> &'static str;
}

/// 按配置选择评分后端
pub fn select_scorer(kind: ScorerKind, fast_key: &str, accurate_key: &str) -> Arc<dyn SentimentScorer> {
    match kind {
        ScorerKind::Fast => Arc::new(FastScorer::new(fast_key.to_string())),
        ScorerKind::Accurate => Arc::new(AccurateScorer::new(accurate_key.to_string())),
    }
}

/// fast提供方返回的单条分类结果
#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

/// fast提供方：单次批量HTTP推理调用
///
/// 端点对每条输入文本返回positive/negative/neutral的(标签, 分值)列表，
/// 情绪值 = positive - negative。
pub struct FastScorer {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl FastScorer {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(
            api_key,
            "https://api-inference.huggingface.co/models/ProsusAI/finbert".to_string(),
        )
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        Self {
            api_key,
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    async fn score_once(&self, texts: &[String], timeout_secs: u64) -> Result<Vec<f64>> {
        let truncated: Vec<&str> = texts
            .iter()
            .map(|t| truncate_chars(t, FAST_MAX_TEXT_LEN))
            .collect();

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "inputs": truncated }))
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("评分端点返回429".to_string()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::AuthenticationFailed(format!(
                "评分端点拒绝凭证: HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AppError::ApiError(format!("评分端点错误: HTTP {}", status)));
        }

        let results: Vec<Vec<LabelScore>> = response.json().await?;
        if results.len() != texts.len() {
            return Err(AppError::ApiError(format!(
                "评分结果数量不匹配: 发送{}条，返回{}条",
                texts.len(),
                results.len()
            )));
        }

        Ok(results
            .iter()
            .map(|labels| {
                let mut positive = 0.0;
                let mut negative = 0.0;
                for entry in labels {
                    match entry.label.to_lowercase().as_str() {
                        "positive" => positive = entry.score,
                        "negative" => negative = entry.score,
                        _ => {}
                    }
                }
                (positive - negative).clamp(-1.0, 1.0)
            })
            .collect())
    }
}

#[async_trait]
impl SentimentScorer for FastScorer {
    async fn score(&self, texts: &[String]) -> Result<Vec<f64>> {
        score_with_retries(self.name(), |timeout_secs| self.score_once(texts, timeout_secs)).await
    }

    fn name(&self) -> &'static str {
        "fast"
    }
}

/// accurate提供方：逐篇发起chat补全调用
///
/// 提示词要求模型只回答[-1, +1]内的单个数字；批量调用做有界并发，
/// 保持输入顺序。
pub struct AccurateScorer {
    api_key: String,
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl AccurateScorer {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(
            api_key,
            "https://api.openai.com/v1/chat/completions".to_string(),
            "gpt-4o-mini".to_string(),
        )
    }

    pub fn with_endpoint(api_key: String, endpoint: String, model: String) -> Self {
        Self {
            api_key,
            endpoint,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn score_one(&self, text: &str, timeout_secs: u64) -> Result<f64> {
        let truncated = truncate_chars(text, ACCURATE_MAX_TEXT_LEN);
        let request_body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a quantitative analyst. Evaluate the market impact of a \
                                financial news article on a leveraged NASDAQ-100 index ETF. \
                                Respond ONLY with a single number from -1.0 (extremely bearish) \
                                to +1.0 (extremely bullish), rounded to two decimals."
                },
                { "role": "user", "content": truncated }
            ],
            "max_tokens": 10,
            "temperature": 0
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("评分端点返回429".to_string()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::AuthenticationFailed(format!(
                "评分端点拒绝凭证: HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AppError::ApiError(format!("评分端点错误: HTTP {}", status)));
        }

        let body: serde_json::Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AppError::ParseError("评分响应缺少content字段".to_string()))?;

        parse_sentiment_value(content)
    }

    async fn score_batch_once(&self, texts: &[String], timeout_secs: u64) -> Result<Vec<f64>> {
        let results: Vec<Result<f64>> = stream::iter(texts.to_vec())
            .map(|text| async move { self.score_one(&text, timeout_secs).await })
            .buffered(ACCURATE_MAX_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect()
    }
}

#[async_trait]
impl SentimentScorer for AccurateScorer {
    async fn score(&self, texts: &[String]) -> Result<Vec<f64>> {
        score_with_retries(self.name(), |timeout_secs| {
            self.score_batch_once(texts, timeout_secs)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "accurate"
    }
}

/// 共享重试阶梯：3次尝试，超时30/45/60秒递增，尝试间退避5秒、10秒。
/// 认证失败立即中止不再重试。
async fn score_with_retries<F, Fut>(provider: &str, mut attempt_fn: F) -> Result<Vec<f64>>
where
    F: FnMut(u64) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<f64>>>,
{
    let mut last_err = None;

    for (attempt, &timeout_secs) in ATTEMPT_TIMEOUTS_SECS.iter().enumerate() {
        match attempt_fn(timeout_secs).await {
            Ok(scores) => {
                if attempt > 0 {
                    info!(
                        target: SCORER_TARGET,
                        provider,
                        attempt = attempt + 1,
                        "评分在重试后成功"
                    );
                }
                return Ok(scores);
            }
            Err(e) => {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(
                    target: SCORER_TARGET,
                    provider,
                    attempt = attempt + 1,
                    timeout_secs,
                    error = %e,
                    "评分尝试失败"
                );
                if attempt < ATTEMPT_BACKOFF_SECS.len() {
                    sleep(Duration::from_secs(ATTEMPT_BACKOFF_SECS[attempt])).await;
                }
                last_err = Some(e);
            }
        }
    }

    warn!(target: SCORER_TARGET, provider, "评分3次尝试全部失败，结果未定义");
    Err(AppError::ScoringUnavailable(format!(
        "提供方{}全部尝试失败: {}",
        provider,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// 将模型回复解析为[-1, +1]内的情绪值
fn parse_sentiment_value(content: &str) -> Result<f64> {
    let value: f64 = content
        .trim()
        .trim_matches('`')
        .parse()
        .map_err(|_| AppError::ParseError(format!("无法解析的情绪回复: {:?}", content)))?;
    if value.is_nan() || value.is_infinite() {
        return Err(AppError::ParseError("情绪值非有限数".to_string()));
    }
    Ok(value.clamp(-1.0, 1.0))
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
