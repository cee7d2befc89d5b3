use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("RSS parsing error: {0}")]
    RssError(String),

    #[error("authentication rejected by upstream: {0}")]
    AuthenticationFailed(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("scoring provider unavailable: {0}")]
    ScoringUnavailable(String),
}

impl AppError {
    /// 流错误是否为致命错误（不再重试，进程退出该子系统）
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::AuthenticationFailed(_) | AppError::ConfigError(_))
    }

    /// 是否为限流错误（重连时采用更保守的退避）
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
