// 导出共享模块
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod market_hours;
pub mod models;
pub mod sanitize;

// 重新导出常用类型，方便使用
pub use config::{Instrument, RssFeedsConfig, ScorerKind, SentimentConfig, WATCHLIST};
pub use db::{classify_db_error, minute_news_contribution, Database, DbErrorKind};
pub use error::{AppError, Result};
pub use market_hours::MarketHoursClock;
pub use models::{
    Article, ArticleCandidate, MinuteRow, RawStreamTick, SaveJob, ScoredImpact, SecondCandle,
    SecondSnapshot, Tick, TickCandle100,
};
