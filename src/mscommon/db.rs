//! 双表持久化适配器
//!
//! 封装秒级快照与分钟分析行的读写、文章upsert以及100笔K线的异步写入队列。
//! 写入队列线程吸收来自异步上下文的追加写，行情消息处理永不阻塞在I/O上。

use crate::mscommon::config::constants::{self, MAX_ARTICLE_IMPACT};
use crate::mscommon::error::{AppError, Result};
use crate::mscommon::models::{Article, MinuteRow, SecondSnapshot, TickCandle100};
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 持久化日志目标
const DB_TARGET: &str = "持久化";

// 全局写操作计数 (插入数, 更新数, 上次输出时间)
static DB_OPERATIONS: Lazy<(AtomicUsize, AtomicUsize, Mutex<Instant>)> =
    Lazy::new(|| (AtomicUsize::new(0), AtomicUsize::new(0), Mutex::new(Instant::now())));

/// 操作统计输出间隔（秒）
const DB_LOG_INTERVAL: u64 = 10;

/// 登记一次写操作并按间隔输出统计
fn record_db_operation(inserted: bool) {
    let (inserts, updates, last_log) = &*DB_OPERATIONS;
    if inserted {
        inserts.fetch_add(1, Ordering::Relaxed);
    } else {
        updates.fetch_add(1, Ordering::Relaxed);
    }

    let mut last = last_log.lock().unwrap();
    if last.elapsed().as_secs() >= DB_LOG_INTERVAL {
        *last = Instant::now();
        debug!(
            target: DB_TARGET,
            inserts = inserts.load(Ordering::Relaxed),
            updates = updates.load(Ordering::Relaxed),
            "数据库写操作统计"
        );
    }
}

/// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 数据库错误分类，保存worker据此决定是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// 瞬时错误（busy/locked/死锁），退避后重试
    Transient,
    /// 唯一约束冲突（并发同键插入），重试走update分支
    Integrity,
    /// 永久错误，不重试
    Permanent,
}

/// 对rusqlite错误分类
pub fn classify_db_error(err: &rusqlite::Error) -> DbErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DbErrorKind::Transient,
            ErrorCode::ConstraintViolation => DbErrorKind::Integrity,
            _ => DbErrorKind::Permanent,
        },
        _ => DbErrorKind::Permanent,
    }
}

/// 写入任务 - 经写入队列的追加写操作
#[derive(Debug)]
enum WriteTask {
    TickCandle(TickCandle100),
}

/// 写入队列处理器 - 在专属线程上消费写入任务
struct DbWriteQueueProcessor {
    receiver: Receiver<WriteTask>,
    pool: DbPool,
    is_running: Arc<Mutex<bool>>,
}

impl DbWriteQueueProcessor {
    fn new(receiver: Receiver<WriteTask>, pool: DbPool) -> Self {
        Self {
            receiver,
            pool,
            is_running: Arc::new(Mutex::new(true)),
        }
    }

    /// 启动写入队列处理线程
    fn start(self) -> Arc<Mutex<bool>> {
        let is_running = self.is_running.clone();

        thread::Builder::new()
            .name("db-write-queue".to_string())
            .spawn(move || {
                info!(target: DB_TARGET, "数据库写入队列处理器已启动");

                while *self.is_running.lock().unwrap() {
                    match self.receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(task) => self.process_with_retry(task),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                            info!(target: DB_TARGET, "写入队列已关闭，处理器退出");
                            break;
                        }
                    }
                }

                // 退出前排空残留任务
                while let Ok(task) = self.receiver.try_recv() {
                    self.process_with_retry(task);
                }

                info!(target: DB_TARGET, "数据库写入队列处理器已停止");
            })
            .expect("写入队列线程创建失败");

        is_running
    }

    /// 处理单个写入任务：3次重试，100/200/400毫秒退避
    fn process_with_retry(&self, task: WriteTask) {
        let mut backoff_ms = 100u64;
        for attempt in 1..=3 {
            let result = match &task {
                WriteTask::TickCandle(candle) => insert_tick_candle(&self.pool, candle),
            };
            match result {
                Ok(_) => return,
                Err(e) => {
                    if attempt < 3 {
                        warn!(
                            target: DB_TARGET,
                            attempt,
                            error = %e,
                            backoff_ms,
                            "写入任务失败，退避后重试"
                        );
                        thread::sleep(Duration::from_millis(backoff_ms));
                        backoff_ms *= 2;
                    } else {
                        error!(target: DB_TARGET, error = %e, "写入任务3次重试后仍失败，丢弃");
                    }
                }
            }
        }
    }
}

fn insert_tick_candle(pool: &DbPool, candle: &TickCandle100) -> Result<()> {
    let conn = pool
        .get()
        .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
    conn.execute(
        "INSERT OR IGNORE INTO tick_candle_100 (
            symbol, sequence, first_tick_time, last_tick_time, duration_seconds,
            open, high, low, close, volume, tick_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            candle.symbol,
            candle.sequence,
            candle.first_tick_time_ms,
            candle.last_tick_time_ms,
            candle.duration_seconds,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
            candle.tick_count,
        ],
    )?;
    Ok(())
}

/// 双表持久化适配器
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
    write_queue_sender: Sender<WriteTask>,
    queue_processor_running: Arc<Mutex<bool>>,
}

impl Database {
    /// 创建数据库连接（WAL模式 + 性能优化pragma）
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: DB_TARGET, path = %db_path.display(), "使用WAL模式打开SQLite数据库");

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -65536;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("创建连接池失败: {}", e)))?;

        let (sender, receiver) = bounded(constants::DB_WRITE_QUEUE_CAPACITY);
        let processor = DbWriteQueueProcessor::new(receiver, pool.clone());
        let queue_processor_running = processor.start();

        let db = Self {
            pool,
            write_queue_sender: sender,
            queue_processor_running,
        };
        db.init_db()?;

        info!(target: DB_TARGET, "数据库与写入队列初始化完成");
        Ok(db)
    }

    /// 初始化表结构与索引
    fn init_db(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS article (
                hash TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                symbol TEXT NOT NULL,
                headline TEXT NOT NULL,
                summary TEXT NOT NULL,
                url TEXT NOT NULL,
                publish_time INTEGER NOT NULL,
                sentiment REAL NOT NULL,
                impact REAL NOT NULL,
                weighted_contribution REAL NOT NULL,
                fetched_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                analyzed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS minute_row (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                composite REAL NOT NULL,
                news REAL NOT NULL,
                reddit REAL NOT NULL,
                technical REAL NOT NULL,
                analyst REAL NOT NULL,
                label TEXT NOT NULL,
                article_count INTEGER NOT NULL DEFAULT 0,
                cached_count INTEGER NOT NULL DEFAULT 0,
                new_count INTEGER NOT NULL DEFAULT 0,
                price_open REAL NOT NULL DEFAULT 0,
                price_high REAL NOT NULL DEFAULT 0,
                price_low REAL NOT NULL DEFAULT 0,
                price_close REAL NOT NULL DEFAULT 0,
                volume REAL NOT NULL DEFAULT 0,
                rsi REAL NOT NULL DEFAULT 0,
                macd REAL NOT NULL DEFAULT 0,
                volatility_index REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_minute_row_symbol_ts
                ON minute_row (symbol, timestamp DESC);

            CREATE TABLE IF NOT EXISTS second_snapshot (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                bucket_second INTEGER NOT NULL,
                composite REAL NOT NULL,
                news_cached REAL NOT NULL,
                technical_cached REAL NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                tick_count INTEGER NOT NULL,
                UNIQUE (symbol, bucket_second)
            );
            CREATE INDEX IF NOT EXISTS idx_second_snapshot_symbol_bucket
                ON second_snapshot (symbol, bucket_second DESC);

            CREATE TABLE IF NOT EXISTS tick_candle_100 (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                first_tick_time INTEGER NOT NULL,
                last_tick_time INTEGER NOT NULL,
                duration_seconds REAL NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                tick_count INTEGER NOT NULL,
                UNIQUE (symbol, sequence)
            );
        ",
        )?;

        Ok(())
    }

    /// 100笔K线入写入队列（非阻塞，队列满则丢弃并告警）
    pub fn queue_tick_candle(&self, candle: TickCandle100) -> Result<()> {
        match self.write_queue_sender.try_send(WriteTask::TickCandle(candle)) {
            Ok(_) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                warn!(target: DB_TARGET, "写入队列已满，100笔K线被丢弃");
                Err(AppError::ChannelError("写入队列已满".to_string()))
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(AppError::ChannelError(
                "写入队列已断开".to_string(),
            )),
        }
    }

    /// 插入秒级快照（同键已存在时忽略，保证每桶至多一条）
    ///
    /// 返回是否实际插入了新行。
    pub fn insert_second_snapshot(&self, snapshot: &SecondSnapshot) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO second_snapshot (
                symbol, bucket_second, composite, news_cached, technical_cached,
                open, high, low, close, volume, tick_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                snapshot.symbol,
                snapshot.bucket_second,
                snapshot.composite,
                snapshot.news_cached,
                snapshot.technical_cached,
                snapshot.open,
                snapshot.high,
                snapshot.low,
                snapshot.close,
                snapshot.volume,
                snapshot.tick_count,
            ],
        )?;
        Ok(changed > 0)
    }

    /// 秒级快照带重试插入：3次，100/200/400毫秒退避，累计不超过1秒
    pub fn insert_second_snapshot_with_retry(&self, snapshot: &SecondSnapshot) -> Result<bool> {
        let mut backoff_ms = 100u64;
        let mut last_err: Option<AppError> = None;
        for attempt in 1..=3 {
            match self.insert_second_snapshot(snapshot) {
                Ok(inserted) => return Ok(inserted),
                Err(e) => {
                    if attempt < 3 {
                        debug!(
                            target: DB_TARGET,
                            attempt,
                            bucket_second = snapshot.bucket_second,
                            error = %e,
                            "快照插入失败，退避后重试"
                        );
                        thread::sleep(Duration::from_millis(backoff_ms));
                        backoff_ms *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::DatabaseError("快照插入失败".to_string())))
    }

    /// 按hash执行文章update_or_create（单次尝试，重试由保存worker控制）
    ///
    /// created_at只在首次插入时写入，后续更新不变。返回是否为新建。
    pub fn upsert_article(&self, article: &Article, now_ms: i64) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;

        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM article WHERE hash = ?",
                params![article.hash],
                |_| Ok(true),
            )
            .optional()?
            .is_some();

        if exists {
            tx.execute(
                "UPDATE article SET
                    source = ?, symbol = ?, headline = ?, summary = ?, url = ?,
                    publish_time = ?, sentiment = ?, impact = ?,
                    weighted_contribution = ?, fetched_at = ?, analyzed = 1
                WHERE hash = ?",
                params![
                    article.source,
                    article.symbol,
                    article.headline,
                    article.summary,
                    article.url,
                    article.publish_time_ms,
                    article.sentiment,
                    article.impact,
                    article.weighted_contribution,
                    article.fetched_at_ms,
                    article.hash,
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO article (
                    hash, source, symbol, headline, summary, url, publish_time,
                    sentiment, impact, weighted_contribution, fetched_at, created_at, analyzed
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                params![
                    article.hash,
                    article.source,
                    article.symbol,
                    article.headline,
                    article.summary,
                    article.url,
                    article.publish_time_ms,
                    article.sentiment,
                    article.impact,
                    article.weighted_contribution,
                    article.fetched_at_ms,
                    now_ms,
                ],
            )?;
        }

        tx.commit()?;
        record_db_operation(!exists);
        Ok(!exists)
    }

    /// 最新分钟分析行（单次索引查找）
    pub fn latest_minute_row(&self, symbol: &str) -> Result<Option<MinuteRow>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        let row = conn
            .query_row(
                "SELECT id, symbol, timestamp, composite, news, reddit, technical, analyst,
                        label, article_count, cached_count, new_count,
                        price_open, price_high, price_low, price_close, volume,
                        rsi, macd, volatility_index
                 FROM minute_row WHERE symbol = ?
                 ORDER BY timestamp DESC LIMIT 1",
                params![symbol],
                |r| {
                    Ok(MinuteRow {
                        id: r.get(0)?,
                        symbol: r.get(1)?,
                        timestamp_ms: r.get(2)?,
                        composite: r.get(3)?,
                        news: r.get(4)?,
                        reddit: r.get(5)?,
                        technical: r.get(6)?,
                        analyst: r.get(7)?,
                        label: r.get(8)?,
                        article_count: r.get(9)?,
                        cached_count: r.get(10)?,
                        new_count: r.get(11)?,
                        price_open: r.get(12)?,
                        price_high: r.get(13)?,
                        price_low: r.get(14)?,
                        price_close: r.get(15)?,
                        volume: r.get(16)?,
                        rsi: r.get(17)?,
                        macd: r.get(18)?,
                        volatility_index: r.get(19)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// 最新秒级快照（单次索引查找）
    pub fn latest_snapshot(&self, symbol: &str) -> Result<Option<SecondSnapshot>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        let row = conn
            .query_row(
                "SELECT symbol, bucket_second, composite, news_cached, technical_cached,
                        open, high, low, close, volume, tick_count
                 FROM second_snapshot WHERE symbol = ?
                 ORDER BY bucket_second DESC LIMIT 1",
                params![symbol],
                map_snapshot_row,
            )
            .optional()?;
        Ok(row)
    }

    /// 最近N条秒级快照，按时间升序返回（用于微动量计算）
    pub fn recent_snapshots(&self, symbol: &str, limit: usize) -> Result<Vec<SecondSnapshot>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        let mut stmt = conn.prepare(
            "SELECT symbol, bucket_second, composite, news_cached, technical_cached,
                    open, high, low, close, volume, tick_count
             FROM second_snapshot WHERE symbol = ?
             ORDER BY bucket_second DESC LIMIT ?",
        )?;
        let mut rows: Vec<SecondSnapshot> = stmt
            .query_map(params![symbol, limit as i64], map_snapshot_row)?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// 已持久化的最大100笔K线序列号，用于进程重启后续接编号
    pub fn max_candle_sequence(&self, symbol: &str) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM tick_candle_100 WHERE symbol = ?",
            params![symbol],
            |r| r.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// 分钟行写入（外部分钟分析器的集成点）
    ///
    /// 始终写入分钟行；若最近一条秒级快照仍在新鲜度窗口内（秒级系统活跃），
    /// 则额外镜像一条携带新基准分的快照，让秒级循环获得无缝的新参考点。
    pub fn insert_minute_row_with_mirror(
        &self,
        row: &MinuteRow,
        freshness_secs: i64,
        now_ms: i64,
    ) -> Result<()> {
        {
            let conn = self
                .pool
                .get()
                .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
            conn.execute(
                "INSERT INTO minute_row (
                    symbol, timestamp, composite, news, reddit, technical, analyst, label,
                    article_count, cached_count, new_count,
                    price_open, price_high, price_low, price_close, volume,
                    rsi, macd, volatility_index
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    row.symbol,
                    row.timestamp_ms,
                    row.composite,
                    row.news,
                    row.reddit,
                    row.technical,
                    row.analyst,
                    row.label,
                    row.article_count,
                    row.cached_count,
                    row.new_count,
                    row.price_open,
                    row.price_high,
                    row.price_low,
                    row.price_close,
                    row.volume,
                    row.rsi,
                    row.macd,
                    row.volatility_index,
                ],
            )?;
        }

        // 秒级系统活跃性检测：最新快照年龄在窗口内才镜像
        let per_second_active = match self.latest_snapshot(&row.symbol)? {
            Some(snap) => now_ms / 1000 - snap.bucket_second <= freshness_secs,
            None => false,
        };

        if per_second_active {
            let mirror = SecondSnapshot {
                symbol: row.symbol.clone(),
                bucket_second: row.timestamp_ms / 1000,
                composite: row.composite,
                news_cached: row.news,
                technical_cached: row.technical,
                open: row.price_open,
                high: row.price_high,
                low: row.price_low,
                close: row.price_close,
                volume: row.volume,
                tick_count: 0,
            };
            // 镜像写为尽力而为，失败由下一个composer节拍补齐基准
            if let Err(e) = self.insert_second_snapshot(&mirror) {
                warn!(target: DB_TARGET, error = %e, "分钟基准快照镜像写入失败");
            }
        }

        Ok(())
    }

    /// 停止写入队列处理线程
    pub fn shutdown(&self) {
        *self.queue_processor_running.lock().unwrap() = false;
    }
}

fn map_snapshot_row(r: &rusqlite::Row<'_>) -> std::result::Result<SecondSnapshot, rusqlite::Error> {
    Ok(SecondSnapshot {
        symbol: r.get(0)?,
        bucket_second: r.get(1)?,
        composite: r.get(2)?,
        news_cached: r.get(3)?,
        technical_cached: r.get(4)?,
        open: r.get(5)?,
        high: r.get(6)?,
        low: r.get(7)?,
        close: r.get(8)?,
        volume: r.get(9)?,
        tick_count: r.get(10)?,
    })
}

/// 分钟分析器的单分钟新文章贡献规则：加权贡献取平均后截断到±25
///
/// 与composer的逐篇直接累加规则相对应，二者共同维持同一分数量纲。
pub fn minute_news_contribution(weighted_contributions: &[f64]) -> f64 {
    if weighted_contributions.is_empty() {
        return 0.0;
    }
    let mean = weighted_contributions.iter().sum::<f64>() / weighted_contributions.len() as f64;
    mean.clamp(-MAX_ARTICLE_IMPACT, MAX_ARTICLE_IMPACT)
}
