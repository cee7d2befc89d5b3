//! 实时市场情绪引擎服务
//!
//! ## 核心执行模型
//! - main手动创建多线程io_runtime，承载行情流、新闻采集与评分等I/O任务。
//! - composer与各来源保存worker运行在专属OS线程上，独占阻塞式数据库访问。
//! - 异步与线程之间只经由有界队列通信。
//! - 启动按依赖顺序：时钟 -> 持久化 -> 评分 -> 保存worker -> composer ->
//!   聚合循环 -> 行情流；关闭时逆向排空。

use anyhow::Result;
use sentiment_server::mscommon::config::constants::{
    CANDLE_QUEUE_CAPACITY, SCORED_IMPACTS_CAPACITY, TO_SAVE_QUEUE_CAPACITY,
    TO_SCORE_QUEUE_CAPACITY,
};
use sentiment_server::mscommon::logging_setup::{init_logging, install_panic_hook};
use sentiment_server::mscommon::{
    Database, MarketHoursClock, RssFeedsConfig, SentimentConfig, WATCHLIST,
};
use sentiment_server::msdata::streamer::TickStreamConfig;
use sentiment_server::msdata::{SentimentComposer, TickAggregator, TickStreamClient};
use sentiment_server::msnews::save_worker::SaveSummary;
use sentiment_server::msnews::{
    run_collector_loop, run_scoring_worker, select_scorer, CompanyNewsCollector,
    MarketNewsCollector, NewsSource, RssCollector, SaveWorker, ScoringContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 应用生命周期日志目标
const APP_TARGET: &str = "应用生命周期";

fn main() -> Result<()> {
    // 日志系统必须最先初始化
    init_logging();
    install_panic_hook();

    let io_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("io-worker")
        .build()?;

    let result = io_runtime.block_on(run_app());

    if let Err(e) = &result {
        error!(target: APP_TARGET, error = ?e, "服务因顶层错误而异常退出");
    } else {
        info!(target: APP_TARGET, "服务正常关闭");
    }

    io_runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn run_app() -> Result<()> {
    info!(target: APP_TARGET, "市场情绪引擎启动中...");

    // 1. ==================== 全局资源 ====================
    let config = SentimentConfig::from_env()?;
    let instrument = Arc::new(config.instrument());
    info!(
        target: APP_TARGET,
        symbol = %config.instrument_symbol,
        provider = ?config.scorer_kind,
        freshness_secs = config.snapshot_freshness_secs,
        "配置加载完成"
    );

    let clock = Arc::new(MarketHoursClock::new(config.skip_market_hours));
    let db = Arc::new(Database::new(&config.database_path)?);
    info!(target: APP_TARGET, path = %config.database_path, "数据库连接成功");

    // 2. ==================== 通信设施 ====================
    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (candle_tx, candle_rx) = crossbeam_channel::bounded(CANDLE_QUEUE_CAPACITY);
    let (impacts_tx, impacts_rx) = crossbeam_channel::bounded(SCORED_IMPACTS_CAPACITY);

    // 3. ==================== 评分后端 ====================
    let scorer = select_scorer(
        config.scorer_kind,
        &config.sentiment_api_key_fast,
        &config.sentiment_api_key_accurate,
    );

    // 4. ============ 新闻采集舰队（能力开关逐个闸门） ============
    let mut sources: Vec<Box<dyn NewsSource>> = Vec::new();

    if config.enable_company_news {
        let collector = CompanyNewsCollector::new(
            config.company_news_api_key.clone(),
            WATCHLIST.iter().map(|s| s.to_string()).collect(),
        );
        match collector.check_configured() {
            Ok(_) => sources.push(Box::new(collector)),
            Err(e) => warn!(target: APP_TARGET, error = %e, "公司新闻采集器已禁用"),
        }
    }
    if config.enable_market_news {
        let collector = MarketNewsCollector::new(config.market_news_api_key.clone());
        match collector.check_configured() {
            Ok(_) => sources.push(Box::new(collector)),
            Err(e) => warn!(target: APP_TARGET, error = %e, "市场新闻采集器已禁用"),
        }
    }
    if config.enable_rss_news {
        match RssFeedsConfig::from_file(&config.rss_feeds_config_path)
            .and_then(|feeds| RssCollector::new(feeds.feeds))
        {
            Ok(collector) => sources.push(Box::new(collector)),
            Err(e) => warn!(target: APP_TARGET, error = %e, "RSS采集器已禁用"),
        }
    }
    info!(target: APP_TARGET, source_count = sources.len(), "新闻采集舰队组装完成");

    // 每来源：保存worker线程 + 评分worker任务 + 采集循环任务
    let mut save_handles: Vec<(String, JoinHandle<SaveSummary>)> = Vec::new();
    for source in sources {
        let tag = source.tag().to_string();

        let (to_score_tx, to_score_rx) = mpsc::channel(TO_SCORE_QUEUE_CAPACITY);
        let (save_tx, save_rx) = crossbeam_channel::bounded(TO_SAVE_QUEUE_CAPACITY);
        let (unmark_tx, unmark_rx) = mpsc::unbounded_channel();

        let worker = SaveWorker::new(tag.clone(), db.clone(), save_rx, running.clone());
        save_handles.push((tag.clone(), worker.spawn()));

        let ctx = ScoringContext {
            tag: tag.clone(),
            scorer: scorer.clone(),
            instrument: instrument.clone(),
            impacts_tx: impacts_tx.clone(),
            impacts_rx: impacts_rx.clone(),
            save_tx,
            unmark_tx,
        };
        tokio::spawn(run_scoring_worker(ctx, to_score_rx, shutdown_rx.clone()));
        tokio::spawn(run_collector_loop(
            source,
            to_score_tx,
            unmark_rx,
            shutdown_rx.clone(),
        ));
    }

    // 5. ==================== composer线程 ====================
    let composer = SentimentComposer::new(
        config.instrument_symbol.clone(),
        db.clone(),
        config.snapshot_freshness_secs,
        candle_rx,
        impacts_rx.clone(),
        running.clone(),
    );
    let composer_handle = composer.spawn();

    // 6. ==================== 聚合器与行情流 ====================
    let aggregator = Arc::new(TickAggregator::new(
        config.instrument_symbol.clone(),
        db.clone(),
        candle_tx,
    )?);

    let agg_loop = {
        let aggregator = aggregator.clone();
        let running = running.clone();
        tokio::spawn(async move { aggregator.run_second_loop(running).await })
    };

    let (tick_tx, mut tick_rx) = mpsc::channel(1024);
    let dispatch_task = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                aggregator.handle_tick(tick);
            }
        })
    };

    let stream_config = TickStreamConfig {
        url: config.tick_stream_url.clone(),
        api_key: config.tick_stream_api_key.clone(),
        symbol: config.instrument_symbol.clone(),
    };
    let stream_client = TickStreamClient::new(stream_config, clock.clone(), running.clone());
    let mut stream_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { stream_client.run(tick_tx, shutdown_rx).await })
    };

    info!(target: APP_TARGET, "全部子系统已启动");

    // 7. ==================== 等待退出条件 ====================
    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(target: APP_TARGET, "收到关闭信号，开始有序退出");
        }
        result = &mut stream_task => {
            match result {
                Ok(Err(e)) => {
                    error!(target: APP_TARGET, error = %e, "行情流客户端致命退出");
                    fatal = Some(e.into());
                }
                Ok(Ok(_)) => info!(target: APP_TARGET, "行情流客户端退出"),
                Err(e) => {
                    error!(target: APP_TARGET, error = %e, "行情流任务异常");
                    fatal = Some(e.into());
                }
            }
        }
    }

    // 8. ==================== 有序关闭 ====================
    // 停止接收tick
    let _ = shutdown_tx.send(true);
    if !stream_task.is_finished() {
        let _ = (&mut stream_task).await;
    }
    dispatch_task.abort();

    // 留出时间让聚合器定稿在途秒
    sleep(Duration::from_millis(1200)).await;
    running.store(false, Ordering::Relaxed);
    let _ = agg_loop.await;

    // composer排空待处理K线与影响队列后退出
    if let Err(e) = tokio::task::spawn_blocking(move || composer_handle.join()).await {
        warn!(target: APP_TARGET, error = %e, "等待composer线程失败");
    }

    // 保存worker各自排空队列（至多60秒），输出最终汇总
    for (tag, handle) in save_handles {
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(summary)) => {
                info!(
                    target: APP_TARGET,
                    source = %tag,
                    "保存worker汇总: SUCCESS {} | FAILED {} | DEADLINE {}",
                    summary.success,
                    summary.failed,
                    summary.deadline_exceeded
                );
            }
            _ => warn!(target: APP_TARGET, source = %tag, "等待保存worker失败"),
        }
    }

    db.shutdown();
    info!(target: APP_TARGET, "全部子系统已停止");

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
