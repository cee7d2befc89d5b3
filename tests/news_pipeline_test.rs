//! 新闻管线集成测试：去重幂等、先评分后保存、评分失败退回
#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use sentiment_server::mscommon::config::Instrument;
    use sentiment_server::mscommon::error::{AppError, Result};
    use sentiment_server::mscommon::models::{ArticleCandidate, SaveJob, ScoredImpact};
    use sentiment_server::mscommon::Database;
    use sentiment_server::msnews::{
        article_hash, run_collector_loop, run_scoring_worker, NewsSource, SaveWorker,
        ScoringContext, SentimentScorer,
    };
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    /// 固定返回+0.9情绪的打桩提供方
    struct StubScorer {
        calls: Arc<AtomicUsize>,
        fail_first_n: usize,
    }

    #[async_trait]
    impl SentimentScorer for StubScorer {
        async fn score(&self, texts: &[String]) -> Result<Vec<f64>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(AppError::ScoringUnavailable("stub timeout".to_string()));
            }
            Ok(vec![0.9; texts.len()])
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    /// 每次poll都返回同一篇文章的打桩来源
    struct RepeatingSource {
        candidate: ArticleCandidate,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NewsSource for RepeatingSource {
        fn tag(&self) -> &str {
            "company"
        }

        async fn poll_once(&mut self) -> Result<Vec<ArticleCandidate>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![self.candidate.clone()])
        }
    }

    fn candidate(url: &str) -> ArticleCandidate {
        let headline = "Apple beats earnings".to_string();
        ArticleCandidate {
            source: "company".to_string(),
            symbol: "AAPL".to_string(),
            headline: headline.clone(),
            summary: "Strong quarter".to_string(),
            url: url.to_string(),
            publish_time_ms: Utc::now().timestamp_millis(),
            hash: article_hash("company", url, &headline),
        }
    }

    fn setup_test_db(name: &str) -> Arc<Database> {
        let db_path = PathBuf::from(format!("./target/test_pipeline_{}.db", name));
        if db_path.exists() {
            std::fs::remove_file(&db_path).unwrap();
        }
        Arc::new(Database::new(&db_path).unwrap())
    }

    /// 幂等性：同一篇文章被反复发现，去重缓存保证只入队一次，
    /// 全程恰好产生一条影响与一行文章。
    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_article_scores_exactly_once() {
        let db = setup_test_db("idempotent");
        let instrument = Arc::new(Instrument::new("QLD".to_string(), "test".to_string()));

        let (to_score_tx, to_score_rx) = mpsc::channel(100);
        let (save_tx, save_rx) = crossbeam_channel::bounded(500);
        let (impacts_tx, impacts_rx) = crossbeam_channel::bounded::<ScoredImpact>(500);
        let (unmark_tx, unmark_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));

        let polls = Arc::new(AtomicUsize::new(0));
        let source = Box::new(RepeatingSource {
            candidate: candidate("https://example.com/apple"),
            polls: polls.clone(),
        });

        let scorer_calls = Arc::new(AtomicUsize::new(0));
        let scorer = Arc::new(StubScorer {
            calls: scorer_calls.clone(),
            fail_first_n: 0,
        });

        let ctx = ScoringContext {
            tag: "company".to_string(),
            scorer,
            instrument,
            impacts_tx: impacts_tx.clone(),
            impacts_rx: impacts_rx.clone(),
            save_tx,
            unmark_tx,
        };

        let save_worker = SaveWorker::new("company".to_string(), db.clone(), save_rx, running.clone());
        let save_handle = save_worker.spawn();

        tokio::spawn(run_scoring_worker(ctx, to_score_rx, shutdown_rx.clone()));
        tokio::spawn(run_collector_loop(
            source,
            to_score_tx,
            unmark_rx,
            shutdown_rx.clone(),
        ));

        // 让采集循环跑几个节拍（同一篇文章被多次发现）
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let _ = shutdown_tx.send(true);
        running.store(false, Ordering::Relaxed);
        let summary = tokio::task::spawn_blocking(move || save_handle.join().unwrap())
            .await
            .unwrap();

        assert!(polls.load(Ordering::SeqCst) >= 2, "来源应被轮询多次");
        assert_eq!(
            scorer_calls.load(Ordering::SeqCst),
            1,
            "同hash文章应只评分一次"
        );

        // 恰好一条影响进入全局队列
        let mut impact_count = 0;
        while let Ok(impact) = impacts_rx.try_recv() {
            assert!((impact.impact - 12.6).abs() < 1e-9, "impact = 0.9*0.14*100 = 12.6");
            impact_count += 1;
        }
        assert_eq!(impact_count, 1, "至多一条影响入队");

        // 恰好一行文章落库
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);
    }

    /// 先评分后保存：影响入队时刻不晚于文章落库。
    /// 保存队列故意塞满时，影响依然产生（QUEUE_FULL只损失落库）。
    #[tokio::test(flavor = "multi_thread")]
    async fn test_impact_pushed_before_save_and_on_full_queue() {
        let instrument = Arc::new(Instrument::new("QLD".to_string(), "test".to_string()));

        let (to_score_tx, to_score_rx) = mpsc::channel(100);
        // 容量1的保存队列，预先塞满
        let (save_tx, save_rx) = crossbeam_channel::bounded(1);
        save_tx
            .send(SaveJob {
                article: sentiment_server::mscommon::models::Article {
                    source: "company".to_string(),
                    symbol: "AAPL".to_string(),
                    headline: "filler".to_string(),
                    summary: String::new(),
                    url: "https://example.com/filler".to_string(),
                    publish_time_ms: 0,
                    hash: "f".repeat(32),
                    sentiment: 0.0,
                    impact: 0.0,
                    weighted_contribution: 0.0,
                    fetched_at_ms: 0,
                },
                enqueued_at_ms: 0,
            })
            .unwrap();

        let (impacts_tx, impacts_rx) = crossbeam_channel::bounded::<ScoredImpact>(500);
        let (unmark_tx, _unmark_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ScoringContext {
            tag: "company".to_string(),
            scorer: Arc::new(StubScorer {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first_n: 0,
            }),
            instrument,
            impacts_tx: impacts_tx.clone(),
            impacts_rx: impacts_rx.clone(),
            save_tx,
            unmark_tx,
        };

        tokio::spawn(run_scoring_worker(ctx, to_score_rx, shutdown_rx.clone()));

        to_score_tx.send(candidate("https://example.com/spike")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = shutdown_tx.send(true);

        // 保存被拒绝（队列满），但影响必须可见
        let impact = impacts_rx.try_recv().expect("保存队列满时影响仍应入队");
        assert!((impact.impact - 12.6).abs() < 1e-9);
        let _ = save_rx;
    }

    /// 评分提供方失败：不缓存0分，hash退回采集器解除登记，
    /// 文章在下次发现时重新入队并成功评分。
    #[tokio::test(flavor = "multi_thread")]
    async fn test_scoring_failure_unmarks_for_refetch() {
        let instrument = Arc::new(Instrument::new("QLD".to_string(), "test".to_string()));

        let (to_score_tx, to_score_rx) = mpsc::channel(100);
        let (save_tx, save_rx) = crossbeam_channel::bounded(500);
        let (impacts_tx, impacts_rx) = crossbeam_channel::bounded::<ScoredImpact>(500);
        let (unmark_tx, unmark_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let polls = Arc::new(AtomicUsize::new(0));
        let source = Box::new(RepeatingSource {
            candidate: candidate("https://example.com/retry"),
            polls,
        });

        let scorer_calls = Arc::new(AtomicUsize::new(0));
        // 第一次评分失败，之后成功
        let ctx = ScoringContext {
            tag: "company".to_string(),
            scorer: Arc::new(StubScorer {
                calls: scorer_calls.clone(),
                fail_first_n: 1,
            }),
            instrument,
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

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let _ = shutdown_tx.send(true);

        assert!(
            scorer_calls.load(Ordering::SeqCst) >= 2,
            "失败后文章应被重新发现并再次评分"
        );

        // 失败不产生影响，成功恰好产生一条
        let mut impacts = Vec::new();
        while let Ok(impact) = impacts_rx.try_recv() {
            impacts.push(impact);
        }
        assert_eq!(impacts.len(), 1, "失败的评分不得计为0分影响");
        let _ = save_rx;
    }
}
