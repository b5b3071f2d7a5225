use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use apify_client::PlaceResult;
use platecheck_common::Mode;
use platecheck_engine::{
    AnalysisRunOptions, AnalyzeOptions, Analyzer, BulkOrchestrator, CallError, DiscoveryOptions,
    EngineError, Gateway, PlaceSearcher, RegionFilter, ReviewAnalyst, ReviewScraper, TaskQueue,
    TaskState,
};
use platecheck_store::Store;

struct MockScraper {
    calls: AtomicUsize,
    items: Vec<Value>,
    delay: Duration,
}

impl MockScraper {
    fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            items,
            delay: Duration::ZERO,
        })
    }

    fn slow(items: Vec<Value>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            items,
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewScraper for MockScraper {
    async fn fetch_reviews(
        &self,
        _map_url: &str,
        _max_reviews: u32,
        _language: &str,
    ) -> Result<Vec<Value>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.items.clone())
    }
}

/// Scraper whose upstream can gain reviews between calls.
struct GrowingScraper {
    calls: AtomicUsize,
    items: std::sync::Mutex<Vec<Value>>,
}

impl GrowingScraper {
    fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            items: std::sync::Mutex::new(items),
        })
    }

    fn push(&self, item: Value) {
        self.items.lock().unwrap().push(item);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewScraper for GrowingScraper {
    async fn fetch_reviews(
        &self,
        _map_url: &str,
        _max_reviews: u32,
        _language: &str,
    ) -> Result<Vec<Value>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.lock().unwrap().clone())
    }
}

struct MockAnalyst {
    calls: AtomicUsize,
}

impl MockAnalyst {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewAnalyst for MockAnalyst {
    async fn analyze(
        &self,
        _place_name: &str,
        _reviews: &str,
        _mode: Mode,
    ) -> Result<Value, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"verdict": "worth a visit", "score": 8}))
    }
}

struct QuotaSearcher {
    calls: AtomicUsize,
    fail_at: usize,
}

impl QuotaSearcher {
    fn new(fail_at: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_at,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaceSearcher for QuotaSearcher {
    async fn search_places(
        &self,
        queries: &[String],
        _limit_per_query: u32,
        _language: &str,
    ) -> Result<Vec<PlaceResult>, CallError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= self.fail_at {
            return Err(CallError::Quota("usage-hard-limit-exceeded".to_string()));
        }
        Ok(queries
            .iter()
            .map(|q| PlaceResult {
                place_id: Some(format!("ChIJ{call}-{q}")),
                title: Some(format!("Place for {q}")),
                address: Some("1 Test Rd, East District".to_string()),
                ..Default::default()
            })
            .collect())
    }
}

fn review_items(place_id: Option<&str>) -> Vec<Value> {
    let mut items = vec![
        json!({
            "reviewId": "r1",
            "name": "A",
            "stars": 5,
            "text": "amazing beef noodles",
            "publishedAtDate": "2026-02-01T10:00:00+00:00",
            "title": "Mock Cafe"
        }),
        json!({
            "reviewId": "r2",
            "name": "B",
            "stars": 3,
            "text": "slow service but decent food",
            "publishedAtDate": "2026-02-03T10:00:00+00:00",
            "title": "Mock Cafe"
        }),
    ];
    if let Some(pid) = place_id {
        for item in &mut items {
            item["placeId"] = json!(pid);
        }
    }
    items
}

async fn build(
    scraper: Arc<dyn ReviewScraper>,
    analyst: Arc<dyn ReviewAnalyst>,
) -> (Arc<Store>, Arc<Gateway>, Arc<Analyzer>) {
    let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
    store.migrate().await.unwrap();
    let gateway = Arc::new(Gateway::new(8, Duration::from_secs(5), Duration::ZERO));
    let analyzer = Arc::new(Analyzer::new(
        Arc::clone(&store),
        Arc::clone(&gateway),
        scraper,
        analyst,
        Duration::from_secs(3600),
        "en",
        60,
    ));
    (store, gateway, analyzer)
}

#[tokio::test]
async fn second_lookup_serves_cache_without_scraping() {
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let input = "https://www.google.com/maps/place/?q=place_id:ChIJmock";
    let opts = AnalyzeOptions::for_mode(Mode::Quick);

    let first = analyzer.analyze_place(input, &opts).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.review_count, 2);
    assert_eq!(first.new_reviews, 2);
    assert_eq!(scraper.calls(), 1);
    assert_eq!(analyst.calls(), 1);

    let second = analyzer.analyze_place(input, &opts).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.report, first.report);
    assert_eq!(scraper.calls(), 1);
    assert_eq!(analyst.calls(), 1);
}

#[tokio::test]
async fn modes_cache_independently() {
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let input = "https://www.google.com/maps/place/?q=place_id:ChIJmock";
    analyzer
        .analyze_place(input, &AnalyzeOptions::for_mode(Mode::Quick))
        .await
        .unwrap();
    analyzer
        .analyze_place(input, &AnalyzeOptions::for_mode(Mode::Deep))
        .await
        .unwrap();

    assert_eq!(scraper.calls(), 2);
    assert_eq!(analyst.calls(), 2);
}

#[tokio::test]
async fn short_link_upgrades_identity_and_reuses_cache() {
    let scraper = MockScraper::new(review_items(Some("ChIJupgraded")));
    let analyst = MockAnalyst::new();
    let (store, _gw, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let input = "https://maps.app.goo.gl/shortmock";
    let opts = AnalyzeOptions::for_mode(Mode::Quick);

    let first = analyzer.analyze_place(input, &opts).await.unwrap();
    assert_eq!(first.reference.identity_key, "place:ChIJupgraded");
    assert_eq!(store.review_count("place:ChIJupgraded").await.unwrap(), 2);

    // The same short link now routes through the alias to the upgraded key.
    let second = analyzer.analyze_place(input, &opts).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(scraper.calls(), 1);
}

#[tokio::test]
async fn unchanged_archive_skips_the_analyst() {
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let input = "https://www.google.com/maps/place/?q=place_id:ChIJmock";
    analyzer
        .analyze_place(input, &AnalyzeOptions::for_mode(Mode::Quick))
        .await
        .unwrap();

    let refresh = AnalyzeOptions {
        force_refresh: true,
        skip_unchanged: true,
        ..AnalyzeOptions::for_mode(Mode::Quick)
    };
    let outcome = analyzer.analyze_place(input, &refresh).await.unwrap();
    assert!(outcome.skipped);
    assert_eq!(scraper.calls(), 2);
    assert_eq!(analyst.calls(), 1);
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let scraper = MockScraper::new(vec![]);
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper, analyst).await;

    let err = analyzer
        .analyze_place("   ", &AnalyzeOptions::for_mode(Mode::Quick))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn duplicate_submissions_coalesce() {
    let scraper = MockScraper::slow(review_items(None), Duration::from_millis(200));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let queue = TaskQueue::new(
        analyzer,
        3,
        Duration::from_secs(60),
        Duration::from_millis(50),
    );

    let input = "https://www.google.com/maps/place/?q=place_id:ChIJmock";
    let opts = AnalyzeOptions::for_mode(Mode::Quick);
    let id1 = queue.submit(input, opts.clone()).unwrap();
    let id2 = queue.submit(input, opts.clone()).unwrap();
    assert_eq!(id1, id2);

    // A different mode is separate work.
    let id3 = queue.submit(input, AnalyzeOptions::for_mode(Mode::Deep)).unwrap();
    assert_ne!(id1, id3);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = queue.status(&id1).unwrap();
        if record.state.is_terminal() {
            assert_eq!(record.state, TaskState::Done);
            assert!(record.result.is_some());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(scraper.calls(), 2); // one per mode, none for the duplicate
}

#[tokio::test]
async fn reaper_expires_finished_tasks() {
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper, analyst).await;

    let queue = TaskQueue::new(
        analyzer,
        1,
        Duration::ZERO, // everything is instantly expired
        Duration::from_millis(50),
    );
    let id = queue
        .submit(
            "https://www.google.com/maps/place/?q=place_id:ChIJmock",
            AnalyzeOptions::for_mode(Mode::Quick),
        )
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !queue.status(&id).unwrap().state.is_terminal() {
        assert!(tokio::time::Instant::now() < deadline, "task never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(queue.reap(), 1);
    assert!(matches!(
        queue.status(&id),
        Err(EngineError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn discovery_quota_abort_keeps_partial_progress() {
    let searcher = QuotaSearcher::new(3);
    let scraper = MockScraper::new(vec![]);
    let analyst = MockAnalyst::new();
    let (store, gateway, analyzer) = build(scraper, analyst).await;

    let orchestrator = BulkOrchestrator::new(
        Arc::clone(&store),
        gateway,
        searcher.clone(),
        analyzer,
        Duration::from_millis(50),
    );

    let queries: Vec<String> = (0..10).map(|i| format!("query {i}")).collect();
    let options = DiscoveryOptions {
        limit_per_query: 10,
        language: "en".to_string(),
        filter: RegionFilter::default(),
        workers: 1,
        queries_per_batch: 1,
        max_new_places: None,
    };

    let err = orchestrator
        .run_discovery("east-district", &queries, &options)
        .await
        .unwrap_err();
    assert!(err.is_quota());

    // Two batches landed before the wall; the rest were never dispatched.
    assert_eq!(searcher.calls(), 3);
    assert_eq!(store.catalog_count("east-district").await.unwrap(), 2);

    let job = store.recent_jobs(1).await.unwrap().remove(0);
    assert_eq!(job.status, "error");
    assert_eq!(job.completed, 2);
    assert_eq!(job.failed, 1); // the batch the quota wall stopped
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn bulk_analysis_processes_catalog_then_skips_fresh() {
    let searcher = QuotaSearcher::new(usize::MAX);
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (store, gateway, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let orchestrator = BulkOrchestrator::new(
        Arc::clone(&store),
        gateway,
        searcher,
        analyzer,
        Duration::from_millis(50),
    );

    let queries = vec!["noodles".to_string(), "dumplings".to_string()];
    let options = DiscoveryOptions {
        limit_per_query: 10,
        language: "en".to_string(),
        filter: RegionFilter::default(),
        workers: 1,
        queries_per_batch: 1,
        max_new_places: None,
    };
    let discovery = orchestrator
        .run_discovery("east-district", &queries, &options)
        .await
        .unwrap();
    assert_eq!(discovery.kept, 2);

    let run = AnalysisRunOptions {
        mode: Mode::Quick,
        workers: 2,
        refresh: false,
    };
    let first = orchestrator.run_analysis("east-district", &run).await.unwrap();
    assert_eq!(first.analyzed, 2);
    assert_eq!(first.failed, 0);
    assert_eq!(analyst.calls(), 2);

    // Nothing new upstream: the second pass still scrapes but keeps the
    // prior reports instead of re-running the analyst.
    let second = orchestrator.run_analysis("east-district", &run).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(analyst.calls(), 2);
    assert_eq!(scraper.calls(), 4);

    let rows = store.catalog_with_analysis("east-district", "quick").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.report.is_some()));
    assert!(rows
        .iter()
        .all(|r| r.place.analyze_status == "skipped_no_new_data"));
    assert!(rows.iter().all(|r| r.place.last_analyzed_at.is_some()));
}

#[tokio::test]
async fn bulk_analysis_picks_up_reviews_posted_after_caching() {
    let searcher = QuotaSearcher::new(usize::MAX);
    let scraper = GrowingScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (store, gateway, analyzer) = build(scraper.clone(), analyst.clone()).await;

    let orchestrator = BulkOrchestrator::new(
        Arc::clone(&store),
        gateway,
        searcher,
        analyzer,
        Duration::from_millis(50),
    );

    let queries = vec!["noodles".to_string()];
    let options = DiscoveryOptions {
        limit_per_query: 10,
        language: "en".to_string(),
        filter: RegionFilter::default(),
        workers: 1,
        queries_per_batch: 1,
        max_new_places: None,
    };
    orchestrator
        .run_discovery("east-district", &queries, &options)
        .await
        .unwrap();

    let run = AnalysisRunOptions {
        mode: Mode::Quick,
        workers: 1,
        refresh: false,
    };
    let first = orchestrator.run_analysis("east-district", &run).await.unwrap();
    assert_eq!(first.analyzed, 1);
    assert_eq!(analyst.calls(), 1);

    // A review lands upstream while the cached report is still fresh. The
    // next run must scrape it into the archive and re-analyze.
    scraper.push(json!({
        "reviewId": "r3",
        "name": "C",
        "stars": 4,
        "text": "the new menu is great",
        "publishedAtDate": "2026-02-05T10:00:00+00:00",
        "title": "Mock Cafe"
    }));
    let second = orchestrator.run_analysis("east-district", &run).await.unwrap();
    assert_eq!(second.analyzed, 1);
    assert_eq!(second.skipped, 0);
    assert_eq!(analyst.calls(), 2);
    assert_eq!(scraper.calls(), 2);

    // Quiet again: scraped, merged nothing, kept the report.
    let third = orchestrator.run_analysis("east-district", &run).await.unwrap();
    assert_eq!(third.skipped, 1);
    assert_eq!(analyst.calls(), 2);
    assert_eq!(scraper.calls(), 3);
}

#[tokio::test]
async fn slow_call_completes_under_heartbeat() {
    let gateway = Gateway::new(1, Duration::from_secs(5), Duration::from_millis(10));
    let value = gateway
        .call("slow", async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok::<_, CallError>(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn discovery_stops_once_enough_new_places_landed() {
    let searcher = QuotaSearcher::new(usize::MAX);
    let scraper = MockScraper::new(vec![]);
    let analyst = MockAnalyst::new();
    let (store, gateway, analyzer) = build(scraper, analyst).await;

    let orchestrator = BulkOrchestrator::new(
        Arc::clone(&store),
        gateway,
        searcher,
        analyzer,
        Duration::from_millis(50),
    );

    let queries: Vec<String> = (0..10).map(|i| format!("query {i}")).collect();
    let options = DiscoveryOptions {
        limit_per_query: 10,
        language: "en".to_string(),
        filter: RegionFilter::default(),
        workers: 1,
        queries_per_batch: 1,
        max_new_places: Some(2),
    };

    let report = orchestrator
        .run_discovery("east-district", &queries, &options)
        .await
        .unwrap();
    assert_eq!(report.new, 2);
    assert_eq!(store.catalog_count("east-district").await.unwrap(), 2);

    let job = store.recent_jobs(1).await.unwrap().remove(0);
    assert_eq!(job.status, "done");
    assert_eq!(job.detail.as_deref(), Some("new-place threshold reached"));
}

#[tokio::test]
async fn finished_task_result_is_backed_by_cache() {
    let scraper = MockScraper::new(review_items(None));
    let analyst = MockAnalyst::new();
    let (_store, _gw, analyzer) = build(scraper, analyst).await;

    let queue = TaskQueue::new(
        analyzer,
        1,
        Duration::from_secs(60),
        Duration::from_millis(50),
    );
    let id = queue
        .submit(
            "https://www.google.com/maps/place/?q=place_id:ChIJmock",
            AnalyzeOptions::for_mode(Mode::Quick),
        )
        .unwrap();

    // Still queued or running: not a result yet.
    assert!(matches!(
        queue.result(&id).await,
        Err(EngineError::TaskPending(_)) | Err(EngineError::TaskNotFound(_)) | Ok(_)
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !queue.status(&id).unwrap().state.is_terminal() {
        assert!(tokio::time::Instant::now() < deadline, "task never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let outcome = queue.result(&id).await.unwrap();
    assert_eq!(outcome.reference.identity_key, "place:ChIJmock");
    assert!(outcome.report.get("verdict").is_some());
}
