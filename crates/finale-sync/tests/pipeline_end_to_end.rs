use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use finale_adapters::{FinaleOutdoorAdapter, FINALEOUTDOOR_LISTING_URL};
use finale_core::{CanonicalTrail, TrailStatus};
use finale_storage::{
    FetchError, FetchedDocument, FileFetcher, HttpClientConfig, HttpFetcher, StatusFetcher,
};
use finale_sync::{
    build_pipeline, InMemoryTrailStore, PersistOutcome, RunError, RunOptions, StatusSyncPipeline,
    SyncConfig, TrailStore,
};

fn listing_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/finaleoutdoor/sample/listing.html")
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

fn trail(id: &str, name: &str, full_name: Option<&str>, current: Option<TrailStatus>) -> CanonicalTrail {
    CanonicalTrail {
        id: id.to_string(),
        name: name.to_string(),
        full_name: full_name.map(ToString::to_string),
        current_status: current,
    }
}

fn seeded_store() -> Arc<InMemoryTrailStore> {
    Arc::new(InMemoryTrailStore::new(vec![
        trail("t-cacciatori", "Cacciatori", None, Some(TrailStatus::Open)),
        trail("t-crestino", "Crestino", Some("7 / Crestino"), Some(TrailStatus::Open)),
        trail("t-lupo", "Lupo", Some("12 / Lupo Enduro"), Some(TrailStatus::Closed)),
        trail("t-toboga", "Toboga", None, None),
        trail("t-madre", "Madre de Dio", None, Some(TrailStatus::Closed)),
        trail("t-pian", "Pian Marino", None, Some(TrailStatus::Open)),
    ]))
}

fn config(overrides: &[(&str, &str)]) -> SyncConfig {
    SyncConfig::from_lookup(|key| {
        overrides
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .unwrap()
}

fn pipeline(
    config: SyncConfig,
    fetcher: Box<dyn StatusFetcher>,
    store: Box<dyn TrailStore>,
) -> StatusSyncPipeline {
    StatusSyncPipeline::new(
        config,
        Box::new(FinaleOutdoorAdapter::new().unwrap()),
        fetcher,
        store,
    )
}

struct StaticFetcher(&'static str);

#[async_trait]
impl StatusFetcher for StaticFetcher {
    async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        Ok(FetchedDocument {
            url: url.to_string(),
            body: self.0.to_string(),
            fetched_at: Utc::now(),
        })
    }
}

#[tokio::test]
async fn fixture_listing_updates_changed_trails_once() {
    let store = seeded_store();
    let archive = tempfile::tempdir().unwrap();
    let archive_dir = archive.path().display().to_string();
    let pipeline = pipeline(
        config(&[("FINALE_ARTIFACTS_DIR", archive_dir.as_str())]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(Arc::clone(&store)),
    );

    let summary = pipeline.run_for_date(run_date()).await.unwrap();
    assert_eq!(summary.total, 6);
    assert_eq!(summary.matched, 4);
    assert_eq!(summary.changed, 3);
    assert_eq!(summary.unmatched, 2);
    assert_eq!(summary.unmatched_names, vec!["Madre de Dio", "Pian Marino"]);
    assert_eq!(summary.persist, PersistOutcome::Written { rows: 3 });
    assert_eq!(summary.near_misses.len(), 1);
    assert_eq!(summary.near_misses[0].candidate, "31 / Madre di Dio");

    let history = store.history().await;
    let written: Vec<(&str, TrailStatus)> = history
        .iter()
        .map(|row| (row.trail_id.as_str(), row.status))
        .collect();
    assert_eq!(
        written,
        vec![
            ("t-crestino", TrailStatus::Closed),
            ("t-lupo", TrailStatus::Open),
            ("t-toboga", TrailStatus::Open),
        ]
    );
    assert!(history.iter().all(|row| row.status_date == run_date()));
    assert!(history
        .iter()
        .all(|row| row.notes == "Auto-updated from finaleoutdoor.com"));
    assert!(std::fs::read_dir(archive.path()).unwrap().next().is_some());

    let text = summary.render_text();
    assert!(text.contains("[CLOSED] Crestino: Open -> Closed"));
    assert!(text.contains("[OPEN] Toboga: unknown -> Open"));

    let rerun = pipeline.run_for_date(run_date()).await.unwrap();
    assert_eq!(rerun.changed, 0);
    assert_eq!(rerun.matched, 4);
    assert_eq!(rerun.persist, PersistOutcome::Written { rows: 0 });
    assert_eq!(store.history().await, history);
    assert_eq!(store.write_calls(), 1);
}

#[tokio::test]
async fn write_scope_all_refreshes_unchanged_trails() {
    let store = seeded_store();
    let pipeline = pipeline(
        config(&[("FINALE_WRITE_SCOPE", "all")]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(Arc::clone(&store)),
    );

    let summary = pipeline.run_for_date(run_date()).await.unwrap();
    assert_eq!(summary.changed, 3);
    assert_eq!(summary.persist, PersistOutcome::Written { rows: 4 });
    assert!(store
        .history()
        .await
        .iter()
        .any(|row| row.trail_id == "t-cacciatori"));
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let store = seeded_store();
    let pipeline = pipeline(
        config(&[("DRY_RUN", "1")]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(Arc::clone(&store)),
    );

    let summary = pipeline.run_for_date(run_date()).await.unwrap();
    assert_eq!(summary.changed, 3);
    assert_eq!(summary.persist, PersistOutcome::DryRun { would_write: 3 });
    assert!(summary.render_text().contains("DRY RUN MODE"));
    assert_eq!(store.write_calls(), 0);
    assert!(store.history().await.is_empty());
}

#[tokio::test]
async fn unrecognised_markup_aborts_before_any_write() {
    let store = seeded_store();
    let pipeline = pipeline(
        config(&[]),
        Box::new(StaticFetcher("<html><body><p>Maintenance</p></body></html>")),
        Box::new(Arc::clone(&store)),
    );

    let err = pipeline.run_for_date(run_date()).await.unwrap_err();
    assert!(matches!(err, RunError::Extraction(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn missing_listing_is_a_fetch_failure() {
    let store = seeded_store();
    let pipeline = pipeline(
        config(&[]),
        Box::new(FileFetcher::new("/nonexistent/listing.html")),
        Box::new(Arc::clone(&store)),
    );

    let err = pipeline.run_for_date(run_date()).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn store_failures_map_to_their_exit_codes() {
    let read_fail = pipeline(
        config(&[]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(InMemoryTrailStore::new(vec![]).failing_reads()),
    );
    assert_eq!(read_fail.run_for_date(run_date()).await.unwrap_err().exit_code(), 4);

    let write_fail = pipeline(
        config(&[]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(
            InMemoryTrailStore::new(vec![trail("t-lupo", "Lupo", None, Some(TrailStatus::Closed))])
                .failing_writes(),
        ),
    );
    assert_eq!(write_fail.run_for_date(run_date()).await.unwrap_err().exit_code(), 5);
}

#[tokio::test]
async fn unmatched_only_run_succeeds_with_no_writes() {
    let store = Arc::new(InMemoryTrailStore::new(vec![trail(
        "t-x",
        "Bric Reseghe",
        None,
        Some(TrailStatus::Open),
    )]));
    let pipeline = pipeline(
        config(&[]),
        Box::new(FileFetcher::new(listing_path())),
        Box::new(Arc::clone(&store)),
    );

    let summary = pipeline.run_for_date(run_date()).await.unwrap();
    assert_eq!(summary.matched, 0);
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.persist, PersistOutcome::Written { rows: 0 });
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn unreachable_listing_host_is_a_fetch_failure() {
    // bind then drop to get a local port nothing listens on
    let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let store = seeded_store();
    let url = format!("http://{addr}/list");
    let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let pipeline = pipeline(
        config(&[("FINALE_STATUS_URL", url.as_str())]),
        Box::new(fetcher),
        Box::new(Arc::clone(&store)),
    );

    let err = pipeline.run_for_date(run_date()).await.unwrap_err();
    assert!(matches!(err, RunError::Fetch(FetchError::Request(_))), "got {err:?}");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(store.write_calls(), 0);
}

#[test]
fn built_pipeline_defaults_to_the_source_listing() {
    let dir = tempfile::tempdir().unwrap();
    let trails_file = dir.path().join("trails.json");
    std::fs::write(
        &trails_file,
        r#"[{"id": "t-lupo", "name": "Lupo", "full_name": null, "current_status": "Closed"}]"#,
    )
    .unwrap();
    let options = RunOptions {
        html_file: None,
        trails_file: Some(trails_file),
    };

    let pipeline = build_pipeline(config(&[]), &options).unwrap();
    assert_eq!(pipeline.status_url(), FINALEOUTDOOR_LISTING_URL);

    let pipeline = build_pipeline(config(&[("FINALE_STATUS_URL", "http://mirror.local/list")]), &options).unwrap();
    assert_eq!(pipeline.status_url(), "http://mirror.local/list");

    let err = build_pipeline(config(&[("FINALE_SOURCE", "trailforks")]), &options).err().unwrap();
    assert!(err.to_string().contains("unknown status source"));
}

#[tokio::test]
async fn selector_overrides_reach_the_extractor() {
    let dir = tempfile::tempdir().unwrap();
    let listing = dir.path().join("listing.html");
    std::fs::write(
        &listing,
        r#"<li><span class="state">Open</span><span class="name">12 / Lupo</span></li>"#,
    )
    .unwrap();
    let trails_file = dir.path().join("trails.json");
    std::fs::write(
        &trails_file,
        r#"[{"id": "t-lupo", "name": "Lupo", "full_name": null, "current_status": "Closed"}]"#,
    )
    .unwrap();
    let options = RunOptions {
        html_file: Some(listing),
        trails_file: Some(trails_file),
    };

    let default_selectors = build_pipeline(config(&[]), &options).unwrap();
    let err = default_selectors.run_for_date(run_date()).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);

    let overridden = build_pipeline(
        config(&[
            ("FINALE_STATUS_SELECTOR", "span.state"),
            ("FINALE_TITLE_SELECTOR", "span.name"),
        ]),
        &options,
    )
    .unwrap();
    let summary = overridden.run_for_date(run_date()).await.unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(summary.persist, PersistOutcome::Written { rows: 1 });
}
