//! Trail status sync: match scraped statuses to canonical trails, reconcile,
//! persist status history and report.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use finale_adapters::{adapter_for_source, BlockSelectors, ExtractionError, StatusAdapter, FINALEOUTDOOR_SOURCE_ID};
use finale_core::{CanonicalTrail, ScrapedStatusEntry, StatusChange, StatusUpdateRecord, TrailStatus};
use finale_storage::{FeedArchive, FetchError, StatusFetcher};
use regex::Regex;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finale-sync";

/// Scraped names this close to an unmatched trail are reported as hints.
pub const NEAR_MISS_THRESHOLD: f64 = 0.85;

/// Unmatched names listed in the text report.
pub const UNMATCHED_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SameDayPolicy {
    /// A re-run on the same day overwrites status and note.
    KeepLast,
    /// The first row written for a day is kept.
    KeepFirst,
}

impl FromStr for SameDayPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "keep_last" => Ok(Self::KeepLast),
            "first" | "keep_first" => Ok(Self::KeepFirst),
            other => bail!("unknown same-day policy `{other}` (expected `last` or `first`)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteScope {
    /// Only trails whose status changed.
    Changed,
    /// Every matched trail, refreshing the status date of unchanged ones too.
    AllMatched,
}

impl FromStr for WriteScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "changed" => Ok(Self::Changed),
            "all" | "all_matched" => Ok(Self::AllMatched),
            other => bail!("unknown write scope `{other}` (expected `changed` or `all`)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    /// Registry id of the status source.
    pub source_id: String,
    /// Overrides the source's own listing URL.
    pub status_url: Option<String>,
    pub selectors: BlockSelectors,
    pub dry_run: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub artifacts_dir: Option<PathBuf>,
    pub same_day_policy: SameDayPolicy,
    pub write_scope: WriteScope,
    pub schedule_cron: String,
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            source_id: non_empty("FINALE_SOURCE")
                .unwrap_or_else(|| FINALEOUTDOOR_SOURCE_ID.to_string()),
            status_url: non_empty("FINALE_STATUS_URL"),
            selectors: {
                let defaults = BlockSelectors::default();
                BlockSelectors {
                    status_block: non_empty("FINALE_STATUS_SELECTOR").unwrap_or(defaults.status_block),
                    title_block: non_empty("FINALE_TITLE_SELECTOR").unwrap_or(defaults.title_block),
                }
            },
            dry_run: non_empty("DRY_RUN").map(|v| truthy(&v)).unwrap_or(false),
            user_agent: non_empty("FINALE_USER_AGENT")
                .unwrap_or_else(|| "finale-trail-status/0.1".to_string()),
            http_timeout_secs: match non_empty("FINALE_HTTP_TIMEOUT_SECS") {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing FINALE_HTTP_TIMEOUT_SECS={v}"))?,
                None => 20,
            },
            artifacts_dir: non_empty("FINALE_ARTIFACTS_DIR").map(PathBuf::from),
            same_day_policy: non_empty("FINALE_SAME_DAY_POLICY")
                .map(|v| v.parse::<SameDayPolicy>())
                .transpose()?
                .unwrap_or(SameDayPolicy::KeepLast),
            write_scope: non_empty("FINALE_WRITE_SCOPE")
                .map(|v| v.parse::<WriteScope>())
                .transpose()?
                .unwrap_or(WriteScope::Changed),
            schedule_cron: non_empty("FINALE_SCHEDULE_CRON")
                .unwrap_or_else(|| "0 0 6,18 * * *".to_string()),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// `DATABASE_URL` with everything before the host replaced.
    pub fn redacted_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url
                .rsplit_once('@')
                .map(|(_, host)| format!("postgres://***@{host}"))
                .unwrap_or_else(|| "<set>".to_string()),
            None => "<not set>".to_string(),
        }
    }

    fn log_redacted(&self, status_url: &str) {
        info!(
            source = %self.source_id,
            %status_url,
            store = %self.redacted_database_url(),
            dry_run = self.dry_run,
            same_day_policy = ?self.same_day_policy,
            write_scope = ?self.write_scope,
            "sync config loaded"
        );
    }
}

static NUMBER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+\s*/\s*(.+)$").expect("number prefix pattern is valid")
});

/// `"12 / Lupo"` becomes `"Lupo"`; names without a `<digits> /` prefix are
/// returned unchanged.
pub fn strip_number_prefix(name: &str) -> &str {
    match NUMBER_PREFIX.captures(name).and_then(|c| c.get(1)) {
        Some(rest) => rest.as_str().trim(),
        None => name,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactName,
    ExactFullName,
    StrippedName,
    StrippedFullName,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExactName => "exact name",
            Self::ExactFullName => "exact full name",
            Self::StrippedName => "stripped name",
            Self::StrippedFullName => "stripped full name",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub status: TrailStatus,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMiss {
    pub trail_name: String,
    pub candidate: String,
    pub score: f64,
}

/// Scraped statuses indexed by display name and by number-stripped name.
/// Later entries overwrite earlier ones with the same key.
#[derive(Debug, Clone, Default)]
pub struct StatusLookup {
    exact: BTreeMap<String, TrailStatus>,
    stripped: BTreeMap<String, TrailStatus>,
}

impl StatusLookup {
    pub fn build(entries: &[ScrapedStatusEntry]) -> Self {
        let mut lookup = Self::default();
        for entry in entries {
            if let Some(previous) = lookup.exact.insert(entry.name.clone(), entry.status) {
                if previous != entry.status {
                    warn!(
                        name = %entry.name,
                        %previous,
                        kept = %entry.status,
                        "duplicate scraped trail name with conflicting status; last one wins"
                    );
                }
            }
            lookup
                .stripped
                .insert(strip_number_prefix(&entry.name).to_string(), entry.status);
        }
        lookup
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn exact(&self, name: &str) -> Option<TrailStatus> {
        self.exact.get(name).copied()
    }

    pub fn stripped(&self, name: &str) -> Option<TrailStatus> {
        self.stripped.get(name).copied()
    }

    /// Ordered fallbacks: exact name, exact full name, stripped name, stripped
    /// full name. The first hit wins.
    pub fn resolve(&self, trail: &CanonicalTrail) -> Option<Resolution> {
        let name = trail.name_key();
        let full_name = trail.full_name();
        let hit = |status: Option<TrailStatus>, strategy| {
            status.map(|status| Resolution { status, strategy })
        };

        hit(self.exact(name), MatchStrategy::ExactName)
            .or_else(|| hit(full_name.and_then(|n| self.exact(n)), MatchStrategy::ExactFullName))
            .or_else(|| hit(self.stripped(name), MatchStrategy::StrippedName))
            .or_else(|| {
                hit(
                    full_name.and_then(|n| self.stripped(n)),
                    MatchStrategy::StrippedFullName,
                )
            })
    }

    /// Closest scraped name for a trail that did not resolve. Report-only.
    pub fn near_miss(&self, trail: &CanonicalTrail) -> Option<NearMiss> {
        let keys = [Some(trail.name_key()), trail.full_name()];
        let mut best: Option<(f64, &str)> = None;

        for key in keys.into_iter().flatten() {
            let key = strip_number_prefix(key).to_lowercase();
            for scraped in self.exact.keys() {
                let score = jaro_winkler(&key, &strip_number_prefix(scraped).to_lowercase());
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, scraped.as_str()));
                }
            }
        }

        best.filter(|(score, _)| *score >= NEAR_MISS_THRESHOLD)
            .map(|(score, candidate)| NearMiss {
                trail_name: trail.name.clone(),
                candidate: candidate.to_string(),
                score,
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// One record per trail whose resolved status differs from the stored one.
    pub updates: Vec<StatusUpdateRecord>,
    pub unchanged: Vec<String>,
    pub unmatched: Vec<String>,
    pub changes: Vec<StatusChange>,
    /// Records re-asserting the status of unchanged trails.
    pub confirmations: Vec<StatusUpdateRecord>,
}

impl Reconciliation {
    pub fn matched(&self) -> usize {
        self.updates.len() + self.unchanged.len()
    }

    pub fn total(&self) -> usize {
        self.matched() + self.unmatched.len()
    }

    pub fn write_batch(&self, scope: WriteScope) -> Vec<StatusUpdateRecord> {
        match scope {
            WriteScope::Changed => self.updates.clone(),
            WriteScope::AllMatched => self
                .updates
                .iter()
                .chain(&self.confirmations)
                .cloned()
                .collect(),
        }
    }
}

pub struct ReconciliationEngine {
    run_date: NaiveDate,
    note: String,
}

impl ReconciliationEngine {
    pub fn new(run_date: NaiveDate, note: impl Into<String>) -> Self {
        Self {
            run_date,
            note: note.into(),
        }
    }

    fn record(&self, trail: &CanonicalTrail, status: TrailStatus) -> StatusUpdateRecord {
        StatusUpdateRecord {
            trail_id: trail.id.clone(),
            new_status: status,
            as_of_date: self.run_date,
            note: self.note.clone(),
        }
    }

    pub fn reconcile(&self, trails: &[CanonicalTrail], lookup: &StatusLookup) -> Reconciliation {
        let mut out = Reconciliation::default();

        for trail in trails {
            let Some(resolution) = lookup.resolve(trail) else {
                out.unmatched.push(trail.name.clone());
                continue;
            };
            debug!(trail = %trail.name, strategy = %resolution.strategy, status = %resolution.status, "resolved");

            if trail.current_status == Some(resolution.status) {
                out.unchanged.push(trail.name.clone());
                out.confirmations.push(self.record(trail, resolution.status));
            } else {
                out.updates.push(self.record(trail, resolution.status));
                out.changes.push(StatusChange {
                    trail_name: trail.name.clone(),
                    previous_status: trail.current_status,
                    new_status: resolution.status,
                });
            }
        }

        out
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trail store read failed: {0:#}")]
    Read(anyhow::Error),
    #[error("trail store write failed: {0:#}")]
    Write(anyhow::Error),
}

/// The system of record for trails and their status history.
#[async_trait]
pub trait TrailStore: Send + Sync {
    async fn load_trails(&self) -> Result<Vec<CanonicalTrail>, StoreError>;

    /// Upsert the batch keyed by `(trail_id, as_of_date)` as one atomic write.
    /// Returns the number of rows inserted or updated.
    async fn upsert_statuses(
        &self,
        records: &[StatusUpdateRecord],
        policy: SameDayPolicy,
    ) -> Result<usize, StoreError>;
}

#[async_trait]
impl<T: TrailStore + ?Sized> TrailStore for Arc<T> {
    async fn load_trails(&self) -> Result<Vec<CanonicalTrail>, StoreError> {
        (**self).load_trails().await
    }

    async fn upsert_statuses(
        &self,
        records: &[StatusUpdateRecord],
        policy: SameDayPolicy,
    ) -> Result<usize, StoreError> {
        (**self).upsert_statuses(records, policy).await
    }
}

const LOAD_TRAILS_SQL: &str = r#"
    SELECT id::text AS id,
           name,
           full_name,
           current_status::text AS current_status
      FROM trails_with_status
"#;

const UPSERT_KEEP_LAST_SQL: &str = r#"
    INSERT INTO trail_status (trail_id, status, status_date, notes)
    SELECT u.trail_id::uuid, u.status, u.status_date, u.notes
      FROM UNNEST($1::text[], $2::text[], $3::date[], $4::text[])
           AS u(trail_id, status, status_date, notes)
    ON CONFLICT (trail_id, status_date) DO UPDATE
       SET status = EXCLUDED.status,
           notes = EXCLUDED.notes
"#;

const UPSERT_KEEP_FIRST_SQL: &str = r#"
    INSERT INTO trail_status (trail_id, status, status_date, notes)
    SELECT u.trail_id::uuid, u.status, u.status_date, u.notes
      FROM UNNEST($1::text[], $2::text[], $3::date[], $4::text[])
           AS u(trail_id, status, status_date, notes)
    ON CONFLICT (trail_id, status_date) DO NOTHING
"#;

/// Trail store backed by the web app's Postgres database.
#[derive(Debug, Clone)]
pub struct PgTrailStore {
    pool: PgPool,
}

impl PgTrailStore {
    /// Connections are opened on first use, so an unreachable database
    /// surfaces as a read failure of the run.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self { pool })
    }

}

#[async_trait]
impl TrailStore for PgTrailStore {
    async fn load_trails(&self) -> Result<Vec<CanonicalTrail>, StoreError> {
        let rows = sqlx::query(LOAD_TRAILS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Read(anyhow::Error::new(e).context("querying trails_with_status")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |e: sqlx::Error| StoreError::Read(anyhow::Error::new(e).context("decoding trail row"));
            let name: String = row.try_get("name").map_err(decode)?;
            let current_status = row
                .try_get::<Option<String>, _>("current_status")
                .map_err(decode)?
                .and_then(|raw| match raw.parse::<TrailStatus>() {
                    Ok(status) => Some(status),
                    Err(err) => {
                        warn!(trail = %name, %err, "ignoring unrecognised current status");
                        None
                    }
                });
            out.push(CanonicalTrail {
                id: row.try_get("id").map_err(decode)?,
                full_name: row.try_get("full_name").map_err(decode)?,
                name,
                current_status,
            });
        }
        Ok(out)
    }

    async fn upsert_statuses(
        &self,
        records: &[StatusUpdateRecord],
        policy: SameDayPolicy,
    ) -> Result<usize, StoreError> {
        let trail_ids: Vec<String> = records.iter().map(|r| r.trail_id.clone()).collect();
        let statuses: Vec<String> = records.iter().map(|r| r.new_status.to_string()).collect();
        let dates: Vec<NaiveDate> = records.iter().map(|r| r.as_of_date).collect();
        let notes: Vec<String> = records.iter().map(|r| r.note.clone()).collect();

        let sql = match policy {
            SameDayPolicy::KeepLast => UPSERT_KEEP_LAST_SQL,
            SameDayPolicy::KeepFirst => UPSERT_KEEP_FIRST_SQL,
        };

        let result = sqlx::query(sql)
            .bind(trail_ids)
            .bind(statuses)
            .bind(dates)
            .bind(notes)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Write(anyhow::Error::new(e).context("upserting trail_status rows")))?;
        Ok(result.rows_affected() as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    pub trail_id: String,
    pub status_date: NaiveDate,
    pub status: TrailStatus,
    pub notes: String,
}

#[derive(Debug, Clone)]
struct SeedTrail {
    id: String,
    name: String,
    full_name: Option<String>,
    initial_status: Option<TrailStatus>,
}

/// Process-local trail store. Current status is derived from the newest
/// history row, falling back to the status the trail was seeded with.
#[derive(Debug)]
pub struct InMemoryTrailStore {
    trails: Vec<SeedTrail>,
    history: Mutex<BTreeMap<(String, NaiveDate), HistoryRow>>,
    fail_reads: bool,
    fail_writes: bool,
    write_calls: AtomicUsize,
}

impl InMemoryTrailStore {
    pub fn new(trails: Vec<CanonicalTrail>) -> Self {
        Self {
            trails: trails
                .into_iter()
                .map(|t| SeedTrail {
                    id: t.id,
                    name: t.name,
                    full_name: t.full_name,
                    initial_status: t.current_status,
                })
                .collect(),
            history: Mutex::new(BTreeMap::new()),
            fail_reads: false,
            fail_writes: false,
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Canonical trails from a JSON array, for offline runs.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let trails: Vec<CanonicalTrail> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(trails))
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub async fn history(&self) -> Vec<HistoryRow> {
        self.history.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl TrailStore for InMemoryTrailStore {
    async fn load_trails(&self) -> Result<Vec<CanonicalTrail>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::Read(anyhow!("in-memory store configured to fail reads")));
        }
        let history = self.history.lock().await;
        Ok(self
            .trails
            .iter()
            .map(|t| {
                let latest = history
                    .values()
                    .filter(|row| row.trail_id == t.id)
                    .max_by_key(|row| row.status_date)
                    .map(|row| row.status);
                CanonicalTrail {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    full_name: t.full_name.clone(),
                    current_status: latest.or(t.initial_status),
                }
            })
            .collect())
    }

    async fn upsert_statuses(
        &self,
        records: &[StatusUpdateRecord],
        policy: SameDayPolicy,
    ) -> Result<usize, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(StoreError::Write(anyhow!("in-memory store configured to fail writes")));
        }
        if let Some(unknown) = records
            .iter()
            .find(|r| !self.trails.iter().any(|t| t.id == r.trail_id))
        {
            return Err(StoreError::Write(anyhow!(
                "foreign key violation: unknown trail id {}",
                unknown.trail_id
            )));
        }

        let mut history = self.history.lock().await;
        let mut written = 0;
        for record in records {
            let row = HistoryRow {
                trail_id: record.trail_id.clone(),
                status_date: record.as_of_date,
                status: record.new_status,
                notes: record.note.clone(),
            };
            match (history.entry((record.trail_id.clone(), record.as_of_date)), policy) {
                (Entry::Occupied(mut slot), SameDayPolicy::KeepLast) => {
                    slot.insert(row);
                    written += 1;
                }
                (Entry::Occupied(_), SameDayPolicy::KeepFirst) => {}
                (Entry::Vacant(slot), _) => {
                    slot.insert(row);
                    written += 1;
                }
            }
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PersistOutcome {
    Written { rows: usize },
    DryRun { would_write: usize },
}

pub struct Persister<'a> {
    store: &'a dyn TrailStore,
    dry_run: bool,
    policy: SameDayPolicy,
}

impl<'a> Persister<'a> {
    pub fn new(store: &'a dyn TrailStore, dry_run: bool, policy: SameDayPolicy) -> Self {
        Self {
            store,
            dry_run,
            policy,
        }
    }

    /// One batch per run; a store failure leaves nothing guaranteed written.
    pub async fn persist(&self, records: &[StatusUpdateRecord]) -> Result<PersistOutcome, StoreError> {
        let batch = dedup_by_day_key(records);
        if self.dry_run {
            info!(rows = batch.len(), "dry run; skipping trail store write");
            return Ok(PersistOutcome::DryRun {
                would_write: batch.len(),
            });
        }
        if batch.is_empty() {
            return Ok(PersistOutcome::Written { rows: 0 });
        }
        let rows = self.store.upsert_statuses(&batch, self.policy).await?;
        info!(rows, batch = batch.len(), "trail status rows upserted");
        Ok(PersistOutcome::Written { rows })
    }
}

/// Postgres rejects an upsert batch touching the same key twice.
fn dedup_by_day_key(records: &[StatusUpdateRecord]) -> Vec<StatusUpdateRecord> {
    let mut seen: BTreeMap<(&str, NaiveDate), usize> = BTreeMap::new();
    let mut out: Vec<StatusUpdateRecord> = Vec::with_capacity(records.len());
    for record in records {
        match seen.entry((record.trail_id.as_str(), record.as_of_date)) {
            Entry::Occupied(slot) => out[*slot.get()] = record.clone(),
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub source_url: String,
    pub matched: usize,
    pub changed: usize,
    pub unmatched: usize,
    pub total: usize,
    pub duration_seconds: f64,
    pub unmatched_names: Vec<String>,
    pub changes: Vec<StatusChange>,
    pub near_misses: Vec<NearMiss>,
    pub persist: PersistOutcome,
}

pub struct RunData<'a> {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub source_url: &'a str,
    pub reconciliation: &'a Reconciliation,
    pub near_misses: Vec<NearMiss>,
    pub persist: PersistOutcome,
    pub started: Instant,
}

pub fn summarize(data: RunData<'_>) -> RunSummary {
    let rec = data.reconciliation;
    RunSummary {
        run_id: data.run_id,
        run_date: data.run_date,
        source_url: data.source_url.to_string(),
        matched: rec.matched(),
        changed: rec.updates.len(),
        unmatched: rec.unmatched.len(),
        total: rec.total(),
        duration_seconds: data.started.elapsed().as_secs_f64(),
        unmatched_names: rec.unmatched.clone(),
        changes: rec.changes.clone(),
        near_misses: data.near_misses,
        persist: data.persist,
    }
}

impl RunSummary {
    pub fn is_dry_run(&self) -> bool {
        matches!(self.persist, PersistOutcome::DryRun { .. })
    }

    pub fn render_text(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![
            rule.clone(),
            format!("Trail Status Update - {} (run {})", self.run_date, self.run_id),
            rule.clone(),
        ];
        if self.is_dry_run() {
            lines.push("DRY RUN MODE - no changes were written to the trail store".to_string());
        }

        lines.push(String::new());
        lines.push("Status Changes:".to_string());
        if self.changes.is_empty() {
            lines.push("   No status changes detected.".to_string());
        }
        for change in &self.changes {
            let marker = match change.new_status {
                TrailStatus::Open => "[OPEN]",
                TrailStatus::Closed => "[CLOSED]",
            };
            let previous = change
                .previous_status
                .map(TrailStatus::as_str)
                .unwrap_or("unknown");
            lines.push(format!(
                "   {marker} {}: {previous} -> {}",
                change.trail_name, change.new_status
            ));
        }

        let persisted = match self.persist {
            PersistOutcome::Written { rows } => format!("   Rows written:           {rows}"),
            PersistOutcome::DryRun { would_write } => {
                format!("   Rows to write (dry):    {would_write}")
            }
        };
        lines.push(String::new());
        lines.push(rule.clone());
        lines.push("Summary:".to_string());
        lines.push(format!("   Total trails in store:  {}", self.total));
        lines.push(format!("   Matched:                {}", self.matched));
        lines.push(format!("   Status changes:         {}", self.changed));
        lines.push(format!("   Not found in scrape:    {}", self.unmatched));
        lines.push(persisted);
        lines.push(format!("   Duration:               {:.2}s", self.duration_seconds));
        lines.push(rule);

        if !self.unmatched_names.is_empty() {
            lines.push(String::new());
            if self.unmatched_names.len() > UNMATCHED_SAMPLE {
                lines.push(format!(
                    "First {UNMATCHED_SAMPLE} trails without status match ({} total):",
                    self.unmatched_names.len()
                ));
            } else {
                lines.push("Trails without status match:".to_string());
            }
            for name in self.unmatched_names.iter().take(UNMATCHED_SAMPLE) {
                match self.near_misses.iter().find(|m| &m.trail_name == name) {
                    Some(hint) => lines.push(format!(
                        "   - {name} (closest scraped: \"{}\", {:.2})",
                        hint.candidate, hint.score
                    )),
                    None => lines.push(format!("   - {name}")),
                }
            }
        }

        lines.join("\n")
    }
}

/// Failures that abort a run. Unmatched trails are never one of these.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetching status listing: {0}")]
    Fetch(#[from] FetchError),
    #[error("extracting statuses: {0}")]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunError {
    /// Process exit code, distinct per failure class for scheduler alerting.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Fetch(_) => 2,
            Self::Extraction(_) => 3,
            Self::Store(StoreError::Read(_)) => 4,
            Self::Store(StoreError::Write(_)) => 5,
        }
    }
}

pub struct StatusSyncPipeline {
    config: SyncConfig,
    adapter: Box<dyn StatusAdapter>,
    fetcher: Box<dyn StatusFetcher>,
    store: Box<dyn TrailStore>,
    archive: Option<FeedArchive>,
}

impl StatusSyncPipeline {
    pub fn new(
        config: SyncConfig,
        adapter: Box<dyn StatusAdapter>,
        fetcher: Box<dyn StatusFetcher>,
        store: Box<dyn TrailStore>,
    ) -> Self {
        let archive = config.artifacts_dir.clone().map(FeedArchive::new);
        Self {
            config,
            adapter,
            fetcher,
            store,
            archive,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Configured override, else the adapter's own listing.
    pub fn status_url(&self) -> &str {
        self.config
            .status_url
            .as_deref()
            .unwrap_or_else(|| self.adapter.listing_url())
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    /// Fetch, extract, match, reconcile, persist and summarise, in that order.
    pub async fn run_for_date(&self, run_date: NaiveDate) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("status_sync", %run_id, %run_date, source = self.adapter.source_id());
        self.run_stages(run_id, run_date).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid, run_date: NaiveDate) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let url = self.status_url();

        info!(%url, "fetching trail status listing");
        let document = self.fetcher.fetch_document(url).await?;
        let archived = self.archive_document(&document).await;

        let entries = match self.adapter.extract(&document.body) {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    %err,
                    archived = archived.as_deref().unwrap_or("<not archived>"),
                    sample = err.sample().unwrap_or_default(),
                    "listing markup did not yield any trail status"
                );
                return Err(err.into());
            }
        };
        let lookup = StatusLookup::build(&entries);
        info!(entries = entries.len(), distinct = lookup.len(), "parsed trail statuses");

        let trails = self.store.load_trails().await?;
        info!(trails = trails.len(), "loaded canonical trails");

        let engine = ReconciliationEngine::new(run_date, self.adapter.provenance_note());
        let reconciliation = engine.reconcile(&trails, &lookup);
        for change in &reconciliation.changes {
            info!(
                trail = %change.trail_name,
                previous = change.previous_status.map(TrailStatus::as_str).unwrap_or("unknown"),
                new = %change.new_status,
                "status change"
            );
        }
        let near_misses = trails
            .iter()
            .filter(|t| lookup.resolve(t).is_none())
            .filter_map(|t| lookup.near_miss(t))
            .collect::<Vec<_>>();

        let batch = reconciliation.write_batch(self.config.write_scope);
        let persister = Persister::new(self.store.as_ref(), self.config.dry_run, self.config.same_day_policy);
        let persist = persister.persist(&batch).await?;

        let summary = summarize(RunData {
            run_id,
            run_date,
            source_url: &document.url,
            reconciliation: &reconciliation,
            near_misses,
            persist,
            started,
        });
        info!(
            matched = summary.matched,
            changed = summary.changed,
            unmatched = summary.unmatched,
            total = summary.total,
            duration_seconds = summary.duration_seconds,
            "status sync complete"
        );
        Ok(summary)
    }

    async fn archive_document(&self, document: &finale_storage::FetchedDocument) -> Option<String> {
        let archive = self.archive.as_ref()?;
        match archive
            .archive_listing(document.fetched_at, self.adapter.source_id(), &document.body)
            .await
        {
            Ok(stored) => {
                debug!(path = %stored.path.display(), deduplicated = stored.deduplicated, "archived listing");
                Some(stored.path.display().to_string())
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not archive listing");
                None
            }
        }
    }
}

/// Where the pipeline reads its listing and trails from, besides the defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub html_file: Option<PathBuf>,
    pub trails_file: Option<PathBuf>,
}

pub fn build_pipeline(config: SyncConfig, options: &RunOptions) -> Result<StatusSyncPipeline> {
    let adapter = adapter_for_source(&config.source_id, &config.selectors)
        .context("building status extractor")?
        .with_context(|| format!("unknown status source `{}`", config.source_id))?;
    config.log_redacted(config.status_url.as_deref().unwrap_or(adapter.listing_url()));

    let fetcher: Box<dyn StatusFetcher> = match &options.html_file {
        Some(path) => Box::new(finale_storage::FileFetcher::new(path)),
        None => Box::new(finale_storage::HttpFetcher::new(finale_storage::HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?),
    };

    let store: Box<dyn TrailStore> = match (&options.trails_file, &config.database_url) {
        (Some(path), _) => Box::new(InMemoryTrailStore::from_json_file(path)?),
        (None, Some(url)) => Box::new(PgTrailStore::connect_lazy(url)?),
        (None, None) => bail!("DATABASE_URL is not set (or pass a trails file for offline runs)"),
    };

    Ok(StatusSyncPipeline::new(config, adapter, fetcher, store))
}

/// Cron-driven runs. Every tick is an independent run; failures are logged and
/// left for the next tick.
pub async fn build_scheduler(pipeline: Arc<StatusSyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().schedule_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    changed = summary.changed,
                    unmatched = summary.unmatched,
                    "scheduled status sync finished"
                ),
                Err(err) => error!(%err, exit_code = err.exit_code(), "scheduled status sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = PgPool::connect(database_url)
        .await
        .context("connecting to trail store")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    Ok(())
}
