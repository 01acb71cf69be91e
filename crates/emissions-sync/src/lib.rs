//! Incremental ingestion: plan the report window, detect missing partitions,
//! then fetch, normalize and append each one.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use emissions_adapters::{
    normalize_records, CarbonReportAdapter, ClientCredentials, ClientCredentialsProvider,
    CredentialProvider, FetchOutcome, ReportContext, ReportSource, DEFAULT_AUTHORITY_URL,
    DEFAULT_CATEGORY_TYPE, DEFAULT_REPORT_API_URL,
};
use emissions_core::{all_partitions, format_month, report_window, EmissionScope, PartitionKey};
use emissions_storage::{HttpClientConfig, HttpFetcher, ItemDetailsTable, RawResponseArchive, TableError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emissions-sync";

pub const LAKEHOUSE_DIR_ENV: &str = "EMISSIONS_LAKEHOUSE_DIR";
pub const REPORTS_DIR_ENV: &str = "EMISSIONS_REPORTS_DIR";
pub const DEFAULT_LAKEHOUSE_DIR: &str = "./lakehouse";
pub const DEFAULT_REPORTS_DIR: &str = "./reports";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: ClientCredentials,
    pub subscription_id: String,
    pub authority_url: String,
    pub api_url: String,
    pub category_type: String,
    pub scopes: Vec<EmissionScope>,
    pub lakehouse_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub raw_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("environment variable {name} must be set"))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            credentials: ClientCredentials {
                tenant_id: required_env("EMISSIONS_TENANT_ID")?,
                client_id: required_env("EMISSIONS_CLIENT_ID")?,
                client_secret: required_env("EMISSIONS_CLIENT_SECRET")?,
            },
            subscription_id: required_env("EMISSIONS_SUBSCRIPTION_ID")?,
            authority_url: env_or("EMISSIONS_AUTHORITY_URL", DEFAULT_AUTHORITY_URL),
            api_url: env_or("EMISSIONS_API_URL", DEFAULT_REPORT_API_URL),
            category_type: env_or("EMISSIONS_CATEGORY_TYPE", DEFAULT_CATEGORY_TYPE),
            scopes: EmissionScope::ALL.to_vec(),
            lakehouse_dir: PathBuf::from(env_or(LAKEHOUSE_DIR_ENV, DEFAULT_LAKEHOUSE_DIR)),
            reports_dir: PathBuf::from(env_or(REPORTS_DIR_ENV, DEFAULT_REPORTS_DIR)),
            raw_dir: std::env::var("EMISSIONS_RAW_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            http_timeout_secs: std::env::var("EMISSIONS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            user_agent: env_or("EMISSIONS_USER_AGENT", "emissions-ingest/0.1"),
            scheduler_enabled: std::env::var("EMISSIONS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_or("EMISSIONS_SYNC_CRON", "0 0 6 * * *"),
        })
    }
}

/// Which stage of a partition cycle gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Normalize,
    Append,
}

/// Terminal state of one partition in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PartitionOutcome {
    Appended { rows: usize, file: String, sha256: String },
    Empty,
    HttpError { status: u16, body: String },
    Failed { stage: FailureStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition: PartitionKey,
    #[serde(flatten)]
    pub outcome: PartitionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPlan {
    pub months: Vec<NaiveDate>,
    pub targets: Vec<PartitionKey>,
    pub existing: BTreeSet<(NaiveDate, String)>,
    pub gaps: Vec<PartitionKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_months: usize,
    pub planned_partitions: usize,
    pub gap_partitions: usize,
    pub appended: usize,
    pub empty: usize,
    pub http_errors: usize,
    pub failed: usize,
    pub rows_appended: usize,
    pub partitions: Vec<PartitionReport>,
    #[serde(default)]
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    fn from_reports(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        plan: &SyncPlan,
        partitions: Vec<PartitionReport>,
    ) -> Self {
        let count = |pred: fn(&PartitionOutcome) -> bool| {
            partitions.iter().filter(|r| pred(&r.outcome)).count()
        };
        let rows_appended = partitions
            .iter()
            .map(|r| match r.outcome {
                PartitionOutcome::Appended { rows, .. } => rows,
                _ => 0,
            })
            .sum();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window_months: plan.months.len(),
            planned_partitions: plan.targets.len(),
            gap_partitions: plan.gaps.len(),
            appended: count(|o| matches!(o, PartitionOutcome::Appended { .. })),
            empty: count(|o| matches!(o, PartitionOutcome::Empty)),
            http_errors: count(|o| matches!(o, PartitionOutcome::HttpError { .. })),
            failed: count(|o| matches!(o, PartitionOutcome::Failed { .. })),
            rows_appended,
            partitions,
            reports_dir: None,
        }
    }
}

/// Distinct `(month, scope)` pairs already stored. A missing table is a first
/// run and yields an empty set; every other failure is returned, since treating
/// it as "nothing stored" would re-append existing partitions.
pub fn existing_partitions(table: &ItemDetailsTable) -> Result<BTreeSet<(NaiveDate, String)>, TableError> {
    match table.distinct_partitions() {
        Ok(pairs) => Ok(pairs),
        Err(TableError::NotFound(path)) => {
            warn!(table = %path.display(), "destination table not found; it will be created on first append");
            Ok(BTreeSet::new())
        }
        Err(err) => Err(err),
    }
}

/// `targets − existing`, by exact (date, scope string) match, keeping target order.
pub fn compute_gaps(
    targets: &[PartitionKey],
    existing: &BTreeSet<(NaiveDate, String)>,
) -> Vec<PartitionKey> {
    targets
        .iter()
        .filter(|key| !existing.contains(&(key.month, key.scope.as_str().to_string())))
        .copied()
        .collect()
}

/// Fetch, normalize and append partitions one at a time.
pub struct IngestEngine {
    source: Arc<dyn ReportSource>,
    table: ItemDetailsTable,
}

impl IngestEngine {
    pub fn new(source: Arc<dyn ReportSource>, table: ItemDetailsTable) -> Self {
        Self { source, table }
    }

    /// One full cycle for `key`. Never panics and never returns an error:
    /// whatever happens is folded into the outcome, and nothing is written
    /// unless every record of the partition normalized.
    pub async fn ingest_partition(&self, ctx: &ReportContext, key: &PartitionKey) -> PartitionOutcome {
        info!(source = self.source.source_id(), "requesting item details report");

        let records = match self.source.fetch_partition(ctx, key).await {
            Ok(FetchOutcome::Records(records)) => records,
            Ok(FetchOutcome::Empty) => {
                warn!("no data for partition; it stays missing and is requested again next run");
                return PartitionOutcome::Empty;
            }
            Ok(FetchOutcome::HttpError { status, body }) => {
                error!(status, %body, "report API returned an error");
                return PartitionOutcome::HttpError { status, body };
            }
            Err(err) => {
                error!(error = %err, "report request failed");
                return PartitionOutcome::Failed {
                    stage: FailureStage::Fetch,
                    reason: err.to_string(),
                };
            }
        };

        let rows = match normalize_records(&records, key) {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, records = records.len(), "normalization failed; partition not written");
                return PartitionOutcome::Failed {
                    stage: FailureStage::Normalize,
                    reason: err.to_string(),
                };
            }
        };

        match self.table.append_partition(key, &rows) {
            Ok(appended) => PartitionOutcome::Appended {
                rows: appended.rows,
                file: appended.file.display().to_string(),
                sha256: appended.sha256,
            },
            Err(err) => {
                error!(error = %err, "append failed; partition stays missing");
                PartitionOutcome::Failed {
                    stage: FailureStage::Append,
                    reason: err.to_string(),
                }
            }
        }
    }

    pub async fn run(&self, run_id: Uuid, ctx: &ReportContext, gaps: &[PartitionKey]) -> Vec<PartitionReport> {
        let mut reports = Vec::with_capacity(gaps.len());
        for key in gaps {
            let span = info_span!("partition", %run_id, month = %format_month(key.month), scope = %key.scope);
            let outcome = self.ingest_partition(ctx, key).instrument(span).await;
            reports.push(PartitionReport {
                partition: *key,
                outcome,
            });
        }
        reports
    }
}

/// One configured ingestion pipeline.
///
/// Runs through the same pipeline are serialized. Separate processes writing
/// the same table are not coordinated and can double-append a partition if
/// both plan before either appends.
pub struct SyncPipeline {
    config: SyncConfig,
    table: ItemDetailsTable,
    engine: IngestEngine,
    credentials: Arc<dyn CredentialProvider>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let mut adapter = CarbonReportAdapter::new(http.clone(), config.api_url.clone());
        if let Some(raw_dir) = &config.raw_dir {
            adapter = adapter.with_archive(RawResponseArchive::new(raw_dir.clone()));
        }
        let credentials = ClientCredentialsProvider::new(
            http,
            config.authority_url.clone(),
            config.credentials.clone(),
        );
        Ok(Self::with_components(config, Arc::new(adapter), Arc::new(credentials)))
    }

    pub fn with_components(
        config: SyncConfig,
        source: Arc<dyn ReportSource>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let table = ItemDetailsTable::open(&config.lakehouse_dir);
        Self {
            engine: IngestEngine::new(source, table.clone()),
            table,
            config,
            credentials,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn table(&self) -> &ItemDetailsTable {
        &self.table
    }

    /// Window, targets and gaps for a run on `today`. Read-only.
    pub fn plan(&self, today: NaiveDate) -> Result<SyncPlan> {
        let months = report_window(today);
        let targets = all_partitions(&months, &self.config.scopes);
        let existing = existing_partitions(&self.table)
            .with_context(|| format!("reading existing partitions of {}", self.table.path().display()))?;
        let gaps = compute_gaps(&targets, &existing);
        Ok(SyncPlan {
            months,
            targets,
            existing,
            gaps,
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    pub async fn run_for_date(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let plan = self.plan(today)?;
        info!(
            %run_id,
            months = plan.months.len(),
            planned = plan.targets.len(),
            existing = plan.existing.len(),
            gaps = plan.gaps.len(),
            "sync plan ready"
        );

        let partitions = if plan.gaps.is_empty() {
            info!(%run_id, "every partition in the window is already ingested");
            Vec::new()
        } else {
            let bearer_token = self
                .credentials
                .bearer_token()
                .await
                .context("acquiring bearer token")?;
            let ctx = ReportContext {
                bearer_token,
                subscription_id: self.config.subscription_id.clone(),
                category_type: self.config.category_type.clone(),
            };
            self.engine.run(run_id, &ctx, &plan.gaps).await
        };

        let mut summary = SyncRunSummary::from_reports(run_id, started_at, &plan, partitions);
        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        info!(
            %run_id,
            appended = summary.appended,
            empty = summary.empty,
            http_errors = summary.http_errors,
            failed = summary.failed,
            rows = summary.rows_appended,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Cron-driven runs, when enabled. Each tick runs a full sync; overlapping
    /// ticks wait on the run lock.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, appended = summary.appended, "scheduled sync complete"),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "scheduled sync failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), bytes)
            .await
            .context("writing run_summary.json")?;

        let partition_lines = summary
            .partitions
            .iter()
            .map(|r| format!("- {}: {}", r.partition, describe_outcome(&r.outcome)))
            .collect::<Vec<_>>();
        let brief = format!(
            "# Emissions Ingest Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Window months: {}\n- Planned partitions: {}\n- Missing partitions: {}\n- Appended: {} ({} rows)\n- Empty: {}\n- HTTP errors: {}\n- Failed: {}\n\n## Partitions\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.window_months,
            summary.planned_partitions,
            summary.gap_partitions,
            summary.appended,
            summary.rows_appended,
            summary.empty,
            summary.http_errors,
            summary.failed,
            if partition_lines.is_empty() {
                "- none".to_string()
            } else {
                partition_lines.join("\n")
            }
        );
        fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        Ok(reports_dir)
    }
}

fn describe_outcome(outcome: &PartitionOutcome) -> String {
    match outcome {
        PartitionOutcome::Appended { rows, .. } => format!("appended {rows} rows"),
        PartitionOutcome::Empty => "no data".to_string(),
        PartitionOutcome::HttpError { status, .. } => format!("API error {status}"),
        PartitionOutcome::Failed { stage, reason } => format!("failed during {stage:?}: {reason}"),
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

/// Markdown digest of the most recent `runs` run summaries under `reports_dir`.
pub fn report_recent_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Emissions Ingest Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let summary: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- partitions: {} missing, {} appended, {} empty, {} http errors, {} failed",
            summary.gap_partitions, summary.appended, summary.empty, summary.http_errors, summary.failed
        ));
        lines.push(format!("- rows appended: {}", summary.rows_appended));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use emissions_adapters::{AdapterError, CredentialError};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[derive(Default)]
    struct FakeSource {
        outcomes: HashMap<PartitionKey, FetchOutcome>,
        calls: std::sync::Mutex<Vec<PartitionKey>>,
    }

    impl FakeSource {
        fn with(mut self, key: PartitionKey, outcome: FetchOutcome) -> Self {
            self.outcomes.insert(key, outcome);
            self
        }

        fn calls(&self) -> Vec<PartitionKey> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportSource for FakeSource {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn fetch_partition(
            &self,
            _ctx: &ReportContext,
            key: &PartitionKey,
        ) -> Result<FetchOutcome, AdapterError> {
            self.calls.lock().unwrap().push(*key);
            Ok(self.outcomes.get(key).cloned().unwrap_or_else(|| {
                FetchOutcome::Records(vec![
                    json!({"itemName": format!("vm-{key}"), "latestMonthEmissions": 2.5, "extra": 1}),
                    json!({"itemName": "storage", "location": "westeurope"}),
                ])
            }))
        }
    }

    #[derive(Default)]
    struct FakeCredentials {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for FakeCredentials {
        async fn bearer_token(&self) -> Result<String, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("token".to_string())
        }
    }

    fn config(dir: &TempDir) -> SyncConfig {
        SyncConfig {
            credentials: ClientCredentials {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            subscription_id: "sub-1".into(),
            authority_url: DEFAULT_AUTHORITY_URL.into(),
            api_url: DEFAULT_REPORT_API_URL.into(),
            category_type: DEFAULT_CATEGORY_TYPE.into(),
            scopes: EmissionScope::ALL.to_vec(),
            lakehouse_dir: dir.path().join("lakehouse"),
            reports_dir: dir.path().join("reports"),
            raw_dir: None,
            http_timeout_secs: 5,
            user_agent: "test".into(),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
        }
    }

    fn ctx() -> ReportContext {
        ReportContext {
            bearer_token: "token".into(),
            subscription_id: "sub-1".into(),
            category_type: DEFAULT_CATEGORY_TYPE.into(),
        }
    }

    fn pipeline(dir: &TempDir, source: Arc<FakeSource>, creds: Arc<FakeCredentials>) -> SyncPipeline {
        SyncPipeline::with_components(config(dir), source, creds)
    }

    #[test]
    fn gaps_exclude_exactly_the_existing_pairs() {
        let targets = all_partitions(&[ymd(2024, 1, 1), ymd(2024, 2, 1)], &EmissionScope::ALL);
        let existing = BTreeSet::from([(ymd(2024, 1, 1), "Scope1".to_string())]);
        let gaps = compute_gaps(&targets, &existing);
        assert_eq!(gaps.len(), 5);
        assert!(!gaps.contains(&PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope1)));
        assert_eq!(gaps[0], PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope2));
    }

    #[test]
    fn unknown_scope_strings_never_match() {
        let targets = all_partitions(&[ymd(2024, 1, 1)], &EmissionScope::ALL);
        let existing = BTreeSet::from([(ymd(2024, 1, 1), "scope1".to_string())]);
        assert_eq!(compute_gaps(&targets, &existing).len(), 3);
    }

    #[test]
    fn missing_table_is_an_empty_existing_set() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        assert!(existing_partitions(&table).unwrap().is_empty());
    }

    #[test]
    fn unreadable_table_is_not_treated_as_empty() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        std::fs::create_dir_all(table.path()).unwrap();
        std::fs::write(table.path().join("part-broken.parquet"), b"junk").unwrap();
        assert!(existing_partitions(&table).is_err());
    }

    #[tokio::test]
    async fn http_error_does_not_block_later_partitions() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let gaps = all_partitions(&[ymd(2024, 1, 1)], &EmissionScope::ALL);
        let source = Arc::new(FakeSource::default().with(
            gaps[0],
            FetchOutcome::HttpError {
                status: 500,
                body: "boom".into(),
            },
        ));
        let engine = IngestEngine::new(source.clone(), table.clone());

        let reports = engine.run(Uuid::new_v4(), &ctx(), &gaps).await;
        assert_eq!(source.calls(), gaps);
        assert_eq!(
            reports[0].outcome,
            PartitionOutcome::HttpError {
                status: 500,
                body: "boom".into()
            }
        );
        assert!(matches!(reports[1].outcome, PartitionOutcome::Appended { rows: 2, .. }));
        assert!(matches!(reports[2].outcome, PartitionOutcome::Appended { rows: 2, .. }));

        let stored = existing_partitions(&table).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(!stored.contains(&(ymd(2024, 1, 1), "Scope1".to_string())));
    }

    #[tokio::test]
    async fn cast_failure_is_isolated_to_its_partition() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let gaps = all_partitions(&[ymd(2024, 2, 1)], &[EmissionScope::Scope1, EmissionScope::Scope2]);
        let source = Arc::new(FakeSource::default().with(
            gaps[0],
            FetchOutcome::Records(vec![
                json!({"itemName": "ok", "latestMonthEmissions": 1.0}),
                json!({"itemName": "bad", "latestMonthEmissions": "lots"}),
            ]),
        ));
        let engine = IngestEngine::new(source, table.clone());

        let reports = engine.run(Uuid::new_v4(), &ctx(), &gaps).await;
        assert!(matches!(
            reports[0].outcome,
            PartitionOutcome::Failed {
                stage: FailureStage::Normalize,
                ..
            }
        ));
        assert!(matches!(reports[1].outcome, PartitionOutcome::Appended { .. }));
        assert!(table.scan().unwrap().iter().all(|r| r.belongs_to(&gaps[1])));
    }

    #[tokio::test]
    async fn appended_rows_carry_partition_stamp_and_full_schema() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let key = PartitionKey::new(ymd(2023, 11, 1), EmissionScope::Scope3);
        let source = Arc::new(FakeSource::default().with(
            key,
            FetchOutcome::Records(vec![
                json!({"itemName": "a", "reportMonth": "1999-01-01", "emissionScope": "Scope1"}),
                json!({"resourceId": "/subscriptions/x", "surprise": {"nested": 1}}),
            ]),
        ));
        let engine = IngestEngine::new(source, table.clone());

        let outcome = engine.ingest_partition(&ctx(), &key).await;
        assert!(matches!(outcome, PartitionOutcome::Appended { rows: 2, .. }));

        let rows = table.scan().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.belongs_to(&key)));
        assert_eq!(rows[0].item_name.as_deref(), Some("a"));
        assert_eq!(rows[1].item_name, None);
        assert_eq!(rows[1].resource_id.as_deref(), Some("/subscriptions/x"));
    }

    #[tokio::test]
    async fn empty_partition_stays_in_the_gap() {
        let dir = tempdir().unwrap();
        let today = ymd(2024, 7, 15);
        let empty_key = PartitionKey::new(ymd(2024, 5, 1), EmissionScope::Scope2);
        let source = Arc::new(FakeSource::default().with(empty_key, FetchOutcome::Empty));
        let creds = Arc::new(FakeCredentials::default());
        let pipeline = pipeline(&dir, source, creds);

        let first = pipeline.run_for_date(today).await.unwrap();
        assert_eq!(first.gap_partitions, 36);
        assert_eq!(first.empty, 1);
        assert_eq!(first.appended, 35);

        let plan = pipeline.plan(today).unwrap();
        assert_eq!(plan.gaps, vec![empty_key]);
    }

    #[tokio::test]
    async fn second_run_fetches_nothing_and_leaves_table_unchanged() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let creds = Arc::new(FakeCredentials::default());
        let pipeline = pipeline(&dir, source.clone(), creds.clone());
        let today = ymd(2024, 7, 15);

        let first = pipeline.run_for_date(today).await.unwrap();
        assert_eq!(first.window_months, 12);
        assert_eq!(first.appended, 36);
        assert_eq!(first.rows_appended, 72);
        let rows_after_first = pipeline.table().scan().unwrap();

        let second = pipeline.run_for_date(today).await.unwrap();
        assert_eq!(second.gap_partitions, 0);
        assert!(second.partitions.is_empty());
        assert_eq!(source.calls().len(), 36);
        assert_eq!(creds.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.table().scan().unwrap(), rows_after_first);
    }

    #[tokio::test]
    async fn query_failure_aborts_before_any_fetch() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let creds = Arc::new(FakeCredentials::default());
        let pipeline = pipeline(&dir, source.clone(), creds.clone());
        std::fs::create_dir_all(pipeline.table().path()).unwrap();
        std::fs::write(pipeline.table().path().join("part-broken.parquet"), b"junk").unwrap();

        assert!(pipeline.run_for_date(ymd(2024, 7, 15)).await.is_err());
        assert!(source.calls().is_empty());
        assert_eq!(creds.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_reports_are_written_and_summarized() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let creds = Arc::new(FakeCredentials::default());
        let pipeline = pipeline(&dir, source, creds);

        let summary = pipeline.run_for_date(ymd(2024, 3, 2)).await.unwrap();
        let reports_dir = PathBuf::from(summary.reports_dir.clone().unwrap());
        assert!(reports_dir.join("run_summary.json").exists());
        assert!(reports_dir.join("run_brief.md").exists());

        let markdown = report_recent_markdown(5, &pipeline.config().reports_dir).unwrap();
        assert!(markdown.contains(&summary.run_id.to_string()));
        assert!(markdown.contains("36 appended"));
    }

    #[test]
    fn outcomes_serialize_with_a_tag() {
        let report = PartitionReport {
            partition: PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope1),
            outcome: PartitionOutcome::HttpError {
                status: 403,
                body: "denied".into(),
            },
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"], "http_error");
        assert_eq!(value["status"], 403);
        assert_eq!(value["partition"]["scope"], "Scope1");
    }
}
