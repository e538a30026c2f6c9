//! Ingestion run coordination.
//!
//! One `IngestionRunner::run` call is one run: a mandatory fetch whose
//! failure fails the whole run, optional follow-up batches that are skipped
//! on error, per-record normalize-and-upsert with failure isolation, and
//! exactly one run-history row written at the end regardless of outcome.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use pulse_adapters::{
    normalize_air, normalize_fda, normalize_flu, normalize_hospital, AdapterError,
    AirQualityAdapter, AirQualityQuery, AirQualitySource, DateRange, EpiweekRange, FdaAdapter,
    FdaSource, FluViewAdapter, FluViewSource, HospitalAdapter, HospitalSource, HttpClient,
    IngestSource, MandatoryFetch, NormalizeError, RawRecord,
};
use pulse_core::{
    epiweek_for_date, AirQualityHourKey, FluWeekKey, HospitalDayKey, IngestionRunRecord, RunStatus,
};
use pulse_store::{Store, StoreError};

pub const CRATE_NAME: &str = "pulse-ingest";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("mandatory fetch failed: {0}")]
    Fetch(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sink for per-run observability signals. The runner emits through this so
/// callers can plug in whatever backend they have; the default just logs.
pub trait ObservabilitySink: Send + Sync {
    fn record_duration(&self, source_name: &str, duration_ms: i64);
    fn increment_processed(&self, source_name: &str, count: i64);
    fn increment_errors(&self, source_name: &str, count: i64);
}

/// Default sink: structured log lines, nothing else.
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record_duration(&self, source_name: &str, duration_ms: i64) {
        info!(source = source_name, duration_ms, "ingestion duration");
    }

    fn increment_processed(&self, source_name: &str, count: i64) {
        info!(source = source_name, count, "records processed");
    }

    fn increment_errors(&self, source_name: &str, count: i64) {
        warn!(source = source_name, count, "record errors");
    }
}

/// Environment-driven configuration for the runner and its sources.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub openaq_api_key: Option<String>,
    pub capture_raw: bool,
    pub capture_retention_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://pulse.db".to_string(),
            openaq_api_key: None,
            capture_raw: false,
            capture_retention_days: 14,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            openaq_api_key: std::env::var("OPENAQ_API_KEY").ok().filter(|k| !k.is_empty()),
            capture_raw: std::env::var("PULSE_CAPTURE_RAW")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.capture_raw),
            capture_retention_days: std::env::var("PULSE_CAPTURE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.capture_retention_days),
        }
    }
}

/// The four ingestion sources, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    FluView,
    Hospital,
    Fda,
    AirQuality,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::FluView,
        SourceKind::Hospital,
        SourceKind::Fda,
        SourceKind::AirQuality,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fluview" => Some(SourceKind::FluView),
            "hospital" => Some(SourceKind::Hospital),
            "fda" => Some(SourceKind::Fda),
            "air" | "airquality" | "air-quality" => Some(SourceKind::AirQuality),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::FluView => "fluview",
            SourceKind::Hospital => "hospital",
            SourceKind::Fda => "fda",
            SourceKind::AirQuality => "air",
        }
    }

    /// Absent bounds fall back to each source's default lookback. FluView
    /// interprets the dates as the epiweeks containing them; air quality
    /// always fetches the latest snapshot and ignores bounds.
    pub fn build_source(
        &self,
        config: &IngestConfig,
        bounds: Option<(NaiveDate, NaiveDate)>,
    ) -> Box<dyn IngestSource> {
        match self {
            SourceKind::FluView => {
                let range = bounds.map(|(start, end)| EpiweekRange {
                    start: epiweek_for_date(start),
                    end: epiweek_for_date(end),
                });
                Box::new(FluViewSource::new(FluViewAdapter::default(), range))
            }
            SourceKind::Hospital => {
                let range = bounds.map(|(start, end)| DateRange { start, end });
                Box::new(HospitalSource::new(HospitalAdapter::default(), range))
            }
            SourceKind::Fda => {
                let range = bounds.map(|(start, end)| DateRange { start, end });
                Box::new(FdaSource::new(FdaAdapter::default(), range))
            }
            SourceKind::AirQuality => {
                let adapter = AirQualityAdapter {
                    api_key: config.openaq_api_key.clone(),
                    ..AirQualityAdapter::default()
                };
                Box::new(AirQualitySource::new(adapter, AirQualityQuery::Default))
            }
        }
    }
}

/// What one run did, mirrored into the run-history table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub source_name: String,
    pub status: RunStatus,
    pub records_processed: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub record_errors: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Default)]
struct Tally {
    processed: i64,
    inserted: i64,
    updated: i64,
    errors: i64,
}

enum Upserted {
    Inserted,
    Updated,
}

pub struct IngestionRunner {
    store: Store,
    http: HttpClient,
    sink: Arc<dyn ObservabilitySink>,
    capture_raw: bool,
}

impl IngestionRunner {
    pub fn new(store: Store, http: HttpClient, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            store,
            http,
            sink,
            capture_raw: false,
        }
    }

    /// Retain raw fetch bodies in the capture table for debugging.
    pub fn with_raw_capture(mut self, capture_raw: bool) -> Self {
        self.capture_raw = capture_raw;
        self
    }

    /// Execute one ingestion run for the source. A mandatory-fetch failure
    /// writes a failed run record and propagates; everything after that point
    /// is failure-isolated per record or per batch.
    pub async fn run(&self, source: &dyn IngestSource) -> Result<RunSummary, RunError> {
        let source_name = source.source_name();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(source = source_name, "ingestion run started");

        let mandatory = match source.fetch_mandatory(&self.http).await {
            Ok(mandatory) => mandatory,
            Err(err) => {
                let message = err.to_string();
                error!(source = source_name, error = %message, "mandatory fetch failed");
                self.sink.increment_errors(source_name, 1);
                let duration_ms = clock.elapsed().as_millis() as i64;
                self.store
                    .insert_run_record(&IngestionRunRecord {
                        source_name: source_name.to_string(),
                        job_run_at: started_at,
                        status: RunStatus::Failed,
                        records_processed: 0,
                        records_inserted: 0,
                        records_updated: 0,
                        error_message: Some(message),
                        duration_ms,
                    })
                    .await?;
                return Err(RunError::Fetch(err));
            }
        };

        let mut tally = Tally::default();
        match mandatory {
            MandatoryFetch::Skipped { reason } => {
                warn!(source = source_name, reason = %reason, "run skipped");
            }
            MandatoryFetch::Records(payload) => {
                let capture_id = if self.capture_raw {
                    Some(
                        self.store
                            .insert_raw_capture(source_name, &payload.raw_body)
                            .await?,
                    )
                } else {
                    None
                };

                self.process_records(source_name, &payload.records, &mut tally)
                    .await;
                for (label, batch) in source.fetch_optional_batches(&self.http).await {
                    match batch {
                        Ok(records) => {
                            self.process_records(source_name, &records, &mut tally).await;
                        }
                        Err(err) => {
                            warn!(
                                source = source_name,
                                batch = %label,
                                error = %err,
                                "batch fetch failed, skipping"
                            );
                        }
                    }
                }

                if let Some(id) = capture_id {
                    if tally.errors == 0 {
                        self.store.mark_capture_processed(id).await?;
                    } else {
                        let message = format!("{} records failed processing", tally.errors);
                        self.store.mark_capture_failed(id, &message).await?;
                    }
                }
            }
        }

        let duration_ms = clock.elapsed().as_millis() as i64;
        let (status, error_message) = if tally.errors > 0 {
            (
                RunStatus::Partial,
                Some(format!("{} records failed processing", tally.errors)),
            )
        } else {
            (RunStatus::Success, None)
        };
        self.store
            .insert_run_record(&IngestionRunRecord {
                source_name: source_name.to_string(),
                job_run_at: started_at,
                status,
                records_processed: tally.processed,
                records_inserted: tally.inserted,
                records_updated: tally.updated,
                error_message,
                duration_ms,
            })
            .await?;
        self.sink.record_duration(source_name, duration_ms);
        self.sink.increment_processed(source_name, tally.processed);

        info!(
            source = source_name,
            processed = tally.processed,
            inserted = tally.inserted,
            updated = tally.updated,
            errors = tally.errors,
            duration_ms,
            "ingestion run finished"
        );
        Ok(RunSummary {
            source_name: source_name.to_string(),
            status,
            records_processed: tally.processed,
            records_inserted: tally.inserted,
            records_updated: tally.updated,
            record_errors: tally.errors,
            duration_ms,
        })
    }

    async fn process_records(&self, source_name: &str, records: &[RawRecord], tally: &mut Tally) {
        for record in records {
            match self.process_one(record).await {
                Ok(Upserted::Inserted) => {
                    tally.processed += 1;
                    tally.inserted += 1;
                }
                Ok(Upserted::Updated) => {
                    tally.processed += 1;
                    tally.updated += 1;
                }
                Err(err) => {
                    error!(source = source_name, error = %err, "error processing record");
                    tally.errors += 1;
                    self.sink.increment_errors(source_name, 1);
                }
            }
        }
    }

    /// Normalize one record and upsert it. The insert/update classification
    /// reads existence before the upsert; under a race it can misattribute a
    /// record, which only skews the tallies, never the stored rows.
    async fn process_one(&self, record: &RawRecord) -> Result<Upserted, RecordError> {
        let now = Utc::now();
        match record {
            RawRecord::Flu {
                region_code,
                record,
            } => {
                let rollup = normalize_flu(region_code, record, now)?;
                let key = FluWeekKey {
                    region_code: rollup.region_code.clone(),
                    year: rollup.year,
                    week_number: rollup.week_number,
                };
                let existed = self.store.flu_exists(&key).await?;
                self.store.upsert_flu(&rollup).await?;
                Ok(classify(existed))
            }
            RawRecord::Hospital(record) => {
                let rollup = normalize_hospital(record, now)?;
                let key = HospitalDayKey {
                    hospital_pk: rollup.hospital_pk.clone(),
                    collection_date: rollup.collection_date,
                };
                let existed = self.store.hospital_exists(&key).await?;
                self.store.upsert_hospital(&rollup).await?;
                Ok(classify(existed))
            }
            RawRecord::Fda(record) => {
                let rollup = normalize_fda(record, now)?;
                let existed = self.store.fda_exists(&rollup.recall_number).await?;
                self.store.upsert_fda(&rollup).await?;
                Ok(classify(existed))
            }
            RawRecord::AirQuality(observation) => {
                let rollup = normalize_air(observation, now)?;
                let key = AirQualityHourKey {
                    location_id: rollup.location_id,
                    measurement_date: rollup.measurement_date,
                    measurement_hour: rollup.measurement_hour,
                };
                let existed = self.store.air_exists(&key).await?;
                self.store.upsert_air(&rollup).await?;
                Ok(classify(existed))
            }
        }
    }
}

fn classify(existed: bool) -> Upserted {
    if existed {
        Upserted::Updated
    } else {
        Upserted::Inserted
    }
}

/// One-shot entry point for the command line: open the store, run the named
/// source, and purge expired captures on the way out.
pub async fn run_source(
    kind: SourceKind,
    config: &IngestConfig,
    bounds: Option<(NaiveDate, NaiveDate)>,
) -> anyhow::Result<RunSummary> {
    let store = Store::connect(&config.database_url).await?;
    store.init_schema().await?;
    let http = HttpClient::new()?;
    let runner = IngestionRunner::new(store.clone(), http, Arc::new(TracingSink))
        .with_raw_capture(config.capture_raw);
    let source = kind.build_source(config, bounds);
    let summary = runner.run(source.as_ref()).await?;
    if config.capture_raw {
        let purged = store
            .purge_captures_older_than(config.capture_retention_days)
            .await?;
        if purged > 0 {
            info!(purged, "expired raw captures purged");
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use pulse_adapters::{FetchPayload, FluViewRecord, HospitalRecord};
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        processed: AtomicI64,
        errors: AtomicI64,
        durations: AtomicI64,
    }

    impl ObservabilitySink for RecordingSink {
        fn record_duration(&self, _source_name: &str, _duration_ms: i64) {
            self.durations.fetch_add(1, Ordering::SeqCst);
        }

        fn increment_processed(&self, _source_name: &str, count: i64) {
            self.processed.fetch_add(count, Ordering::SeqCst);
        }

        fn increment_errors(&self, _source_name: &str, count: i64) {
            self.errors.fetch_add(count, Ordering::SeqCst);
        }
    }

    struct FakeSource {
        name: &'static str,
        mandatory: Option<MandatoryFetch>,
        fail_mandatory: Option<AdapterError>,
        batches: Vec<(String, Result<Vec<RawRecord>, AdapterError>)>,
    }

    impl FakeSource {
        fn with_records(name: &'static str, records: Vec<RawRecord>) -> Self {
            Self {
                name,
                mandatory: Some(MandatoryFetch::Records(FetchPayload {
                    raw_body: "{}".to_string(),
                    records,
                })),
                fail_mandatory: None,
                batches: Vec::new(),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                mandatory: None,
                fail_mandatory: Some(AdapterError::HttpStatus {
                    status: 503,
                    url: "https://example.invalid/feed".to_string(),
                }),
                batches: Vec::new(),
            }
        }

        fn skipped(name: &'static str, reason: &str) -> Self {
            Self {
                name,
                mandatory: Some(MandatoryFetch::Skipped {
                    reason: reason.to_string(),
                }),
                fail_mandatory: None,
                batches: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl IngestSource for FakeSource {
        fn source_name(&self) -> &'static str {
            self.name
        }

        async fn fetch_mandatory(&self, _http: &HttpClient) -> Result<MandatoryFetch, AdapterError> {
            if let Some(err) = &self.fail_mandatory {
                return Err(match err {
                    AdapterError::HttpStatus { status, url } => AdapterError::HttpStatus {
                        status: *status,
                        url: url.clone(),
                    },
                    _ => unreachable!("fakes only fail with http statuses"),
                });
            }
            match &self.mandatory {
                Some(MandatoryFetch::Records(payload)) => {
                    Ok(MandatoryFetch::Records(payload.clone()))
                }
                Some(MandatoryFetch::Skipped { reason }) => Ok(MandatoryFetch::Skipped {
                    reason: reason.clone(),
                }),
                None => unreachable!("fake has neither payload nor failure"),
            }
        }

        async fn fetch_optional_batches(
            &self,
            _http: &HttpClient,
        ) -> Vec<(String, Result<Vec<RawRecord>, AdapterError>)> {
            self.batches
                .iter()
                .map(|(label, result)| {
                    let cloned = match result {
                        Ok(records) => Ok(records.clone()),
                        Err(AdapterError::HttpStatus { status, url }) => {
                            Err(AdapterError::HttpStatus {
                                status: *status,
                                url: url.clone(),
                            })
                        }
                        Err(_) => unreachable!("fakes only fail with http statuses"),
                    };
                    (label.clone(), cloned)
                })
                .collect()
        }
    }

    async fn runner_with_store() -> (IngestionRunner, Store, Arc<RecordingSink>) {
        let store = Store::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let runner = IngestionRunner::new(
            store.clone(),
            HttpClient::new().unwrap(),
            sink.clone(),
        );
        (runner, store, sink)
    }

    fn flu_record(epiweek: i64, wili: f64) -> RawRecord {
        RawRecord::Flu {
            region_code: "nat".to_string(),
            record: FluViewRecord {
                epiweek,
                region: Some("nat".to_string()),
                wili: Some(wili),
                ili: Some(wili - 0.3),
                num_providers: Some(120),
                num_patients: Some(8000),
                num_ili: Some(170),
            },
        }
    }

    fn hospital_record(pk: &str, collection_date: &str) -> RawRecord {
        RawRecord::Hospital(HospitalRecord {
            hospital_pk: Some(pk.to_string()),
            collection_date: Some(collection_date.to_string()),
            state: Some("MD".to_string()),
            zip_code: Some("20850".to_string()),
            total_beds: Some(200),
            occupied_beds: Some(150),
            icu_beds: Some(20),
            icu_occupied: Some(12),
            covid_patients: Some(5),
        })
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_the_run() {
        let (runner, store, sink) = runner_with_store().await;
        let source = FakeSource::with_records(
            "delphi_hospital",
            vec![
                hospital_record("100001", "2024-06-01"),
                hospital_record("100002", "not-a-date"),
                hospital_record("100003", "20240601"),
            ],
        );

        let summary = runner.run(&source).await.unwrap();
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.records_processed, 2);
        assert_eq!(summary.records_inserted, 2);
        assert_eq!(summary.record_errors, 1);

        let rows = store
            .hospital_for_zip_range("20850", date(2024, 6, 1), date(2024, 6, 1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(sink.errors.load(Ordering::SeqCst), 1);
        assert_eq!(sink.processed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mandatory_fetch_failure_writes_failed_run_and_propagates() {
        let (runner, store, sink) = runner_with_store().await;
        let source = FakeSource::failing("fda_enforcement");

        let err = runner.run(&source).await.unwrap_err();
        assert!(matches!(err, RunError::Fetch(AdapterError::HttpStatus { status: 503, .. })));

        let runs = store.recent_runs("fda_enforcement", 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].records_processed, 0);
        let message = runs[0].error_message.as_deref().unwrap();
        assert!(message.contains("503"));
        assert_eq!(sink.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rerun_with_revised_values_updates_the_same_row() {
        let (runner, store, _sink) = runner_with_store().await;

        let first = FakeSource::with_records("delphi_fluview", vec![flu_record(202403, 2.5)]);
        let summary = runner.run(&first).await.unwrap();
        assert_eq!(summary.records_inserted, 1);
        assert_eq!(summary.records_updated, 0);

        let second = FakeSource::with_records("delphi_fluview", vec![flu_record(202403, 3.1)]);
        let summary = runner.run(&second).await.unwrap();
        assert_eq!(summary.records_inserted, 0);
        assert_eq!(summary.records_updated, 1);

        let rows = store
            .flu_for_range("nat", date(2024, 1, 1), date(2024, 12, 31))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].year, 2024);
        assert_eq!(rows[0].week_number, 3);
        assert_eq!(rows[0].epiweek_start, date(2024, 1, 15));
        assert_eq!(rows[0].wili, Some(3.1));

        let runs = store.recent_runs("delphi_fluview", 1).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    }

    #[tokio::test]
    async fn skipped_mandatory_fetch_records_clean_success() {
        let (runner, store, sink) = runner_with_store().await;
        let source = FakeSource::skipped("openaq", "OpenAQ API key not set");

        let summary = runner.run(&source).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.records_processed, 0);

        let runs = store.recent_runs("openaq", 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].records_processed, 0);
        assert!(runs[0].error_message.is_none());
        assert_eq!(sink.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_optional_batch_is_skipped_not_fatal() {
        let (runner, store, _sink) = runner_with_store().await;
        let mut source =
            FakeSource::with_records("delphi_fluview", vec![flu_record(202401, 1.8)]);
        source.batches = vec![
            (
                "al,ak,az".to_string(),
                Ok(vec![RawRecord::Flu {
                    region_code: "al".to_string(),
                    record: FluViewRecord {
                        epiweek: 202401,
                        region: Some("al".to_string()),
                        wili: Some(2.2),
                        ili: None,
                        num_providers: None,
                        num_patients: None,
                        num_ili: None,
                    },
                }]),
            ),
            (
                "ca,co,ct".to_string(),
                Err(AdapterError::HttpStatus {
                    status: 504,
                    url: "https://example.invalid/batch".to_string(),
                }),
            ),
        ];

        let summary = runner.run(&source).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.records_processed, 2);

        let regions = store.distinct_flu_regions().await.unwrap();
        assert_eq!(regions, vec!["al".to_string(), "nat".to_string()]);
    }

    #[tokio::test]
    async fn raw_capture_follows_run_outcome() {
        let store = Store::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let runner = IngestionRunner::new(
            store.clone(),
            HttpClient::new().unwrap(),
            Arc::new(TracingSink),
        )
        .with_raw_capture(true);

        let clean = FakeSource::with_records("delphi_fluview", vec![flu_record(202402, 2.0)]);
        runner.run(&clean).await.unwrap();
        let capture = store.get_raw_capture(1).await.unwrap().unwrap();
        assert_eq!(capture.status, pulse_core::CaptureStatus::Processed);
        assert_eq!(capture.source_name, "delphi_fluview");

        let dirty = FakeSource::with_records(
            "delphi_hospital",
            vec![hospital_record("x", "garbage")],
        );
        runner.run(&dirty).await.unwrap();
        let capture = store.get_raw_capture(2).await.unwrap().unwrap();
        assert_eq!(capture.status, pulse_core::CaptureStatus::Failed);
        assert!(capture.error_message.is_some());
    }

    #[test]
    fn source_kind_round_trips_cli_names() {
        for kind in SourceKind::ALL {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("air-quality"), Some(SourceKind::AirQuality));
        assert_eq!(SourceKind::parse("bogus"), None);
    }
}
