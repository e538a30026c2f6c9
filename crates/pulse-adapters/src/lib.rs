//! Source adapters for the four external public-health APIs.
//!
//! Each adapter knows one API's request shape (endpoint template, default
//! lookback window, timeout, batching) and its response schema, and hands the
//! coordinator a sequence of raw records plus the raw body for capture. The
//! paired normalizers map raw records into canonical rollup entities,
//! deriving natural keys along the way.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Timelike, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use pulse_core::{
    epiweek_bounds, epiweek_for_date, split_epiweek, AirQualityHourlyRollup, DomainError,
    FdaEnforcementDailyRollup, FluWeeklyRollup, HospitalCapacityDailyRollup,
};

pub const CRATE_NAME: &str = "pulse-adapters";

pub const DELPHI_FLUVIEW_URL: &str = "https://api.delphi.cmu.edu/epidata/fluview/";
pub const DELPHI_HOSPITAL_URL: &str = "https://api.delphi.cmu.edu/epidata/covid_hosp_facility/";
pub const OPENFDA_ENFORCEMENT_URL: &str = "https://api.fda.gov/drug/enforcement.json";
pub const OPENAQ_LOCATIONS_URL: &str = "https://api.openaq.org/v3/locations";

/// State regions queried after the national fetch, ten per request.
pub const STATE_CODES: [&str; 51] = [
    "al", "ak", "az", "ar", "ca", "co", "ct", "de", "dc", "fl", "ga", "hi", "id", "il", "in", "ia",
    "ks", "ky", "la", "me", "md", "ma", "mi", "mn", "ms", "mo", "mt", "ne", "nv", "nh", "nj", "nm",
    "ny", "nc", "nd", "oh", "ok", "or", "pa", "ri", "sc", "sd", "tn", "tx", "ut", "vt", "va", "wa",
    "wv", "wi", "wy",
];
pub const STATE_BATCH_SIZE: usize = 10;

/// openFDA page size bound; recalls are high-cardinality.
pub const FDA_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unparsable date: {0:?}")]
    BadDate(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Thin JSON client shared by all adapters. No retry or backoff: a failed
/// mandatory call is surfaced to the scheduler, which owns the retry policy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder().gzip(true).build()?;
        Ok(Self { client })
    }

    pub async fn get_text(
        &self,
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
    ) -> Result<String, AdapterError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Inclusive epiweek-identifier window (`year*100 + week`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpiweekRange {
    pub start: i64,
    pub end: i64,
}

impl EpiweekRange {
    pub const DEFAULT_LOOKBACK_WEEKS: u64 = 4;

    pub fn default_lookback(today: NaiveDate) -> Self {
        let start_date = today
            .checked_sub_days(Days::new(Self::DEFAULT_LOOKBACK_WEEKS * 7))
            .unwrap_or(today);
        Self {
            start: epiweek_for_date(start_date),
            end: epiweek_for_date(today),
        }
    }
}

/// Inclusive calendar-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn last_days(today: NaiveDate, days: u64) -> Self {
        Self {
            start: today.checked_sub_days(Days::new(days)).unwrap_or(today),
            end: today,
        }
    }
}

// ----------------------------------------------------------------------
// Raw response schemas
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EpidataEnvelope<T> {
    pub result: Option<i64>,
    pub epidata: Option<Vec<T>>,
}

impl<T> EpidataEnvelope<T> {
    /// Delphi signals success with `result == 1`; anything else carries no
    /// usable rows.
    pub fn into_records(self) -> Vec<T> {
        if self.result == Some(1) {
            self.epidata.unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FluViewRecord {
    pub epiweek: i64,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub wili: Option<f64>,
    #[serde(default)]
    pub ili: Option<f64>,
    #[serde(default)]
    pub num_providers: Option<i64>,
    #[serde(default)]
    pub num_patients: Option<i64>,
    #[serde(default)]
    pub num_ili: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HospitalRecord {
    #[serde(default)]
    pub hospital_pk: Option<String>,
    #[serde(default)]
    pub collection_date: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub total_beds: Option<i64>,
    #[serde(default)]
    pub occupied_beds: Option<i64>,
    #[serde(default)]
    pub icu_beds: Option<i64>,
    #[serde(default)]
    pub icu_occupied: Option<i64>,
    #[serde(default)]
    pub covid_patients: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FdaEnvelope {
    #[serde(default)]
    pub results: Option<Vec<FdaRecord>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FdaRecord {
    #[serde(default)]
    pub recall_number: Option<String>,
    #[serde(default)]
    pub report_date: Option<String>,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub reason_for_recall: Option<String>,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AqEnvelope {
    #[serde(default)]
    pub results: Option<Vec<AqLocation>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AqLocation {
    #[serde(default, alias = "locationId")]
    pub id: Option<i64>,
    #[serde(default)]
    pub coordinates: Option<AqCoordinates>,
    #[serde(default)]
    pub parameters: Vec<AqParameter>,
    #[serde(default)]
    pub zip_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AqCoordinates {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AqParameter {
    #[serde(default)]
    pub parameter: Option<String>,
    #[serde(default, rename = "lastValue", alias = "last_value")]
    pub last_value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One air-quality location snapshot, stamped with the time it was observed.
/// Measurement date/hour are derived from this stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AqObservation {
    pub location: AqLocation,
    pub observed_at: DateTime<Utc>,
    pub zip_override: Option<String>,
}

/// Raw record handoff from an adapter to the run coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Flu {
        region_code: String,
        record: FluViewRecord,
    },
    Hospital(HospitalRecord),
    Fda(FdaRecord),
    AirQuality(AqObservation),
}

/// A completed fetch: the raw body (retained for debugging capture) and the
/// records parsed out of it.
#[derive(Debug, Clone)]
pub struct FetchPayload {
    pub raw_body: String,
    pub records: Vec<RawRecord>,
}

pub enum MandatoryFetch {
    Records(FetchPayload),
    /// Preconditions missing (e.g. no API key). Not a failure.
    Skipped { reason: String },
}

/// One ingestion source as the coordinator sees it: a mandatory fetch whose
/// failure is fatal to the run, plus optional follow-up batches whose
/// failures are logged and skipped.
#[async_trait]
pub trait IngestSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_mandatory(&self, http: &HttpClient) -> Result<MandatoryFetch, AdapterError>;

    async fn fetch_optional_batches(
        &self,
        _http: &HttpClient,
    ) -> Vec<(String, Result<Vec<RawRecord>, AdapterError>)> {
        Vec::new()
    }
}

// ----------------------------------------------------------------------
// FluView
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FluViewAdapter {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for FluViewAdapter {
    fn default() -> Self {
        Self {
            base_url: DELPHI_FLUVIEW_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl FluViewAdapter {
    pub fn national_url(&self, range: &EpiweekRange) -> String {
        format!(
            "{}?regions=nat&epiweeks={}-{}",
            self.base_url, range.start, range.end
        )
    }

    pub fn batch_url(&self, batch: &[&str], range: &EpiweekRange) -> String {
        format!(
            "{}?regions={}&epiweeks={}-{}",
            self.base_url,
            batch.join(","),
            range.start,
            range.end
        )
    }

    /// National scope, always attempted first. A failure here is fatal.
    pub async fn fetch_national(
        &self,
        http: &HttpClient,
        range: &EpiweekRange,
    ) -> Result<FetchPayload, AdapterError> {
        let url = self.national_url(range);
        let body = http.get_text(&url, self.timeout, &[]).await?;
        let envelope: EpidataEnvelope<FluViewRecord> = serde_json::from_str(&body)?;
        let records = envelope
            .into_records()
            .into_iter()
            .map(|record| RawRecord::Flu {
                region_code: "nat".to_string(),
                record,
            })
            .collect();
        Ok(FetchPayload {
            raw_body: body,
            records,
        })
    }

    /// State regions in fixed-size batches. A batch failure is reported to
    /// the caller but never aborts sibling batches.
    pub async fn fetch_state_batches(
        &self,
        http: &HttpClient,
        range: &EpiweekRange,
    ) -> Vec<(String, Result<Vec<RawRecord>, AdapterError>)> {
        let mut out = Vec::new();
        for batch in STATE_CODES.chunks(STATE_BATCH_SIZE) {
            let label = batch.join(",");
            let result = self.fetch_state_batch(http, batch, range).await;
            out.push((label, result));
        }
        out
    }

    async fn fetch_state_batch(
        &self,
        http: &HttpClient,
        batch: &[&str],
        range: &EpiweekRange,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.batch_url(batch, range);
        let body = http.get_text(&url, self.timeout, &[]).await?;
        let envelope: EpidataEnvelope<FluViewRecord> = serde_json::from_str(&body)?;
        let fallback_region = batch.first().copied().unwrap_or("nat").to_string();
        Ok(envelope
            .into_records()
            .into_iter()
            .map(|record| RawRecord::Flu {
                region_code: record
                    .region
                    .clone()
                    .unwrap_or_else(|| fallback_region.clone()),
                record,
            })
            .collect())
    }
}

pub struct FluViewSource {
    adapter: FluViewAdapter,
    range: EpiweekRange,
}

impl FluViewSource {
    pub fn new(adapter: FluViewAdapter, range: Option<EpiweekRange>) -> Self {
        let range = range.unwrap_or_else(|| EpiweekRange::default_lookback(Utc::now().date_naive()));
        Self { adapter, range }
    }
}

#[async_trait]
impl IngestSource for FluViewSource {
    fn source_name(&self) -> &'static str {
        "delphi_fluview"
    }

    async fn fetch_mandatory(&self, http: &HttpClient) -> Result<MandatoryFetch, AdapterError> {
        let payload = self.adapter.fetch_national(http, &self.range).await?;
        Ok(MandatoryFetch::Records(payload))
    }

    async fn fetch_optional_batches(
        &self,
        http: &HttpClient,
    ) -> Vec<(String, Result<Vec<RawRecord>, AdapterError>)> {
        self.adapter.fetch_state_batches(http, &self.range).await
    }
}

// ----------------------------------------------------------------------
// Hospital capacity
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HospitalAdapter {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for HospitalAdapter {
    fn default() -> Self {
        Self {
            base_url: DELPHI_HOSPITAL_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HospitalAdapter {
    pub const DEFAULT_LOOKBACK_DAYS: u64 = 7;

    pub fn request_url(&self, range: &DateRange) -> String {
        format!(
            "{}?collection_weeks={}-{}",
            self.base_url,
            range.start.format("%Y%m%d"),
            range.end.format("%Y%m%d")
        )
    }

    /// Single request for the collection window. An empty payload is a clean
    /// zero-record result, not an error.
    pub async fn fetch(
        &self,
        http: &HttpClient,
        range: &DateRange,
    ) -> Result<FetchPayload, AdapterError> {
        let url = self.request_url(range);
        let body = http.get_text(&url, self.timeout, &[]).await?;
        let envelope: EpidataEnvelope<HospitalRecord> = serde_json::from_str(&body)?;
        let records = envelope
            .into_records()
            .into_iter()
            .map(RawRecord::Hospital)
            .collect::<Vec<_>>();
        if records.is_empty() {
            warn!(
                start = %range.start,
                end = %range.end,
                "no hospital data returned for collection window"
            );
        }
        Ok(FetchPayload {
            raw_body: body,
            records,
        })
    }
}

pub struct HospitalSource {
    adapter: HospitalAdapter,
    range: DateRange,
}

impl HospitalSource {
    pub fn new(adapter: HospitalAdapter, range: Option<DateRange>) -> Self {
        let range = range.unwrap_or_else(|| {
            DateRange::last_days(Utc::now().date_naive(), HospitalAdapter::DEFAULT_LOOKBACK_DAYS)
        });
        Self { adapter, range }
    }
}

#[async_trait]
impl IngestSource for HospitalSource {
    fn source_name(&self) -> &'static str {
        "delphi_hospital"
    }

    async fn fetch_mandatory(&self, http: &HttpClient) -> Result<MandatoryFetch, AdapterError> {
        let payload = self.adapter.fetch(http, &self.range).await?;
        Ok(MandatoryFetch::Records(payload))
    }
}

// ----------------------------------------------------------------------
// FDA enforcement
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FdaAdapter {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for FdaAdapter {
    fn default() -> Self {
        Self {
            base_url: OPENFDA_ENFORCEMENT_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl FdaAdapter {
    pub const DEFAULT_LOOKBACK_DAYS: u64 = 7;

    pub fn request_url(&self, range: &DateRange) -> String {
        format!(
            "{}?search=report_date:[{}+TO+{}]&limit={}",
            self.base_url,
            range.start.format("%Y%m%d"),
            range.end.format("%Y%m%d"),
            FDA_PAGE_LIMIT
        )
    }

    pub async fn fetch(
        &self,
        http: &HttpClient,
        range: &DateRange,
    ) -> Result<FetchPayload, AdapterError> {
        let url = self.request_url(range);
        let body = http.get_text(&url, self.timeout, &[]).await?;
        let envelope: FdaEnvelope = serde_json::from_str(&body)?;
        let records = envelope
            .results
            .unwrap_or_default()
            .into_iter()
            .map(RawRecord::Fda)
            .collect::<Vec<_>>();
        if records.is_empty() {
            warn!(
                start = %range.start,
                end = %range.end,
                "no enforcement data returned for report window"
            );
        }
        Ok(FetchPayload {
            raw_body: body,
            records,
        })
    }
}

pub struct FdaSource {
    adapter: FdaAdapter,
    range: DateRange,
}

impl FdaSource {
    pub fn new(adapter: FdaAdapter, range: Option<DateRange>) -> Self {
        let range = range.unwrap_or_else(|| {
            DateRange::last_days(Utc::now().date_naive(), FdaAdapter::DEFAULT_LOOKBACK_DAYS)
        });
        Self { adapter, range }
    }
}

#[async_trait]
impl IngestSource for FdaSource {
    fn source_name(&self) -> &'static str {
        "fda_enforcement"
    }

    async fn fetch_mandatory(&self, http: &HttpClient) -> Result<MandatoryFetch, AdapterError> {
        let payload = self.adapter.fetch(http, &self.range).await?;
        Ok(MandatoryFetch::Records(payload))
    }
}

// ----------------------------------------------------------------------
// Air quality (OpenAQ)
// ----------------------------------------------------------------------

/// Query modes in precedence order: explicit location, then coordinates,
/// then zip (which falls back to a country-scoped query since no
/// zip→location mapping is maintained), then the country-scoped default.
#[derive(Debug, Clone, PartialEq)]
pub enum AirQualityQuery {
    Location { location_id: i64 },
    Coordinates { lat: f64, lon: f64, radius_km: f64 },
    Zip { zip_code: String },
    Default,
}

impl AirQualityQuery {
    pub fn resolve(
        location_id: Option<i64>,
        lat: Option<f64>,
        lon: Option<f64>,
        zip_code: Option<String>,
        radius_km: f64,
    ) -> Self {
        if let Some(location_id) = location_id {
            AirQualityQuery::Location { location_id }
        } else if let (Some(lat), Some(lon)) = (lat, lon) {
            AirQualityQuery::Coordinates {
                lat,
                lon,
                radius_km,
            }
        } else if let Some(zip_code) = zip_code {
            AirQualityQuery::Zip { zip_code }
        } else {
            AirQualityQuery::Default
        }
    }

    /// Zip hint carried through to normalization; the payload itself rarely
    /// has one.
    pub fn zip_hint(&self) -> Option<String> {
        match self {
            AirQualityQuery::Zip { zip_code } => Some(zip_code.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AirQualityAdapter {
    pub base_url: String,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl Default for AirQualityAdapter {
    fn default() -> Self {
        Self {
            base_url: OPENAQ_LOCATIONS_URL.to_string(),
            timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}

impl AirQualityAdapter {
    pub fn request_url(&self, query: &AirQualityQuery) -> String {
        match query {
            AirQualityQuery::Location { location_id } => {
                format!("{}/{}/latest", self.base_url, location_id)
            }
            AirQualityQuery::Coordinates {
                lat,
                lon,
                radius_km,
            } => {
                // OpenAQ expects the radius in meters.
                let radius_m = (radius_km * 1000.0) as i64;
                format!(
                    "{}?coordinates={},{}&radius={}&limit=10&parameters_id=2,8",
                    self.base_url, lat, lon, radius_m
                )
            }
            // No zip→location mapping is maintained; fall back to the
            // US-scoped query. 840 is the ISO numeric code for the US.
            AirQualityQuery::Zip { .. } | AirQualityQuery::Default => {
                format!(
                    "{}?limit=10&parameters_id=2,8&countries_id=840",
                    self.base_url
                )
            }
        }
    }

    /// Requires an API key; absence is a skip, not a failure.
    pub async fn fetch(
        &self,
        http: &HttpClient,
        query: &AirQualityQuery,
    ) -> Result<MandatoryFetch, AdapterError> {
        let Some(api_key) = self.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(MandatoryFetch::Skipped {
                reason: "OpenAQ API key not set".to_string(),
            });
        };
        let url = self.request_url(query);
        let headers = [("X-API-Key", api_key), ("Accept", "application/json")];
        let body = http.get_text(&url, self.timeout, &headers).await?;
        let envelope: AqEnvelope = serde_json::from_str(&body)?;
        let observed_at = Utc::now();
        let zip_override = query.zip_hint();
        let records = envelope
            .results
            .unwrap_or_default()
            .into_iter()
            .map(|location| {
                RawRecord::AirQuality(AqObservation {
                    location,
                    observed_at,
                    zip_override: zip_override.clone(),
                })
            })
            .collect::<Vec<_>>();
        if records.is_empty() {
            warn!("no air-quality data returned");
        }
        Ok(MandatoryFetch::Records(FetchPayload {
            raw_body: body,
            records,
        }))
    }
}

pub struct AirQualitySource {
    adapter: AirQualityAdapter,
    query: AirQualityQuery,
}

impl AirQualitySource {
    pub fn new(adapter: AirQualityAdapter, query: AirQualityQuery) -> Self {
        Self { adapter, query }
    }
}

#[async_trait]
impl IngestSource for AirQualitySource {
    fn source_name(&self) -> &'static str {
        "openaq"
    }

    async fn fetch_mandatory(&self, http: &HttpClient) -> Result<MandatoryFetch, AdapterError> {
        self.adapter.fetch(http, &self.query).await
    }
}

// ----------------------------------------------------------------------
// Normalizers
// ----------------------------------------------------------------------

fn parse_flexible_date(value: &str) -> Result<NaiveDate, NormalizeError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| NormalizeError::BadDate(value.to_string()))
}

pub fn normalize_flu(
    region_code: &str,
    record: &FluViewRecord,
    now: DateTime<Utc>,
) -> Result<FluWeeklyRollup, NormalizeError> {
    let (year, week_number) = split_epiweek(record.epiweek);
    let (epiweek_start, epiweek_end) = epiweek_bounds(year, week_number)?;
    Ok(FluWeeklyRollup {
        region_code: region_code.to_string(),
        year,
        week_number,
        epiweek_start,
        epiweek_end,
        wili: record.wili,
        ili: record.ili,
        num_providers: record.num_providers,
        num_patients: record.num_patients,
        num_ili: record.num_ili,
        last_updated: now,
    })
}

pub fn normalize_hospital(
    record: &HospitalRecord,
    now: DateTime<Utc>,
) -> Result<HospitalCapacityDailyRollup, NormalizeError> {
    let hospital_pk = record
        .hospital_pk
        .clone()
        .ok_or(NormalizeError::MissingField("hospital_pk"))?;
    let collection_date = record
        .collection_date
        .as_deref()
        .ok_or(NormalizeError::MissingField("collection_date"))?;
    Ok(HospitalCapacityDailyRollup {
        hospital_pk,
        collection_date: parse_flexible_date(collection_date)?,
        state: record.state.clone(),
        zip_code: record.zip_code.clone(),
        total_beds: record.total_beds,
        occupied_beds: record.occupied_beds,
        icu_beds: record.icu_beds,
        icu_occupied: record.icu_occupied,
        covid_patients: record.covid_patients,
        last_updated: now,
    })
}

pub fn normalize_fda(
    record: &FdaRecord,
    now: DateTime<Utc>,
) -> Result<FdaEnforcementDailyRollup, NormalizeError> {
    let recall_number = record
        .recall_number
        .clone()
        .ok_or(NormalizeError::MissingField("recall_number"))?;
    let report_date = record
        .report_date
        .as_deref()
        .ok_or(NormalizeError::MissingField("report_date"))?;
    Ok(FdaEnforcementDailyRollup {
        recall_number,
        report_date: parse_flexible_date(report_date)?,
        product_description: record.product_description.clone(),
        reason_for_recall: record.reason_for_recall.clone(),
        classification: record.classification.clone(),
        status: record.status.clone(),
        state: record.state.clone(),
        country: record.country.clone(),
        last_updated: now,
    })
}

/// Selects exactly the pm2.5 and o3 entries from the location's parameter
/// list; other pollutants are discarded. Zip stays null when neither the
/// caller nor the payload supplies one; it is intentionally not geocoded.
pub fn normalize_air(
    observation: &AqObservation,
    now: DateTime<Utc>,
) -> Result<AirQualityHourlyRollup, NormalizeError> {
    let location = &observation.location;
    let location_id = location
        .id
        .ok_or(NormalizeError::MissingField("location id"))?;

    let find_parameter = |name: &str| {
        location
            .parameters
            .iter()
            .find(|p| p.parameter.as_deref().map(str::to_ascii_lowercase) == Some(name.to_string()))
    };
    let pm25 = find_parameter("pm25");
    let o3 = find_parameter("o3");

    let (latitude, longitude) = match &location.coordinates {
        Some(coords) => (coords.latitude, coords.longitude),
        None => (None, None),
    };

    Ok(AirQualityHourlyRollup {
        location_id,
        measurement_date: observation.observed_at.date_naive(),
        measurement_hour: observation.observed_at.hour() as i32,
        latitude,
        longitude,
        zip_code: observation
            .zip_override
            .clone()
            .or_else(|| location.zip_code.clone()),
        pm25_value: pm25.and_then(|p| p.last_value),
        pm25_unit: pm25.and_then(|p| p.unit.clone()),
        o3_value: o3.and_then(|p| p.last_value),
        o3_unit: o3.and_then(|p| p.unit.clone()),
        last_updated: now,
    })
}
