//! Core domain model for Public Health Pulse rollups.
//!
//! Every ingested record is normalized into one of four rollup entities, each
//! identified by a natural key. Rows are created once and rewritten in place;
//! this subsystem never deletes them.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pulse-core";

/// Kilometers per degree of latitude, used by the bounding-box approximation.
pub const KM_PER_DEGREE_LAT: f64 = 111.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("unknown status value: {0}")]
    UnknownStatus(String),
    #[error("measurement hour {0} out of range 0..=23")]
    HourOutOfRange(i32),
    #[error("invalid epiweek {year}{week:02}")]
    InvalidEpiweek { year: i32, week: i32 },
    #[error("coordinates out of range: lat={lat} lon={lon}")]
    CoordinatesOutOfRange { lat: f64, lon: f64 },
}

/// Weekly influenza surveillance rollup (Delphi FluView).
///
/// Natural key: `(region_code, year, week_number)`. `week_number` is unique
/// only within a region and year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluWeeklyRollup {
    pub region_code: String,
    pub year: i32,
    pub week_number: i32,
    pub epiweek_start: NaiveDate,
    pub epiweek_end: NaiveDate,
    pub wili: Option<f64>,
    pub ili: Option<f64>,
    pub num_providers: Option<i64>,
    pub num_patients: Option<i64>,
    pub num_ili: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluWeekKey {
    pub region_code: String,
    pub year: i32,
    pub week_number: i32,
}

/// Daily hospital bed-capacity rollup. Carries no coordinates; geospatial
/// queries against it go through zip codes resolved from the air-quality
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalCapacityDailyRollup {
    pub hospital_pk: String,
    pub collection_date: NaiveDate,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub total_beds: Option<i64>,
    pub occupied_beds: Option<i64>,
    pub icu_beds: Option<i64>,
    pub icu_occupied: Option<i64>,
    pub covid_patients: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalDayKey {
    pub hospital_pk: String,
    pub collection_date: NaiveDate,
}

/// Daily drug-recall enforcement rollup (openFDA). `recall_number` is
/// globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdaEnforcementDailyRollup {
    pub recall_number: String,
    pub report_date: NaiveDate,
    pub product_description: Option<String>,
    pub reason_for_recall: Option<String>,
    pub classification: Option<String>,
    pub status: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Hourly air-quality rollup (OpenAQ, pm2.5 + ozone only). The only entity
/// carrying coordinates, so it anchors geospatial lookups for everything
/// else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityHourlyRollup {
    pub location_id: i64,
    pub measurement_date: NaiveDate,
    pub measurement_hour: i32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zip_code: Option<String>,
    pub pm25_value: Option<f64>,
    pub pm25_unit: Option<String>,
    pub o3_value: Option<f64>,
    pub o3_unit: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirQualityHourKey {
    pub location_id: i64,
    pub measurement_date: NaiveDate,
    pub measurement_hour: i32,
}

/// Terminal status of one ingestion job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Append-only audit row, exactly one per job execution, never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunRecord {
    pub source_name: String,
    pub job_run_at: DateTime<Utc>,
    pub status: RunStatus,
    pub records_processed: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Pending,
    Processed,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Processed => "processed",
            CaptureStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(CaptureStatus::Pending),
            "processed" => Ok(CaptureStatus::Processed),
            "failed" => Ok(CaptureStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Raw API payload retained for a bounded debugging window, then purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub id: i64,
    pub source_name: String,
    pub ingested_at: DateTime<Utc>,
    pub raw_payload: String,
    pub status: CaptureStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Splits an epiweek identifier (`year*100 + week`) into its parts.
pub fn split_epiweek(epiweek: i64) -> (i32, i32) {
    ((epiweek / 100) as i32, (epiweek % 100) as i32)
}

/// Combines a date into an epiweek identifier using its ISO week.
pub fn epiweek_for_date(date: NaiveDate) -> i64 {
    let iso = date.iso_week();
    iso.year() as i64 * 100 + iso.week() as i64
}

/// Start/end dates for an epidemiological week.
///
/// Approximation: `start = Jan 1 of year + (week-1) * 7 days`, `end = start +
/// 6 days`. True MMWR/ISO week boundaries differ in some years; the simpler
/// rule is kept deliberately for compatibility with the historical rollups.
pub fn epiweek_bounds(year: i32, week_number: i32) -> Result<(NaiveDate, NaiveDate), DomainError> {
    if !(1..=53).contains(&week_number) {
        return Err(DomainError::InvalidEpiweek {
            year,
            week: week_number,
        });
    }
    let jan_first = NaiveDate::from_ymd_opt(year, 1, 1).ok_or(DomainError::InvalidEpiweek {
        year,
        week: week_number,
    })?;
    let start = jan_first
        .checked_add_days(Days::new((week_number as u64 - 1) * 7))
        .ok_or(DomainError::InvalidEpiweek {
            year,
            week: week_number,
        })?;
    let end = start
        .checked_add_days(Days::new(6))
        .ok_or(DomainError::InvalidEpiweek {
            year,
            week: week_number,
        })?;
    Ok((start, end))
}

pub fn validate_measurement_hour(hour: i32) -> Result<(), DomainError> {
    if (0..=23).contains(&hour) {
        Ok(())
    } else {
        Err(DomainError::HourOutOfRange(hour))
    }
}

/// Five ASCII digits, nothing else.
pub fn is_valid_zip(zip: &str) -> bool {
    zip.len() == 5 && zip.bytes().all(|b| b.is_ascii_digit())
}

pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), DomainError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(DomainError::CoordinatesOutOfRange { lat, lon })
    }
}

/// Rectangular coordinate-range approximation of a radius filter.
///
/// No spatial index is available, so radius queries are answered with a
/// latitude/longitude box: one degree of latitude is taken as 111 km and the
/// longitude span is widened by `1/cos(lat)`. Deliberately not geodesic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn around(lat: f64, lon: f64, radius_km: f64) -> Self {
        let lat_delta = radius_km / KM_PER_DEGREE_LAT;
        let lon_delta = radius_km / (KM_PER_DEGREE_LAT * (lat.to_radians()).cos());
        Self {
            lat_min: lat - lat_delta,
            lat_max: lat + lat_delta,
            lon_min: lon - lon_delta,
            lon_max: lon + lon_delta,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }
}
