//! Rollup persistence for Public Health Pulse.
//!
//! One SQLite database holds the four rollup tables, the run-history table,
//! and the raw-capture table. Every rollup table shares the same upsert
//! protocol: look up by natural key, update if present, otherwise insert, and
//! treat a duplicate-key failure on insert as a concurrency signal to re-read
//! and update instead. Natural-key uniqueness is enforced by `UNIQUE`
//! constraints, so concurrent callers racing on the same key converge to a
//! single row.

use chrono::{Duration, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use pulse_core::{
    validate_measurement_hour, AirQualityHourKey, AirQualityHourlyRollup, BoundingBox,
    CaptureStatus, DomainError, FdaEnforcementDailyRollup, FluWeekKey, FluWeeklyRollup,
    HospitalCapacityDailyRollup, HospitalDayKey, IngestionRunRecord, RawCapture, RunStatus,
};

pub const CRATE_NAME: &str = "pulse-store";

/// Persisted error messages are truncated to this many characters.
pub const MAX_ERROR_LEN: usize = 4000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flu_weekly_rollups (
    region_code   TEXT NOT NULL,
    year          INTEGER NOT NULL,
    week_number   INTEGER NOT NULL,
    epiweek_start TEXT NOT NULL,
    epiweek_end   TEXT NOT NULL,
    wili          REAL,
    ili           REAL,
    num_providers INTEGER,
    num_patients  INTEGER,
    num_ili       INTEGER,
    last_updated  TEXT NOT NULL,
    UNIQUE (region_code, year, week_number)
);

CREATE TABLE IF NOT EXISTS hospital_capacity_daily_rollups (
    hospital_pk     TEXT NOT NULL,
    collection_date TEXT NOT NULL,
    state           TEXT,
    zip_code        TEXT,
    total_beds      INTEGER,
    occupied_beds   INTEGER,
    icu_beds        INTEGER,
    icu_occupied    INTEGER,
    covid_patients  INTEGER,
    last_updated    TEXT NOT NULL,
    UNIQUE (hospital_pk, collection_date)
);

CREATE TABLE IF NOT EXISTS fda_enforcement_daily_rollups (
    recall_number       TEXT NOT NULL UNIQUE,
    report_date         TEXT NOT NULL,
    product_description TEXT,
    reason_for_recall   TEXT,
    classification      TEXT,
    status              TEXT,
    state               TEXT,
    country             TEXT,
    last_updated        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS air_quality_hourly_rollups (
    location_id      INTEGER NOT NULL,
    measurement_date TEXT NOT NULL,
    measurement_hour INTEGER NOT NULL CHECK (measurement_hour BETWEEN 0 AND 23),
    latitude         REAL,
    longitude        REAL,
    zip_code         TEXT,
    pm25_value       REAL,
    pm25_unit        TEXT,
    o3_value         REAL,
    o3_unit          TEXT,
    last_updated     TEXT NOT NULL,
    UNIQUE (location_id, measurement_date, measurement_hour)
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name       TEXT NOT NULL,
    job_run_at        TEXT NOT NULL,
    status            TEXT NOT NULL CHECK (status IN ('success', 'failed', 'partial')),
    records_processed INTEGER NOT NULL,
    records_inserted  INTEGER NOT NULL,
    records_updated   INTEGER NOT NULL,
    error_message     TEXT,
    duration_ms       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_captures (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name   TEXT NOT NULL,
    ingested_at   TEXT NOT NULL,
    raw_payload   TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('pending', 'processed', 'failed')),
    error_message TEXT,
    processed_at  TEXT
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut cut = MAX_ERROR_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message[..cut].to_string()
}

/// Daily pm2.5/o3 averages for the dashboard chart.
#[derive(Debug, Clone, PartialEq)]
pub struct AirDailyAverage {
    pub measurement_date: NaiveDate,
    pub avg_pm25: Option<f64>,
    pub avg_o3: Option<f64>,
}

/// Minimal hospital projection for map markers.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalMarker {
    pub hospital_pk: String,
    pub state: Option<String>,
    pub total_beds: Option<i64>,
    pub zip_code: Option<String>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. A single connection keeps every caller
    /// on the same database instance.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // FluWeeklyRollup
    // ------------------------------------------------------------------

    pub async fn flu_exists(&self, key: &FluWeekKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM flu_weekly_rollups WHERE region_code = ? AND year = ? AND week_number = ?",
        )
        .bind(&key.region_code)
        .bind(key.year)
        .bind(key.week_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn upsert_flu(&self, rollup: &FluWeeklyRollup) -> Result<(), StoreError> {
        let key = FluWeekKey {
            region_code: rollup.region_code.clone(),
            year: rollup.year,
            week_number: rollup.week_number,
        };
        if self.flu_exists(&key).await? {
            return self.update_flu(rollup).await;
        }
        match self.insert_flu(rollup).await {
            Ok(()) => Ok(()),
            Err(StoreError::Database(err)) if is_unique_violation(&err) => {
                // Lost the insert race; the row exists now, so rewrite it.
                debug!(region = %rollup.region_code, "flu insert conflict, falling back to update");
                self.update_flu(rollup).await
            }
            Err(err) => Err(err),
        }
    }

    async fn insert_flu(&self, r: &FluWeeklyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO flu_weekly_rollups \
             (region_code, year, week_number, epiweek_start, epiweek_end, wili, ili, \
              num_providers, num_patients, num_ili, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.region_code)
        .bind(r.year)
        .bind(r.week_number)
        .bind(r.epiweek_start)
        .bind(r.epiweek_end)
        .bind(r.wili)
        .bind(r.ili)
        .bind(r.num_providers)
        .bind(r.num_patients)
        .bind(r.num_ili)
        .bind(r.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_flu(&self, r: &FluWeeklyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE flu_weekly_rollups \
             SET epiweek_start = ?, epiweek_end = ?, wili = ?, ili = ?, num_providers = ?, \
                 num_patients = ?, num_ili = ?, last_updated = ? \
             WHERE region_code = ? AND year = ? AND week_number = ?",
        )
        .bind(r.epiweek_start)
        .bind(r.epiweek_end)
        .bind(r.wili)
        .bind(r.ili)
        .bind(r.num_providers)
        .bind(r.num_patients)
        .bind(r.num_ili)
        .bind(r.last_updated)
        .bind(&r.region_code)
        .bind(r.year)
        .bind(r.week_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Weekly rollups for one region whose week falls entirely in the window,
    /// earliest week first.
    pub async fn flu_for_range(
        &self,
        region_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FluWeeklyRollup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM flu_weekly_rollups \
             WHERE region_code = ? AND epiweek_start >= ? AND epiweek_end <= ? \
             ORDER BY epiweek_start",
        )
        .bind(region_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(flu_from_row).collect()
    }

    pub async fn distinct_flu_regions(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT region_code FROM flu_weekly_rollups ORDER BY region_code",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("region_code").map_err(StoreError::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // HospitalCapacityDailyRollup
    // ------------------------------------------------------------------

    pub async fn hospital_exists(&self, key: &HospitalDayKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM hospital_capacity_daily_rollups \
             WHERE hospital_pk = ? AND collection_date = ?",
        )
        .bind(&key.hospital_pk)
        .bind(key.collection_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn upsert_hospital(
        &self,
        rollup: &HospitalCapacityDailyRollup,
    ) -> Result<(), StoreError> {
        let key = HospitalDayKey {
            hospital_pk: rollup.hospital_pk.clone(),
            collection_date: rollup.collection_date,
        };
        if self.hospital_exists(&key).await? {
            return self.update_hospital(rollup).await;
        }
        match self.insert_hospital(rollup).await {
            Ok(()) => Ok(()),
            Err(StoreError::Database(err)) if is_unique_violation(&err) => {
                debug!(hospital = %rollup.hospital_pk, "hospital insert conflict, falling back to update");
                self.update_hospital(rollup).await
            }
            Err(err) => Err(err),
        }
    }

    async fn insert_hospital(&self, r: &HospitalCapacityDailyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO hospital_capacity_daily_rollups \
             (hospital_pk, collection_date, state, zip_code, total_beds, occupied_beds, \
              icu_beds, icu_occupied, covid_patients, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.hospital_pk)
        .bind(r.collection_date)
        .bind(&r.state)
        .bind(&r.zip_code)
        .bind(r.total_beds)
        .bind(r.occupied_beds)
        .bind(r.icu_beds)
        .bind(r.icu_occupied)
        .bind(r.covid_patients)
        .bind(r.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_hospital(&self, r: &HospitalCapacityDailyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE hospital_capacity_daily_rollups \
             SET state = ?, zip_code = ?, total_beds = ?, occupied_beds = ?, icu_beds = ?, \
                 icu_occupied = ?, covid_patients = ?, last_updated = ? \
             WHERE hospital_pk = ? AND collection_date = ?",
        )
        .bind(&r.state)
        .bind(&r.zip_code)
        .bind(r.total_beds)
        .bind(r.occupied_beds)
        .bind(r.icu_beds)
        .bind(r.icu_occupied)
        .bind(r.covid_patients)
        .bind(r.last_updated)
        .bind(&r.hospital_pk)
        .bind(r.collection_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn hospital_for_zip_range(
        &self,
        zip_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HospitalCapacityDailyRollup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM hospital_capacity_daily_rollups \
             WHERE zip_code = ? AND collection_date >= ? AND collection_date <= ? \
             ORDER BY collection_date",
        )
        .bind(zip_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hospital_from_row).collect()
    }

    /// Hospitals have no coordinates; a coordinate query first resolves the
    /// bounding box to zip codes observed in the air-quality table, then
    /// filters hospitals by that zip set. An empty zip set yields an empty
    /// result, never an unfiltered scan.
    pub async fn hospital_for_coords_range(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HospitalCapacityDailyRollup>, StoreError> {
        let zips = self
            .distinct_zips_in_box(&BoundingBox::around(lat, lon, radius_km))
            .await?;
        if zips.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM hospital_capacity_daily_rollups WHERE zip_code IN (");
        let mut separated = qb.separated(", ");
        for zip in &zips {
            separated.push_bind(zip);
        }
        qb.push(") AND collection_date >= ");
        qb.push_bind(start);
        qb.push(" AND collection_date <= ");
        qb.push_bind(end);
        qb.push(" ORDER BY collection_date");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(hospital_from_row).collect()
    }

    /// Distinct non-null states among hospitals in the given zip set.
    pub async fn hospital_states_for_zips(
        &self,
        zips: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if zips.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT state FROM hospital_capacity_daily_rollups \
             WHERE state IS NOT NULL AND zip_code IN (",
        );
        let mut separated = qb.separated(", ");
        for zip in zips {
            separated.push_bind(zip);
        }
        qb.push(") ORDER BY state");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("state").map_err(StoreError::from))
            .collect()
    }

    /// Up to `limit` distinct facilities in the zip set, for map markers.
    pub async fn hospital_markers_for_zips(
        &self,
        zips: &[String],
        limit: i64,
    ) -> Result<Vec<HospitalMarker>, StoreError> {
        if zips.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT hospital_pk, state, total_beds, zip_code \
             FROM hospital_capacity_daily_rollups \
             WHERE state IS NOT NULL AND zip_code IN (",
        );
        let mut separated = qb.separated(", ");
        for zip in zips {
            separated.push_bind(zip);
        }
        qb.push(") LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(HospitalMarker {
                    hospital_pk: row.try_get("hospital_pk")?,
                    state: row.try_get("state")?,
                    total_beds: row.try_get("total_beds")?,
                    zip_code: row.try_get("zip_code")?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // FdaEnforcementDailyRollup
    // ------------------------------------------------------------------

    pub async fn fda_exists(&self, recall_number: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM fda_enforcement_daily_rollups WHERE recall_number = ?")
            .bind(recall_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn upsert_fda(&self, rollup: &FdaEnforcementDailyRollup) -> Result<(), StoreError> {
        if self.fda_exists(&rollup.recall_number).await? {
            return self.update_fda(rollup).await;
        }
        match self.insert_fda(rollup).await {
            Ok(()) => Ok(()),
            Err(StoreError::Database(err)) if is_unique_violation(&err) => {
                debug!(recall = %rollup.recall_number, "fda insert conflict, falling back to update");
                self.update_fda(rollup).await
            }
            Err(err) => Err(err),
        }
    }

    async fn insert_fda(&self, r: &FdaEnforcementDailyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO fda_enforcement_daily_rollups \
             (recall_number, report_date, product_description, reason_for_recall, \
              classification, status, state, country, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.recall_number)
        .bind(r.report_date)
        .bind(&r.product_description)
        .bind(&r.reason_for_recall)
        .bind(&r.classification)
        .bind(&r.status)
        .bind(&r.state)
        .bind(&r.country)
        .bind(r.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_fda(&self, r: &FdaEnforcementDailyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE fda_enforcement_daily_rollups \
             SET report_date = ?, product_description = ?, reason_for_recall = ?, \
                 classification = ?, status = ?, state = ?, country = ?, last_updated = ? \
             WHERE recall_number = ?",
        )
        .bind(r.report_date)
        .bind(&r.product_description)
        .bind(&r.reason_for_recall)
        .bind(&r.classification)
        .bind(&r.status)
        .bind(&r.state)
        .bind(&r.country)
        .bind(r.last_updated)
        .bind(&r.recall_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enforcement rows in the window, optionally filtered by state
    /// (case-insensitive), oldest first, capped at `limit` rows.
    pub async fn fda_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        state: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FdaEnforcementDailyRollup>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM fda_enforcement_daily_rollups WHERE report_date >= ",
        );
        qb.push_bind(start);
        qb.push(" AND report_date <= ");
        qb.push_bind(end);
        if let Some(state) = state {
            qb.push(" AND UPPER(state) = ");
            qb.push_bind(state.to_uppercase());
        }
        qb.push(" ORDER BY report_date LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(fda_from_row).collect()
    }

    pub async fn distinct_fda_states(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT state FROM fda_enforcement_daily_rollups \
             WHERE state IS NOT NULL ORDER BY state",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("state").map_err(StoreError::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // AirQualityHourlyRollup
    // ------------------------------------------------------------------

    pub async fn air_exists(&self, key: &AirQualityHourKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM air_quality_hourly_rollups \
             WHERE location_id = ? AND measurement_date = ? AND measurement_hour = ?",
        )
        .bind(key.location_id)
        .bind(key.measurement_date)
        .bind(key.measurement_hour)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn upsert_air(&self, rollup: &AirQualityHourlyRollup) -> Result<(), StoreError> {
        validate_measurement_hour(rollup.measurement_hour)?;
        let key = AirQualityHourKey {
            location_id: rollup.location_id,
            measurement_date: rollup.measurement_date,
            measurement_hour: rollup.measurement_hour,
        };
        if self.air_exists(&key).await? {
            return self.update_air(rollup).await;
        }
        match self.insert_air(rollup).await {
            Ok(()) => Ok(()),
            Err(StoreError::Database(err)) if is_unique_violation(&err) => {
                debug!(location = rollup.location_id, "air insert conflict, falling back to update");
                self.update_air(rollup).await
            }
            Err(err) => Err(err),
        }
    }

    async fn insert_air(&self, r: &AirQualityHourlyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO air_quality_hourly_rollups \
             (location_id, measurement_date, measurement_hour, latitude, longitude, zip_code, \
              pm25_value, pm25_unit, o3_value, o3_unit, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.location_id)
        .bind(r.measurement_date)
        .bind(r.measurement_hour)
        .bind(r.latitude)
        .bind(r.longitude)
        .bind(&r.zip_code)
        .bind(r.pm25_value)
        .bind(&r.pm25_unit)
        .bind(r.o3_value)
        .bind(&r.o3_unit)
        .bind(r.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_air(&self, r: &AirQualityHourlyRollup) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE air_quality_hourly_rollups \
             SET latitude = ?, longitude = ?, zip_code = ?, pm25_value = ?, pm25_unit = ?, \
                 o3_value = ?, o3_unit = ?, last_updated = ? \
             WHERE location_id = ? AND measurement_date = ? AND measurement_hour = ?",
        )
        .bind(r.latitude)
        .bind(r.longitude)
        .bind(&r.zip_code)
        .bind(r.pm25_value)
        .bind(&r.pm25_unit)
        .bind(r.o3_value)
        .bind(&r.o3_unit)
        .bind(r.last_updated)
        .bind(r.location_id)
        .bind(r.measurement_date)
        .bind(r.measurement_hour)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn air_for_zip_range(
        &self,
        zip_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AirQualityHourlyRollup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM air_quality_hourly_rollups \
             WHERE zip_code = ? AND measurement_date >= ? AND measurement_date <= ? \
             ORDER BY measurement_date, measurement_hour",
        )
        .bind(zip_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(air_from_row).collect()
    }

    pub async fn air_for_coords_range(
        &self,
        bbox: &BoundingBox,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AirQualityHourlyRollup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM air_quality_hourly_rollups \
             WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ? \
               AND measurement_date >= ? AND measurement_date <= ? \
             ORDER BY measurement_date, measurement_hour",
        )
        .bind(bbox.lat_min)
        .bind(bbox.lat_max)
        .bind(bbox.lon_min)
        .bind(bbox.lon_max)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(air_from_row).collect()
    }

    pub async fn air_daily_averages_for_zip(
        &self,
        zip_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AirDailyAverage>, StoreError> {
        let rows = sqlx::query(
            "SELECT measurement_date, AVG(pm25_value) AS avg_pm25, AVG(o3_value) AS avg_o3 \
             FROM air_quality_hourly_rollups \
             WHERE zip_code = ? AND measurement_date >= ? AND measurement_date <= ? \
             GROUP BY measurement_date ORDER BY measurement_date",
        )
        .bind(zip_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(average_from_row).collect()
    }

    pub async fn air_daily_averages_in_box(
        &self,
        bbox: &BoundingBox,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AirDailyAverage>, StoreError> {
        let rows = sqlx::query(
            "SELECT measurement_date, AVG(pm25_value) AS avg_pm25, AVG(o3_value) AS avg_o3 \
             FROM air_quality_hourly_rollups \
             WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ? \
               AND measurement_date >= ? AND measurement_date <= ? \
             GROUP BY measurement_date ORDER BY measurement_date",
        )
        .bind(bbox.lat_min)
        .bind(bbox.lat_max)
        .bind(bbox.lon_min)
        .bind(bbox.lon_max)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(average_from_row).collect()
    }

    /// Distinct zip codes observed in the box. This is the pivot that lets
    /// coordinate queries reach entities without coordinates.
    pub async fn distinct_zips_in_box(
        &self,
        bbox: &BoundingBox,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT zip_code FROM air_quality_hourly_rollups \
             WHERE zip_code IS NOT NULL \
               AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?",
        )
        .bind(bbox.lat_min)
        .bind(bbox.lat_max)
        .bind(bbox.lon_min)
        .bind(bbox.lon_max)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("zip_code").map_err(StoreError::from))
            .collect()
    }

    /// First zip code observed within a fixed ±0.1° box of the point.
    pub async fn first_zip_near(&self, lat: f64, lon: f64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT zip_code FROM air_quality_hourly_rollups \
             WHERE zip_code IS NOT NULL \
               AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ? \
             LIMIT 1",
        )
        .bind(lat - 0.1)
        .bind(lat + 0.1)
        .bind(lon - 0.1)
        .bind(lon + 0.1)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("zip_code").map_err(StoreError::from))
            .transpose()
    }

    pub async fn first_coords_for_zip(
        &self,
        zip_code: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let row = sqlx::query(
            "SELECT latitude, longitude FROM air_quality_hourly_rollups \
             WHERE zip_code = ? AND latitude IS NOT NULL AND longitude IS NOT NULL \
             LIMIT 1",
        )
        .bind(zip_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let lat: f64 = r.try_get("latitude")?;
            let lon: f64 = r.try_get("longitude")?;
            Ok((lat, lon))
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // Run history
    // ------------------------------------------------------------------

    pub async fn insert_run_record(&self, record: &IngestionRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingestion_runs \
             (source_name, job_run_at, status, records_processed, records_inserted, \
              records_updated, error_message, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.source_name)
        .bind(record.job_run_at)
        .bind(record.status.as_str())
        .bind(record.records_processed)
        .bind(record.records_inserted)
        .bind(record.records_updated)
        .bind(record.error_message.as_deref().map(truncate_message))
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Run records for a source within the last `hours`, newest first.
    pub async fn recent_runs(
        &self,
        source_name: &str,
        hours: i64,
    ) -> Result<Vec<IngestionRunRecord>, StoreError> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let rows = sqlx::query(
            "SELECT * FROM ingestion_runs \
             WHERE source_name = ? AND job_run_at >= ? \
             ORDER BY job_run_at DESC",
        )
        .bind(source_name)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Raw captures
    // ------------------------------------------------------------------

    pub async fn insert_raw_capture(
        &self,
        source_name: &str,
        raw_payload: &str,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO raw_captures (source_name, ingested_at, raw_payload, status) \
             VALUES (?, ?, ?, 'pending')",
        )
        .bind(source_name)
        .bind(Utc::now())
        .bind(raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn mark_capture_processed(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE raw_captures SET status = 'processed', processed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_capture_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE raw_captures SET status = 'failed', error_message = ? WHERE id = ?")
            .bind(truncate_message(error))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_raw_capture(&self, id: i64) -> Result<Option<RawCapture>, StoreError> {
        let row = sqlx::query("SELECT * FROM raw_captures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(capture_from_row).transpose()
    }

    /// Deletes captures older than the retention window. Returns rows purged.
    pub async fn purge_captures_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query("DELETE FROM raw_captures WHERE ingested_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    async fn count(&self, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) AS n FROM {table}");
        sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap()
    }
}

fn flu_from_row(row: &SqliteRow) -> Result<FluWeeklyRollup, StoreError> {
    Ok(FluWeeklyRollup {
        region_code: row.try_get("region_code")?,
        year: row.try_get("year")?,
        week_number: row.try_get("week_number")?,
        epiweek_start: row.try_get("epiweek_start")?,
        epiweek_end: row.try_get("epiweek_end")?,
        wili: row.try_get("wili")?,
        ili: row.try_get("ili")?,
        num_providers: row.try_get("num_providers")?,
        num_patients: row.try_get("num_patients")?,
        num_ili: row.try_get("num_ili")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn hospital_from_row(row: &SqliteRow) -> Result<HospitalCapacityDailyRollup, StoreError> {
    Ok(HospitalCapacityDailyRollup {
        hospital_pk: row.try_get("hospital_pk")?,
        collection_date: row.try_get("collection_date")?,
        state: row.try_get("state")?,
        zip_code: row.try_get("zip_code")?,
        total_beds: row.try_get("total_beds")?,
        occupied_beds: row.try_get("occupied_beds")?,
        icu_beds: row.try_get("icu_beds")?,
        icu_occupied: row.try_get("icu_occupied")?,
        covid_patients: row.try_get("covid_patients")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn fda_from_row(row: &SqliteRow) -> Result<FdaEnforcementDailyRollup, StoreError> {
    Ok(FdaEnforcementDailyRollup {
        recall_number: row.try_get("recall_number")?,
        report_date: row.try_get("report_date")?,
        product_description: row.try_get("product_description")?,
        reason_for_recall: row.try_get("reason_for_recall")?,
        classification: row.try_get("classification")?,
        status: row.try_get("status")?,
        state: row.try_get("state")?,
        country: row.try_get("country")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn air_from_row(row: &SqliteRow) -> Result<AirQualityHourlyRollup, StoreError> {
    Ok(AirQualityHourlyRollup {
        location_id: row.try_get("location_id")?,
        measurement_date: row.try_get("measurement_date")?,
        measurement_hour: row.try_get("measurement_hour")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        zip_code: row.try_get("zip_code")?,
        pm25_value: row.try_get("pm25_value")?,
        pm25_unit: row.try_get("pm25_unit")?,
        o3_value: row.try_get("o3_value")?,
        o3_unit: row.try_get("o3_unit")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn average_from_row(row: &SqliteRow) -> Result<AirDailyAverage, StoreError> {
    Ok(AirDailyAverage {
        measurement_date: row.try_get("measurement_date")?,
        avg_pm25: row.try_get("avg_pm25")?,
        avg_o3: row.try_get("avg_o3")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<IngestionRunRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(IngestionRunRecord {
        source_name: row.try_get("source_name")?,
        job_run_at: row.try_get("job_run_at")?,
        status: RunStatus::parse(&status)?,
        records_processed: row.try_get("records_processed")?,
        records_inserted: row.try_get("records_inserted")?,
        records_updated: row.try_get("records_updated")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn capture_from_row(row: &SqliteRow) -> Result<RawCapture, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(RawCapture {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        ingested_at: row.try_get("ingested_at")?,
        raw_payload: row.try_get("raw_payload")?,
        status: CaptureStatus::parse(&status)?,
        error_message: row.try_get("error_message")?,
        processed_at: row.try_get("processed_at")?,
    })
}
