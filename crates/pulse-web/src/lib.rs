//! JSON dashboard API over the rollup store.
//!
//! One `GET /dashboard` call assembles everything the dashboard shows for a
//! location: flu trend, hospital capacity, enforcement actions, air-quality
//! daily averages, map center, and the filter option lists. Location is a zip
//! code or a lat/lon pair; coordinates win when both are given.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::error;

use pulse_core::{
    is_valid_zip, validate_coordinates, BoundingBox, FdaEnforcementDailyRollup, FluWeeklyRollup,
    HospitalCapacityDailyRollup, IngestionRunRecord,
};
use pulse_store::{AirDailyAverage, HospitalMarker, Store, StoreError};

pub const CRATE_NAME: &str = "pulse-web";

pub const DEFAULT_FLU_WEEKS: i64 = 12;
pub const MAX_FLU_WEEKS: i64 = 52;
pub const DEFAULT_WINDOW_DAYS: i64 = 30;
pub const MAX_WINDOW_DAYS: i64 = 365;
pub const DEFAULT_RADIUS_KM: f64 = 10.0;
pub const FDA_DISPLAY_LIMIT: i64 = 50;
pub const MARKER_LIMIT: i64 = 10;

/// Geographic center of the contiguous US, used when no location resolves.
pub const DEFAULT_MAP_CENTER: [f64; 2] = [-98.5795, 39.8283];

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("zip_code must be exactly five digits, got {0:?}")]
    InvalidZip(String),
    #[error("lat must be in -90..=90 and lon in -180..=180")]
    InvalidCoordinates,
    #[error("lat and lon must be provided together")]
    HalfCoordinates,
    #[error("provide a location: zip_code, or lat and lon")]
    MissingLocation,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        match self {
            DashboardError::Store(err) => {
                error!(error = %err, "dashboard query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "internal error"})),
                )
                    .into_response()
            }
            other => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": other.to_string()})),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DashboardParams {
    #[serde(alias = "zip")]
    pub zip_code: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: Option<f64>,
    pub region: Option<String>,
    pub state: Option<String>,
    pub weeks: Option<i64>,
    pub hospital_days: Option<i64>,
    pub fda_days: Option<i64>,
    pub openaq_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Location {
    Coords { lat: f64, lon: f64 },
    Zip(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AirDailyView {
    pub measurement_date: NaiveDate,
    pub avg_pm25: Option<f64>,
    pub avg_o3: Option<f64>,
}

impl From<AirDailyAverage> for AirDailyView {
    fn from(avg: AirDailyAverage) -> Self {
        Self {
            measurement_date: avg.measurement_date,
            avg_pm25: avg.avg_pm25,
            avg_o3: avg.avg_o3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerView {
    pub hospital_pk: String,
    pub state: Option<String>,
    pub total_beds: Option<i64>,
    pub zip_code: Option<String>,
}

impl From<HospitalMarker> for MarkerView {
    fn from(marker: HospitalMarker) -> Self {
        Self {
            hospital_pk: marker.hospital_pk,
            state: marker.state,
            total_beds: marker.total_beds,
            zip_code: marker.zip_code,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowView {
    pub weeks: i64,
    pub hospital_days: i64,
    pub fda_days: i64,
    pub openaq_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    /// The zip the location resolved to: the caller's own zip, or the first
    /// zip observed near the coordinates.
    pub resolved_zip: Option<String>,
    pub flu_region: String,
    pub flu: Vec<FluWeeklyRollup>,
    pub flu_regions: Vec<String>,
    pub hospitals: Vec<HospitalCapacityDailyRollup>,
    pub hospital_markers: Vec<MarkerView>,
    pub fda: Vec<FdaEnforcementDailyRollup>,
    pub fda_states: Vec<String>,
    pub air_daily: Vec<AirDailyView>,
    /// `[lon, lat]`, the order map libraries expect.
    pub map_center: [f64; 2],
    pub window: WindowView,
}

/// Out-of-range window values fall back to the default rather than erroring;
/// a shared dashboard link with a stale parameter should still render.
pub fn clamp_weeks(weeks: Option<i64>) -> i64 {
    match weeks {
        Some(w) if (1..=MAX_FLU_WEEKS).contains(&w) => w,
        _ => DEFAULT_FLU_WEEKS,
    }
}

pub fn clamp_days(days: Option<i64>) -> i64 {
    match days {
        Some(d) if (1..=MAX_WINDOW_DAYS).contains(&d) => d,
        _ => DEFAULT_WINDOW_DAYS,
    }
}

fn resolve_location(params: &DashboardParams) -> Result<Location, DashboardError> {
    match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => {
            validate_coordinates(lat, lon).map_err(|_| DashboardError::InvalidCoordinates)?;
            Ok(Location::Coords { lat, lon })
        }
        (Some(_), None) | (None, Some(_)) => Err(DashboardError::HalfCoordinates),
        (None, None) => match &params.zip_code {
            Some(zip) if is_valid_zip(zip) => Ok(Location::Zip(zip.clone())),
            Some(zip) => Err(DashboardError::InvalidZip(zip.clone())),
            None => Err(DashboardError::MissingLocation),
        },
    }
}

/// Assembles the full dashboard for one location. Every section is scoped to
/// its own window: the flu trend by weeks, hospital/FDA/air-quality each by
/// its own day parameter.
pub async fn build_dashboard(
    store: &Store,
    params: &DashboardParams,
) -> Result<DashboardView, DashboardError> {
    let location = resolve_location(params)?;
    let weeks = clamp_weeks(params.weeks);
    let hospital_days = clamp_days(params.hospital_days);
    let fda_days = clamp_days(params.fda_days);
    let openaq_days = clamp_days(params.openaq_days);
    let radius_km = params
        .radius_km
        .filter(|r| r.is_finite() && *r > 0.0)
        .unwrap_or(DEFAULT_RADIUS_KM);

    let today = Utc::now().date_naive();
    let window_start = |days: i64| {
        today
            .checked_sub_days(Days::new(days as u64))
            .unwrap_or(today)
    };
    let flu_start = window_start(weeks * 7);
    let hospital_start = window_start(hospital_days);
    let fda_start = window_start(fda_days);
    let air_start = window_start(openaq_days);

    let (air_daily, hospitals, zips, resolved_zip) = match &location {
        Location::Coords { lat, lon } => {
            let bbox = BoundingBox::around(*lat, *lon, radius_km);
            let air = store
                .air_daily_averages_in_box(&bbox, air_start, today)
                .await?;
            let hospitals = store
                .hospital_for_coords_range(*lat, *lon, radius_km, hospital_start, today)
                .await?;
            let zips = store.distinct_zips_in_box(&bbox).await?;
            let resolved_zip = store.first_zip_near(*lat, *lon).await?;
            (air, hospitals, zips, resolved_zip)
        }
        Location::Zip(zip) => {
            let air = store.air_daily_averages_for_zip(zip, air_start, today).await?;
            let hospitals = store
                .hospital_for_zip_range(zip, hospital_start, today)
                .await?;
            (air, hospitals, vec![zip.clone()], Some(zip.clone()))
        }
    };

    // "auto" (or nothing) derives the region from nearby hospital states.
    let flu_region = match params.region.as_deref() {
        Some(region) if !region.is_empty() && !region.eq_ignore_ascii_case("auto") => {
            region.to_lowercase()
        }
        _ => detect_flu_region(store, &zips).await?,
    };
    let flu = store.flu_for_range(&flu_region, flu_start, today).await?;

    let fda = store
        .fda_for_range(fda_start, today, params.state.as_deref(), FDA_DISPLAY_LIMIT)
        .await?;

    let mut flu_regions = store.distinct_flu_regions().await?;
    if flu_regions.is_empty() {
        flu_regions = vec!["nat".to_string()];
    }
    let fda_states = store.distinct_fda_states().await?;

    let map_center = match &location {
        Location::Coords { lat, lon } => [*lon, *lat],
        Location::Zip(zip) => match store.first_coords_for_zip(zip).await? {
            Some((lat, lon)) => [lon, lat],
            None => DEFAULT_MAP_CENTER,
        },
    };

    let hospital_markers = store
        .hospital_markers_for_zips(&zips, MARKER_LIMIT)
        .await?
        .into_iter()
        .map(MarkerView::from)
        .collect();

    Ok(DashboardView {
        resolved_zip,
        flu_region,
        flu,
        flu_regions,
        hospitals,
        hospital_markers,
        fda,
        fda_states,
        air_daily: air_daily.into_iter().map(AirDailyView::from).collect(),
        map_center,
        window: WindowView {
            weeks,
            hospital_days,
            fda_days,
            openaq_days,
        },
    })
}

/// Region auto-detection: the state of a hospital in the location's zip
/// neighborhood, lowercased to match FluView region codes; national scope
/// when nothing matches.
async fn detect_flu_region(store: &Store, zips: &[String]) -> Result<String, DashboardError> {
    let states = store.hospital_states_for_zips(zips).await?;
    Ok(states
        .first()
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "nat".to_string()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsParams {
    pub source: String,
    pub hours: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PULSE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://pulse.db".to_string());
    let store = Store::connect(&database_url).await?;
    store.init_schema().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState { store })).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DashboardParams>,
) -> Result<Json<DashboardView>, DashboardError> {
    let view = build_dashboard(&state.store, &params).await?;
    Ok(Json(view))
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<IngestionRunRecord>>, DashboardError> {
    let hours = params.hours.filter(|h| *h > 0).unwrap_or(24);
    let runs = state.store.recent_runs(&params.source, hours).await?;
    Ok(Json(runs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use pulse_core::AirQualityHourlyRollup;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Store) {
        let store = Store::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let app = app(AppState {
            store: store.clone(),
        });
        (app, store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    fn air_row(zip: &str, lat: f64, lon: f64) -> AirQualityHourlyRollup {
        AirQualityHourlyRollup {
            location_id: 2178,
            measurement_date: Utc::now().date_naive(),
            measurement_hour: 12,
            latitude: Some(lat),
            longitude: Some(lon),
            zip_code: Some(zip.to_string()),
            pm25_value: Some(12.5),
            pm25_unit: Some("µg/m³".to_string()),
            o3_value: Some(0.031),
            o3_unit: Some("ppm".to_string()),
            last_updated: Utc::now(),
        }
    }

    fn hospital_row(pk: &str, zip: &str, state: &str) -> HospitalCapacityDailyRollup {
        HospitalCapacityDailyRollup {
            hospital_pk: pk.to_string(),
            collection_date: Utc::now().date_naive(),
            state: Some(state.to_string()),
            zip_code: Some(zip.to_string()),
            total_beds: Some(200),
            occupied_beds: Some(150),
            icu_beds: Some(20),
            icu_occupied: Some(12),
            covid_patients: Some(5),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn window_clamping_defaults_and_honors_in_range() {
        assert_eq!(clamp_weeks(None), DEFAULT_FLU_WEEKS);
        assert_eq!(clamp_weeks(Some(0)), DEFAULT_FLU_WEEKS);
        assert_eq!(clamp_weeks(Some(9999)), DEFAULT_FLU_WEEKS);
        assert_eq!(clamp_weeks(Some(45)), 45);
        assert_eq!(clamp_weeks(Some(52)), 52);

        assert_eq!(clamp_days(None), DEFAULT_WINDOW_DAYS);
        assert_eq!(clamp_days(Some(-1)), DEFAULT_WINDOW_DAYS);
        assert_eq!(clamp_days(Some(366)), DEFAULT_WINDOW_DAYS);
        assert_eq!(clamp_days(Some(365)), 365);
        assert_eq!(clamp_days(Some(45)), 45);
    }

    #[test]
    fn location_resolution_prefers_coordinates() {
        let params = DashboardParams {
            zip_code: Some("20850".to_string()),
            lat: Some(39.0),
            lon: Some(-77.0),
            ..Default::default()
        };
        assert_eq!(
            resolve_location(&params).unwrap(),
            Location::Coords {
                lat: 39.0,
                lon: -77.0
            }
        );
    }

    #[tokio::test]
    async fn invalid_zip_is_a_400_with_actionable_message() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(app, "/dashboard?zip_code=abc12").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("five digits"));
    }

    #[tokio::test]
    async fn out_of_range_coordinates_are_a_400() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(app, "/dashboard?lat=95.0&lon=-77.0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("lat"));
    }

    #[tokio::test]
    async fn missing_location_is_a_400() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(app, "/dashboard").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("zip_code"));
    }

    #[tokio::test]
    async fn empty_database_renders_an_empty_dashboard() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(app, "/dashboard?zip_code=20850").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flu_region"], "nat");
        assert_eq!(body["flu"].as_array().unwrap().len(), 0);
        assert_eq!(body["flu_regions"], serde_json::json!(["nat"]));
        assert_eq!(body["hospitals"].as_array().unwrap().len(), 0);
        assert_eq!(body["map_center"], serde_json::json!([-98.5795, 39.8283]));
        assert_eq!(body["resolved_zip"], "20850");
        assert_eq!(body["window"]["weeks"], 12);
        assert_eq!(body["window"]["hospital_days"], 30);
        assert_eq!(body["window"]["fda_days"], 30);
        assert_eq!(body["window"]["openaq_days"], 30);
    }

    #[tokio::test]
    async fn day_windows_are_clamped_independently() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(
            app,
            "/dashboard?zip_code=20850&hospital_days=45&fda_days=0&openaq_days=9999",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window"]["hospital_days"], 45);
        assert_eq!(body["window"]["fda_days"], 30);
        assert_eq!(body["window"]["openaq_days"], 30);
    }

    #[tokio::test]
    async fn coordinate_dashboard_detects_region_and_centers_map() {
        let (app, store) = test_app().await;
        store.upsert_air(&air_row("20850", 39.03, -77.05)).await.unwrap();
        store
            .upsert_hospital(&hospital_row("100075", "20850", "MD"))
            .await
            .unwrap();

        let (status, body) = get_json(app, "/dashboard?lat=39.0&lon=-77.0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flu_region"], "md");
        assert_eq!(body["resolved_zip"], "20850");
        assert_eq!(body["hospitals"].as_array().unwrap().len(), 1);
        assert_eq!(body["hospital_markers"].as_array().unwrap().len(), 1);
        assert_eq!(body["hospital_markers"][0]["hospital_pk"], "100075");
        assert_eq!(body["map_center"], serde_json::json!([-77.0, 39.0]));
        assert_eq!(body["air_daily"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn region_auto_detects_instead_of_filtering_literally() {
        let (app, store) = test_app().await;
        store.upsert_air(&air_row("20850", 39.03, -77.05)).await.unwrap();
        store
            .upsert_hospital(&hospital_row("100075", "20850", "MD"))
            .await
            .unwrap();

        let (status, body) =
            get_json(app.clone(), "/dashboard?lat=39.0&lon=-77.0&region=auto").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flu_region"], "md");

        // An explicit region is still honored as given.
        let (status, body) = get_json(app, "/dashboard?lat=39.0&lon=-77.0&region=CA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flu_region"], "ca");
    }

    #[tokio::test]
    async fn zip_dashboard_centers_on_observed_coordinates() {
        let (app, store) = test_app().await;
        store.upsert_air(&air_row("20850", 39.03, -77.05)).await.unwrap();

        let (status, body) = get_json(app, "/dashboard?zip_code=20850").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["map_center"], serde_json::json!([-77.05, 39.03]));
        assert_eq!(body["air_daily"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runs_endpoint_lists_recent_history() {
        let (app, store) = test_app().await;
        store
            .insert_run_record(&pulse_core::IngestionRunRecord {
                source_name: "delphi_fluview".to_string(),
                job_run_at: Utc::now(),
                status: pulse_core::RunStatus::Success,
                records_processed: 12,
                records_inserted: 10,
                records_updated: 2,
                error_message: None,
                duration_ms: 840,
            })
            .await
            .unwrap();

        let (status, body) = get_json(app, "/runs?source=delphi_fluview").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["status"], "success");
        assert_eq!(body[0]["records_processed"], 12);
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let (app, _store) = test_app().await;
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
