use axum::{
    Router,
    extract::{Json, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Datelike, NaiveDate, Utc};
use clap::Args;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::core::{
    ConstantRate, DynamicWithdrawal, EngineError, HistoricalSeries, LifeExpectancy,
    MarketHistory, MonthlyDelta, PartialPortfolio, Person, Plan, Portfolio, RawStage,
    RedistributionFrequency, SeriesPoint, SimulationHost, SimulationOutput, SimulationRequest,
    SimulationSettings, WithdrawalScheme, monthly_multipliers_from_prices, run_simulation,
    unroll_plan,
};

#[derive(Args, Clone, Copy, Debug)]
pub struct SettingsArgs {
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Percentile cut off each tail of the bands (0-50)"
    )]
    pub percentile_tail: f64,
    #[arg(long, default_value_t = 3, help = "Number of percentile bands (>= 2)")]
    pub band_resolution: usize,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "Standard deviations of life expectancy covered by the default horizon"
    )]
    pub horizon_standard_deviations: f64,
    #[arg(long, help = "Return every simulated cycle")]
    pub include_cycles: bool,
}

impl From<SettingsArgs> for SimulationSettings {
    fn from(value: SettingsArgs) -> Self {
        Self {
            percentile_tail: value.percentile_tail,
            band_resolution: value.band_resolution,
            horizon_standard_deviations: value.horizon_standard_deviations,
            include_cycles: value.include_cycles,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    people: Vec<ApiPerson>,
    stages: Option<Vec<ApiStage>>,
    plans: Option<BTreeMap<String, ApiPlan>>,
    selected_plan_id: Option<String>,
    initial_portfolio: Option<ApiPortfolio>,
    deltas: Option<Vec<ApiMonthlyDelta>>,
    history: Option<ApiHistory>,

    current_year: Option<i32>,
    start_year: Option<i32>,
    end_year: Option<i32>,

    percentile_tail: Option<f64>,
    band_resolution: Option<usize>,
    horizon_standard_deviations: Option<f64>,
    include_cycles: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPerson {
    id: String,
    #[serde(default)]
    name: String,
    date_of_birth: NaiveDate,
    life_expectancy: ApiLifeExpectancy,
}

#[derive(Copy, Clone, Debug, Deserialize)]
struct ApiLifeExpectancy {
    mean: f64,
    #[serde(default)]
    variance: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiPlan {
    name: String,
    inherits_from: Option<String>,
    stages: Option<Vec<ApiStage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiStage {
    id: String,
    name: String,
    end_year: Option<i32>,
    income_by_person: Option<BTreeMap<String, f64>>,
    withdrawal: Option<ApiWithdrawalScheme>,
    allocation: Option<ApiPartialPortfolio>,
    redistribution_frequency: Option<ApiRedistribution>,
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ApiWithdrawalScheme {
    #[serde(rename_all = "camelCase", alias = "fixed")]
    Constant {
        initial_rate: Option<f64>,
        target_percentage: Option<f64>,
    },
    #[serde(rename_all = "camelCase", alias = "guardrails", alias = "guyton-klinger")]
    Dynamic {
        target_percentage: f64,
        threshold_percentage: Option<f64>,
        adjustment_percentage: Option<f64>,
        #[serde(default)]
        minimum_rate: f64,
    },
}

impl TryFrom<ApiWithdrawalScheme> for WithdrawalScheme {
    type Error = String;

    fn try_from(value: ApiWithdrawalScheme) -> Result<Self, Self::Error> {
        match value {
            ApiWithdrawalScheme::Constant {
                initial_rate: Some(rate),
                target_percentage: None,
            } => Ok(WithdrawalScheme::Constant(ConstantRate::Fixed(rate))),
            ApiWithdrawalScheme::Constant {
                initial_rate: None,
                target_percentage: Some(percentage),
            } => Ok(WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(
                percentage,
            ))),
            ApiWithdrawalScheme::Constant {
                initial_rate: None,
                target_percentage: None,
            } => Ok(WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(0.0))),
            ApiWithdrawalScheme::Constant { .. } => Err(
                "constant withdrawal needs exactly one of initialRate or targetPercentage"
                    .to_string(),
            ),
            ApiWithdrawalScheme::Dynamic {
                target_percentage,
                threshold_percentage,
                adjustment_percentage,
                minimum_rate,
            } => Ok(WithdrawalScheme::Dynamic(DynamicWithdrawal {
                target_percentage,
                threshold_percentage: threshold_percentage.unwrap_or(f64::INFINITY),
                adjustment_percentage: adjustment_percentage.unwrap_or(f64::INFINITY),
                minimum_rate,
            })),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(untagged)]
enum ApiRedistribution {
    Months(u32),
    Named(ApiRedistributionName),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiRedistributionName {
    Never,
    Monthly,
    Quarterly,
    #[serde(alias = "annually", alias = "annual")]
    Yearly,
}

impl From<ApiRedistribution> for RedistributionFrequency {
    fn from(value: ApiRedistribution) -> Self {
        match value {
            ApiRedistribution::Months(months) => RedistributionFrequency::EveryMonths(months),
            ApiRedistribution::Named(ApiRedistributionName::Never) => {
                RedistributionFrequency::Never
            }
            ApiRedistribution::Named(ApiRedistributionName::Monthly) => {
                RedistributionFrequency::EveryMonths(1)
            }
            ApiRedistribution::Named(ApiRedistributionName::Quarterly) => {
                RedistributionFrequency::EveryMonths(3)
            }
            ApiRedistribution::Named(ApiRedistributionName::Yearly) => {
                RedistributionFrequency::EveryMonths(12)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct ApiPortfolio {
    cash: f64,
    bonds: f64,
    stocks: f64,
    crypto: f64,
}

impl From<ApiPortfolio> for Portfolio {
    fn from(value: ApiPortfolio) -> Self {
        Portfolio::new(value.cash, value.bonds, value.stocks, value.crypto)
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct ApiPartialPortfolio {
    cash: Option<f64>,
    bonds: Option<f64>,
    stocks: Option<f64>,
    crypto: Option<f64>,
}

impl From<ApiPartialPortfolio> for PartialPortfolio {
    fn from(value: ApiPartialPortfolio) -> Self {
        PartialPortfolio {
            cash: value.cash,
            bonds: value.bonds,
            stocks: value.stocks,
            crypto: value.crypto,
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
struct ApiMonthlyDelta {
    inflation: f64,
    cash: f64,
    bonds: f64,
    stocks: f64,
    crypto: f64,
}

impl From<ApiMonthlyDelta> for MonthlyDelta {
    fn from(value: ApiMonthlyDelta) -> Self {
        MonthlyDelta {
            inflation: value.inflation,
            cash: value.cash,
            bonds: value.bonds,
            stocks: value.stocks,
            crypto: value.crypto,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiHistory {
    inflation: ApiSeries,
    cash: ApiSeries,
    bonds: ApiSeries,
    stocks: ApiSeries,
    crypto: ApiSeries,
}

#[derive(Debug, Deserialize)]
struct ApiSeries {
    #[serde(default)]
    kind: ApiSeriesKind,
    points: Vec<ApiSeriesPoint>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiSeriesKind {
    #[default]
    #[serde(alias = "multiplier")]
    Multipliers,
    #[serde(alias = "price")]
    Prices,
}

#[derive(Copy, Clone, Debug, Deserialize)]
struct ApiSeriesPoint {
    date: NaiveDate,
    value: f64,
}

#[derive(Debug)]
struct ApiRequest {
    request: SimulationRequest,
    current_year: i32,
    selected_plan_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse<'a> {
    current_year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_plan_id: Option<&'a str>,
    #[serde(flatten)]
    simulation: &'a SimulationOutput,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Clone)]
struct AppState {
    host: SimulationHost,
    defaults: SimulationSettings,
}

pub async fn run_http_server(
    port: u16,
    throttle: Duration,
    defaults: SimulationSettings,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState {
        host: SimulationHost::new(throttle),
        defaults,
    };
    let app = Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("runway HTTP API listening on http://{addr}");
    info!("requests are throttled by {}ms", throttle.as_millis());

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    let api_request = match api_request_from_payload(payload, state.defaults) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match state
        .host
        .run_latest(api_request.request, api_request.current_year)
        .await
    {
        Ok(Some(output)) => json_response(
            StatusCode::OK,
            SimulateResponse {
                current_year: api_request.current_year,
                selected_plan_id: api_request.selected_plan_id.as_deref(),
                simulation: &output,
            },
        ),
        Ok(None) => error_response(StatusCode::CONFLICT, &EngineError::Superseded.to_string()),
        Err(err) => {
            warn!("simulation rejected: {err}");
            error_response(status_for(&err), &err.to_string())
        }
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Superseded => StatusCode::CONFLICT,
        err if err.is_configuration_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

pub fn simulate_json(json: &str, defaults: SimulationSettings) -> Result<String, String> {
    let api_request = api_request_from_json(json, defaults)?;
    let output = run_simulation(&api_request.request, api_request.current_year)
        .map_err(|e| e.to_string())?;
    let response = SimulateResponse {
        current_year: api_request.current_year,
        selected_plan_id: api_request.selected_plan_id.as_deref(),
        simulation: &output,
    };
    serde_json::to_string_pretty(&response).map_err(|e| format!("Failed to encode response: {e}"))
}

fn api_request_from_json(json: &str, defaults: SimulationSettings) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload, defaults)
}

fn api_request_from_payload(
    payload: SimulatePayload,
    defaults: SimulationSettings,
) -> Result<ApiRequest, String> {
    let mut settings = defaults;
    if let Some(v) = payload.percentile_tail {
        settings.percentile_tail = v;
    }
    if let Some(v) = payload.band_resolution {
        settings.band_resolution = v;
    }
    if let Some(v) = payload.horizon_standard_deviations {
        settings.horizon_standard_deviations = v;
    }
    if let Some(v) = payload.include_cycles {
        settings.include_cycles = v;
    }

    let current_year = payload.current_year.unwrap_or_else(|| Utc::now().year());
    let start_year = payload.start_year.unwrap_or(current_year);

    let people = build_people(payload.people)?;

    let selected_plan_id = payload.selected_plan_id;
    let stages = match (payload.stages, payload.plans) {
        (Some(_), Some(_)) => return Err("use either stages or plans, not both".to_string()),
        (Some(stages), None) => build_stages(stages, "stages")?,
        (None, Some(plans)) => {
            let plan_id = selected_plan_id
                .as_deref()
                .ok_or_else(|| "selectedPlanId is required with plans".to_string())?;
            let plans = build_plans(plans)?;
            unroll_plan(&plans, plan_id).map_err(|e| e.to_string())?
        }
        (None, None) => return Err("stages or plans is required".to_string()),
    };

    let initial_portfolio = payload
        .initial_portfolio
        .ok_or_else(|| "initialPortfolio is required".to_string())?
        .into();

    let history = match (payload.deltas, payload.history) {
        (Some(_), Some(_)) => return Err("use either deltas or history, not both".to_string()),
        (Some(deltas), None) => {
            MarketHistory::Deltas(deltas.into_iter().map(MonthlyDelta::from).collect())
        }
        (None, Some(history)) => MarketHistory::Series(build_history(history)?),
        (None, None) => return Err("deltas or history is required".to_string()),
    };

    Ok(ApiRequest {
        request: SimulationRequest {
            people,
            stages,
            initial_portfolio,
            history,
            start_year,
            end_year: payload.end_year,
            settings,
        },
        current_year,
        selected_plan_id,
    })
}

fn build_people(people: Vec<ApiPerson>) -> Result<Vec<Person>, String> {
    people
        .into_iter()
        .enumerate()
        .map(|(idx, person)| {
            let life = person.life_expectancy;
            if !life.mean.is_finite() || life.mean <= 0.0 {
                return Err(format!("people[{idx}].lifeExpectancy.mean must be > 0"));
            }
            if !life.variance.is_finite() || life.variance < 0.0 {
                return Err(format!(
                    "people[{idx}].lifeExpectancy.variance must be >= 0"
                ));
            }
            Ok(Person {
                id: person.id,
                name: person.name,
                date_of_birth: person.date_of_birth,
                life_expectancy: LifeExpectancy {
                    mean: life.mean,
                    variance: life.variance,
                },
            })
        })
        .collect()
}

fn build_stages(stages: Vec<ApiStage>, field: &str) -> Result<Vec<RawStage>, String> {
    stages
        .into_iter()
        .enumerate()
        .map(|(idx, stage)| {
            let withdrawal = stage
                .withdrawal
                .map(WithdrawalScheme::try_from)
                .transpose()
                .map_err(|e| format!("{field}[{idx}].withdrawal: {e}"))?;
            Ok(RawStage {
                id: stage.id,
                name: stage.name,
                end_year: stage.end_year,
                income_by_person: stage.income_by_person,
                withdrawal,
                allocation: stage.allocation.map(PartialPortfolio::from),
                redistribution_frequency: stage.redistribution_frequency.map(Into::into),
            })
        })
        .collect()
}

fn build_plans(plans: BTreeMap<String, ApiPlan>) -> Result<BTreeMap<String, Plan>, String> {
    plans
        .into_iter()
        .map(|(id, plan)| {
            let stages = plan
                .stages
                .map(|stages| build_stages(stages, &format!("plans.{id}.stages")))
                .transpose()?;
            let plan = Plan {
                name: plan.name,
                inherits_from: plan.inherits_from,
                stages,
            };
            Ok((id, plan))
        })
        .collect()
}

fn build_history(history: ApiHistory) -> Result<HistoricalSeries, String> {
    Ok(HistoricalSeries {
        inflation: build_series(history.inflation, "history.inflation")?,
        cash: build_series(history.cash, "history.cash")?,
        bonds: build_series(history.bonds, "history.bonds")?,
        stocks: build_series(history.stocks, "history.stocks")?,
        crypto: build_series(history.crypto, "history.crypto")?,
    })
}

fn build_series(series: ApiSeries, field: &str) -> Result<Vec<SeriesPoint>, String> {
    let points: Vec<SeriesPoint> = series
        .points
        .into_iter()
        .map(|point| SeriesPoint::new(point.date, point.value))
        .collect();
    match series.kind {
        ApiSeriesKind::Multipliers => Ok(points),
        ApiSeriesKind::Prices => {
            monthly_multipliers_from_prices(&points).map_err(|e| format!("{field}: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn flat_deltas_json(months: usize) -> String {
        let delta = r#"{"inflation":1,"cash":1,"bonds":1,"stocks":1,"crypto":1}"#;
        format!("[{}]", vec![delta; months].join(","))
    }

    fn minimal_json(extra: &str) -> String {
        format!(
            r#"{{
              "currentYear": 2025,
              "endYear": 2027,
              "people": [
                {{ "id": "alice", "name": "Alice", "dateOfBirth": "1960-04-01",
                   "lifeExpectancy": {{ "mean": 84, "variance": 6 }} }}
              ],
              "stages": [
                {{ "id": "retired", "name": "Retired",
                   "incomeByPerson": {{ "alice": 0 }},
                   "withdrawal": {{ "type": "constant", "initialRate": 12000 }},
                   "allocation": {{ "cash": 1, "bonds": 0, "stocks": 0, "crypto": 0 }},
                   "redistributionFrequency": "never" }}
              ],
              "initialPortfolio": {{ "cash": 100000 }},
              "deltas": {}
              {extra}
            }}"#,
            flat_deltas_json(36)
        )
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let json = r#"{
          "currentYear": 2025,
          "startYear": 2026,
          "people": [
            { "id": "bob", "dateOfBirth": "1970-02-03",
              "lifeExpectancy": { "mean": 82.5, "variance": 7 } }
          ],
          "stages": [
            { "id": "work", "endYear": 2030,
              "incomeByPerson": { "bob": 40000 },
              "withdrawal": { "type": "dynamic", "targetPercentage": 4,
                              "adjustmentPercentage": 10, "minimumRate": 20000 },
              "allocation": { "cash": 0.1, "bonds": 0.3, "stocks": 0.6, "crypto": 0 },
              "redistributionFrequency": "quarterly" },
            { "id": "retire",
              "incomeByPerson": { "bob": 0 },
              "withdrawal": { "type": "guardrails", "targetPercentage": 4,
                              "thresholdPercentage": 20, "adjustmentPercentage": 10 },
              "redistributionFrequency": 6 }
          ],
          "initialPortfolio": { "cash": 5000, "stocks": 250000 },
          "deltas": [ { "inflation": 1.002, "cash": 1.001, "bonds": 1.003, "stocks": 1.01, "crypto": 1.2 } ],
          "percentileTail": 10,
          "includeCycles": true
        }"#;
        let api_request =
            api_request_from_json(json, SimulationSettings::default()).expect("json should parse");
        let request = api_request.request;

        assert_eq!(api_request.current_year, 2025);
        assert_eq!(request.start_year, 2026);
        assert_eq!(request.end_year, None);
        assert_eq!(request.people[0].birth_year(), 1970);
        assert_approx(request.people[0].life_expectancy.mean, 82.5);
        assert_eq!(request.people[0].name, "");
        assert_approx(request.initial_portfolio.stocks, 250_000.0);
        assert_approx(request.initial_portfolio.bonds, 0.0);

        let work = &request.stages[0];
        assert_eq!(work.end_year, Some(2030));
        assert_eq!(
            work.redistribution_frequency,
            Some(RedistributionFrequency::EveryMonths(3))
        );
        assert_eq!(
            work.withdrawal,
            Some(WithdrawalScheme::Dynamic(DynamicWithdrawal {
                target_percentage: 4.0,
                threshold_percentage: f64::INFINITY,
                adjustment_percentage: 10.0,
                minimum_rate: 20_000.0,
            }))
        );
        let retire = &request.stages[1];
        assert_eq!(retire.allocation, None);
        assert_eq!(
            retire.redistribution_frequency,
            Some(RedistributionFrequency::EveryMonths(6))
        );

        match &request.history {
            MarketHistory::Deltas(deltas) => assert_approx(deltas[0].crypto, 1.2),
            other => panic!("expected deltas, got {other:?}"),
        }
        assert_approx(request.settings.percentile_tail, 10.0);
        assert_eq!(request.settings.band_resolution, 3);
        assert!(request.settings.include_cycles);
    }

    #[test]
    fn payload_settings_override_defaults() {
        let defaults = SimulationSettings {
            percentile_tail: 1.0,
            band_resolution: 7,
            horizon_standard_deviations: 3.0,
            include_cycles: false,
        };
        let api_request = api_request_from_json(&minimal_json(r#", "bandResolution": 5"#), defaults)
            .expect("json should parse");
        let settings = api_request.request.settings;
        assert_approx(settings.percentile_tail, 1.0);
        assert_eq!(settings.band_resolution, 5);
        assert_approx(settings.horizon_standard_deviations, 3.0);
    }

    #[test]
    fn plans_are_unrolled_through_inheritance() {
        let json = format!(
            r#"{{
              "currentYear": 2025,
              "plans": {{
                "base": {{ "name": "Base", "stages": [
                  {{ "id": "retired",
                     "withdrawal": {{ "type": "constant", "targetPercentage": 4 }},
                     "allocation": {{ "cash": 1, "bonds": 0, "stocks": 0, "crypto": 0 }},
                     "redistributionFrequency": "yearly" }}
                ] }},
                "variant": {{ "name": "Variant", "inheritsFrom": "base" }}
              }},
              "selectedPlanId": "variant",
              "initialPortfolio": {{ "cash": 1000 }},
              "deltas": {}
            }}"#,
            flat_deltas_json(12)
        );
        let api_request =
            api_request_from_json(&json, SimulationSettings::default()).expect("json should parse");
        assert_eq!(api_request.selected_plan_id.as_deref(), Some("variant"));
        assert_eq!(api_request.request.stages.len(), 1);
        assert_eq!(
            api_request.request.stages[0].withdrawal,
            Some(WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(
                4.0
            )))
        );
    }

    #[test]
    fn plans_require_a_selected_plan() {
        let json = r#"{ "plans": {}, "initialPortfolio": {}, "deltas": [] }"#;
        let err = api_request_from_json(json, SimulationSettings::default())
            .expect_err("must require selectedPlanId");
        assert!(err.contains("selectedPlanId"));
    }

    #[test]
    fn rejects_conflicting_sources() {
        let err = api_request_from_json(&minimal_json(r#", "plans": {}"#), SimulationSettings::default())
            .expect_err("must reject stages with plans");
        assert!(err.contains("stages or plans"));

        let history = r#", "history": {
            "inflation": { "points": [] }, "cash": { "points": [] }, "bonds": { "points": [] },
            "stocks": { "points": [] }, "crypto": { "points": [] } }"#;
        let err = api_request_from_json(&minimal_json(history), SimulationSettings::default())
            .expect_err("must reject deltas with history");
        assert!(err.contains("deltas or history"));
    }

    #[test]
    fn rejects_missing_portfolio_and_bad_people() {
        let json = r#"{ "stages": [], "deltas": [] }"#;
        let err = api_request_from_json(json, SimulationSettings::default())
            .expect_err("must require initialPortfolio");
        assert!(err.contains("initialPortfolio"));

        let json = r#"{
          "people": [ { "id": "a", "dateOfBirth": "1980-01-01",
                        "lifeExpectancy": { "mean": 80, "variance": -1 } } ],
          "stages": [], "initialPortfolio": {}, "deltas": []
        }"#;
        let err = api_request_from_json(json, SimulationSettings::default())
            .expect_err("must reject negative variance");
        assert!(err.contains("people[0].lifeExpectancy.variance"));
    }

    #[test]
    fn omitted_scheme_fields_fall_back() {
        let dynamic: ApiWithdrawalScheme =
            serde_json::from_str(r#"{ "type": "dynamic", "targetPercentage": 4 }"#)
                .expect("dynamic scheme should parse");
        assert_eq!(
            WithdrawalScheme::try_from(dynamic),
            Ok(WithdrawalScheme::Dynamic(DynamicWithdrawal {
                target_percentage: 4.0,
                threshold_percentage: f64::INFINITY,
                adjustment_percentage: f64::INFINITY,
                minimum_rate: 0.0,
            }))
        );

        let constant: ApiWithdrawalScheme = serde_json::from_str(r#"{ "type": "constant" }"#)
            .expect("constant scheme should parse");
        assert_eq!(
            WithdrawalScheme::try_from(constant),
            Ok(WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(0.0)))
        );
    }

    #[test]
    fn rejects_ambiguous_constant_withdrawal() {
        let json = r#"{
          "stages": [ { "id": "s", "withdrawal": { "type": "constant", "initialRate": 1, "targetPercentage": 4 } } ],
          "initialPortfolio": {}, "deltas": []
        }"#;
        let err = api_request_from_json(json, SimulationSettings::default())
            .expect_err("must reject ambiguous scheme");
        assert!(err.contains("stages[0].withdrawal"));
    }

    #[test]
    fn price_series_become_monthly_multipliers() {
        let series = ApiSeries {
            kind: ApiSeriesKind::Prices,
            points: vec![
                ApiSeriesPoint {
                    date: NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date"),
                    value: 200.0,
                },
                ApiSeriesPoint {
                    date: NaiveDate::from_ymd_opt(2020, 2, 1).expect("valid date"),
                    value: 250.0,
                },
            ],
        };
        let points = build_series(series, "history.crypto").expect("ordered prices");
        assert_eq!(points.len(), 1);
        assert_approx(points[0].value, 1.25);
    }

    #[test]
    fn simulate_json_returns_aggregate_without_cycles_by_default() {
        let json = simulate_json(&minimal_json(""), SimulationSettings::default())
            .expect("simulation should run");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(value["currentYear"], 2025);
        assert_eq!(value["startYear"], 2025);
        assert_eq!(value["endYear"], 2027);
        assert_eq!(value["monthsPerCycle"], 24);
        assert_eq!(value["cycleCount"], 13);
        assert!(value.get("cycles").is_none());
        assert!(value.get("selectedPlanId").is_none());
        assert_eq!(value["aggregate"]["percentiles"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["aggregate"]["bands"].as_array().map(Vec::len), Some(25));
        let success = value["aggregate"]["successProbability"]
            .as_f64()
            .expect("numeric success probability");
        assert_approx(success, 1.0);
    }

    #[test]
    fn simulate_json_reports_engine_errors() {
        let err = simulate_json(&minimal_json(r#", "percentileTail": 60"#), SimulationSettings::default())
            .expect_err("must reject percentile tail");
        assert!(err.contains("percentileTail"));
    }

    #[test]
    fn engine_errors_map_to_status_codes() {
        assert_eq!(status_for(&EngineError::Superseded), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::WorkerFailed("panicked".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&EngineError::InsufficientHistory {
                available: 1,
                required: 12
            }),
            StatusCode::BAD_REQUEST
        );
    }
}
