use std::borrow::Cow;

use log::{debug, info};
use serde::Serialize;

use super::aggregate::{aggregate_cycles, band_percentiles, horizon_end_year};
use super::engine::{CyclePlan, generate_cycles, simulate_cycle, validate_deltas, validate_portfolio};
use super::error::EngineError;
use super::history::{HistoricalSeries, align_trailing, build_monthly_deltas};
use super::stages::{active_stages, resolve_stages};
use super::types::{AggregateResult, Cycle, MonthlyDelta, Person, Portfolio, RawStage};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulationSettings {
    pub percentile_tail: f64,
    pub band_resolution: usize,
    pub horizon_standard_deviations: f64,
    pub include_cycles: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            percentile_tail: 5.0,
            band_resolution: 3,
            horizon_standard_deviations: 2.0,
            include_cycles: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MarketHistory {
    Deltas(Vec<MonthlyDelta>),
    Series(HistoricalSeries),
}

impl MarketHistory {
    pub fn monthly_deltas(&self) -> Result<Cow<'_, [MonthlyDelta]>, EngineError> {
        match self {
            MarketHistory::Deltas(deltas) => Ok(Cow::Borrowed(deltas.as_slice())),
            MarketHistory::Series(series) => {
                let aligned = align_trailing(series)?;
                Ok(Cow::Owned(build_monthly_deltas(&aligned)?))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationRequest {
    pub people: Vec<Person>,
    pub stages: Vec<RawStage>,
    pub initial_portfolio: Portfolio,
    pub history: MarketHistory,
    pub start_year: i32,
    pub end_year: Option<i32>,
    pub settings: SimulationSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub start_year: i32,
    pub end_year: i32,
    pub months_per_cycle: usize,
    pub cycle_count: usize,
    pub aggregate: AggregateResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycles: Option<Vec<Cycle>>,
}

pub fn run_simulation(
    request: &SimulationRequest,
    current_year: i32,
) -> Result<SimulationOutput, EngineError> {
    run_simulation_cancellable(request, current_year, &|| false)
}

/// Same as [`run_simulation`], but gives up with [`EngineError::Superseded`] as
/// soon as `is_stale` reports that nobody is waiting for the result anymore.
pub fn run_simulation_cancellable(
    request: &SimulationRequest,
    current_year: i32,
    is_stale: &(dyn Fn() -> bool + Sync),
) -> Result<SimulationOutput, EngineError> {
    let settings = &request.settings;
    band_percentiles(settings.percentile_tail, settings.band_resolution)?;
    if !settings.horizon_standard_deviations.is_finite() || settings.horizon_standard_deviations < 0.0
    {
        return Err(EngineError::InvalidHorizon(format!(
            "horizonStandardDeviations must be finite and >= 0, got {}",
            settings.horizon_standard_deviations
        )));
    }

    let resolved = resolve_stages(&request.stages)?;
    let stages = active_stages(&resolved, current_year);
    if stages.is_empty() {
        return Err(EngineError::InvalidStageSequence(format!(
            "every stage ended on or before {current_year}"
        )));
    }

    let end_year = request.end_year.unwrap_or_else(|| {
        horizon_end_year(
            &request.people,
            current_year,
            settings.horizon_standard_deviations,
        )
    });
    let plan = CyclePlan {
        start_year: request.start_year,
        end_year,
        initial_portfolio: request.initial_portfolio,
        stages: &stages,
    };
    let months_per_cycle = plan.months_per_cycle()?;

    validate_portfolio(&request.initial_portfolio)?;
    let deltas = request.history.monthly_deltas()?;
    validate_deltas(&deltas)?;
    debug!(
        "simulating {}..{} with {} active stages over {} months of history",
        plan.start_year,
        plan.end_year,
        stages.len(),
        deltas.len()
    );

    let cycles = generate_cycles(&deltas, months_per_cycle, |window| {
        if is_stale() {
            return Err(EngineError::Superseded);
        }
        simulate_cycle(&plan, window)
    })?;
    if is_stale() {
        return Err(EngineError::Superseded);
    }

    let aggregate = aggregate_cycles(
        &cycles,
        &request.people,
        request.start_year,
        settings.percentile_tail,
        settings.band_resolution,
    )?;
    info!(
        "simulated {} cycles for {}..{}, success probability {:.3}",
        cycles.len(),
        request.start_year,
        end_year,
        aggregate.success_probability
    );

    Ok(SimulationOutput {
        start_year: request.start_year,
        end_year,
        months_per_cycle,
        cycle_count: cycles.len(),
        aggregate,
        cycles: settings.include_cycles.then_some(cycles),
    })
}
