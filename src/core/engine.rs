use log::debug;
use rayon::prelude::*;

use super::error::EngineError;
use super::types::{Cycle, MonthlyDelta, Portfolio, ResolvedStage};
use super::withdrawal::evaluate_withdrawal;

const MONTHS_PER_YEAR: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct CyclePlan<'a> {
    pub start_year: i32,
    pub end_year: i32,
    pub initial_portfolio: Portfolio,
    pub stages: &'a [ResolvedStage],
}

impl CyclePlan<'_> {
    pub fn months_per_cycle(&self) -> Result<usize, EngineError> {
        if self.end_year <= self.start_year {
            return Err(EngineError::InvalidHorizon(format!(
                "end year {} must be after start year {}",
                self.end_year, self.start_year
            )));
        }
        let years = i64::from(self.end_year) - i64::from(self.start_year);
        usize::try_from(years)
            .ok()
            .and_then(|years| years.checked_mul(MONTHS_PER_YEAR))
            .ok_or_else(|| {
                EngineError::InvalidHorizon(format!(
                    "{} to {} spans too many months",
                    self.start_year, self.end_year
                ))
            })
    }
}

#[derive(Debug)]
struct CycleState {
    portfolio: Portfolio,
    cumulative_inflation: f64,
    previous_withdrawal: Option<f64>,
    samples: Vec<f64>,
}

impl CycleState {
    fn is_depleted(&self) -> bool {
        self.samples.last().is_some_and(|value| *value <= 0.0)
    }
}

/// Evolves the initial portfolio month by month over one window of deltas.
///
/// The returned cycle holds `deltas.len() + 1` samples: the initial total followed
/// by the total after each month. Once a month total reaches zero every later
/// sample is zero, even if a later stage would bring income in again.
pub fn simulate_cycle(plan: &CyclePlan<'_>, deltas: &[MonthlyDelta]) -> Result<Cycle, EngineError> {
    let months = plan.months_per_cycle()?;
    if deltas.len() != months {
        return Err(EngineError::DataAlignment(format!(
            "cycle from {} to {} needs {months} monthly deltas, got {}",
            plan.start_year,
            plan.end_year,
            deltas.len()
        )));
    }
    validate_deltas(deltas)?;
    validate_portfolio(&plan.initial_portfolio)?;

    if plan.stages.is_empty() {
        return Err(EngineError::InvalidStageSequence(
            "no active stages to simulate".to_string(),
        ));
    }

    let mut state = CycleState {
        portfolio: plan.initial_portfolio,
        cumulative_inflation: 1.0,
        previous_withdrawal: None,
        samples: Vec::with_capacity(months + 1),
    };
    state.samples.push(plan.initial_portfolio.total());

    let total_years = months / MONTHS_PER_YEAR;
    let mut year = 0_usize;

    for (idx, stage) in plan.stages.iter().enumerate() {
        // The final stage governs whatever remains of the horizon.
        let stage_end_year = if idx + 1 == plan.stages.len() {
            plan.end_year
        } else {
            stage.end_year.unwrap_or(plan.end_year).min(plan.end_year)
        };

        while year < total_years && plan.start_year + (year as i32) < stage_end_year {
            if state.is_depleted() {
                break;
            }
            let offset = year * MONTHS_PER_YEAR;
            run_year(
                stage,
                offset,
                &deltas[offset..offset + MONTHS_PER_YEAR],
                &mut state,
            );
            year += 1;
        }
    }

    state.samples.resize(months + 1, 0.0);
    Ok(Cycle {
        samples: state.samples,
    })
}

fn run_year(
    stage: &ResolvedStage,
    first_month_index: usize,
    year_deltas: &[MonthlyDelta],
    state: &mut CycleState,
) {
    let yearly_income = stage.yearly_income() * state.cumulative_inflation;
    let start_of_year_total = state.portfolio.total();
    let yearly_withdrawal = evaluate_withdrawal(
        state.previous_withdrawal,
        start_of_year_total,
        &stage.withdrawal,
        state.cumulative_inflation,
    );
    state.previous_withdrawal = Some(yearly_withdrawal);

    let monthly_net_adjustment = (yearly_income - yearly_withdrawal) / MONTHS_PER_YEAR as f64;

    for (month, delta) in year_deltas.iter().enumerate() {
        state.cumulative_inflation *= delta.inflation;
        let grown = state.portfolio.grown(delta);
        let month_total = (grown.total() + monthly_net_adjustment).max(0.0);

        state.portfolio = if month_total <= 0.0 {
            Portfolio::ZERO
        } else if stage
            .redistribution_frequency
            .is_due(first_month_index + month)
        {
            stage.allocation.scaled(month_total)
        } else {
            apply_waterfall(grown, -monthly_net_adjustment)
        };

        state.samples.push(month_total);
        if month_total <= 0.0 {
            break;
        }
    }
}

/// Draws `amount` from the buckets in priority order `cash -> bonds -> stocks -> crypto`,
/// never taking a bucket below zero. A negative amount is a surplus and is added to cash.
pub fn apply_waterfall(mut portfolio: Portfolio, amount: f64) -> Portfolio {
    if amount <= 0.0 {
        portfolio.cash -= amount;
        return portfolio;
    }

    let mut remaining = amount;
    for bucket in portfolio.buckets_mut() {
        if remaining <= 0.0 {
            break;
        }
        let drawn = remaining.min((*bucket).max(0.0));
        *bucket -= drawn;
        remaining -= drawn;
    }
    portfolio
}

pub fn generate_cycles<F>(
    deltas: &[MonthlyDelta],
    months_per_cycle: usize,
    simulate: F,
) -> Result<Vec<Cycle>, EngineError>
where
    F: Fn(&[MonthlyDelta]) -> Result<Cycle, EngineError> + Send + Sync,
{
    if months_per_cycle == 0 {
        return Err(EngineError::InvalidHorizon(
            "a cycle must span at least one month".to_string(),
        ));
    }
    if deltas.len() < months_per_cycle {
        return Err(EngineError::InsufficientHistory {
            available: deltas.len(),
            required: months_per_cycle,
        });
    }

    let cycles = deltas
        .par_windows(months_per_cycle)
        .map(simulate)
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        "generated {} cycles of {} months from {} months of history",
        cycles.len(),
        months_per_cycle,
        deltas.len()
    );
    Ok(cycles)
}

pub fn generate_plan_cycles(
    plan: &CyclePlan<'_>,
    deltas: &[MonthlyDelta],
) -> Result<Vec<Cycle>, EngineError> {
    let months = plan.months_per_cycle()?;
    generate_cycles(deltas, months, |window| simulate_cycle(plan, window))
}

pub fn validate_deltas(deltas: &[MonthlyDelta]) -> Result<(), EngineError> {
    if let Some((idx, _)) = deltas.iter().enumerate().find(|(_, delta)| {
        delta
            .factors()
            .iter()
            .any(|factor| !factor.is_finite() || *factor < 0.0)
    }) {
        return Err(EngineError::DataAlignment(format!(
            "monthly delta {idx} has a negative or non-finite multiplier"
        )));
    }
    Ok(())
}

pub fn validate_portfolio(portfolio: &Portfolio) -> Result<(), EngineError> {
    if portfolio
        .buckets()
        .iter()
        .any(|amount| !amount.is_finite() || *amount < 0.0)
    {
        return Err(EngineError::InvalidPortfolio(format!(
            "bucket amounts must be finite and >= 0, got {portfolio:?}"
        )));
    }
    Ok(())
}
