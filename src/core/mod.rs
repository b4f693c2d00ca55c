mod aggregate;
mod engine;
mod error;
mod history;
mod host;
mod simulation;
mod stages;
mod types;
mod withdrawal;

pub use aggregate::{
    aggregate_cycles, band_percentiles, cycle_success_weight, death_probability_by,
    horizon_end_year, percentile_bands, success_probability,
};
pub use engine::{
    CyclePlan, apply_waterfall, generate_cycles, generate_plan_cycles, simulate_cycle,
    validate_deltas, validate_portfolio,
};
pub use error::EngineError;
pub use history::{
    HistoricalSeries, SeriesPoint, align_trailing, build_monthly_deltas,
    monthly_multipliers_from_prices,
};
pub use host::{HostOutcome, HostResult, SimulationHost};
pub use simulation::{
    MarketHistory, SimulationOutput, SimulationRequest, SimulationSettings, run_simulation,
    run_simulation_cancellable,
};
pub use stages::{active_stages, finished_stages, resolve_stages, unroll_plan};
pub use types::{
    AggregateResult, ConstantRate, Cycle, DynamicWithdrawal, LifeExpectancy, MonthlyDelta,
    PartialPortfolio, Person, Plan, Portfolio, RawStage, RedistributionFrequency, ResolvedStage,
    WithdrawalScheme,
};
pub use withdrawal::{evaluate_withdrawal, validate_scheme};
