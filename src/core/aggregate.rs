use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};

use super::error::EngineError;
use super::types::{AggregateResult, Cycle, Person};

const MONTHS_PER_YEAR: f64 = 12.0;

pub fn band_percentiles(percentile_tail: f64, band_resolution: usize) -> Result<Vec<f64>, EngineError> {
    if !(0.0..=50.0).contains(&percentile_tail) {
        return Err(EngineError::InvalidAggregation(format!(
            "percentileTail must be between 0 and 50, got {percentile_tail}"
        )));
    }
    if band_resolution < 2 {
        return Err(EngineError::InvalidAggregation(format!(
            "bandResolution must be >= 2, got {band_resolution}"
        )));
    }

    let span = 100.0 - 2.0 * percentile_tail;
    let steps = (band_resolution - 1) as f64;
    Ok((0..band_resolution)
        .map(|k| percentile_tail + span * k as f64 / steps)
        .collect())
}

fn rank_index(percentile: f64, len: usize) -> usize {
    let rank = (percentile / 100.0 * (len - 1) as f64).floor() as usize;
    rank.min(len - 1)
}

pub fn percentile_bands(cycles: &[Cycle], percentiles: &[f64]) -> Result<Vec<Vec<f64>>, EngineError> {
    let Some(first) = cycles.first() else {
        return Ok(Vec::new());
    };
    let months = first.samples.len();
    if let Some(idx) = cycles.iter().position(|cycle| cycle.samples.len() != months) {
        return Err(EngineError::DataAlignment(format!(
            "cycle {idx} has {} samples, expected {months}",
            cycles[idx].samples.len()
        )));
    }

    Ok((0..months)
        .into_par_iter()
        .map(|month| {
            let mut values = cycles
                .iter()
                .map(|cycle| cycle.samples[month])
                .collect::<Vec<_>>();
            values.sort_by(|a, b| a.total_cmp(b));
            percentiles
                .iter()
                .map(|percentile| values[rank_index(*percentile, values.len())])
                .collect::<Vec<_>>()
        })
        .collect())
}

pub fn death_probability_by(person: &Person, year: f64) -> f64 {
    let mean = person.expected_death_year();
    let spread = person.life_expectancy.variance;

    match Normal::new(mean, spread) {
        Ok(distribution) if spread > 0.0 => distribution.cdf(year),
        _ => {
            if year > mean {
                1.0
            } else if year < mean {
                0.0
            } else {
                0.5
            }
        }
    }
}

pub fn cycle_success_weight(cycle: &Cycle, people: &[Person], start_year: i32) -> f64 {
    match cycle.first_depletion_index() {
        None => 1.0,
        Some(month) => {
            let depletion_year = start_year as f64 + month as f64 / MONTHS_PER_YEAR;
            people
                .iter()
                .map(|person| death_probability_by(person, depletion_year))
                .product()
        }
    }
}

pub fn success_probability(cycles: &[Cycle], people: &[Person], start_year: i32) -> f64 {
    if cycles.is_empty() {
        return 0.0;
    }
    let total: f64 = cycles
        .iter()
        .map(|cycle| cycle_success_weight(cycle, people, start_year))
        .sum();
    total / cycles.len() as f64
}

pub fn aggregate_cycles(
    cycles: &[Cycle],
    people: &[Person],
    start_year: i32,
    percentile_tail: f64,
    band_resolution: usize,
) -> Result<AggregateResult, EngineError> {
    let percentiles = band_percentiles(percentile_tail, band_resolution)?;
    let bands = percentile_bands(cycles, &percentiles)?;
    Ok(AggregateResult {
        percentiles,
        bands,
        success_probability: success_probability(cycles, people, start_year),
    })
}

pub fn horizon_end_year(people: &[Person], current_year: i32, standard_deviations: f64) -> i32 {
    people
        .iter()
        .map(|person| {
            (person.expected_death_year() + person.life_expectancy.variance * standard_deviations)
                .ceil() as i32
        })
        .fold(current_year, i32::max)
}
