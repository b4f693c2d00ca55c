use std::collections::{BTreeMap, BTreeSet};

use super::error::EngineError;
use super::types::{
    PartialPortfolio, Plan, Portfolio, RawStage, RedistributionFrequency, ResolvedStage,
};
use super::withdrawal::validate_scheme;

const ALLOCATION_TOLERANCE: f64 = 1e-6;

/// Resolves raw stages in order, inheriting every unset field from the previous
/// resolved stage. Income merges per person and the allocation merges per bucket;
/// `end_year` is never inherited.
pub fn resolve_stages(raw_stages: &[RawStage]) -> Result<Vec<ResolvedStage>, EngineError> {
    let Some((first, rest)) = raw_stages.split_first() else {
        return Err(EngineError::InvalidStageSequence(
            "a plan needs at least one stage".to_string(),
        ));
    };

    let mut resolved = Vec::with_capacity(raw_stages.len());
    resolved.push(resolve_first(first)?);

    for stage in rest {
        let previous = resolved
            .last()
            .ok_or_else(|| EngineError::InvalidStageSequence("missing baseline".to_string()))?;
        let next = resolve_next(previous, stage)?;
        resolved.push(next);
    }

    validate_end_years(&resolved)?;
    Ok(resolved)
}

fn resolve_first(stage: &RawStage) -> Result<ResolvedStage, EngineError> {
    let missing = |field: &str| {
        EngineError::InvalidStageSequence(format!(
            "first stage '{}' is missing {field}",
            stage.id
        ))
    };

    let income_by_person = stage
        .income_by_person
        .clone()
        .ok_or_else(|| missing("incomeByPerson"))?;
    let withdrawal = stage.withdrawal.ok_or_else(|| missing("withdrawal"))?;
    let partial = stage.allocation.ok_or_else(|| missing("allocation"))?;
    let allocation = Portfolio {
        cash: partial.cash.ok_or_else(|| missing("allocation.cash"))?,
        bonds: partial.bonds.ok_or_else(|| missing("allocation.bonds"))?,
        stocks: partial.stocks.ok_or_else(|| missing("allocation.stocks"))?,
        crypto: partial.crypto.ok_or_else(|| missing("allocation.crypto"))?,
    };
    let redistribution_frequency = stage
        .redistribution_frequency
        .ok_or_else(|| missing("redistributionFrequency"))?;

    finish_stage(ResolvedStage {
        id: stage.id.clone(),
        name: stage.name.clone(),
        end_year: stage.end_year,
        income_by_person,
        withdrawal,
        allocation,
        redistribution_frequency,
    })
}

fn resolve_next(previous: &ResolvedStage, stage: &RawStage) -> Result<ResolvedStage, EngineError> {
    let mut income_by_person = previous.income_by_person.clone();
    if let Some(overrides) = &stage.income_by_person {
        income_by_person.extend(overrides.iter().map(|(id, amount)| (id.clone(), *amount)));
    }

    finish_stage(ResolvedStage {
        id: stage.id.clone(),
        name: stage.name.clone(),
        end_year: stage.end_year,
        income_by_person,
        withdrawal: stage.withdrawal.unwrap_or(previous.withdrawal),
        allocation: merge_allocation(&previous.allocation, stage.allocation.as_ref()),
        redistribution_frequency: stage
            .redistribution_frequency
            .unwrap_or(previous.redistribution_frequency),
    })
}

fn merge_allocation(previous: &Portfolio, partial: Option<&PartialPortfolio>) -> Portfolio {
    let Some(partial) = partial else {
        return *previous;
    };
    Portfolio {
        cash: partial.cash.unwrap_or(previous.cash),
        bonds: partial.bonds.unwrap_or(previous.bonds),
        stocks: partial.stocks.unwrap_or(previous.stocks),
        crypto: partial.crypto.unwrap_or(previous.crypto),
    }
}

fn finish_stage(stage: ResolvedStage) -> Result<ResolvedStage, EngineError> {
    validate_allocation(&stage)?;
    validate_scheme(&stage.withdrawal)?;

    if stage.redistribution_frequency == RedistributionFrequency::EveryMonths(0) {
        return Err(EngineError::InvalidStageSequence(format!(
            "stage '{}' has a redistribution frequency of 0 months",
            stage.id
        )));
    }

    if let Some((person, amount)) = stage
        .income_by_person
        .iter()
        .find(|(_, amount)| !amount.is_finite())
    {
        return Err(EngineError::InvalidStageSequence(format!(
            "stage '{}' has a non-finite income {amount} for person '{person}'",
            stage.id
        )));
    }

    Ok(stage)
}

fn validate_allocation(stage: &ResolvedStage) -> Result<(), EngineError> {
    let buckets = stage.allocation.buckets();
    if buckets.iter().any(|fraction| !fraction.is_finite() || *fraction < 0.0) {
        return Err(EngineError::InvalidStageSequence(format!(
            "stage '{}' has a negative or non-finite allocation",
            stage.id
        )));
    }

    let sum: f64 = buckets.iter().sum();
    if (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err(EngineError::InvalidStageSequence(format!(
            "stage '{}' allocation sums to {sum}, expected 1",
            stage.id
        )));
    }
    Ok(())
}

fn validate_end_years(stages: &[ResolvedStage]) -> Result<(), EngineError> {
    let mut previous_end: Option<i32> = None;
    for (idx, stage) in stages.iter().enumerate() {
        let is_last = idx + 1 == stages.len();
        match stage.end_year {
            None if !is_last => {
                return Err(EngineError::InvalidStageSequence(format!(
                    "stage '{}' has no end year but is followed by another stage",
                    stage.id
                )));
            }
            Some(end_year) => {
                if let Some(previous) = previous_end
                    && end_year <= previous
                {
                    return Err(EngineError::InvalidStageSequence(format!(
                        "stage '{}' ends in {end_year}, not after the previous stage ({previous})",
                        stage.id
                    )));
                }
                previous_end = Some(end_year);
            }
            None => {}
        }
    }
    Ok(())
}

pub fn active_stages(stages: &[ResolvedStage], current_year: i32) -> Vec<ResolvedStage> {
    stages
        .iter()
        .filter(|stage| stage.end_year.is_none_or(|end_year| end_year > current_year))
        .cloned()
        .collect()
}

pub fn finished_stages(stages: &[ResolvedStage], current_year: i32) -> Vec<ResolvedStage> {
    stages
        .iter()
        .filter(|stage| stage.end_year.is_some_and(|end_year| end_year <= current_year))
        .cloned()
        .collect()
}

pub fn unroll_plan(plans: &BTreeMap<String, Plan>, plan_id: &str) -> Result<Vec<RawStage>, EngineError> {
    let mut visited = BTreeSet::new();
    let mut current_id = plan_id;

    loop {
        if !visited.insert(current_id) {
            return Err(EngineError::InvalidStageSequence(format!(
                "plan '{plan_id}' has a cyclic inheritance chain through '{current_id}'"
            )));
        }

        let plan = plans.get(current_id).ok_or_else(|| {
            EngineError::InvalidStageSequence(format!("unknown plan '{current_id}'"))
        })?;

        if let Some(stages) = &plan.stages {
            return Ok(stages.clone());
        }

        match &plan.inherits_from {
            Some(parent) => current_id = parent,
            None => {
                return Err(EngineError::InvalidStageSequence(format!(
                    "plan '{current_id}' has neither stages nor a parent plan"
                )));
            }
        }
    }
}
