use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Portfolio {
    pub cash: f64,
    pub bonds: f64,
    pub stocks: f64,
    pub crypto: f64,
}

impl Portfolio {
    pub const ZERO: Portfolio = Portfolio {
        cash: 0.0,
        bonds: 0.0,
        stocks: 0.0,
        crypto: 0.0,
    };

    pub fn new(cash: f64, bonds: f64, stocks: f64, crypto: f64) -> Self {
        Self {
            cash,
            bonds,
            stocks,
            crypto,
        }
    }

    pub fn total(&self) -> f64 {
        self.cash + self.bonds + self.stocks + self.crypto
    }

    pub fn grown(&self, delta: &MonthlyDelta) -> Self {
        Self {
            cash: self.cash * delta.cash,
            bonds: self.bonds * delta.bonds,
            stocks: self.stocks * delta.stocks,
            crypto: self.crypto * delta.crypto,
        }
    }

    pub fn scaled(&self, amount: f64) -> Self {
        Self {
            cash: self.cash * amount,
            bonds: self.bonds * amount,
            stocks: self.stocks * amount,
            crypto: self.crypto * amount,
        }
    }

    pub fn buckets_mut(&mut self) -> [&mut f64; 4] {
        [
            &mut self.cash,
            &mut self.bonds,
            &mut self.stocks,
            &mut self.crypto,
        ]
    }

    pub fn buckets(&self) -> [f64; 4] {
        [self.cash, self.bonds, self.stocks, self.crypto]
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PartialPortfolio {
    pub cash: Option<f64>,
    pub bonds: Option<f64>,
    pub stocks: Option<f64>,
    pub crypto: Option<f64>,
}

impl From<Portfolio> for PartialPortfolio {
    fn from(value: Portfolio) -> Self {
        Self {
            cash: Some(value.cash),
            bonds: Some(value.bonds),
            stocks: Some(value.stocks),
            crypto: Some(value.crypto),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct MonthlyDelta {
    pub inflation: f64,
    pub cash: f64,
    pub bonds: f64,
    pub stocks: f64,
    pub crypto: f64,
}

impl MonthlyDelta {
    pub const FLAT: MonthlyDelta = MonthlyDelta {
        inflation: 1.0,
        cash: 1.0,
        bonds: 1.0,
        stocks: 1.0,
        crypto: 1.0,
    };

    pub fn factors(&self) -> [f64; 5] {
        [self.inflation, self.cash, self.bonds, self.stocks, self.crypto]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LifeExpectancy {
    pub mean: f64,
    /// Spread of the age at death in years, used as the standard deviation.
    pub variance: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub life_expectancy: LifeExpectancy,
}

impl Person {
    pub fn birth_year(&self) -> i32 {
        self.date_of_birth.year()
    }

    pub fn expected_death_year(&self) -> f64 {
        self.birth_year() as f64 + self.life_expectancy.mean
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConstantRate {
    Fixed(f64),
    PercentOfPortfolio(f64),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DynamicWithdrawal {
    pub target_percentage: f64,
    pub threshold_percentage: f64,
    pub adjustment_percentage: f64,
    pub minimum_rate: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WithdrawalScheme {
    Constant(ConstantRate),
    Dynamic(DynamicWithdrawal),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RedistributionFrequency {
    EveryMonths(u32),
    Never,
}

impl RedistributionFrequency {
    pub fn is_due(self, month_index: usize) -> bool {
        match self {
            RedistributionFrequency::EveryMonths(0) | RedistributionFrequency::Never => false,
            RedistributionFrequency::EveryMonths(months) => (month_index + 1) % months as usize == 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawStage {
    pub id: String,
    pub name: String,
    pub end_year: Option<i32>,
    pub income_by_person: Option<BTreeMap<String, f64>>,
    pub withdrawal: Option<WithdrawalScheme>,
    pub allocation: Option<PartialPortfolio>,
    pub redistribution_frequency: Option<RedistributionFrequency>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedStage {
    pub id: String,
    pub name: String,
    pub end_year: Option<i32>,
    pub income_by_person: BTreeMap<String, f64>,
    pub withdrawal: WithdrawalScheme,
    pub allocation: Portfolio,
    pub redistribution_frequency: RedistributionFrequency,
}

impl ResolvedStage {
    pub fn yearly_income(&self) -> f64 {
        self.income_by_person.values().sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub name: String,
    pub inherits_from: Option<String>,
    pub stages: Option<Vec<RawStage>>,
}

/// One simulated trajectory. `samples[0]` is the initial total, `samples[m]` the total after month `m`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Cycle {
    pub samples: Vec<f64>,
}

impl Cycle {
    pub fn first_depletion_index(&self) -> Option<usize> {
        self.samples.iter().position(|value| *value <= 0.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub percentiles: Vec<f64>,
    /// `bands[month][k]` is the value at `percentiles[k]` for that month.
    pub bands: Vec<Vec<f64>>,
    pub success_probability: f64,
}
