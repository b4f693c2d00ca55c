use chrono::{Datelike, NaiveDate};

use super::error::EngineError;
use super::types::MonthlyDelta;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }

    fn month_key(&self) -> i32 {
        month_key(self.date)
    }
}

fn month_key(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoricalSeries {
    pub inflation: Vec<SeriesPoint>,
    pub cash: Vec<SeriesPoint>,
    pub bonds: Vec<SeriesPoint>,
    pub stocks: Vec<SeriesPoint>,
    pub crypto: Vec<SeriesPoint>,
}

impl HistoricalSeries {
    fn named(&self) -> [(&'static str, &[SeriesPoint]); 5] {
        [
            ("inflation", &self.inflation),
            ("cash", &self.cash),
            ("bonds", &self.bonds),
            ("stocks", &self.stocks),
            ("crypto", &self.crypto),
        ]
    }

    fn map(&self, f: impl Fn(&[SeriesPoint]) -> Vec<SeriesPoint>) -> Self {
        Self {
            inflation: f(&self.inflation),
            cash: f(&self.cash),
            bonds: f(&self.bonds),
            stocks: f(&self.stocks),
            crypto: f(&self.crypto),
        }
    }
}

pub fn monthly_multipliers_from_prices(
    prices: &[SeriesPoint],
) -> Result<Vec<SeriesPoint>, EngineError> {
    if let Some(pair) = prices.windows(2).find(|pair| pair[1].date < pair[0].date) {
        return Err(EngineError::DataAlignment(format!(
            "prices are not date-ordered: {} follows {}",
            pair[1].date, pair[0].date
        )));
    }

    let mut multipliers = Vec::new();
    let mut previous: Option<&SeriesPoint> = None;
    for point in prices {
        match previous {
            Some(prev) if prev.month_key() == point.month_key() => continue,
            Some(prev) if prev.value > 0.0 => {
                multipliers.push(SeriesPoint::new(point.date, point.value / prev.value));
            }
            _ => {}
        }
        previous = Some(point);
    }
    Ok(multipliers)
}

pub fn align_trailing(series: &HistoricalSeries) -> Result<HistoricalSeries, EngineError> {
    let mut start = i32::MIN;
    let mut end = i32::MAX;
    for (name, points) in series.named() {
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            return Err(EngineError::DataAlignment(format!("{name} series is empty")));
        };
        start = start.max(first.month_key());
        end = end.min(last.month_key());
    }
    if start > end {
        return Err(EngineError::DataAlignment(
            "series do not share any common month".to_string(),
        ));
    }

    Ok(series.map(|points| {
        points
            .iter()
            .filter(|point| (start..=end).contains(&point.month_key()))
            .copied()
            .collect()
    }))
}

pub fn build_monthly_deltas(series: &HistoricalSeries) -> Result<Vec<MonthlyDelta>, EngineError> {
    let named = series.named();
    let len = series.inflation.len();
    for (name, points) in named {
        if points.len() != len {
            return Err(EngineError::DataAlignment(format!(
                "{name} has {} months, inflation has {len}",
                points.len()
            )));
        }
        if let Some(bad) = points.iter().find(|point| !point.value.is_finite() || point.value < 0.0) {
            return Err(EngineError::DataAlignment(format!(
                "{name} multiplier at {} must be finite and >= 0, got {}",
                bad.date, bad.value
            )));
        }
    }

    for idx in 0..len {
        let key = series.inflation[idx].month_key();
        if let Some((name, points)) = named.iter().find(|(_, points)| points[idx].month_key() != key) {
            return Err(EngineError::DataAlignment(format!(
                "{name} month {} does not match inflation month {}",
                points[idx].date.format("%Y-%m"),
                series.inflation[idx].date.format("%Y-%m")
            )));
        }
        if idx > 0 && key != series.inflation[idx - 1].month_key() + 1 {
            return Err(EngineError::DataAlignment(format!(
                "series are not contiguous between {} and {}",
                series.inflation[idx - 1].date.format("%Y-%m"),
                series.inflation[idx].date.format("%Y-%m")
            )));
        }
    }

    Ok((0..len)
        .map(|idx| MonthlyDelta {
            inflation: series.inflation[idx].value,
            cash: series.cash[idx].value,
            bonds: series.bonds[idx].value,
            stocks: series.stocks[idx].value,
            crypto: series.crypto[idx].value,
        })
        .collect())
}
