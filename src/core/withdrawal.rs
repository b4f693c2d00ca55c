use super::error::EngineError;
use super::types::{ConstantRate, DynamicWithdrawal, WithdrawalScheme};

pub fn evaluate_withdrawal(
    previous_withdrawal: Option<f64>,
    total_portfolio_value: f64,
    scheme: &WithdrawalScheme,
    cumulative_inflation: f64,
) -> f64 {
    match scheme {
        WithdrawalScheme::Constant(ConstantRate::Fixed(initial_rate)) => {
            initial_rate * cumulative_inflation
        }
        WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(target_percentage)) => {
            target_percentage / 100.0 * total_portfolio_value
        }
        WithdrawalScheme::Dynamic(dynamic) => {
            let withdrawal = match previous_withdrawal {
                None => dynamic.target_percentage / 100.0 * total_portfolio_value,
                Some(previous) => guardrail_withdrawal(previous, total_portfolio_value, dynamic),
            };
            withdrawal.max(dynamic.minimum_rate * cumulative_inflation)
        }
    }
}

// Thresholds are compared as absolute amounts so a zero total never divides.
fn guardrail_withdrawal(previous: f64, total: f64, scheme: &DynamicWithdrawal) -> f64 {
    let target = scheme.target_percentage / 100.0;
    let threshold = scheme.threshold_percentage / 100.0;
    let adjustment = scheme.adjustment_percentage / 100.0;
    let lower_rate = target / (1.0 + threshold);
    let upper_rate = target * (1.0 + threshold);

    if total <= previous {
        total
    } else if previous < total * lower_rate {
        (total * target).min(previous * (1.0 + adjustment))
    } else if previous > total * upper_rate {
        (total * target).max(previous / (1.0 + adjustment))
    } else {
        previous
    }
}

pub fn validate_scheme(scheme: &WithdrawalScheme) -> Result<(), EngineError> {
    match scheme {
        WithdrawalScheme::Constant(ConstantRate::Fixed(rate)) => {
            require_non_negative("initialRate", *rate)
        }
        WithdrawalScheme::Constant(ConstantRate::PercentOfPortfolio(percentage)) => {
            require_non_negative("targetPercentage", *percentage)
        }
        WithdrawalScheme::Dynamic(dynamic) => {
            require_non_negative("targetPercentage", dynamic.target_percentage)?;
            require_non_negative("minimumRate", dynamic.minimum_rate)?;
            if dynamic.threshold_percentage.is_nan() || dynamic.threshold_percentage <= -100.0 {
                return Err(EngineError::InvalidSchemeParameter(format!(
                    "thresholdPercentage must be > -100, got {}",
                    dynamic.threshold_percentage
                )));
            }
            if dynamic.adjustment_percentage.is_nan() || dynamic.adjustment_percentage <= -100.0 {
                return Err(EngineError::InvalidSchemeParameter(format!(
                    "adjustmentPercentage must be > -100, got {}",
                    dynamic.adjustment_percentage
                )));
            }
            Ok(())
        }
    }
}

fn require_non_negative(field: &str, value: f64) -> Result<(), EngineError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::InvalidSchemeParameter(format!(
            "{field} must be finite and >= 0, got {value}"
        )));
    }
    Ok(())
}
