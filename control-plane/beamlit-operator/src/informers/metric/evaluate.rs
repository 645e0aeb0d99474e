//! Metric target evaluation.
//!
//! Samples arrive as milli-units (the metric APIs speak quantities; the
//! backends parse them). Comparisons stay in integer milli-space to avoid
//! float drift on large memory values.

use crate::crd::metrics::{
    MetricTarget, MetricTargetType, parse_quantity_milli,
};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("target has no {0} field")]
    MissingTargetValue(&'static str),
    #[error("malformed quantity {0:?}")]
    BadQuantity(String),
    #[error("utilization targets apply to resource metrics only")]
    UtilizationOutsideResource,
}

/// Evaluates a Value/AverageValue target against raw samples.
///
/// - `Value`: the aggregate of all samples must meet the target.
/// - `AverageValue`: the aggregate divided by replicas must meet it.
pub fn is_target_reached(
    target: &MetricTarget,
    replicas: i32,
    samples: &[i64],
) -> Result<bool, EvalError> {
    let sum: i64 = samples.iter().sum();
    match target.target_type {
        MetricTargetType::Value => {
            let raw = target
                .value
                .as_deref()
                .ok_or(EvalError::MissingTargetValue("value"))?;
            let wanted = parse_quantity_milli(raw)
                .ok_or_else(|| EvalError::BadQuantity(raw.to_string()))?;
            Ok(sum >= wanted)
        }
        MetricTargetType::AverageValue => {
            let raw = target
                .average_value
                .as_deref()
                .ok_or(EvalError::MissingTargetValue("averageValue"))?;
            let wanted = parse_quantity_milli(raw)
                .ok_or_else(|| EvalError::BadQuantity(raw.to_string()))?;
            if replicas <= 0 {
                return Ok(false);
            }
            Ok(sum / replicas as i64 >= wanted)
        }
        MetricTargetType::Utilization => {
            Err(EvalError::UtilizationOutsideResource)
        }
    }
}

/// Average-utilization check for resource metrics: pod usages are summed,
/// converted to a percentage of summed requests first, then averaged over
/// replicas. The multiplication happens before the divisions to keep
/// integer precision.
pub fn is_utilization_reached(
    usage_milli: &[i64],
    requested_milli: i64,
    replicas: i32,
    target_percent: i32,
) -> bool {
    if requested_milli <= 0 || replicas <= 0 {
        return false;
    }
    let mut utilization: i64 = usage_milli.iter().sum();
    utilization *= 100;
    utilization /= requested_milli;
    utilization /= replicas as i64;
    utilization >= target_percent as i64
}
