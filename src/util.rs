//! Numeric constants and helpers shared across the solver, trainers and
//! scorer.

/// Largest magnitude allowed into `exp` before the sigmoid saturates.
pub const MAX_EXP: f64 = 50.0;
/// Predictions are clipped into `[MIN_SIGMOID, MAX_SIGMOID]` before the
/// logarithmic loss.
pub const MIN_SIGMOID: f64 = 1e-14;
pub const MAX_SIGMOID: f64 = 1.0 - 1e-14;
/// Tolerance for floating-point comparisons.
pub const FLOAT_EPSILON: f64 = 1.192093e-7;

pub fn float_equal(v1: f64, v2: f64) -> bool {
    (v1 - v2).abs() < FLOAT_EPSILON
}

pub fn float_greater(v1: f64, v2: f64) -> bool {
    !float_equal(v1, v2) && v1 > v2
}

pub fn float_less(v1: f64, v2: f64) -> bool {
    !float_equal(v1, v2) && v1 < v2
}

pub fn safe_exp(x: f64) -> f64 {
    x.clamp(-MAX_EXP, MAX_EXP).exp()
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + safe_exp(-x))
}

/// Round half away from zero at the given number of decimal places.
pub fn round_to(x: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (x * scale).round() / scale
}
