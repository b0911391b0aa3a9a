//! Small numeric helpers for training statistics and the observation model.
//!
//! Running averages and Student-t confidence intervals summarise returns across
//! evaluation batches and seeds; the log-gamma based beta-binomial pmf backs the
//! IDS alert distribution of the stopping game.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Mean and half width of a confidence interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub half_width: f64,
}

impl ConfidenceInterval {
    pub fn lower(&self) -> f64 {
        self.mean - self.half_width
    }

    pub fn upper(&self) -> f64 {
        self.mean + self.half_width
    }
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation (n - 1 in the denominator)
pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Mean of the last `window` values (all values when fewer are available)
pub fn running_average(xs: &[f64], window: usize) -> f64 {
    if xs.is_empty() || window == 0 {
        return 0.0;
    }
    let start = xs.len().saturating_sub(window);
    mean(&xs[start..])
}

/// Two-sided Student-t confidence interval around the sample mean.
///
/// With fewer than two samples the standard error is undefined and the half
/// width is reported as 0.
pub fn mean_confidence_interval(xs: &[f64], confidence: f64) -> Result<ConfidenceInterval> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(Error::domain(format!(
            "confidence level must lie in (0,1), got {}",
            confidence
        )));
    }
    let m = mean(xs);
    if xs.len() < 2 {
        return Ok(ConfidenceInterval { mean: m, half_width: 0.0 });
    }
    let se = sample_std(xs) / (xs.len() as f64).sqrt();
    let t = student_t_quantile(1.0 - confidence, (xs.len() - 1) as f64)?;
    Ok(ConfidenceInterval {
        mean: m,
        half_width: se * t,
    })
}

/// Lower-tail standard normal quantile (Acklam's rational approximation,
/// relative error below 1.2e-9)
pub fn normal_quantile(p: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::domain(format!("normal quantile needs p in (0,1), got {}", p)));
    }
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    let x = if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    };
    Ok(x)
}

/// Positive Student-t quantile for a two-sided tail probability `p`
/// (e.g. 0.05 for a 95% interval) and `df` degrees of freedom, following
/// Hill's algorithm 396.
pub fn student_t_quantile(p: f64, df: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::domain(format!("t quantile needs p in (0,1), got {}", p)));
    }
    if df < 1.0 {
        return Err(Error::domain(format!("t quantile needs df >= 1, got {}", df)));
    }
    if (df - 1.0).abs() < f64::EPSILON {
        let angle = p * PI / 2.0;
        return Ok(angle.cos() / angle.sin());
    }
    if (df - 2.0).abs() < f64::EPSILON {
        return Ok((2.0 / (p * (2.0 - p)) - 2.0).sqrt());
    }

    let a = 1.0 / (df - 0.5);
    let b = 48.0 / (a * a);
    let mut c = ((20700.0 * a / b - 98.0) * a - 16.0) * a + 96.36;
    let d = ((94.5 / (b + c) - 3.0) / b + 1.0) * (a * PI / 2.0).sqrt() * df;
    let mut y = (d * p).powf(2.0 / df);

    if y > 0.05 + a {
        let x = normal_quantile(0.5 * p)?;
        y = x * x;
        if df < 5.0 {
            c += 0.3 * (df - 4.5) * (x + 0.6);
        }
        c = (((0.05 * d * x - 5.0) * x - 7.0) * x - 2.0) * x + b + c;
        y = (((((0.4 * y + 6.3) * y + 36.0) * y + 94.5) / c - y - 3.0) / b + 1.0) * x;
        y = (a * y * y).exp_m1();
    } else {
        y = ((1.0 / (((df + 6.0) / (df * y) - 0.089 * d - 0.822) * (df + 2.0) * 3.0)
            + 0.5 / (df + 4.0))
            * y
            - 1.0)
            * (df + 1.0)
            / (df + 2.0)
            + 1.0 / y;
    }
    Ok((df * y).sqrt())
}

/// Natural log of the gamma function for x > 0 (Lanczos, g = 7)
pub fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_59,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // reflection
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// P(K = k) for K ~ BetaBinomial(n, alpha, beta)
pub fn beta_binomial_pmf(k: usize, n: usize, alpha: f64, beta: f64) -> f64 {
    if k > n {
        return 0.0;
    }
    let (k, n) = (k as f64, n as f64);
    let ln_choose = ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0);
    (ln_choose + ln_beta(k + alpha, n - k + beta) - ln_beta(alpha, beta)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_running_average_window() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(running_average(&xs, 2), 3.5);
        assert_abs_diff_eq!(running_average(&xs, 10), 2.5);
        assert_eq!(running_average(&[], 3), 0.0);
    }

    #[test]
    fn test_normal_quantile() {
        assert_abs_diff_eq!(normal_quantile(0.5).unwrap(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(normal_quantile(0.975).unwrap(), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(normal_quantile(0.01).unwrap(), -2.326348, epsilon = 1e-5);
        assert!(normal_quantile(1.0).is_err());
    }

    #[test]
    fn test_student_t_quantile() {
        assert_abs_diff_eq!(student_t_quantile(0.05, 1.0).unwrap(), 12.7062, epsilon = 1e-3);
        assert_abs_diff_eq!(student_t_quantile(0.05, 2.0).unwrap(), 4.3027, epsilon = 1e-3);
        assert_abs_diff_eq!(student_t_quantile(0.05, 10.0).unwrap(), 2.2281, epsilon = 5e-3);
        assert_abs_diff_eq!(student_t_quantile(0.05, 1000.0).unwrap(), 1.9623, epsilon = 5e-3);
    }

    #[test]
    fn test_confidence_interval_constant_data() {
        let ci = mean_confidence_interval(&[2.0; 20], 0.95).unwrap();
        assert_abs_diff_eq!(ci.mean, 2.0);
        assert_abs_diff_eq!(ci.half_width, 0.0);
    }

    #[test]
    fn test_confidence_interval_single_sample() {
        let ci = mean_confidence_interval(&[7.0], 0.95).unwrap();
        assert_eq!(ci.mean, 7.0);
        assert_eq!(ci.half_width, 0.0);
        assert!(mean_confidence_interval(&[1.0, 2.0], 1.0).is_err());
    }

    #[test]
    fn test_ln_gamma_factorials() {
        assert_abs_diff_eq!(ln_gamma(1.0), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(ln_gamma(5.0), 24.0_f64.ln(), epsilon = 1e-10);
        assert_abs_diff_eq!(ln_gamma(0.5), PI.sqrt().ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_beta_binomial_sums_to_one() {
        let n = 10;
        let total: f64 = (0..=n).map(|k| beta_binomial_pmf(k, n, 0.7, 3.0)).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert_eq!(beta_binomial_pmf(11, n, 1.0, 0.7), 0.0);
    }
}
