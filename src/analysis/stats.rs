//! Correlation statistics: Pearson r and its two-tailed p-value.
//!
//! The p-value comes from Student's t with `n - 2` degrees of freedom.

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Pearson correlation of two equally long samples.
///
/// Returns `None` when fewer than two pairs exist or either side has zero
/// variance, since r is undefined there.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Two-tailed p-value for H0: rho = 0 given sample correlation `r` over `n` pairs.
pub fn correlation_p_value(r: f64, n: usize) -> f64 {
    if n <= 2 {
        return 1.0;
    }
    let r2 = r * r;
    if r2 >= 1.0 {
        return 0.0;
    }
    let df = (n - 2) as f64;
    let t = (r2 * df / (1.0 - r2)).sqrt();
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * (1.0 - dist.cdf(t))).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_perfect_and_inverse() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [3.0, 5.0, 7.0, 9.0, 11.0];
        let z = [10.0, 8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&x, &y).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&x, &z).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_undefined_for_constant_side() {
        assert!(pearson(&[1.0, 2.0, 3.0], &[4.0, 4.0, 4.0]).is_none());
        assert!(pearson(&[1.0], &[2.0]).is_none());
    }

    #[test]
    fn test_p_value_bounds() {
        assert!((correlation_p_value(0.0, 30) - 1.0).abs() < 1e-9);
        assert_eq!(correlation_p_value(1.0, 30), 0.0);
        assert_eq!(correlation_p_value(0.9, 2), 1.0);
    }

    #[test]
    fn test_p_value_matches_t_table() {
        // r = 0.71, n = 12 -> t ~ 3.19 on 10 df, two-tailed p ~ 0.0097.
        let p = correlation_p_value(0.71, 12);
        assert!((p - 0.0097).abs() < 7e-4, "p = {p}");
        // Symmetric in the sign of r.
        assert!((p - correlation_p_value(-0.71, 12)).abs() < 1e-12);
    }

    #[test]
    fn test_p_value_shrinks_with_sample_size() {
        assert!(correlation_p_value(0.3, 100) < correlation_p_value(0.3, 20));
    }
}
